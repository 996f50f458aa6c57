//! Scheduled reconciliation (C9). The trigger is external: each tick hands
//! the gateway a cron expression, and the expression selects the pass. A
//! tick is idempotent and bounded by the configured batch caps; an
//! unrecognized expression runs every pass sequentially.

use chrono::{Duration as ChronoDuration, Utc};

use crate::{BillingError, BillingService, CatalogSyncReport, ProcessOutcome};

const RETRY_CRON: &str = "*/5 * * * *";
const GRACE_CRON: &str = "0 * * * *";
const RETENTION_CRON: &str = "30 2 * * *";
const RETENTION_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickHandler {
    Retry,
    Grace,
    Catalog,
    Retention,
    All,
}

impl TickHandler {
    fn name(&self) -> &'static str {
        match self {
            TickHandler::Retry => "retry",
            TickHandler::Grace => "grace",
            TickHandler::Catalog => "catalog",
            TickHandler::Retention => "retention",
            TickHandler::All => "all",
        }
    }
}

/// Matches the tick's cron expression to a pass. The fixed expressions win
/// over the configurable catalog cron; anything unrecognized runs every
/// pass.
fn select_handler(cron: &str, catalog_cron: &str) -> TickHandler {
    match cron.trim() {
        RETRY_CRON => TickHandler::Retry,
        GRACE_CRON => TickHandler::Grace,
        expr if expr == catalog_cron.trim() => TickHandler::Catalog,
        RETENTION_CRON => TickHandler::Retention,
        _ => TickHandler::All,
    }
}

#[derive(Debug, Default, Clone)]
pub struct TickReport {
    pub handler: &'static str,
    pub retried: usize,
    pub completed: usize,
    pub failed: usize,
    pub not_claimed: usize,
    pub downgraded: usize,
    pub purged: u64,
    pub catalog: Option<CatalogSyncReport>,
}

impl BillingService {
    pub async fn run_scheduled_tick(&self, cron: &str) -> Result<TickReport, BillingError> {
        let handler = select_handler(cron, &self.config().catalog_sync_cron);
        let mut report = TickReport {
            handler: handler.name(),
            ..TickReport::default()
        };

        match handler {
            TickHandler::Retry => self.retry_pass(&mut report).await?,
            TickHandler::Grace => self.grace_pass(&mut report).await?,
            TickHandler::Catalog => {
                if self.config().catalog_sync_enabled {
                    report.catalog = Some(self.sync_catalog().await?);
                } else {
                    // A matched-but-disabled catalog tick still reports.
                    report.catalog = Some(CatalogSyncReport::default());
                }
            }
            TickHandler::Retention => self.retention_pass(&mut report).await?,
            TickHandler::All => {
                self.retry_pass(&mut report).await?;
                self.grace_pass(&mut report).await?;
                if self.config().catalog_sync_enabled {
                    report.catalog = Some(self.sync_catalog().await?);
                }
                self.retention_pass(&mut report).await?;
            }
        }

        tracing::info!(
            handler = report.handler,
            retried = report.retried,
            completed = report.completed,
            failed = report.failed,
            downgraded = report.downgraded,
            purged = report.purged,
            "billing.tick_done"
        );

        Ok(report)
    }

    /// Re-drives pending/failed rows that are due and processing rows whose
    /// lease expired, oldest first, capped by the retry batch size.
    async fn retry_pass(&self, report: &mut TickReport) -> Result<(), BillingError> {
        let ids = self
            .store()
            .due_webhook_event_ids(
                self.config().webhook_max_attempts,
                self.config().retry_batch_size,
            )
            .await?;

        for event_id in ids {
            report.retried += 1;
            match self.process_webhook_event(&event_id).await? {
                ProcessOutcome::Completed => report.completed += 1,
                ProcessOutcome::Failed { .. } => report.failed += 1,
                ProcessOutcome::NotClaimed => report.not_claimed += 1,
            }
        }
        Ok(())
    }

    /// Downgrades `past_due` subscriptions whose grace window elapsed:
    /// cancel, converge to free, refresh the plan cache.
    async fn grace_pass(&self, report: &mut TickReport) -> Result<(), BillingError> {
        let rows = self
            .store()
            .expired_grace_subscriptions(self.config().grace_batch_size)
            .await?;

        let now = Utc::now();
        for row in rows {
            self.store().cancel_subscription_row(row.id, now).await?;
            self.store()
                .ensure_free_subscription_for_workspace(row.workspace_id, "grace_expired")
                .await?;
            self.store().refresh_workspace_plan(row.workspace_id).await?;
            report.downgraded += 1;

            tracing::info!(
                workspace_id = %row.workspace_id,
                subscription_id = %row.id,
                "billing.grace_downgrade"
            );
        }
        Ok(())
    }

    async fn retention_pass(&self, report: &mut TickReport) -> Result<(), BillingError> {
        let cutoff = Utc::now() - ChronoDuration::days(RETENTION_DAYS);
        report.purged = self.store().purge_completed_webhook_events(cutoff).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG_CRON: &str = "*/15 * * * *";

    #[test]
    fn fixed_expressions_map_to_their_pass() {
        assert_eq!(select_handler("*/5 * * * *", CATALOG_CRON), TickHandler::Retry);
        assert_eq!(select_handler("0 * * * *", CATALOG_CRON), TickHandler::Grace);
        assert_eq!(select_handler("*/15 * * * *", CATALOG_CRON), TickHandler::Catalog);
        assert_eq!(select_handler("30 2 * * *", CATALOG_CRON), TickHandler::Retention);
    }

    #[test]
    fn unknown_expression_runs_everything() {
        assert_eq!(select_handler("11 11 * * *", CATALOG_CRON), TickHandler::All);
        assert_eq!(select_handler("", CATALOG_CRON), TickHandler::All);
    }

    #[test]
    fn reconfigured_catalog_cron_is_honored() {
        assert_eq!(
            select_handler("*/30 * * * *", "*/30 * * * *"),
            TickHandler::Catalog
        );
        // The fixed retry expression shadows a colliding catalog config.
        assert_eq!(
            select_handler("*/5 * * * *", "*/5 * * * *"),
            TickHandler::Retry
        );
    }

    #[test]
    fn whitespace_is_ignored() {
        assert_eq!(select_handler("  */5 * * * *  ", CATALOG_CRON), TickHandler::Retry);
    }
}

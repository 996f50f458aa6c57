//! Catalog sync (C10): map the upstream recurring price list onto the
//! local plan-variant rows. Eligibility is decided per price from its
//! lookup key or its metadata; for each `(plan, interval)` the freshest
//! upstream price wins and local rows are updated only on drift.

use formsandbox_contracts::{BillingInterval, PlanSlug};
use formsandbox_stripe::types::Price;
use std::collections::HashMap;

use crate::{BillingError, BillingService};

const LOOKUP_KEY_PREFIX: &str = "formsandbox";
const CATALOG_CURRENCY: &str = "usd";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogSyncReport {
    pub scanned_prices: usize,
    pub eligible_prices: usize,
    pub updated_variants: usize,
    pub missing_variants: usize,
}

#[derive(Debug, Clone)]
struct Candidate {
    plan_slug: String,
    interval: BillingInterval,
    price_id: String,
    amount_cents: i64,
    currency: String,
    created: i64,
}

/// Decides whether a price belongs in the catalog and under which
/// `(plan, interval)` cell. Lookup-key naming wins over metadata;
/// `self_serve="false"` metadata vetoes either path.
fn derive_candidate(price: &Price, catalog_env: Option<&str>) -> Option<Candidate> {
    if !price.active || price.currency != CATALOG_CURRENCY {
        return None;
    }
    // The recurring interval itself must be sellable (month/year), whatever
    // naming the lookup key or metadata then assigns.
    price
        .recurring
        .as_ref()
        .and_then(|r| BillingInterval::from_upstream_interval(&r.interval))?;
    let amount_cents = price.unit_amount.filter(|amount| *amount >= 0)?;

    if price.metadata.get("self_serve").map(String::as_str) == Some("false") {
        return None;
    }

    if let Some((slug, key_interval)) = parse_lookup_key(price.lookup_key.as_deref(), catalog_env) {
        return Some(Candidate {
            plan_slug: slug,
            interval: key_interval,
            price_id: price.id.clone(),
            amount_cents,
            currency: price.currency.clone(),
            created: price.created,
        });
    }

    let slug = price
        .metadata
        .get("plan_slug")
        .and_then(|raw| PlanSlug::parse(raw))
        .filter(PlanSlug::is_self_serve)?;
    let meta_interval = price
        .metadata
        .get("interval")
        .and_then(|raw| BillingInterval::parse(raw))?;
    if price.metadata.get("self_serve").map(String::as_str) != Some("true") {
        return None;
    }

    Some(Candidate {
        plan_slug: slug.as_str().to_string(),
        interval: meta_interval,
        price_id: price.id.clone(),
        amount_cents,
        currency: price.currency.clone(),
        created: price.created,
    })
}

/// `formsandbox:{env}:{plan_slug}:{interval}:usd`; `env` must equal the
/// configured catalog env when one is set.
fn parse_lookup_key(
    lookup_key: Option<&str>,
    catalog_env: Option<&str>,
) -> Option<(String, BillingInterval)> {
    let key = lookup_key?;
    let parts: Vec<&str> = key.split(':').collect();
    let [prefix, env, slug, interval, currency] = parts.as_slice() else {
        return None;
    };
    if *prefix != LOOKUP_KEY_PREFIX || *currency != CATALOG_CURRENCY || slug.is_empty() {
        return None;
    }
    if let Some(expected_env) = catalog_env {
        if *env != expected_env {
            return None;
        }
    }
    let interval = BillingInterval::parse(interval)?;
    Some((slug.to_string(), interval))
}

impl BillingService {
    /// Runs one sync pass. Scheduling (and the enabled flag) is the
    /// caller's concern: the reconciler consults the flag, forced callers
    /// do not.
    pub async fn sync_catalog(&self) -> Result<CatalogSyncReport, BillingError> {
        let prices = self.stripe().list_active_recurring_prices().await?;
        let catalog_env = self.config().catalog_env.clone();

        let mut report = CatalogSyncReport {
            scanned_prices: prices.len(),
            ..CatalogSyncReport::default()
        };

        let mut winners: HashMap<(String, BillingInterval), Candidate> = HashMap::new();
        for price in &prices {
            let Some(candidate) = derive_candidate(price, catalog_env.as_deref()) else {
                continue;
            };
            report.eligible_prices += 1;

            let cell = (candidate.plan_slug.clone(), candidate.interval);
            match winners.get(&cell) {
                Some(current) if current.created >= candidate.created => {}
                _ => {
                    winners.insert(cell, candidate);
                }
            }
        }

        for candidate in winners.values() {
            let variant = self
                .store()
                .active_variant_for_plan(
                    &candidate.plan_slug,
                    candidate.interval.as_str(),
                    CATALOG_CURRENCY,
                )
                .await?;

            let Some(variant) = variant else {
                report.missing_variants += 1;
                continue;
            };

            let drifted = variant.stripe_price_id.as_deref() != Some(candidate.price_id.as_str())
                || variant.amount_cents != candidate.amount_cents
                || variant.currency != candidate.currency;
            if drifted {
                self.store()
                    .update_variant_pricing(
                        variant.id,
                        &candidate.price_id,
                        candidate.amount_cents,
                        &candidate.currency,
                    )
                    .await?;
                report.updated_variants += 1;
            }
        }

        tracing::info!(
            scanned = report.scanned_prices,
            eligible = report.eligible_prices,
            updated = report.updated_variants,
            missing = report.missing_variants,
            "billing.catalog_synced"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use formsandbox_stripe::types::Recurring;

    fn price(
        id: &str,
        lookup_key: Option<&str>,
        metadata: &[(&str, &str)],
        interval: &str,
        unit_amount: i64,
        created: i64,
    ) -> Price {
        Price {
            id: id.to_string(),
            active: true,
            currency: "usd".to_string(),
            unit_amount: Some(unit_amount),
            created,
            lookup_key: lookup_key.map(str::to_string),
            recurring: Some(Recurring {
                interval: interval.to_string(),
            }),
            metadata: metadata
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn lookup_key_path_qualifies() {
        let p = price("price_1", Some("formsandbox:prod:pro:monthly:usd"), &[], "month", 1500, 1);
        let candidate = derive_candidate(&p, Some("prod")).expect("should qualify");
        assert_eq!(candidate.plan_slug, "pro");
        assert_eq!(candidate.interval, BillingInterval::Monthly);
    }

    #[test]
    fn lookup_key_env_mismatch_disqualifies() {
        let p = price("price_1", Some("formsandbox:staging:pro:monthly:usd"), &[], "month", 1500, 1);
        assert!(derive_candidate(&p, Some("prod")).is_none());
        // No configured env accepts any env segment.
        assert!(derive_candidate(&p, None).is_some());
    }

    #[test]
    fn metadata_path_qualifies() {
        let p = price(
            "price_2",
            None,
            &[("plan_slug", "business"), ("interval", "yearly"), ("self_serve", "true")],
            "year",
            39900,
            1,
        );
        let candidate = derive_candidate(&p, None).expect("should qualify");
        assert_eq!(candidate.plan_slug, "business");
        assert_eq!(candidate.interval, BillingInterval::Yearly);
    }

    #[test]
    fn metadata_requires_self_serve_true() {
        let p = price(
            "price_2",
            None,
            &[("plan_slug", "pro"), ("interval", "monthly")],
            "month",
            1500,
            1,
        );
        assert!(derive_candidate(&p, None).is_none());
    }

    #[test]
    fn self_serve_false_vetoes_even_lookup_key() {
        let p = price(
            "price_3",
            Some("formsandbox:prod:pro:monthly:usd"),
            &[("self_serve", "false")],
            "month",
            1500,
            1,
        );
        assert!(derive_candidate(&p, Some("prod")).is_none());
    }

    #[test]
    fn lookup_key_wins_over_disagreeing_metadata() {
        let p = price(
            "price_4",
            Some("formsandbox:prod:business:yearly:usd"),
            &[("plan_slug", "pro"), ("interval", "monthly"), ("self_serve", "true")],
            "year",
            39900,
            1,
        );
        let candidate = derive_candidate(&p, Some("prod")).expect("should qualify");
        assert_eq!(candidate.plan_slug, "business");
        assert_eq!(candidate.interval, BillingInterval::Yearly);
    }

    #[test]
    fn non_usd_and_weekly_prices_disqualify() {
        let mut p = price("price_5", Some("formsandbox:prod:pro:monthly:usd"), &[], "month", 1500, 1);
        p.currency = "eur".to_string();
        assert!(derive_candidate(&p, None).is_none());

        let p = price("price_6", Some("formsandbox:prod:pro:monthly:usd"), &[], "week", 1500, 1);
        assert!(derive_candidate(&p, None).is_none());

        let mut p = price("price_7", Some("formsandbox:prod:pro:monthly:usd"), &[], "month", 1500, 1);
        p.unit_amount = None;
        assert!(derive_candidate(&p, None).is_none());
    }

    #[test]
    fn enterprise_metadata_is_not_self_serve() {
        let p = price(
            "price_8",
            None,
            &[("plan_slug", "enterprise"), ("interval", "monthly"), ("self_serve", "true")],
            "month",
            99900,
            1,
        );
        assert!(derive_candidate(&p, None).is_none());
    }
}

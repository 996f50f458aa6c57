//! In-process webhook worker. Ingestion answers 200 as soon as the row is
//! durable; the event id is then handed to this task over a bounded
//! channel. The channel is a latency optimization, not a correctness
//! dependency — anything dropped here is re-driven by the retry pass.

use tokio::sync::mpsc;

use crate::BillingService;

const QUEUE_DEPTH: usize = 1024;

#[derive(Clone)]
pub struct WebhookWorker {
    tx: mpsc::Sender<String>,
}

impl WebhookWorker {
    /// Hands a freshly ingested event id to the worker. Backpressure drops
    /// are logged and left to the scheduler's retry pass.
    pub fn enqueue(&self, event_id: &str) {
        if let Err(err) = self.tx.try_send(event_id.to_string()) {
            tracing::warn!(
                event_id = %event_id,
                error = %err,
                "billing.webhook_enqueue_deferred"
            );
        }
    }
}

/// Spawns the worker task, owned by the process rather than any request.
pub fn spawn_webhook_worker(service: BillingService) -> WebhookWorker {
    let (tx, mut rx) = mpsc::channel::<String>(QUEUE_DEPTH);

    tokio::spawn(async move {
        while let Some(event_id) = rx.recv().await {
            if let Err(err) = service.process_webhook_event(&event_id).await {
                tracing::error!(
                    event_id = %event_id,
                    error = %err,
                    "billing.webhook_worker_error"
                );
            }
        }
    });

    WebhookWorker { tx }
}

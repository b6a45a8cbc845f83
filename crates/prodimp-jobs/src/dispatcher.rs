use std::sync::Arc;

use prodimp_core::{DeliveryAttempt, WebhookPayload};
use prodimp_storage::{DeliveryReport, StoreError, SubscriberRegistry, WebhookClient};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Queue side of the webhook dispatcher. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<DeliveryAttempt>,
}

impl DispatcherHandle {
    /// Queues one delivery. Returns `false` once the dispatcher has stopped.
    pub fn enqueue(&self, attempt: DeliveryAttempt) -> bool {
        self.tx.send(attempt).is_ok()
    }

    /// Queues `payload` for every active subscriber of its event.
    pub async fn fan_out(
        &self,
        registry: &dyn SubscriberRegistry,
        payload: &WebhookPayload,
    ) -> Result<usize, StoreError> {
        let subscriptions = registry.active_subscriptions(&payload.event).await?;
        let mut queued = 0;
        for subscription in subscriptions {
            if self.enqueue(DeliveryAttempt::new(subscription.url.clone(), payload.clone())) {
                queued += 1;
            } else {
                warn!(url = %subscription.url, "dispatcher stopped; delivery dropped");
            }
        }
        debug!(event = %payload.event, queued, "webhook deliveries queued");
        Ok(queued)
    }
}

/// Starts the dispatcher loop. Each queued delivery runs in its own task so a
/// slow subscriber never holds up the others. Finished reports are forwarded
/// to `reports` when given.
///
/// The loop ends once every handle is dropped and in-flight deliveries finish.
pub fn spawn_dispatcher(
    client: Arc<WebhookClient>,
    reports: Option<mpsc::UnboundedSender<DeliveryReport>>,
) -> (DispatcherHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_dispatcher(client, rx, reports));
    (DispatcherHandle { tx }, task)
}

async fn run_dispatcher(
    client: Arc<WebhookClient>,
    mut rx: mpsc::UnboundedReceiver<DeliveryAttempt>,
    reports: Option<mpsc::UnboundedSender<DeliveryReport>>,
) {
    let mut in_flight = JoinSet::new();
    loop {
        tokio::select! {
            next = rx.recv() => match next {
                Some(attempt) => {
                    let client = client.clone();
                    in_flight.spawn(async move { client.deliver(attempt).await });
                }
                None => break,
            },
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                record(joined, reports.as_ref());
            }
        }
    }
    while let Some(joined) = in_flight.join_next().await {
        record(joined, reports.as_ref());
    }
    info!("webhook dispatcher stopped");
}

fn record(
    joined: Result<DeliveryReport, JoinError>,
    reports: Option<&mpsc::UnboundedSender<DeliveryReport>>,
) {
    match joined {
        Ok(report) => {
            if let Some(tx) = reports {
                let _ = tx.send(report);
            }
        }
        Err(err) => error!(error = %err, "webhook delivery task panicked"),
    }
}

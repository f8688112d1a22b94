//! Persistent webhook delivery: enqueuer and worker.
//!
//! [`WebhookEnqueuer`] turns domain events into queue rows: it assigns the
//! merchant-facing event id (exactly once), serializes the payload, and
//! appends to the store with `status = pending`.
//!
//! [`WebhookWorker`] is the single long-running delivery task per process.
//! Each poll cycle it claims a batch of due rows, POSTs them through the
//! `webhook_out` circuit breaker, and classifies the outcome: 2xx/3xx
//! delivers the row, anything else schedules a retry with exponential
//! backoff until the attempt budget is exhausted and the row moves to the
//! dead-letter tier. On startup the worker reclaims rows a crashed process
//! left leased in `processing`.
//!
//! Multiple processes may run workers concurrently; exclusivity comes from
//! the store's atomic claim in `dequeue_webhooks`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::circuit_breaker::{BreakerError, BreakerRegistry};
use crate::clock::Clock;
use crate::error::GatewayError;
use crate::events::{PaymentEvent, RefundEvent};
use crate::hooks::{HookRegistry, WebhookDeadLettered, WebhookDelivered, WebhookRetried};
use crate::retry::RetryPolicy;
use crate::store::Store;
use crate::types::{NewWebhook, PendingWebhook, WebhookStatus};

const WEBHOOK_OUT: &str = "webhook_out";

/// Delivery configuration shared by the enqueuer and the worker.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Merchant endpoint for payment events. Unset disables payment webhooks.
    pub payment_url: Option<Url>,
    /// Merchant endpoint for refund events; falls back to `payment_url`.
    pub refund_url: Option<Url>,
    /// Extra headers attached to every delivery (auth tokens and the like).
    pub headers: HashMap<String, String>,
    /// Attempt budget and backoff curve.
    pub retry: RetryPolicy,
    /// Per-attempt HTTP timeout.
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub batch_size: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            payment_url: None,
            refund_url: None,
            headers: HashMap::new(),
            retry: RetryPolicy {
                max_attempts: 5,
                initial_interval: Duration::from_secs(30),
                max_interval: Duration::from_secs(3600),
                multiplier: 2.0,
            },
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(5),
            batch_size: 20,
        }
    }
}

/// Failures while POSTing a webhook to the merchant.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("delivery timed out")]
    Timeout,
    #[error("delivery transport failure: {0}")]
    Transport(String),
}

/// Transport used for webhook egress. The production implementation is
/// [`HttpNotifier`]; tests substitute a scripted double.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// POST `payload` to `url` and return the HTTP status code.
    async fn deliver(
        &self,
        url: &Url,
        headers: &HashMap<String, String>,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<u16, NotifyError>;
}

/// Webhook egress over `reqwest`.
pub struct HttpNotifier {
    http: reqwest::Client,
}

impl HttpNotifier {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn deliver(
        &self,
        url: &Url,
        headers: &HashMap<String, String>,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<u16, NotifyError> {
        let mut request = self
            .http
            .post(url.clone())
            .timeout(timeout)
            .body(payload.to_vec());
        let has_content_type = headers
            .keys()
            .any(|name| name.eq_ignore_ascii_case("content-type"));
        if !has_content_type {
            request = request.header("Content-Type", "application/json");
        }
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                NotifyError::Timeout
            } else {
                NotifyError::Transport(err.to_string())
            }
        })?;
        Ok(response.status().as_u16())
    }
}

/// Serializes domain events and appends them to the persistent queue.
pub struct WebhookEnqueuer {
    store: Arc<dyn Store>,
    cfg: DeliveryConfig,
    clock: Arc<dyn Clock>,
    hooks: Arc<HookRegistry>,
}

impl WebhookEnqueuer {
    pub fn new(
        store: Arc<dyn Store>,
        cfg: DeliveryConfig,
        clock: Arc<dyn Clock>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        Self {
            store,
            cfg,
            clock,
            hooks,
        }
    }

    /// Enqueue a payment event. Returns the queue row id, or `None` when no
    /// payment endpoint is configured.
    pub async fn enqueue_payment(
        &self,
        mut event: PaymentEvent,
    ) -> Result<Option<u64>, GatewayError> {
        let Some(url) = self.cfg.payment_url.clone() else {
            tracing::debug!("no payment webhook endpoint configured, dropping event");
            return Ok(None);
        };
        let now = self.clock.now();
        event.prepare(now);
        let payload = serde_json::to_vec(&event)
            .map_err(|err| GatewayError::Internal(format!("payment event serialization: {err}")))?;
        let id = self
            .store
            .enqueue_webhook(NewWebhook {
                url,
                payload,
                headers: self.cfg.headers.clone(),
                event_type: "payment".to_string(),
                max_attempts: self.cfg.retry.max_attempts,
                next_attempt_at: now,
                created_at: now,
            })
            .await?;
        self.hooks.webhook_enqueued(id, "payment");
        Ok(Some(id))
    }

    /// Enqueue a refund event, falling back to the payment endpoint when no
    /// refund endpoint is configured.
    pub async fn enqueue_refund(
        &self,
        mut event: RefundEvent,
    ) -> Result<Option<u64>, GatewayError> {
        let Some(url) = self
            .cfg
            .refund_url
            .clone()
            .or_else(|| self.cfg.payment_url.clone())
        else {
            tracing::debug!("no refund webhook endpoint configured, dropping event");
            return Ok(None);
        };
        let now = self.clock.now();
        event.prepare(now);
        let payload = serde_json::to_vec(&event)
            .map_err(|err| GatewayError::Internal(format!("refund event serialization: {err}")))?;
        let id = self
            .store
            .enqueue_webhook(NewWebhook {
                url,
                payload,
                headers: self.cfg.headers.clone(),
                event_type: "refund".to_string(),
                max_attempts: self.cfg.retry.max_attempts,
                next_attempt_at: now,
                created_at: now,
            })
            .await?;
        self.hooks.refund_enqueued(&event);
        self.hooks.webhook_enqueued(id, "refund");
        Ok(Some(id))
    }
}

/// The long-running delivery task.
pub struct WebhookWorker {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    breakers: Arc<BreakerRegistry>,
    hooks: Arc<HookRegistry>,
    clock: Arc<dyn Clock>,
    cfg: DeliveryConfig,
    shutdown: CancellationToken,
}

impl WebhookWorker {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        breakers: Arc<BreakerRegistry>,
        hooks: Arc<HookRegistry>,
        clock: Arc<dyn Clock>,
        cfg: DeliveryConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            notifier,
            breakers,
            hooks,
            clock,
            cfg,
            shutdown,
        }
    }

    /// Spawn the worker loop onto the runtime.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Main loop: reclaim orphaned leases once, then poll until shutdown.
    /// The batch in flight is always finished before exiting.
    pub async fn run(self) {
        let reclaim_cutoff = self.clock.now()
            - chrono::Duration::from_std(2 * self.cfg.poll_interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(10));
        match self.store.reclaim_stale_leases(reclaim_cutoff).await {
            Ok(0) => {}
            Ok(reclaimed) => {
                tracing::info!(reclaimed, "reclaimed webhooks from stale leases");
            }
            Err(err) => {
                self.hooks
                    .storage_error("reclaim_stale_leases", &err.to_string());
            }
        }

        tracing::info!("webhook worker started");
        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => break,

                () = tokio::time::sleep(self.cfg.poll_interval) => {
                    self.drain_batch().await;
                }
            }
        }
        tracing::info!("webhook worker stopped");
    }

    /// Claim and process one batch. Returns how many rows were claimed.
    pub async fn drain_batch(&self) -> usize {
        let now = self.clock.now();
        let batch = match self.store.dequeue_webhooks(self.cfg.batch_size, now).await {
            Ok(batch) => batch,
            Err(err) => {
                self.hooks
                    .storage_error("dequeue_webhooks", &err.to_string());
                return 0;
            }
        };
        let claimed = batch.len();
        for webhook in batch {
            self.process_one(webhook).await;
        }
        claimed
    }

    async fn process_one(&self, mut webhook: PendingWebhook) {
        if let Err(err) = self
            .store
            .mark_webhook_processing(webhook.id, self.clock.now())
            .await
        {
            self.hooks
                .storage_error("mark_webhook_processing", &err.to_string());
            return;
        }
        webhook.attempts += 1;

        let started = Instant::now();
        let outcome = self
            .breakers
            .execute(WEBHOOK_OUT, || {
                self.notifier.deliver(
                    &webhook.url,
                    &webhook.headers,
                    &webhook.payload,
                    self.cfg.timeout,
                )
            })
            .await;
        let duration = started.elapsed();

        let failure = match outcome {
            Ok(status) if status < 400 => None,
            Ok(status) => Some(format!("endpoint returned status {status}")),
            Err(BreakerError::Open { service }) => Some(format!("circuit open for {service}")),
            Err(BreakerError::Inner(err)) => Some(err.to_string()),
        };

        match failure {
            None => {
                if let Err(err) = self.store.mark_webhook_success(webhook.id).await {
                    self.hooks
                        .storage_error("mark_webhook_success", &err.to_string());
                    return;
                }
                self.hooks.webhook_delivered(&WebhookDelivered {
                    id: webhook.id,
                    event_type: webhook.event_type.clone(),
                    attempts: webhook.attempts,
                    duration,
                });
            }
            Some(error) => {
                let backoff = self.cfg.retry.backoff_interval(webhook.attempts);
                let next_attempt_at = self.clock.now()
                    + chrono::Duration::from_std(backoff)
                        .unwrap_or_else(|_| chrono::Duration::seconds(30));
                match self
                    .store
                    .mark_webhook_failed(webhook.id, &error, next_attempt_at)
                    .await
                {
                    Err(err) => {
                        self.hooks
                            .storage_error("mark_webhook_failed", &err.to_string());
                    }
                    Ok(WebhookStatus::Dlq) => {
                        self.hooks.webhook_dead_lettered(&WebhookDeadLettered {
                            id: webhook.id,
                            event_type: webhook.event_type.clone(),
                            attempts: webhook.attempts,
                            error,
                        });
                    }
                    Ok(_) => {
                        self.hooks.webhook_retried(&WebhookRetried {
                            id: webhook.id,
                            event_type: webhook.event_type.clone(),
                            attempts: webhook.attempts,
                            next_attempt_at,
                            backoff,
                            error,
                        });
                    }
                }
            }
        }
    }
}

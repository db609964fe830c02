//! Signed webhook delivery.
//!
//! # Responsibilities
//! - Select subscribers for an event
//! - Sign and POST the payload over HTTPS
//! - Retry failed deliveries on the shared backoff schedule
//!
//! # Design Decisions
//! - Delivery runs in spawned tasks; `notify` never waits on the network
//! - Non-https subscribers are rejected at construction, not at send time
//! - 4xx responses other than 408/429 are not retried

use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{WebhookConfig, WebhookSubscriber};
use crate::observability::metrics;
use crate::resilience::{calculate_backoff, with_timeout};
use crate::webhooks::payload::{WebhookEvent, WebhookPayload};
use crate::webhooks::signing::sign;

const INITIAL_RETRY_DELAY_MS: u64 = 1_000;
const MAX_RETRY_DELAY_MS: u64 = 60_000;
const RETRY_JITTER_MS: u64 = 500;

/// Errors building the notifier.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook subscriber URL must be https: {0}")]
    InsecureUrl(String),

    #[error("invalid webhook subscriber URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

enum DeliveryOutcome {
    Delivered,
    Retry(String),
    Rejected(String),
}

/// Fans escrow events out to configured subscribers.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    subscribers: Arc<Vec<WebhookSubscriber>>,
    timeout: Duration,
    max_attempts: u32,
}

impl WebhookNotifier {
    pub fn new(config: &WebhookConfig) -> Result<Self, WebhookError> {
        for sub in &config.subscribers {
            let url = url::Url::parse(&sub.url).map_err(|e| WebhookError::InvalidUrl {
                url: sub.url.clone(),
                reason: e.to_string(),
            })?;
            if url.scheme() != "https" {
                return Err(WebhookError::InsecureUrl(sub.url.clone()));
            }
        }

        let timeout = Duration::from_secs(config.delivery_timeout_secs.max(1));
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("escrow-custody-webhook/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            subscribers: Arc::new(config.subscribers.clone()),
            timeout,
            max_attempts: config.max_attempts.max(1),
        })
    }

    /// A notifier with no subscribers.
    pub fn disabled() -> Self {
        Self {
            client: Client::new(),
            subscribers: Arc::new(Vec::new()),
            timeout: Duration::from_secs(10),
            max_attempts: 1,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Queue `payload` for every subscriber of its event type.
    pub fn notify(&self, payload: WebhookPayload) {
        let targets: Vec<WebhookSubscriber> = self
            .subscribers
            .iter()
            .filter(|s| payload.event_type.selected_by(&s.events))
            .cloned()
            .collect();
        if targets.is_empty() {
            return;
        }

        let body = match serde_json::to_string(&payload) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(event = %payload.event_type, error = %e, "Failed to serialize webhook payload");
                return;
            }
        };

        for subscriber in targets {
            let notifier = self.clone();
            let body = body.clone();
            let event = payload.event_type;
            let escrow_id = payload.escrow_id;
            tokio::spawn(async move {
                notifier.deliver_with_retries(&subscriber, event, &body, escrow_id).await;
            });
        }
    }

    async fn deliver_with_retries(
        &self,
        subscriber: &WebhookSubscriber,
        event: WebhookEvent,
        body: &str,
        escrow_id: uuid::Uuid,
    ) {
        for attempt in 0..self.max_attempts {
            match self.deliver_once(subscriber, event, body).await {
                DeliveryOutcome::Delivered => {
                    metrics::record_webhook_delivery("delivered");
                    tracing::debug!(url = %subscriber.url, event = %event, escrow_id = %escrow_id, attempt, "Webhook delivered");
                    return;
                }
                DeliveryOutcome::Rejected(reason) => {
                    metrics::record_webhook_delivery("rejected");
                    tracing::warn!(url = %subscriber.url, event = %event, escrow_id = %escrow_id, reason = %reason, "Webhook rejected by subscriber");
                    return;
                }
                DeliveryOutcome::Retry(reason) => {
                    if attempt + 1 >= self.max_attempts {
                        metrics::record_webhook_delivery("failed");
                        tracing::error!(url = %subscriber.url, event = %event, escrow_id = %escrow_id, attempts = self.max_attempts, reason = %reason, "Webhook delivery failed");
                        return;
                    }
                    let delay = calculate_backoff(
                        attempt,
                        INITIAL_RETRY_DELAY_MS,
                        2.0,
                        MAX_RETRY_DELAY_MS,
                        RETRY_JITTER_MS,
                    );
                    tracing::warn!(url = %subscriber.url, event = %event, attempt, delay_ms = delay.as_millis() as u64, reason = %reason, "Webhook delivery failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn deliver_once(
        &self,
        subscriber: &WebhookSubscriber,
        event: WebhookEvent,
        body: &str,
    ) -> DeliveryOutcome {
        let timestamp = chrono::Utc::now().timestamp();
        let request = self
            .client
            .post(&subscriber.url)
            .header("Content-Type", "application/json")
            .header("X-Escrow-Event", event.as_str())
            .header("X-Escrow-Timestamp", timestamp.to_string())
            .header("X-Escrow-Signature", sign(&subscriber.secret, timestamp, body))
            .body(body.to_string())
            .send();

        match with_timeout(self.timeout, request).await {
            Ok(Ok(response)) => classify_status(response.status()),
            Ok(Err(e)) => DeliveryOutcome::Retry(e.to_string()),
            Err(elapsed) => DeliveryOutcome::Retry(elapsed.to_string()),
        }
    }
}

fn classify_status(status: StatusCode) -> DeliveryOutcome {
    if status.is_success() {
        DeliveryOutcome::Delivered
    } else if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        DeliveryOutcome::Retry(format!("HTTP {}", status))
    } else {
        DeliveryOutcome::Rejected(format!("HTTP {}", status))
    }
}

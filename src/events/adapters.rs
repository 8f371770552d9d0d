//! Outbound webhook adapters.
//!
//! Each adapter POSTs pipeline events to a configured URL with a bounded
//! timeout and an HMAC-SHA256 signature over the body. Delivery is
//! at-least-once: a dedup key header lets receivers drop duplicates, and a
//! failed delivery enters the DLQ, whose retry driver re-runs it with
//! exponential backoff. The pipeline itself never fails on a webhook error.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

use super::bus::{EventBus, PipelineEvent};
use super::dlq::{DeadLetterQueue, RetryStats};
use crate::config::AdapterConfig;
use crate::errors::{Error, Result};

pub const SIGNATURE_HEADER: &str = "x-foreman-signature";
pub const DELIVERY_HEADER: &str = "x-foreman-delivery";

/// Hex HMAC-SHA256 of the payload under the adapter's shared secret.
pub fn sign_payload(secret: &str, payload: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Stable dedup key for at-least-once receivers.
pub fn delivery_key(event: &PipelineEvent) -> String {
    format!(
        "{}:{}:{}",
        event.request_id,
        event.event_type,
        event.timestamp.timestamp_millis()
    )
}

pub struct WebhookAdapter {
    pub name: String,
    config: AdapterConfig,
    client: reqwest::Client,
}

impl WebhookAdapter {
    pub fn new(name: &str, config: AdapterConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            client: reqwest::Client::new(),
        }
    }

    pub async fn deliver(&self, event: &PipelineEvent) -> Result<()> {
        let body = serde_json::to_vec(event)?;
        let signature = sign_payload(&self.config.secret, &body);

        let response = self
            .client
            .post(&self.config.url)
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(DELIVERY_HEADER, delivery_key(event))
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout {
                        command: format!("webhook {}", self.name),
                        timeout_ms: self.config.timeout_ms,
                        partial_stdout: String::new(),
                        partial_stderr: String::new(),
                    }
                } else {
                    Error::Internal(format!("webhook {}: {}", self.name, e))
                }
            })?;

        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "webhook {} returned {}",
                self.name,
                response.status()
            )));
        }
        Ok(())
    }
}

/// Fans pipeline events out to every enabled adapter, dead-lettering
/// failures, and drives the retry loop.
pub struct DeliveryService {
    adapters: Vec<Arc<WebhookAdapter>>,
    dlq: Arc<DeadLetterQueue>,
    retry_interval: Duration,
}

impl DeliveryService {
    pub fn new(
        adapter_configs: &BTreeMap<String, AdapterConfig>,
        dlq: Arc<DeadLetterQueue>,
        retry_interval: Duration,
    ) -> Self {
        let adapters = adapter_configs
            .iter()
            .filter(|(_, c)| c.enabled && !c.url.is_empty())
            .map(|(name, c)| Arc::new(WebhookAdapter::new(name, c.clone())))
            .collect();
        Self {
            adapters,
            dlq,
            retry_interval,
        }
    }

    pub fn adapter_names(&self) -> Vec<String> {
        self.adapters.iter().map(|a| a.name.clone()).collect()
    }

    /// First-attempt delivery to all adapters; failures go to the DLQ.
    pub async fn dispatch(&self, event: &PipelineEvent) {
        for adapter in &self.adapters {
            match adapter.deliver(event).await {
                Ok(()) => debug!(adapter = %adapter.name, event_type = %event.event_type, "delivered"),
                Err(err) => {
                    warn!(adapter = %adapter.name, error = %err, "delivery failed, dead-lettering");
                    if let Err(dlq_err) = self
                        .dlq
                        .enqueue(&adapter.name, event.clone(), &err.to_string())
                        .await
                    {
                        warn!(adapter = %adapter.name, error = %dlq_err, "failed to dead-letter event");
                    }
                }
            }
        }
    }

    /// One retry pass over every adapter's queue.
    pub async fn retry_pass(&self) -> RetryStats {
        let mut total = RetryStats::default();
        if !self.dlq.enabled() {
            return total;
        }
        for adapter in &self.adapters {
            let adapter = Arc::clone(adapter);
            match self
                .dlq
                .process_retries(&adapter.name.clone(), move |event| {
                    let adapter = Arc::clone(&adapter);
                    async move { adapter.deliver(&event).await }
                })
                .await
            {
                Ok(stats) => {
                    total.delivered += stats.delivered;
                    total.failed += stats.failed;
                    total.exhausted += stats.exhausted;
                }
                Err(err) => warn!(error = %err, "retry pass failed"),
            }
        }
        total
    }

    /// Background loop: consume the bus and run retry passes until the
    /// subscription closes.
    pub async fn run(self: Arc<Self>, bus: Arc<EventBus>) {
        let mut rx = bus.subscribe_all();
        let mut retry_tick = tokio::time::interval(self.retry_interval);
        retry_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(event) => self.dispatch(&event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "delivery service lagged behind the bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = retry_tick.tick() => {
                    let stats = self.retry_pass().await;
                    if stats.delivered + stats.failed + stats.exhausted > 0 {
                        debug!(?stats, "dlq retry pass");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DlqConfig;
    use std::path::PathBuf;

    fn sample_event() -> PipelineEvent {
        PipelineEvent::now("req-1", "pipeline.completed", serde_json::json!({"n": 1}))
    }

    #[test]
    fn signature_is_stable_and_secret_dependent() {
        let payload = b"{\"hello\":\"world\"}";
        let sig1 = sign_payload("secret-a", payload);
        let sig2 = sign_payload("secret-a", payload);
        let sig3 = sign_payload("secret-b", payload);
        assert_eq!(sig1, sig2);
        assert_ne!(sig1, sig3);
        // Hex SHA-256 output.
        assert_eq!(sig1.len(), 64);
        assert!(sig1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn delivery_key_includes_request_type_and_time() {
        let event = sample_event();
        let key = delivery_key(&event);
        assert!(key.starts_with("req-1:pipeline.completed:"));
    }

    #[test]
    fn disabled_and_urlless_adapters_are_filtered() {
        let mut configs = BTreeMap::new();
        configs.insert(
            "on".to_string(),
            AdapterConfig {
                enabled: true,
                url: "http://127.0.0.1:9/hook".into(),
                ..AdapterConfig::default()
            },
        );
        configs.insert(
            "off".to_string(),
            AdapterConfig {
                enabled: false,
                url: "http://127.0.0.1:9/hook".into(),
                ..AdapterConfig::default()
            },
        );
        configs.insert("blank".to_string(), AdapterConfig::default());

        let dir = tempfile::tempdir().unwrap();
        let dlq = Arc::new(DeadLetterQueue::new(
            dir.path().to_path_buf(),
            DlqConfig::default(),
        ));
        let service = DeliveryService::new(&configs, dlq, Duration::from_secs(1));
        assert_eq!(service.adapter_names(), vec!["on".to_string()]);
    }

    #[tokio::test]
    async fn failed_dispatch_enters_the_dlq() {
        let mut configs = BTreeMap::new();
        configs.insert(
            "unreachable".to_string(),
            AdapterConfig {
                enabled: true,
                // Port 9 (discard) is never listening in the test env.
                url: "http://127.0.0.1:9/hook".into(),
                secret: "s".into(),
                timeout_ms: 500,
            },
        );

        let dir = tempfile::tempdir().unwrap();
        let dlq = Arc::new(DeadLetterQueue::new(
            dir.path().to_path_buf(),
            DlqConfig {
                enabled: true,
                path: PathBuf::new(),
                max_retries: 3,
                base_delay_ms: 50,
                backoff_factor: 2.0,
            },
        ));
        let service = DeliveryService::new(&configs, Arc::clone(&dlq), Duration::from_secs(60));

        service.dispatch(&sample_event()).await;

        let pending = dlq.pending("unreachable").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 0);
        assert_eq!(pending[0].event.request_id, "req-1");
    }
}

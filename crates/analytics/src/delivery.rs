//! Delivery side of the pipeline: the collector sink batches are handed to,
//! and the connectivity signal that gates non-forced flushes.

use async_trait::async_trait;
use beacon_core::config::CollectorConfig;
use beacon_core::error::{BeaconError, BeaconResult};
use beacon_core::types::EventBatch;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

/// Remote collector that durably stores delivered batches. Delivery must be
/// safe to retry: the queue may send the same batch more than once.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn deliver(&self, batch: &EventBatch) -> BeaconResult<()>;

    fn name(&self) -> &str {
        "collector"
    }
}

/// Posts batches as JSON to an HTTP endpoint.
pub struct HttpCollector {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpCollector {
    pub fn new(config: &CollectorConfig) -> BeaconResult<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| BeaconError::Config("collector.endpoint is not set".to_string()))?;
        url::Url::parse(&endpoint)
            .map_err(|e| BeaconError::Config(format!("collector.endpoint {endpoint}: {e}")))?;

        info!(endpoint = %endpoint, "HTTP collector configured");
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl Collector for HttpCollector {
    async fn deliver(&self, batch: &EventBatch) -> BeaconResult<()> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("x-beacon-batch-id", batch.batch_id.to_string())
            .json(batch);
        if let Some(key) = &self.api_key {
            request = request.header("x-beacon-key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BeaconError::Delivery(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(BeaconError::Delivery(format!(
                "collector responded with {status}"
            )));
        }

        debug!(batch_id = %batch.batch_id, events = batch.events.len(), "batch accepted");
        Ok(())
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Logs batches instead of sending them. Optionally keeps them in memory so
/// a host (or test) can inspect what would have been delivered.
#[derive(Default)]
pub struct LogCollector {
    retained: Mutex<Vec<EventBatch>>,
    retain: bool,
}

impl LogCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retaining() -> Self {
        Self {
            retained: Mutex::new(Vec::new()),
            retain: true,
        }
    }

    pub fn batches(&self) -> Vec<EventBatch> {
        self.retained.lock().clone()
    }

    pub fn event_count(&self) -> usize {
        self.retained.lock().iter().map(|b| b.events.len()).sum()
    }
}

#[async_trait]
impl Collector for LogCollector {
    async fn deliver(&self, batch: &EventBatch) -> BeaconResult<()> {
        info!(
            batch_id = %batch.batch_id,
            session_id = %batch.session.session_id,
            events = batch.events.len(),
            "batch delivered to log collector"
        );
        if self.retain {
            self.retained.lock().push(batch.clone());
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Online/offline signal. The flush loop watches it and flushes as soon as
/// connectivity comes back.
pub struct Connectivity {
    state: watch::Sender<bool>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self { state }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Returns true when the state actually changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "connectivity changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use beacon_core::types::Session;
    use chrono::Utc;
    use uuid::Uuid;

    fn empty_batch() -> EventBatch {
        let now = Utc::now();
        EventBatch {
            batch_id: Uuid::new_v4(),
            app_id: "test".into(),
            events: Vec::new(),
            session: Session {
                session_id: "s-1".into(),
                user_id: None,
                start_time: now,
                last_activity: now,
                page_views: 0,
                events: 0,
                referrer: None,
                utm_source: None,
                utm_medium: None,
                utm_campaign: None,
            },
            sent_at: now,
        }
    }

    #[test]
    fn test_http_collector_requires_endpoint() {
        assert!(HttpCollector::new(&CollectorConfig::default()).is_err());

        let config = CollectorConfig {
            endpoint: Some("::not-a-url".into()),
            api_key: None,
        };
        assert!(HttpCollector::new(&config).is_err());

        let config = CollectorConfig {
            endpoint: Some("https://collect.example.com/v1/batch".into()),
            api_key: Some("k".into()),
        };
        assert_eq!(HttpCollector::new(&config).unwrap().name(), "http");
    }

    #[tokio::test]
    async fn test_log_collector_retains() {
        let collector = LogCollector::retaining();
        collector.deliver(&empty_batch()).await.unwrap();
        assert_eq!(collector.batches().len(), 1);

        let quiet = LogCollector::new();
        quiet.deliver(&empty_batch()).await.unwrap();
        assert!(quiet.batches().is_empty());
    }

    #[tokio::test]
    async fn test_connectivity_notifies_on_change_only() {
        let connectivity = Connectivity::new(true);
        let mut rx = connectivity.subscribe();

        assert!(!connectivity.set_online(true));
        assert!(connectivity.set_online(false));
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
        assert!(!connectivity.is_online());
    }
}

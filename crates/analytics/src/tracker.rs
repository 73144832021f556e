//! Tracker facade — the single `track(name, properties)` entry point.
//!
//! Every event is stamped with the session, device, locale, route and the
//! visitor's active experiments before it is queued. With consent denied
//! every call is a silent no-op.

use std::sync::Arc;

use beacon_core::config::BeaconConfig;
use beacon_core::consent::ConsentState;
use beacon_core::event_bus::{EventSink, TrackCall};
use beacon_core::types::{
    names, ConnectionType, DeviceClass, Event, EventContext, Properties, Session, Visitor,
};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::delivery::{Collector, Connectivity};
use crate::queue::{EventQueue, FlushOutcome, QueueStats};
use crate::session::{NavigationContext, SessionTracker};

/// Device facts reported by the host at startup.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub device_class: DeviceClass,
    pub locale: Option<String>,
    pub connection: ConnectionType,
}

pub struct Tracker {
    session: Arc<SessionTracker>,
    queue: Arc<EventQueue>,
    consent: Arc<ConsentState>,
    connectivity: Arc<Connectivity>,
    device: RwLock<DeviceInfo>,
    route: RwLock<Option<String>>,
    experiments: DashMap<String, String>,
    idle_timeout: chrono::Duration,
}

impl Tracker {
    pub fn new(
        config: &BeaconConfig,
        navigation: &NavigationContext,
        device: DeviceInfo,
        collector: Arc<dyn Collector>,
        consent: Arc<ConsentState>,
    ) -> Arc<Self> {
        let session = Arc::new(SessionTracker::create(navigation));
        let connectivity = Arc::new(Connectivity::new(device.connection != ConnectionType::Offline));
        let queue = EventQueue::new(
            config.app_id.clone(),
            &config.queue,
            collector,
            session.clone(),
            connectivity.clone(),
        );
        let route = navigation
            .url
            .as_deref()
            .and_then(|u| url::Url::parse(u).ok())
            .map(|u| u.path().to_string());

        Arc::new(Self {
            session,
            queue,
            consent,
            connectivity,
            device: RwLock::new(device),
            route: RwLock::new(route),
            experiments: DashMap::new(),
            idle_timeout: chrono::Duration::seconds(config.session.idle_timeout_secs as i64),
        })
    }

    /// Start the flush loop and report the session start.
    pub fn start(&self) {
        self.queue.start();
        let session = self.session.snapshot();
        let mut properties = Properties::new();
        if let Some(referrer) = session.referrer {
            properties.insert("referrer".into(), referrer.into());
        }
        for (key, value) in [
            ("utm_source", session.utm_source),
            ("utm_medium", session.utm_medium),
            ("utm_campaign", session.utm_campaign),
        ] {
            if let Some(value) = value {
                properties.insert(key.into(), value.into());
            }
        }
        self.track(names::SESSION_START, properties);
    }

    /// Record an interaction. Never fails and never blocks on delivery.
    pub fn track(&self, name: &str, properties: Properties) {
        self.track_for(name, properties, None);
    }

    fn track_for(&self, name: &str, properties: Properties, user_override: Option<String>) {
        if !self.consent.is_granted() {
            metrics::counter!("beacon.track.suppressed").increment(1);
            return;
        }
        if name.trim().is_empty() {
            warn!("track called with an empty event name, ignored");
            return;
        }

        let now = Utc::now();
        if self.session.is_idle(now, self.idle_timeout) {
            debug!(session_id = %self.session.session_id(), "activity after idle period");
        }
        self.session.touch_at(now);

        let device = self.device.read().clone();
        let context = EventContext {
            route: self.route.read().clone(),
            device_class: device.device_class,
            locale: device.locale,
            connection: device.connection,
            experiments: self
                .experiments
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        };

        let event = Event {
            id: Uuid::new_v4(),
            name: name.to_string(),
            properties,
            session_id: self.session.session_id(),
            user_id: user_override.or_else(|| self.session.user_id()),
            timestamp: now,
            context,
        };
        debug!(event = %event.name, event_id = %event.id, "event tracked");
        self.queue.enqueue(event);
    }

    /// Record a page view for `route` and make it the context route.
    pub fn track_page_view(&self, route: &str, mut properties: Properties) {
        if !self.consent.is_granted() {
            metrics::counter!("beacon.track.suppressed").increment(1);
            return;
        }
        *self.route.write() = Some(route.to_string());
        self.session.record_page_view();
        properties.insert("route".into(), route.into());
        self.track(names::PAGE_VIEW, properties);
    }

    /// Attach the authenticated user supplied by the identity provider.
    pub fn identify(&self, user_id: Option<String>) {
        self.session.identify(user_id);
    }

    /// The visitor as experiment, funnel and cohort calls should see it.
    pub fn visitor(&self) -> Visitor {
        Visitor::new(self.session.user_id(), Some(self.session.session_id()))
    }

    pub fn set_locale(&self, locale: Option<String>) {
        self.device.write().locale = locale;
    }

    /// Report a connection change. Going offline pauses non-forced flushes;
    /// coming back online flushes immediately.
    pub fn set_connection(&self, connection: ConnectionType) {
        self.device.write().connection = connection;
        self.connectivity
            .set_online(connection != ConnectionType::Offline);
    }

    pub fn consent_granted(&self) -> bool {
        self.consent.is_granted()
    }

    /// Update consent. Revoking it discards anything not yet delivered.
    pub fn set_consent(&self, granted: bool) {
        self.consent.set_granted(granted);
        if !granted {
            let discarded = self.queue.clear();
            info!(discarded, "tracking disabled by consent");
        }
    }

    pub fn session(&self) -> Session {
        self.session.snapshot()
    }

    pub fn active_experiments(&self) -> Vec<(String, String)> {
        let mut active: Vec<_> = self
            .experiments
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        active.sort();
        active
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub async fn flush(&self) -> FlushOutcome {
        self.queue.flush(false).await
    }

    /// Teardown: stop the timer and force out whatever is pending.
    pub async fn shutdown(&self) -> FlushOutcome {
        if !self.consent.is_granted() {
            self.queue.clear();
        }
        self.queue.shutdown().await
    }
}

impl EventSink for Tracker {
    fn emit(&self, call: TrackCall) {
        self.track_for(&call.name, call.properties, call.visitor.user_id);
    }

    fn annotate_experiment(&self, test_id: &str, variant_id: &str) {
        self.experiments
            .insert(test_id.to_string(), variant_id.to_string());
    }

    fn is_enabled(&self) -> bool {
        self.consent.is_granted()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::delivery::LogCollector;

    fn tracker(granted: bool) -> (Arc<Tracker>, Arc<LogCollector>) {
        let collector = Arc::new(LogCollector::retaining());
        let nav = NavigationContext::new("https://discover.example.com/shows?utm_source=ads");
        let device = DeviceInfo {
            device_class: DeviceClass::Mobile,
            locale: Some("en-GB".into()),
            connection: ConnectionType::Wifi,
        };
        let tracker = Tracker::new(
            &BeaconConfig::default(),
            &nav,
            device,
            collector.clone(),
            Arc::new(ConsentState::fixed(granted)),
        );
        (tracker, collector)
    }

    #[tokio::test]
    async fn test_track_enriches_event() {
        let (tracker, collector) = tracker(true);
        tracker.identify(Some("u-7".into()));
        tracker.annotate_experiment("hero_layout", "carousel");
        tracker.track(
            "content_open",
            Properties::from([("content_id".to_string(), serde_json::json!("c-100"))]),
        );

        assert_eq!(tracker.flush().await, FlushOutcome::Delivered(1));
        let batches = collector.batches();
        let event = &batches[0].events[0];
        assert_eq!(event.name, "content_open");
        assert_eq!(event.user_id.as_deref(), Some("u-7"));
        assert_eq!(event.session_id, tracker.session().session_id);
        assert_eq!(event.context.route.as_deref(), Some("/shows"));
        assert_eq!(event.context.device_class, DeviceClass::Mobile);
        assert_eq!(event.context.locale.as_deref(), Some("en-GB"));
        assert_eq!(event.context.experiments["hero_layout"], "carousel");
        assert_eq!(batches[0].session.utm_source.as_deref(), Some("ads"));
    }

    #[tokio::test]
    async fn test_event_counter_matches_track_calls() {
        let (tracker, _) = tracker(true);
        for _ in 0..4 {
            tracker.track("scroll", Properties::new());
        }
        tracker.track_page_view("/search", Properties::new());

        let session = tracker.session();
        assert_eq!(session.events, 5);
        assert_eq!(session.page_views, 1);
        assert!(session.last_activity >= session.start_time);
    }

    #[tokio::test]
    async fn test_page_view_updates_route() {
        let (tracker, collector) = tracker(true);
        tracker.track_page_view("/collections/jazz", Properties::new());
        tracker.track("play", Properties::new());
        tracker.flush().await;

        let events = &collector.batches()[0].events;
        assert_eq!(events[0].name, names::PAGE_VIEW);
        assert_eq!(events[0].properties["route"], "/collections/jazz");
        assert_eq!(events[1].context.route.as_deref(), Some("/collections/jazz"));
    }

    #[tokio::test]
    async fn test_consent_denied_never_delivers() {
        let (tracker, collector) = tracker(false);
        tracker.start();
        tracker.track("content_open", Properties::new());
        tracker.track_page_view("/", Properties::new());

        assert_eq!(tracker.shutdown().await, FlushOutcome::Empty);
        assert!(collector.batches().is_empty());
        assert_eq!(tracker.session().events, 0);
    }

    #[tokio::test]
    async fn test_revoking_consent_discards_pending() {
        let (tracker, collector) = tracker(true);
        tracker.track("a", Properties::new());
        tracker.set_consent(false);
        tracker.track("b", Properties::new());

        assert_eq!(tracker.flush().await, FlushOutcome::Empty);
        assert_eq!(collector.event_count(), 0);
    }

    #[tokio::test]
    async fn test_sink_enabled_follows_consent() {
        let (tracker, _) = tracker(true);
        assert!(tracker.is_enabled());
        tracker.set_consent(false);
        assert!(!tracker.is_enabled());
        tracker.set_consent(true);
        assert!(tracker.is_enabled());
    }

    #[tokio::test]
    async fn test_emit_uses_visitor_user() {
        let (tracker, collector) = tracker(true);
        tracker.emit(TrackCall::new(
            names::AB_TEST_ASSIGNED,
            Properties::new(),
            Visitor::user("u-99"),
        ));
        tracker.track("", Properties::new());
        tracker.flush().await;

        let events = &collector.batches()[0].events;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].user_id.as_deref(), Some("u-99"));
    }

    #[tokio::test]
    async fn test_offline_connection_holds_events() {
        let (tracker, collector) = tracker(true);
        tracker.set_connection(ConnectionType::Offline);
        tracker.track("a", Properties::new());
        assert_eq!(tracker.flush().await, FlushOutcome::Offline);

        tracker.set_connection(ConnectionType::Cellular);
        assert_eq!(tracker.flush().await, FlushOutcome::Delivered(1));
        assert_eq!(collector.batches()[0].events[0].context.connection, ConnectionType::Offline);
    }
}

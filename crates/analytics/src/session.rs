//! Session tracking — one session record per application lifetime, with
//! referrer and campaign attribution captured from the initial navigation.

use beacon_core::types::Session;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

/// Where the visitor landed when the application loaded.
#[derive(Debug, Clone, Default)]
pub struct NavigationContext {
    pub url: Option<String>,
    pub referrer: Option<String>,
}

impl NavigationContext {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            referrer: None,
        }
    }

    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Attribution {
    utm_source: Option<String>,
    utm_medium: Option<String>,
    utm_campaign: Option<String>,
}

fn parse_attribution(landing_url: Option<&str>) -> Attribution {
    let Some(parsed) = landing_url.and_then(|u| Url::parse(u).ok()) else {
        return Attribution::default();
    };

    let mut attribution = Attribution::default();
    for (key, value) in parsed.query_pairs() {
        if value.is_empty() {
            continue;
        }
        match key.as_ref() {
            "utm_source" => attribution.utm_source = Some(value.into_owned()),
            "utm_medium" => attribution.utm_medium = Some(value.into_owned()),
            "utm_campaign" => attribution.utm_campaign = Some(value.into_owned()),
            _ => {}
        }
    }
    attribution
}

/// Owns the live session. Interior mutability so the tracker can share it.
pub struct SessionTracker {
    session: RwLock<Session>,
}

impl SessionTracker {
    /// Start a fresh session with a random id and zeroed counters.
    pub fn create(navigation: &NavigationContext) -> Self {
        Self::create_at(navigation, Utc::now())
    }

    pub fn create_at(navigation: &NavigationContext, now: DateTime<Utc>) -> Self {
        let attribution = parse_attribution(navigation.url.as_deref());
        let referrer = navigation
            .referrer
            .as_ref()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
            .map(str::to_string);

        let session = Session {
            session_id: Uuid::new_v4().simple().to_string(),
            user_id: None,
            start_time: now,
            last_activity: now,
            page_views: 0,
            events: 0,
            referrer,
            utm_source: attribution.utm_source,
            utm_medium: attribution.utm_medium,
            utm_campaign: attribution.utm_campaign,
        };

        info!(
            session_id = %session.session_id,
            utm_source = ?session.utm_source,
            "session started"
        );
        Self {
            session: RwLock::new(session),
        }
    }

    pub fn session_id(&self) -> String {
        self.session.read().session_id.clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.session.read().user_id.clone()
    }

    /// Count one tracked event and bump the activity clock.
    pub fn touch(&self) {
        self.touch_at(Utc::now());
    }

    pub fn touch_at(&self, now: DateTime<Utc>) {
        let mut session = self.session.write();
        // Clock skew must never move activity before the session start.
        session.last_activity = now.max(session.last_activity);
        session.events += 1;
    }

    pub fn record_page_view(&self) {
        self.session.write().page_views += 1;
    }

    /// Attach (or clear) the authenticated user for the rest of the lifetime.
    pub fn identify(&self, user_id: Option<String>) {
        let mut session = self.session.write();
        debug!(session_id = %session.session_id, user_id = ?user_id, "session identified");
        session.user_id = user_id;
    }

    pub fn snapshot(&self) -> Session {
        self.session.read().clone()
    }

    /// Whether no event was tracked for longer than `timeout`.
    pub fn is_idle(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now - self.session.read().last_activity > timeout
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_create_parses_campaign() {
        let nav = NavigationContext::new(
            "https://discover.example.com/browse?utm_source=newsletter&utm_medium=email&utm_campaign=spring&page=2",
        )
        .with_referrer("https://mail.example.net/");
        let tracker = SessionTracker::create(&nav);
        let session = tracker.snapshot();

        assert_eq!(session.utm_source.as_deref(), Some("newsletter"));
        assert_eq!(session.utm_medium.as_deref(), Some("email"));
        assert_eq!(session.utm_campaign.as_deref(), Some("spring"));
        assert_eq!(session.referrer.as_deref(), Some("https://mail.example.net/"));
        assert_eq!(session.events, 0);
        assert_eq!(session.page_views, 0);
        assert_eq!(session.start_time, session.last_activity);
    }

    #[test]
    fn test_missing_or_bad_url_has_no_attribution() {
        let tracker = SessionTracker::create(&NavigationContext::default());
        assert!(tracker.snapshot().utm_source.is_none());

        let tracker = SessionTracker::create(&NavigationContext::new("not a url"));
        assert!(tracker.snapshot().utm_campaign.is_none());

        let tracker = SessionTracker::create(&NavigationContext::default().with_referrer("  "));
        assert!(tracker.snapshot().referrer.is_none());
    }

    #[test]
    fn test_touch_counts_and_keeps_ordering() {
        let start = Utc::now();
        let tracker = SessionTracker::create_at(&NavigationContext::default(), start);

        tracker.touch_at(start + chrono::Duration::seconds(5));
        // An earlier clock reading must not rewind activity.
        tracker.touch_at(start - chrono::Duration::seconds(60));

        let session = tracker.snapshot();
        assert_eq!(session.events, 2);
        assert!(session.last_activity >= session.start_time);
        assert_eq!(session.duration(), chrono::Duration::seconds(5));
    }

    #[test]
    fn test_page_views_and_identify() {
        let tracker = SessionTracker::create(&NavigationContext::default());
        tracker.record_page_view();
        tracker.record_page_view();
        tracker.identify(Some("u-42".into()));

        let session = tracker.snapshot();
        assert_eq!(session.page_views, 2);
        assert_eq!(session.user_id.as_deref(), Some("u-42"));
        assert_eq!(session.session_id.len(), 32);
    }

    #[test]
    fn test_idle_detection() {
        let start = Utc::now();
        let tracker = SessionTracker::create_at(&NavigationContext::default(), start);
        let timeout = chrono::Duration::minutes(30);
        assert!(!tracker.is_idle(start + chrono::Duration::minutes(10), timeout));
        assert!(tracker.is_idle(start + chrono::Duration::minutes(31), timeout));
    }
}

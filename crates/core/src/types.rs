use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Free-form event properties. Only used at the serialization boundary.
pub type Properties = HashMap<String, serde_json::Value>;

/// Event names emitted by the engine itself.
pub mod names {
    pub const PAGE_VIEW: &str = "page_view";
    pub const SESSION_START: &str = "session_start";
    pub const AB_TEST_ASSIGNED: &str = "ab_test_assigned";
    pub const AB_TEST_CONVERSION: &str = "ab_test_conversion";
    pub const FUNNEL_STEP: &str = "funnel_step";
    pub const COHORT_ASSIGNED: &str = "cohort_assigned";
}

// ─── Identity ───────────────────────────────────────────────────────────

/// Who an operation is about. Callers pass whatever they know.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visitor {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

impl Visitor {
    pub fn new(user_id: Option<String>, session_id: Option<String>) -> Self {
        Self {
            user_id,
            session_id,
        }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            session_id: None,
        }
    }

    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            user_id: None,
            session_id: Some(session_id.into()),
        }
    }

    /// Resolve the correlation key: user id, else session id, else a fresh
    /// anonymous key that will never match a later call.
    pub fn identity(&self) -> Identity {
        match (&self.user_id, &self.session_id) {
            (Some(user), _) if !user.is_empty() => Identity::User(user.clone()),
            (_, Some(session)) if !session.is_empty() => Identity::Session(session.clone()),
            _ => Identity::Anonymous(format!("anon-{}", Uuid::new_v4())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum Identity {
    User(String),
    Session(String),
    Anonymous(String),
}

impl Identity {
    pub fn key(&self) -> &str {
        match self {
            Identity::User(k) | Identity::Session(k) | Identity::Anonymous(k) => k,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Identity::Anonymous(_))
    }

    /// Key prefixed with its kind, so a user and a session that happen to
    /// share an id never collide.
    pub fn scoped_key(&self) -> String {
        let kind = match self {
            Identity::User(_) => "user",
            Identity::Session(_) => "session",
            Identity::Anonymous(_) => "anon",
        };
        format!("{kind}:{}", self.key())
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

// ─── Context ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Mobile,
    Tablet,
    Desktop,
    #[default]
    Unknown,
}

impl DeviceClass {
    /// Classify by CSS viewport width, using the usual 768/1024 breakpoints.
    pub fn from_viewport_width(width: u32) -> Self {
        match width {
            0 => DeviceClass::Unknown,
            1..=767 => DeviceClass::Mobile,
            768..=1023 => DeviceClass::Tablet,
            _ => DeviceClass::Desktop,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Ethernet,
    Offline,
    #[default]
    Unknown,
}

/// Contextual fields stamped onto every event at track time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventContext {
    pub route: Option<String>,
    pub device_class: DeviceClass,
    pub locale: Option<String>,
    pub connection: ConnectionType,
    /// Active experiment flags, test id to variant id.
    pub experiments: BTreeMap<String, String>,
}

// ─── Event / Session ────────────────────────────────────────────────────

/// A tracked interaction. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub name: String,
    pub properties: Properties,
    pub session_id: String,
    pub user_id: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub context: EventContext,
}

/// One session per application lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_activity: DateTime<Utc>,
    pub page_views: u64,
    pub events: u64,
    pub referrer: Option<String>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
}

impl Session {
    pub fn duration(&self) -> chrono::Duration {
        self.last_activity - self.start_time
    }
}

/// Batch of events plus the session snapshot, as handed to a collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatch {
    pub batch_id: Uuid,
    pub app_id: String,
    pub events: Vec<Event>,
    pub session: Session,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub sent_at: DateTime<Utc>,
}

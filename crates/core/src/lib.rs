pub mod config;
pub mod consent;
pub mod error;
pub mod event_bus;
pub mod storage;
pub mod types;

pub use config::BeaconConfig;
pub use consent::ConsentState;
pub use error::{BeaconError, BeaconResult};
pub use event_bus::{EventSink, TrackCall};
pub use storage::KeyValueStore;
pub use types::{Event, EventBatch, Identity, Properties, Session, Visitor};

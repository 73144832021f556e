//! Tracking consent flag, read once at startup and re-checked on every call.

use crate::config::ConsentConfig;
use crate::storage::KeyValueStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

const GRANTED: &str = "granted";
const DENIED: &str = "denied";

pub struct ConsentState {
    granted: AtomicBool,
    store: Arc<dyn KeyValueStore>,
    storage_key: String,
}

impl ConsentState {
    /// Load the stored choice, falling back to the configured default when
    /// nothing (or something unrecognised) is stored.
    pub fn load(config: &ConsentConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let granted = match store.get(&config.storage_key).as_deref() {
            Some(GRANTED) => true,
            Some(DENIED) => false,
            Some(other) => {
                warn!(value = %other, "unrecognised consent value, using default");
                config.default_granted
            }
            None => config.default_granted,
        };

        info!(granted, "tracking consent loaded");
        Self {
            granted: AtomicBool::new(granted),
            store,
            storage_key: config.storage_key.clone(),
        }
    }

    /// Consent fixed in memory, for tests and hosts without storage.
    pub fn fixed(granted: bool) -> Self {
        Self {
            granted: AtomicBool::new(granted),
            store: Arc::new(crate::storage::MemoryStore::new()),
            storage_key: "beacon.consent".to_string(),
        }
    }

    pub fn is_granted(&self) -> bool {
        self.granted.load(Ordering::Acquire)
    }

    /// Record the visitor's choice. Persistence failures keep the in-memory
    /// value so the current lifetime still honours it.
    pub fn set_granted(&self, granted: bool) {
        self.granted.store(granted, Ordering::Release);
        let value = if granted { GRANTED } else { DENIED };
        if let Err(e) = self.store.set(&self.storage_key, value.to_string()) {
            warn!(error = %e, "failed to persist consent choice");
        }
        info!(granted, "tracking consent updated");
    }
}

//! Experiment registry — weighted variant assignment, sticky persistence of
//! assignments and exclusions, exposure/conversion reporting.

use std::sync::Arc;

use beacon_core::config::ExperimentConfig;
use beacon_core::error::{BeaconError, BeaconResult};
use beacon_core::event_bus::{EventSink, TrackCall};
use beacon_core::storage::KeyValueStore;
use beacon_core::types::{names, Identity, Properties, Visitor};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::analysis::{ExperimentAnalysis, ExperimentLedger};
use crate::definition::{ExperimentDefinition, ExperimentStatus, Variant, VariantConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub test_id: String,
    pub variant_id: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub assigned_at: DateTime<Utc>,
}

/// What is remembered per (test, identity). Exclusions are remembered too
/// so an excluded visitor is never re-rolled into the experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
enum StoredAssignment {
    Assigned(Assignment),
    Excluded { excluded_at: DateTime<Utc> },
}

/// Pick the first variant whose cumulative weight exceeds `draw`, where
/// `draw` is uniform in `[0, total_weight)`.
pub fn pick_variant(variants: &[Variant], draw: f64) -> Option<&Variant> {
    let mut cumulative = 0.0;
    for variant in variants {
        cumulative += variant.weight;
        if draw < cumulative {
            return Some(variant);
        }
    }
    // Float rounding at the top of the range.
    variants.iter().rev().find(|v| v.weight > 0.0)
}

/// `beacon.ab.<test>.<kind>:<id>`. Dots in the test id are escaped so the
/// first separator after the prefix always ends it.
fn storage_key(test_id: &str, identity: &Identity) -> String {
    let test_id = test_id.replace('%', "%25").replace('.', "%2E");
    format!("beacon.ab.{test_id}.{}", identity.scoped_key())
}

/// `true` when no segment list is given, the experiment does not target
/// segments, or the lists share a segment.
fn in_target_segments(experiment: &ExperimentDefinition, segments: Option<&[String]>) -> bool {
    match (segments, experiment.targeting.as_ref()) {
        (Some(segments), Some(targeting)) if !targeting.segments.is_empty() => {
            targeting.segments.iter().any(|s| segments.contains(s))
        }
        _ => true,
    }
}

pub struct ExperimentRegistry {
    experiments: DashMap<String, ExperimentDefinition>,
    assignments: DashMap<String, StoredAssignment>,
    ledgers: DashMap<String, ExperimentLedger>,
    store: Arc<dyn KeyValueStore>,
    sink: Arc<dyn EventSink>,
    rng: Mutex<StdRng>,
    sticky_exclusion: bool,
    default_min_sample_size: u64,
}

impl ExperimentRegistry {
    pub fn new(
        config: &ExperimentConfig,
        store: Arc<dyn KeyValueStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            experiments: DashMap::new(),
            assignments: DashMap::new(),
            ledgers: DashMap::new(),
            store,
            sink,
            rng: Mutex::new(StdRng::from_entropy()),
            sticky_exclusion: config.sticky_exclusion,
            default_min_sample_size: config.default_min_sample_size,
        }
    }

    /// Use a fixed RNG seed, for reproducible simulations and tests.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    // ─── Definitions ────────────────────────────────────────────────────

    /// Register or replace a definition. Once an experiment has left draft
    /// its variants and weights are frozen.
    pub fn register(&self, definition: ExperimentDefinition) -> BeaconResult<()> {
        definition.validate()?;
        if let Some(existing) = self.experiments.get(&definition.id) {
            if existing.status != ExperimentStatus::Draft {
                return Err(BeaconError::InvalidDefinition(format!(
                    "{} is {:?} and can no longer be redefined",
                    definition.id, existing.status
                )));
            }
        }

        info!(
            test_id = %definition.id,
            variants = definition.variants.len(),
            status = ?definition.status,
            "experiment registered"
        );
        self.ledgers.entry(definition.id.clone()).or_default();
        self.experiments.insert(definition.id.clone(), definition);
        Ok(())
    }

    pub fn get(&self, test_id: &str) -> Option<ExperimentDefinition> {
        self.experiments.get(test_id).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<ExperimentDefinition> {
        let mut all: Vec<_> = self.experiments.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn start(&self, test_id: &str) -> BeaconResult<ExperimentStatus> {
        self.transition(test_id, ExperimentStatus::Running)
    }

    pub fn pause(&self, test_id: &str) -> BeaconResult<ExperimentStatus> {
        self.transition(test_id, ExperimentStatus::Paused)
    }

    pub fn resume(&self, test_id: &str) -> BeaconResult<ExperimentStatus> {
        self.transition(test_id, ExperimentStatus::Running)
    }

    pub fn complete(&self, test_id: &str) -> BeaconResult<ExperimentStatus> {
        self.transition(test_id, ExperimentStatus::Completed)
    }

    fn transition(&self, test_id: &str, next: ExperimentStatus) -> BeaconResult<ExperimentStatus> {
        let mut experiment = self
            .experiments
            .get_mut(test_id)
            .ok_or_else(|| BeaconError::InvalidTransition(format!("unknown experiment {test_id}")))?;
        let current = experiment.status;
        if !current.can_transition_to(next) {
            return Err(BeaconError::InvalidTransition(format!(
                "{test_id}: {current:?} → {next:?}"
            )));
        }
        experiment.status = next;
        info!(test_id, from = ?current, to = ?next, "experiment status changed");
        Ok(next)
    }

    // ─── Assignment ─────────────────────────────────────────────────────

    /// Assign the visitor to a variant, or return their existing assignment.
    /// Unknown, non-running and excluded cases return `None`.
    pub fn assign(&self, test_id: &str, visitor: &Visitor) -> Option<Assignment> {
        self.assign_in_segments(test_id, visitor, None)
    }

    /// As [`assign`](Self::assign), additionally requiring one of the
    /// experiment's targeting segments before a fresh roll when `segments`
    /// is given. An existing assignment is returned whatever the segments.
    /// A segment miss is not remembered; membership may change.
    ///
    /// While tracking is disabled an existing assignment is still returned,
    /// but nothing new is rolled, stored or reported.
    pub fn assign_in_segments(
        &self,
        test_id: &str,
        visitor: &Visitor,
        segments: Option<&[String]>,
    ) -> Option<Assignment> {
        let Some(experiment) = self.get(test_id) else {
            debug!(test_id, "assign on unknown experiment");
            return None;
        };
        let identity = visitor.identity();
        let collecting = self.sink.is_enabled();

        let fresh = if identity.is_anonymous() {
            // Nothing to remember for a one-off key.
            if !collecting || !in_target_segments(&experiment, segments) {
                return None;
            }
            self.roll(&experiment, visitor, Utc::now())
        } else {
            let key = storage_key(test_id, &identity);
            match self.assignments.entry(key.clone()) {
                Entry::Occupied(existing) => {
                    return match existing.get() {
                        StoredAssignment::Assigned(a) => Some(a.clone()),
                        StoredAssignment::Excluded { .. } => None,
                    };
                }
                Entry::Vacant(slot) => {
                    if let Some(stored) = self.load(&key) {
                        let result = match &stored {
                            StoredAssignment::Assigned(a) => Some(a.clone()),
                            StoredAssignment::Excluded { .. } => None,
                        };
                        // Restored later, once tracking is allowed again.
                        if !collecting {
                            return result;
                        }
                        slot.insert(stored);
                        if let Some(a) = &result {
                            self.record_participant(a, &identity);
                            self.sink.annotate_experiment(&a.test_id, &a.variant_id);
                        }
                        return result;
                    }

                    if !collecting {
                        debug!(test_id, "tracking disabled, no fresh assignment");
                        return None;
                    }
                    if !in_target_segments(&experiment, segments) {
                        debug!(test_id, identity = %identity, "visitor outside target segments");
                        return None;
                    }

                    let rolled = self.roll(&experiment, visitor, Utc::now());
                    match &rolled {
                        Some(StoredAssignment::Excluded { .. }) if !self.sticky_exclusion => {}
                        Some(stored) => {
                            self.persist(&key, stored);
                            slot.insert(stored.clone());
                        }
                        None => {}
                    }
                    rolled
                }
            }
        };

        match fresh? {
            StoredAssignment::Excluded { .. } => {
                metrics::counter!("beacon.experiments.excluded").increment(1);
                debug!(test_id, identity = %identity, "visitor excluded by traffic allocation");
                None
            }
            StoredAssignment::Assigned(assignment) => {
                self.record_participant(&assignment, &identity);
                self.report_assignment(&experiment, &assignment, visitor);
                Some(assignment)
            }
        }
    }

    /// Draw traffic admission and a variant. `None` when the experiment is
    /// not accepting assignments.
    fn roll(
        &self,
        experiment: &ExperimentDefinition,
        visitor: &Visitor,
        now: DateTime<Utc>,
    ) -> Option<StoredAssignment> {
        if !experiment.is_accepting(now) {
            debug!(test_id = %experiment.id, status = ?experiment.status, "experiment not accepting assignments");
            return None;
        }

        let mut rng = self.rng.lock();
        if let Some(pct) = experiment.traffic_percentage() {
            let draw: f64 = rng.gen_range(0.0..100.0);
            if draw >= pct {
                return Some(StoredAssignment::Excluded { excluded_at: now });
            }
        }

        let total = experiment.total_weight();
        let draw: f64 = rng.gen_range(0.0..total);
        let variant = pick_variant(&experiment.variants, draw)?;
        Some(StoredAssignment::Assigned(Assignment {
            test_id: experiment.id.clone(),
            variant_id: variant.id.clone(),
            user_id: visitor.user_id.clone(),
            session_id: visitor.session_id.clone(),
            assigned_at: now,
        }))
    }

    fn load(&self, key: &str) -> Option<StoredAssignment> {
        let raw = self.store.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(stored) => Some(stored),
            Err(e) => {
                warn!(key, error = %e, "discarding unreadable stored assignment");
                None
            }
        }
    }

    fn persist(&self, key: &str, stored: &StoredAssignment) {
        let result = serde_json::to_string(stored)
            .map_err(BeaconError::from)
            .and_then(|json| self.store.set(key, json));
        if let Err(e) = result {
            warn!(key, error = %e, "failed to persist assignment");
        }
    }

    fn record_participant(&self, assignment: &Assignment, identity: &Identity) {
        self.ledgers
            .entry(assignment.test_id.clone())
            .or_default()
            .record_participant(&assignment.variant_id, &identity.scoped_key());
    }

    fn report_assignment(&self, experiment: &ExperimentDefinition, assignment: &Assignment, visitor: &Visitor) {
        metrics::counter!("beacon.experiments.assigned").increment(1);
        info!(test_id = %assignment.test_id, variant_id = %assignment.variant_id, "visitor assigned");

        self.sink.annotate_experiment(&assignment.test_id, &assignment.variant_id);
        let properties = Properties::from([
            ("test_id".to_string(), assignment.test_id.clone().into()),
            ("test_name".to_string(), experiment.name.clone().into()),
            ("variant_id".to_string(), assignment.variant_id.clone().into()),
        ]);
        self.sink
            .emit(TrackCall::new(names::AB_TEST_ASSIGNED, properties, visitor.clone()));
    }

    /// Existing assignment for the visitor, without assigning.
    pub fn get_assignment(&self, test_id: &str, visitor: &Visitor) -> Option<Assignment> {
        let identity = visitor.identity();
        if identity.is_anonymous() {
            return None;
        }
        let key = storage_key(test_id, &identity);
        let stored = match self.assignments.get(&key) {
            Some(entry) => entry.value().clone(),
            None => self.load(&key)?,
        };
        match stored {
            StoredAssignment::Assigned(a) => Some(a),
            StoredAssignment::Excluded { .. } => None,
        }
    }

    /// Configuration of the visitor's variant, assigning them if needed.
    pub fn variant_config(&self, test_id: &str, visitor: &Visitor) -> Option<VariantConfig> {
        let assignment = self.assign(test_id, visitor)?;
        let experiment = self.get(test_id)?;
        let variant = experiment.variant(&assignment.variant_id)?;
        Some(variant.config.clone())
    }

    /// Typed view of [`variant_config`](Self::variant_config). A payload that
    /// does not fit `T` is logged and treated as no configuration.
    pub fn variant_config_as<T: DeserializeOwned>(&self, test_id: &str, visitor: &Visitor) -> Option<T> {
        let config = self.variant_config(test_id, visitor)?;
        match config.decode() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(test_id, error = %e, "variant config does not match requested type");
                None
            }
        }
    }

    // ─── Conversions ────────────────────────────────────────────────────

    /// Report a conversion for an assigned visitor. Returns whether it was
    /// recorded; unassigned visitors, undeclared metrics and anything while
    /// tracking is disabled are ignored.
    pub fn track_conversion(
        &self,
        test_id: &str,
        metric: &str,
        visitor: &Visitor,
        value: Option<f64>,
    ) -> bool {
        if !self.sink.is_enabled() {
            return false;
        }
        let Some(assignment) = self.get_assignment(test_id, visitor) else {
            return false;
        };
        if let Some(experiment) = self.experiments.get(test_id) {
            if !experiment.metrics.is_empty() && !experiment.metrics.iter().any(|m| m.name == metric) {
                warn!(test_id, metric, "conversion for undeclared metric ignored");
                return false;
            }
        }

        let identity = visitor.identity();
        self.ledgers
            .entry(test_id.to_string())
            .or_default()
            .record_conversion(&assignment.variant_id, &identity.scoped_key(), metric, value);

        metrics::counter!("beacon.experiments.conversions").increment(1);
        let mut properties = Properties::from([
            ("test_id".to_string(), test_id.into()),
            ("variant_id".to_string(), assignment.variant_id.clone().into()),
            ("metric".to_string(), metric.into()),
        ]);
        if let Some(value) = value {
            properties.insert("value".to_string(), value.into());
        }
        self.sink
            .emit(TrackCall::new(names::AB_TEST_CONVERSION, properties, visitor.clone()));
        true
    }

    // ─── Analysis ───────────────────────────────────────────────────────

    pub fn analyze(&self, test_id: &str) -> Option<ExperimentAnalysis> {
        let experiment = self.get(test_id)?;
        let ledger = self
            .ledgers
            .get(test_id)
            .map(|l| l.value().clone())
            .unwrap_or_default();
        Some(ledger.analyze(&experiment, self.default_min_sample_size))
    }
}

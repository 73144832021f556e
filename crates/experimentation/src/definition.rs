//! Experiment definitions: ordered, weighted variants with typed
//! configuration payloads, optional traffic targeting, and goal metrics.

use beacon_core::error::{BeaconError, BeaconResult};
use beacon_core::types::Properties;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    #[default]
    Draft,
    Running,
    Paused,
    Completed,
}

impl ExperimentStatus {
    /// `draft → running → (paused ↔ running) → completed`
    pub fn can_transition_to(self, next: ExperimentStatus) -> bool {
        use ExperimentStatus::*;
        matches!(
            (self, next),
            (Draft, Running) | (Running, Paused) | (Paused, Running) | (Running, Completed) | (Paused, Completed)
        )
    }
}

/// A single value in a variant configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<ConfigValue>),
}

/// Configuration a variant hands to the UI. Values are restricted to
/// [`ConfigValue`]; use [`VariantConfig::decode`] to read it as a struct.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariantConfig(BTreeMap<String, ConfigValue>);

impl VariantConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: ConfigValue) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.0.get(key)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            ConfigValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            ConfigValue::Float(f) => Some(*f),
            ConfigValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key)? {
            ConfigValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Read the whole payload as a caller-defined struct.
    pub fn decode<T: DeserializeOwned>(&self) -> BeaconResult<T> {
        let value = serde_json::to_value(&self.0)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Flatten into event properties at the serialization boundary.
    pub fn to_properties(&self) -> Properties {
        self.0
            .iter()
            .filter_map(|(k, v)| serde_json::to_value(v).ok().map(|v| (k.clone(), v)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    /// Relative weight, 0–100. Weights need not sum to 100.
    pub weight: f64,
    #[serde(default)]
    pub config: VariantConfig,
}

impl Variant {
    pub fn new(id: impl Into<String>, weight: f64) -> Self {
        Self {
            id: id.into(),
            weight,
            config: VariantConfig::default(),
        }
    }

    pub fn with_config(mut self, config: VariantConfig) -> Self {
        self.config = config;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Targeting {
    /// Share of identities admitted into the experiment, 0–100.
    #[serde(default)]
    pub traffic_percentage: Option<f64>,
    /// Audience segments; an identity must belong to one when segments are
    /// supplied at assignment time.
    #[serde(default)]
    pub segments: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Conversion,
    Engagement,
    Revenue,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MetricGoal {
    #[default]
    Increase,
    Decrease,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub name: String,
    pub kind: MetricKind,
    #[serde(default)]
    pub goal: MetricGoal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDefinition {
    pub id: String,
    pub name: String,
    /// Ordered; the first variant is the control.
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub status: ExperimentStatus,
    #[serde(default = "Utc::now")]
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub targeting: Option<Targeting>,
    #[serde(default)]
    pub metrics: Vec<MetricDefinition>,
    /// Participants needed before the analysis recommends anything.
    #[serde(default)]
    pub min_sample_size: Option<u64>,
}

impl ExperimentDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, variants: Vec<Variant>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            variants,
            status: ExperimentStatus::Draft,
            start_date: Utc::now(),
            end_date: None,
            targeting: None,
            metrics: Vec::new(),
            min_sample_size: None,
        }
    }

    pub fn with_traffic(mut self, percentage: f64) -> Self {
        self.targeting.get_or_insert_with(Targeting::default).traffic_percentage = Some(percentage);
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, kind: MetricKind, goal: MetricGoal) -> Self {
        self.metrics.push(MetricDefinition {
            name: name.into(),
            kind,
            goal,
        });
        self
    }

    pub fn total_weight(&self) -> f64 {
        self.variants.iter().map(|v| v.weight).sum()
    }

    pub fn variant(&self, variant_id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == variant_id)
    }

    pub fn control(&self) -> Option<&Variant> {
        self.variants.first()
    }

    pub fn traffic_percentage(&self) -> Option<f64> {
        self.targeting.as_ref().and_then(|t| t.traffic_percentage)
    }

    /// Whether the experiment accepts new assignments at `now`.
    pub fn is_accepting(&self, now: DateTime<Utc>) -> bool {
        self.status == ExperimentStatus::Running
            && now >= self.start_date
            && self.end_date.map_or(true, |end| now < end)
    }

    pub fn validate(&self) -> BeaconResult<()> {
        let invalid = |msg: String| Err(BeaconError::InvalidDefinition(format!("{}: {msg}", self.id)));

        if self.id.trim().is_empty() {
            return Err(BeaconError::InvalidDefinition("experiment id is empty".to_string()));
        }
        if self.variants.is_empty() {
            return invalid("at least one variant is required".to_string());
        }
        let mut seen = HashSet::new();
        for variant in &self.variants {
            if variant.id.trim().is_empty() {
                return invalid("variant id is empty".to_string());
            }
            if !seen.insert(variant.id.as_str()) {
                return invalid(format!("duplicate variant id {}", variant.id));
            }
            if !variant.weight.is_finite() || !(0.0..=100.0).contains(&variant.weight) {
                return invalid(format!("variant {} weight must be within 0–100", variant.id));
            }
        }
        if self.total_weight() <= 0.0 {
            return invalid("variant weights sum to zero".to_string());
        }
        if let Some(pct) = self.traffic_percentage() {
            if !pct.is_finite() || !(0.0..=100.0).contains(&pct) {
                return invalid("traffic percentage must be within 0–100".to_string());
            }
        }
        if let Some(end) = self.end_date {
            if end <= self.start_date {
                return invalid("end date must be after start date".to_string());
            }
        }
        let mut metric_names = HashSet::new();
        for metric in &self.metrics {
            if !metric_names.insert(metric.name.as_str()) {
                return invalid(format!("duplicate metric {}", metric.name));
            }
        }
        Ok(())
    }
}

//! Per-experiment participant/conversion ledger and the figures derived
//! from it. Rates are raw; significance testing is left downstream.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::definition::{ExperimentDefinition, ExperimentStatus, MetricGoal};

/// Relative lift (percent) a variant needs over control before the
/// analysis calls it a winner or a loser.
pub const DECISION_LIFT_PCT: f64 = 5.0;

const Z_95: f64 = 1.96;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Implement,
    Continue,
    Stop,
}

#[derive(Debug, Clone, Default)]
struct MetricTally {
    converters: HashSet<String>,
    conversions: u64,
    total_value: f64,
}

#[derive(Debug, Clone, Default)]
struct VariantTally {
    participants: HashSet<String>,
    metrics: HashMap<String, MetricTally>,
}

#[derive(Debug, Clone, Default)]
pub struct ExperimentLedger {
    variants: HashMap<String, VariantTally>,
}

impl ExperimentLedger {
    pub fn record_participant(&mut self, variant_id: &str, identity: &str) {
        self.variants
            .entry(variant_id.to_string())
            .or_default()
            .participants
            .insert(identity.to_string());
    }

    pub fn record_conversion(&mut self, variant_id: &str, identity: &str, metric: &str, value: Option<f64>) {
        let variant = self.variants.entry(variant_id.to_string()).or_default();
        variant.participants.insert(identity.to_string());
        let tally = variant.metrics.entry(metric.to_string()).or_default();
        tally.converters.insert(identity.to_string());
        tally.conversions += 1;
        tally.total_value += value.unwrap_or(0.0);
    }

    pub fn total_participants(&self) -> u64 {
        self.variants.values().map(|v| v.participants.len() as u64).sum()
    }

    /// Derive figures for `experiment`. The primary metric is the first
    /// declared one; experiments without metrics count any conversion.
    pub fn analyze(&self, experiment: &ExperimentDefinition, default_min_sample_size: u64) -> ExperimentAnalysis {
        let primary = experiment.metrics.first();
        let goal = primary.map(|m| m.goal).unwrap_or_default();
        let min_sample = experiment.min_sample_size.unwrap_or(default_min_sample_size);

        let mut variants: Vec<VariantAnalysis> = experiment
            .variants
            .iter()
            .map(|variant| self.variant_figures(&variant.id, primary.map(|m| m.name.as_str())))
            .collect();

        let control_rate = variants.first().map(|v| v.conversion_rate).unwrap_or(0.0);
        for variant in variants.iter_mut().skip(1) {
            variant.lift = relative_lift(variant.conversion_rate, control_rate);
        }

        let confidence = sample_confidence(&variants, min_sample);
        let recommendation = recommend(&variants, goal, min_sample);

        ExperimentAnalysis {
            test_id: experiment.id.clone(),
            status: experiment.status,
            primary_metric: primary.map(|m| m.name.clone()),
            total_participants: self.total_participants(),
            min_sample_size: min_sample,
            variants,
            confidence,
            recommendation,
            analyzed_at: Utc::now(),
        }
    }

    fn variant_figures(&self, variant_id: &str, metric: Option<&str>) -> VariantAnalysis {
        let Some(tally) = self.variants.get(variant_id) else {
            return VariantAnalysis::empty(variant_id);
        };
        let participants = tally.participants.len() as u64;

        let (converters, conversions, total_value) = match metric {
            Some(name) => tally
                .metrics
                .get(name)
                .map(|m| (m.converters.len() as u64, m.conversions, m.total_value))
                .unwrap_or_default(),
            None => {
                let converters: HashSet<&String> =
                    tally.metrics.values().flat_map(|m| m.converters.iter()).collect();
                (
                    converters.len() as u64,
                    tally.metrics.values().map(|m| m.conversions).sum(),
                    tally.metrics.values().map(|m| m.total_value).sum(),
                )
            }
        };

        let (conversion_rate, margin_of_error) = if participants == 0 {
            (0.0, 0.0)
        } else {
            let p = (converters as f64 / participants as f64).min(1.0);
            (p * 100.0, Z_95 * (p * (1.0 - p) / participants as f64).sqrt() * 100.0)
        };

        VariantAnalysis {
            variant_id: variant_id.to_string(),
            participants,
            converters,
            conversions,
            conversion_rate,
            margin_of_error,
            total_value,
            lift: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariantAnalysis {
    pub variant_id: String,
    pub participants: u64,
    /// Distinct identities with at least one conversion.
    pub converters: u64,
    pub conversions: u64,
    /// Percent of participants who converted.
    pub conversion_rate: f64,
    /// 95% margin of error on `conversion_rate`, in percentage points.
    pub margin_of_error: f64,
    pub total_value: f64,
    /// Relative change vs control in percent. `None` for the control and
    /// when the control has not converted anyone.
    pub lift: Option<f64>,
}

impl VariantAnalysis {
    fn empty(variant_id: &str) -> Self {
        Self {
            variant_id: variant_id.to_string(),
            participants: 0,
            converters: 0,
            conversions: 0,
            conversion_rate: 0.0,
            margin_of_error: 0.0,
            total_value: 0.0,
            lift: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentAnalysis {
    pub test_id: String,
    pub status: ExperimentStatus,
    pub primary_metric: Option<String>,
    pub total_participants: u64,
    pub min_sample_size: u64,
    pub variants: Vec<VariantAnalysis>,
    /// Share of the required per-variant sample collected so far (0-100).
    pub confidence: f64,
    pub recommendation: Recommendation,
    pub analyzed_at: DateTime<Utc>,
}

fn relative_lift(rate: f64, control_rate: f64) -> Option<f64> {
    (control_rate > 0.0).then(|| (rate - control_rate) / control_rate * 100.0)
}

fn sample_confidence(variants: &[VariantAnalysis], min_sample: u64) -> f64 {
    if variants.is_empty() {
        return 0.0;
    }
    if min_sample == 0 {
        return 100.0;
    }
    let smallest = variants.iter().map(|v| v.participants).min().unwrap_or(0);
    (smallest as f64 / min_sample as f64 * 100.0).min(100.0)
}

fn recommend(variants: &[VariantAnalysis], goal: MetricGoal, min_sample: u64) -> Recommendation {
    if variants.len() < 2 || variants.iter().any(|v| v.participants < min_sample) {
        return Recommendation::Continue;
    }

    // Lift in the goal's direction: positive is always good.
    let directed: Vec<Option<f64>> = variants[1..]
        .iter()
        .map(|v| {
            v.lift.map(|lift| match goal {
                MetricGoal::Increase => lift,
                MetricGoal::Decrease => -lift,
            })
        })
        .collect();

    if directed.iter().flatten().any(|&lift| lift >= DECISION_LIFT_PCT) {
        return Recommendation::Implement;
    }
    if directed.iter().all(|lift| matches!(lift, Some(l) if *l <= -DECISION_LIFT_PCT)) {
        return Recommendation::Stop;
    }
    Recommendation::Continue
}

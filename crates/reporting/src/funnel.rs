//! Funnel analysis — tracks identity progression through multi-step
//! conversion paths within a time window.

use std::collections::HashMap;
use std::sync::Arc;

use beacon_core::error::{BeaconError, BeaconResult};
use beacon_core::event_bus::{EventSink, TrackCall};
use beacon_core::types::{names, Properties, Visitor};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelStep {
    pub name: String,
    /// Event that completes this step when fed through `observe`.
    pub event: String,
    /// Property filter; every entry must match the observed event.
    #[serde(default)]
    pub properties: Properties,
}

impl FunnelStep {
    pub fn new(name: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            event: event.into(),
            properties: Properties::new(),
        }
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    fn matches(&self, event: &str, properties: &Properties) -> bool {
        self.event == event
            && self
                .properties
                .iter()
                .all(|(k, v)| properties.get(k) == Some(v))
    }
}

/// How a step counts as reached for an identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOrdering {
    /// Any in-window record of the step, regardless of the other steps.
    #[default]
    Presence,
    /// The previous step must be reached first, and no later than this one.
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelDefinition {
    pub name: String,
    pub steps: Vec<FunnelStep>,
    pub conversion_window_hours: u32,
    #[serde(default)]
    pub ordering: StepOrdering,
}

impl FunnelDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<FunnelStep>, conversion_window_hours: u32) -> Self {
        Self {
            name: name.into(),
            steps,
            conversion_window_hours,
            ordering: StepOrdering::Presence,
        }
    }

    pub fn strict(mut self) -> Self {
        self.ordering = StepOrdering::Strict;
        self
    }

    pub fn window(&self) -> Duration {
        Duration::hours(i64::from(self.conversion_window_hours))
    }

    fn step_index(&self, step_name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == step_name)
    }

    pub fn validate(&self) -> BeaconResult<()> {
        if self.name.trim().is_empty() {
            return Err(BeaconError::InvalidDefinition("funnel name is empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(BeaconError::InvalidDefinition(format!("{}: funnel has no steps", self.name)));
        }
        if self.conversion_window_hours == 0 {
            return Err(BeaconError::InvalidDefinition(format!(
                "{}: conversion window must be positive",
                self.name
            )));
        }
        for (i, step) in self.steps.iter().enumerate() {
            if step.name.trim().is_empty() || step.event.trim().is_empty() {
                return Err(BeaconError::InvalidDefinition(format!(
                    "{}: step {i} needs a name and an event",
                    self.name
                )));
            }
            if self.steps[..i].iter().any(|s| s.name == step.name) {
                return Err(BeaconError::InvalidDefinition(format!(
                    "{}: duplicate step {}",
                    self.name, step.name
                )));
            }
        }
        Ok(())
    }
}

/// One step completion. Appended, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelStepRecord {
    pub funnel: String,
    pub step: String,
    pub event: String,
    pub properties: Properties,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub identity: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The `window` leading up to `now`.
    pub fn trailing(window: Duration, now: DateTime<Utc>) -> Self {
        Self {
            start: now - window,
            end: now,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelStepResult {
    pub step_name: String,
    /// Identities that reached this step.
    pub reached: u64,
    pub conversion_rate: f64,
    pub dropoff_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelAnalysis {
    pub funnel: String,
    pub range: TimeRange,
    pub ordering: StepOrdering,
    pub total_entrants: u64,
    pub steps: Vec<FunnelStepResult>,
    pub overall_conversion_rate: f64,
    /// Over identities that reached the final step.
    pub average_time_to_complete_secs: Option<f64>,
    pub median_time_to_complete_secs: Option<f64>,
    pub computed_at: DateTime<Utc>,
}

pub struct FunnelEngine {
    funnels: DashMap<String, FunnelDefinition>,
    records: DashMap<String, Vec<FunnelStepRecord>>,
    sink: Arc<dyn EventSink>,
}

impl FunnelEngine {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            funnels: DashMap::new(),
            records: DashMap::new(),
            sink,
        }
    }

    /// Register or replace a funnel. Recorded steps are kept.
    pub fn define_funnel(&self, funnel: FunnelDefinition) -> BeaconResult<()> {
        funnel.validate()?;
        info!(funnel = %funnel.name, steps = funnel.steps.len(), ordering = ?funnel.ordering, "funnel defined");
        self.funnels.insert(funnel.name.clone(), funnel);
        Ok(())
    }

    pub fn list_funnels(&self) -> Vec<FunnelDefinition> {
        let mut all: Vec<_> = self.funnels.iter().map(|f| f.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Record that `visitor` completed `step`. Unknown funnels or steps are
    /// ignored, as is everything while tracking is disabled. Returns whether
    /// a record was appended.
    pub fn record_step(&self, funnel: &str, step: &str, visitor: &Visitor, properties: Properties) -> bool {
        self.record_step_at(funnel, step, visitor, properties, Utc::now())
    }

    pub fn record_step_at(
        &self,
        funnel: &str,
        step: &str,
        visitor: &Visitor,
        properties: Properties,
        timestamp: DateTime<Utc>,
    ) -> bool {
        if !self.sink.is_enabled() {
            return false;
        }
        let Some(definition) = self.funnels.get(funnel) else {
            warn!(funnel, step, "step recorded for unknown funnel");
            return false;
        };
        let Some(index) = definition.step_index(step) else {
            warn!(funnel, step, "unknown funnel step");
            return false;
        };
        let event = definition.steps[index].event.clone();
        drop(definition);

        self.append(funnel, index, step, &event, visitor, properties, timestamp);
        true
    }

    /// Feed a tracked event through every funnel, recording each step whose
    /// event and property filter match. Returns the number of steps recorded.
    pub fn observe(&self, event: &str, properties: &Properties, visitor: &Visitor) -> usize {
        self.observe_at(event, properties, visitor, Utc::now())
    }

    pub fn observe_at(
        &self,
        event: &str,
        properties: &Properties,
        visitor: &Visitor,
        timestamp: DateTime<Utc>,
    ) -> usize {
        if !self.sink.is_enabled() {
            return 0;
        }
        let matched: Vec<(String, usize, String)> = self
            .funnels
            .iter()
            .flat_map(|funnel| {
                funnel
                    .steps
                    .iter()
                    .enumerate()
                    .filter(|(_, step)| step.matches(event, properties))
                    .map(|(i, step)| (funnel.name.clone(), i, step.name.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        for (funnel, index, step) in &matched {
            self.append(funnel, *index, step, event, visitor, properties.clone(), timestamp);
        }
        if !matched.is_empty() {
            debug!(event, steps = matched.len(), "event matched funnel steps");
        }
        matched.len()
    }

    #[allow(clippy::too_many_arguments)]
    fn append(
        &self,
        funnel: &str,
        index: usize,
        step: &str,
        event: &str,
        visitor: &Visitor,
        properties: Properties,
        timestamp: DateTime<Utc>,
    ) {
        let identity = visitor.identity();
        let record = FunnelStepRecord {
            funnel: funnel.to_string(),
            step: step.to_string(),
            event: event.to_string(),
            properties: properties.clone(),
            timestamp,
            user_id: visitor.user_id.clone(),
            session_id: visitor.session_id.clone(),
            identity: identity.scoped_key(),
        };
        self.records.entry(funnel.to_string()).or_default().push(record);
        metrics::counter!("beacon.funnel.steps").increment(1);

        let mut emitted = properties;
        emitted.insert("funnel".to_string(), funnel.into());
        emitted.insert("step".to_string(), step.into());
        emitted.insert("step_index".to_string(), index.into());
        emitted.insert("event".to_string(), event.into());
        self.sink
            .emit(TrackCall::new(names::FUNNEL_STEP, emitted, visitor.clone()));
    }

    pub fn records(&self, funnel: &str) -> Vec<FunnelStepRecord> {
        self.records
            .get(funnel)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    /// Step-wise conversion over `range`, defaulting to the funnel's window
    /// ending now. `None` only for an unknown funnel.
    pub fn analyze(&self, funnel: &str, range: Option<TimeRange>) -> Option<FunnelAnalysis> {
        let definition = self.funnels.get(funnel)?.value().clone();
        let range = range.unwrap_or_else(|| TimeRange::trailing(definition.window(), Utc::now()));
        // Snapshot, so writers are not held up by the scan.
        let records = self.records(funnel);
        Some(compute(&definition, &records, range))
    }
}

fn compute(definition: &FunnelDefinition, records: &[FunnelStepRecord], range: TimeRange) -> FunnelAnalysis {
    let step_count = definition.steps.len();

    // identity -> per-step in-window timestamps
    let mut journeys: HashMap<&str, Vec<Vec<DateTime<Utc>>>> = HashMap::new();
    for record in records.iter().filter(|r| range.contains(r.timestamp)) {
        let Some(index) = definition.step_index(&record.step) else {
            continue;
        };
        journeys
            .entry(record.identity.as_str())
            .or_insert_with(|| vec![Vec::new(); step_count])[index]
            .push(record.timestamp);
    }

    let total_entrants = journeys.len() as u64;
    let mut reached = vec![0u64; step_count];
    let mut completion_secs = Vec::new();

    for steps in journeys.values() {
        let reached_at = reached_times(steps, definition.ordering);
        for (i, at) in reached_at.iter().enumerate() {
            if at.is_some() {
                reached[i] += 1;
            }
        }
        if let Some(Some(finished)) = reached_at.last() {
            let first = steps.iter().flatten().min().copied().unwrap_or(*finished);
            completion_secs.push((*finished - first).num_milliseconds().max(0) as f64 / 1000.0);
        }
    }

    let steps = definition
        .steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let denominator = if i == 0 { total_entrants } else { reached[i - 1] };
            let conversion_rate = percentage(reached[i], denominator).min(100.0);
            FunnelStepResult {
                step_name: step.name.clone(),
                reached: reached[i],
                conversion_rate,
                dropoff_rate: if total_entrants == 0 { 0.0 } else { 100.0 - conversion_rate },
            }
        })
        .collect();

    let completed = reached.last().copied().unwrap_or(0);
    FunnelAnalysis {
        funnel: definition.name.clone(),
        range,
        ordering: definition.ordering,
        total_entrants,
        steps,
        overall_conversion_rate: percentage(completed, total_entrants),
        average_time_to_complete_secs: mean(&completion_secs),
        median_time_to_complete_secs: median(&mut completion_secs),
        computed_at: Utc::now(),
    }
}

/// When each step counts as reached for one identity.
fn reached_times(steps: &[Vec<DateTime<Utc>>], ordering: StepOrdering) -> Vec<Option<DateTime<Utc>>> {
    match ordering {
        StepOrdering::Presence => steps.iter().map(|times| times.iter().min().copied()).collect(),
        StepOrdering::Strict => {
            let mut out = Vec::with_capacity(steps.len());
            let mut previous: Option<DateTime<Utc>> = None;
            for (i, times) in steps.iter().enumerate() {
                let at = if i == 0 {
                    times.iter().min().copied()
                } else {
                    previous.and_then(|prev| times.iter().filter(|t| **t >= prev).min().copied())
                };
                out.push(at);
                previous = at;
            }
            out
        }
    }
}

fn percentage(count: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64 * 100.0
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use beacon_core::event_bus::{capture_sink, CaptureSink};

    fn signup() -> FunnelDefinition {
        FunnelDefinition::new(
            "signup",
            vec![
                FunnelStep::new("landing", "page_view").with_filter("route", "/join"),
                FunnelStep::new("form_start", "form_start"),
                FunnelStep::new("form_complete", "form_complete"),
            ],
            24,
        )
    }

    fn engine() -> (FunnelEngine, Arc<CaptureSink>) {
        let sink = capture_sink();
        let engine = FunnelEngine::new(sink.clone());
        engine.define_funnel(signup()).unwrap();
        (engine, sink)
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap() + Duration::minutes(minutes)
    }

    fn range() -> TimeRange {
        TimeRange::new(at(0), at(24 * 60))
    }

    #[test]
    fn test_define_rejects_malformed() {
        let engine = FunnelEngine::new(capture_sink());
        assert!(engine.define_funnel(FunnelDefinition::new("empty", vec![], 24)).is_err());
        assert!(engine
            .define_funnel(FunnelDefinition::new("w", vec![FunnelStep::new("a", "a")], 0))
            .is_err());
        assert!(engine
            .define_funnel(FunnelDefinition::new(
                "dup",
                vec![FunnelStep::new("a", "x"), FunnelStep::new("a", "y")],
                1
            ))
            .is_err());
        assert!(engine.list_funnels().is_empty());
    }

    #[test]
    fn test_step_wise_conversion() {
        let (engine, sink) = engine();
        for i in 0..100 {
            let visitor = Visitor::user(format!("u-{i}"));
            engine.record_step_at("signup", "landing", &visitor, Properties::new(), at(1));
            if i < 40 {
                engine.record_step_at("signup", "form_start", &visitor, Properties::new(), at(2));
            }
            if i < 10 {
                engine.record_step_at("signup", "form_complete", &visitor, Properties::new(), at(5));
            }
        }

        let analysis = engine.analyze("signup", Some(range())).unwrap();
        assert_eq!(analysis.total_entrants, 100);
        let rates: Vec<f64> = analysis.steps.iter().map(|s| s.conversion_rate).collect();
        assert_eq!(rates, vec![100.0, 40.0, 25.0]);
        assert_eq!(analysis.steps[1].dropoff_rate, 60.0);
        assert_eq!(analysis.overall_conversion_rate, 10.0);
        assert_eq!(analysis.average_time_to_complete_secs, Some(240.0));
        assert_eq!(analysis.median_time_to_complete_secs, Some(240.0));
        assert_eq!(sink.count_named(names::FUNNEL_STEP), 150);
    }

    #[test]
    fn test_unknown_funnel_or_step_is_noop() {
        let (engine, sink) = engine();
        let visitor = Visitor::user("u-1");
        assert!(!engine.record_step("nope", "landing", &visitor, Properties::new()));
        assert!(!engine.record_step("signup", "checkout", &visitor, Properties::new()));
        assert!(engine.analyze("nope", None).is_none());
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_nothing_recorded_while_disabled() {
        let (engine, sink) = engine();
        let visitor = Visitor::user("u-1");
        sink.set_enabled(false);

        assert!(!engine.record_step("signup", "form_start", &visitor, Properties::new()));
        let join = Properties::from([("route".to_string(), serde_json::json!("/join"))]);
        assert_eq!(engine.observe("page_view", &join, &visitor), 0);
        assert!(engine.records("signup").is_empty());
        assert_eq!(sink.count(), 0);

        sink.set_enabled(true);
        assert_eq!(engine.observe("page_view", &join, &visitor), 1);
        assert_eq!(engine.records("signup").len(), 1);
    }

    #[test]
    fn test_zero_entrants() {
        let (engine, _) = engine();
        let analysis = engine.analyze("signup", None).unwrap();
        assert_eq!(analysis.total_entrants, 0);
        assert_eq!(analysis.overall_conversion_rate, 0.0);
        assert!(analysis
            .steps
            .iter()
            .all(|s| s.conversion_rate == 0.0 && s.dropoff_rate == 0.0 && s.reached == 0));
        assert!(analysis.average_time_to_complete_secs.is_none());
    }

    #[test]
    fn test_window_excludes_old_records() {
        let (engine, _) = engine();
        let visitor = Visitor::user("u-1");
        engine.record_step_at("signup", "landing", &visitor, Properties::new(), at(-60));
        engine.record_step_at("signup", "form_start", &visitor, Properties::new(), at(10));

        let analysis = engine.analyze("signup", Some(range())).unwrap();
        assert_eq!(analysis.total_entrants, 1);
        assert_eq!(analysis.steps[0].reached, 0);
        assert_eq!(analysis.steps[0].conversion_rate, 0.0);
        // Still counted at its own step even though the previous one is missing.
        assert_eq!(analysis.steps[1].reached, 1);
        assert_eq!(analysis.steps[1].conversion_rate, 0.0);
    }

    #[test]
    fn test_presence_vs_strict_ordering() {
        let sink = capture_sink();
        let engine = FunnelEngine::new(sink);
        engine.define_funnel(signup()).unwrap();
        let mut strict = signup().strict();
        strict.name = "signup_strict".to_string();
        engine.define_funnel(strict).unwrap();

        let visitor = Visitor::user("backwards");
        for funnel in ["signup", "signup_strict"] {
            engine.record_step_at(funnel, "form_complete", &visitor, Properties::new(), at(1));
            engine.record_step_at(funnel, "form_start", &visitor, Properties::new(), at(2));
            engine.record_step_at(funnel, "landing", &visitor, Properties::new(), at(3));
        }

        let presence = engine.analyze("signup", Some(range())).unwrap();
        assert_eq!(presence.overall_conversion_rate, 100.0);

        let strict = engine.analyze("signup_strict", Some(range())).unwrap();
        assert_eq!(strict.steps[0].reached, 1);
        assert_eq!(strict.steps[1].reached, 0);
        assert_eq!(strict.overall_conversion_rate, 0.0);
    }

    #[test]
    fn test_observe_matches_filters() {
        let (engine, sink) = engine();
        let visitor = Visitor::session("s-1");
        let join = Properties::from([("route".to_string(), serde_json::json!("/join"))]);
        let home = Properties::from([("route".to_string(), serde_json::json!("/"))]);

        assert_eq!(engine.observe("page_view", &home, &visitor), 0);
        assert_eq!(engine.observe("page_view", &join, &visitor), 1);
        assert_eq!(engine.observe("form_start", &Properties::new(), &visitor), 1);
        assert_eq!(engine.observe("unrelated", &Properties::new(), &visitor), 0);

        let records = engine.records("signup");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].identity, "session:s-1");
        let emitted = sink.calls();
        assert_eq!(emitted[0].properties["step"], "landing");
        assert_eq!(emitted[0].properties["route"], "/join");
    }

    #[test]
    fn test_median_time() {
        let (engine, _) = engine();
        for (i, minutes) in [1i64, 2, 10].iter().enumerate() {
            let visitor = Visitor::user(format!("u-{i}"));
            engine.record_step_at("signup", "landing", &visitor, Properties::new(), at(0));
            engine.record_step_at("signup", "form_start", &visitor, Properties::new(), at(0));
            engine.record_step_at("signup", "form_complete", &visitor, Properties::new(), at(*minutes));
        }
        let analysis = engine.analyze("signup", Some(range())).unwrap();
        assert_eq!(analysis.median_time_to_complete_secs, Some(120.0));
        assert_eq!(analysis.average_time_to_complete_secs, Some(260.0));
    }
}

//! Cohort analysis — weekly acquisition cohorts, "ever returns after N days"
//! retention curves, engagement over returning members, and a trend summary.

use std::collections::BTreeMap;
use std::sync::Arc;

use beacon_core::event_bus::{EventSink, TrackCall};
use beacon_core::types::{names, Properties, Visitor};
use chrono::{Datelike, Duration, NaiveDate, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Retention horizons, in days after the cohort's bucket date.
pub const HORIZONS: [i64; 6] = [1, 3, 7, 14, 30, 90];

/// Relative change in mean day-7 retention that counts as a trend.
const TREND_THRESHOLD: f64 = 0.10;
const TREND_WINDOW: usize = 3;

/// Monday of the ISO week containing `date`.
pub fn week_bucket(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

/// One user's activity on one calendar day. Reports for the same day merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyActivity {
    pub events: u64,
    pub sessions: u64,
    pub duration_secs: u64,
}

impl DailyActivity {
    fn merge(&mut self, other: DailyActivity) {
        self.events += other.events;
        self.sessions += other.sessions;
        self.duration_secs += other.duration_secs;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Retention {
    pub day1: f64,
    pub day3: f64,
    pub day7: f64,
    pub day14: f64,
    pub day30: f64,
    pub day90: f64,
}

impl Retention {
    fn from_rates(rates: [f64; 6]) -> Self {
        let [day1, day3, day7, day14, day30, day90] = rates;
        Self {
            day1,
            day3,
            day7,
            day14,
            day30,
            day90,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Engagement {
    pub average_sessions: f64,
    pub average_events: f64,
    /// Seconds per session.
    pub average_session_duration: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortRow {
    pub cohort_date: NaiveDate,
    pub total_users: u64,
    pub active_users: u64,
    pub retention: Retention,
    pub engagement: Engagement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortSummary {
    pub average_day1: f64,
    pub average_day7: f64,
    pub average_day30: f64,
    pub best_cohort: Option<NaiveDate>,
    pub worst_cohort: Option<NaiveDate>,
    pub trend: Trend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortAnalysis {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub cohorts: Vec<CohortRow>,
    pub summary: CohortSummary,
    pub computed_at: chrono::DateTime<Utc>,
}

pub struct CohortEngine {
    members: DashMap<String, NaiveDate>,
    activity: DashMap<String, BTreeMap<NaiveDate, DailyActivity>>,
    sink: Arc<dyn EventSink>,
}

impl CohortEngine {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            members: DashMap::new(),
            activity: DashMap::new(),
            sink,
        }
    }

    /// Place `user_id` in the cohort for the week of `signup_date`. The first
    /// call wins; the effective bucket is returned either way. While tracking
    /// is disabled only an existing membership is returned.
    pub fn assign_cohort(&self, user_id: &str, signup_date: NaiveDate) -> Option<NaiveDate> {
        if user_id.is_empty() {
            return None;
        }
        if !self.sink.is_enabled() {
            return self.cohort_of(user_id);
        }
        let bucket = week_bucket(signup_date);
        let mut created = false;
        let effective = *self
            .members
            .entry(user_id.to_string())
            .or_insert_with(|| {
                created = true;
                bucket
            });

        if created {
            info!(user_id, cohort = %effective, "cohort assigned");
            let properties = Properties::from([
                ("cohort".to_string(), effective.to_string().into()),
                ("signup_date".to_string(), signup_date.to_string().into()),
            ]);
            self.sink
                .emit(TrackCall::new(names::COHORT_ASSIGNED, properties, Visitor::user(user_id)));
        } else if effective != bucket {
            debug!(user_id, cohort = %effective, ignored = %bucket, "cohort already assigned");
        }
        Some(effective)
    }

    pub fn cohort_of(&self, user_id: &str) -> Option<NaiveDate> {
        self.members.get(user_id).map(|c| *c.value())
    }

    /// Merge one activity report into the user's record for `date`. Dropped
    /// while tracking is disabled.
    pub fn record_activity(&self, user_id: &str, date: NaiveDate, activity: DailyActivity) {
        if user_id.is_empty() || !self.sink.is_enabled() {
            return;
        }
        self.activity
            .entry(user_id.to_string())
            .or_default()
            .entry(date)
            .or_default()
            .merge(activity);
        metrics::counter!("beacon.cohort.activity").increment(1);
    }

    pub fn activity_of(&self, user_id: &str, date: NaiveDate) -> Option<DailyActivity> {
        self.activity.get(user_id)?.get(&date).copied()
    }

    /// Retention and engagement for every weekly bucket between `start` and
    /// `end` that has members.
    pub fn analyze(&self, start: NaiveDate, end: NaiveDate) -> CohortAnalysis {
        let first = week_bucket(start);

        let mut buckets: BTreeMap<NaiveDate, Vec<String>> = BTreeMap::new();
        for member in self.members.iter() {
            let bucket = *member.value();
            if bucket >= first && bucket <= end {
                buckets.entry(bucket).or_default().push(member.key().clone());
            }
        }

        let cohorts: Vec<CohortRow> = buckets
            .into_iter()
            .map(|(bucket, users)| self.cohort_row(bucket, &users))
            .collect();
        let summary = summarize(&cohorts);

        CohortAnalysis {
            start,
            end,
            cohorts,
            summary,
            computed_at: Utc::now(),
        }
    }

    fn cohort_row(&self, bucket: NaiveDate, users: &[String]) -> CohortRow {
        let total = users.len() as u64;
        let mut returned = [0u64; 6];
        let mut active = 0u64;
        let mut totals = DailyActivity::default();

        for user in users {
            let Some(days) = self.activity.get(user) else {
                continue;
            };
            if days.is_empty() {
                continue;
            }
            active += 1;
            for day in days.values() {
                totals.merge(*day);
            }
            let Some(last) = days.keys().next_back() else {
                continue;
            };
            for (i, horizon) in HORIZONS.iter().enumerate() {
                if *last >= bucket + Duration::days(*horizon) {
                    returned[i] += 1;
                }
            }
        }

        let rates = returned.map(|n| ratio(n, total) * 100.0);
        let engagement = if active == 0 {
            Engagement::default()
        } else {
            Engagement {
                average_sessions: ratio(totals.sessions, active),
                average_events: ratio(totals.events, active),
                average_session_duration: ratio(totals.duration_secs, totals.sessions),
            }
        };

        CohortRow {
            cohort_date: bucket,
            total_users: total,
            active_users: active,
            retention: Retention::from_rates(rates),
            engagement,
        }
    }
}

fn ratio(n: u64, d: u64) -> f64 {
    if d == 0 {
        0.0
    } else {
        n as f64 / d as f64
    }
}

fn average(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

fn summarize(cohorts: &[CohortRow]) -> CohortSummary {
    let best = cohorts
        .iter()
        .max_by(|a, b| a.retention.day7.total_cmp(&b.retention.day7))
        .map(|c| c.cohort_date);
    let worst = cohorts
        .iter()
        .min_by(|a, b| a.retention.day7.total_cmp(&b.retention.day7))
        .map(|c| c.cohort_date);

    CohortSummary {
        average_day1: average(cohorts.iter().map(|c| c.retention.day1)),
        average_day7: average(cohorts.iter().map(|c| c.retention.day7)),
        average_day30: average(cohorts.iter().map(|c| c.retention.day30)),
        best_cohort: best,
        worst_cohort: worst,
        trend: trend(cohorts),
    }
}

/// Compare mean day-7 retention of the latest cohorts against the ones
/// before them. `cohorts` is in date order.
fn trend(cohorts: &[CohortRow]) -> Trend {
    let split = cohorts.len().saturating_sub(TREND_WINDOW);
    let recent = &cohorts[split..];
    let previous = &cohorts[split.saturating_sub(TREND_WINDOW)..split];
    if recent.len() < 2 || previous.len() < 2 {
        return Trend::Stable;
    }

    let recent_mean = average(recent.iter().map(|c| c.retention.day7));
    let previous_mean = average(previous.iter().map(|c| c.retention.day7));
    if previous_mean == 0.0 {
        return if recent_mean > 0.0 { Trend::Improving } else { Trend::Stable };
    }

    let change = (recent_mean - previous_mean) / previous_mean;
    if change > TREND_THRESHOLD {
        Trend::Improving
    } else if change < -TREND_THRESHOLD {
        Trend::Declining
    } else {
        Trend::Stable
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use beacon_core::event_bus::{capture_sink, CaptureSink};

    fn new_engine() -> (CohortEngine, Arc<CaptureSink>) {
        let sink = capture_sink();
        (CohortEngine::new(sink.clone()), sink)
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn active(events: u64, sessions: u64, duration_secs: u64) -> DailyActivity {
        DailyActivity {
            events,
            sessions,
            duration_secs,
        }
    }

    #[test]
    fn test_week_bucket_is_monday() {
        // 2024-03-13 is a Wednesday.
        assert_eq!(week_bucket(day(2024, 3, 13)), day(2024, 3, 11));
        assert_eq!(week_bucket(day(2024, 3, 11)), day(2024, 3, 11));
        assert_eq!(week_bucket(day(2024, 3, 17)), day(2024, 3, 11));
        assert_eq!(week_bucket(day(2024, 1, 1)), day(2024, 1, 1));
    }

    #[test]
    fn test_first_assignment_wins() {
        let (engine, sink) = new_engine();
        assert_eq!(engine.assign_cohort("u-1", day(2024, 3, 13)), Some(day(2024, 3, 11)));
        assert_eq!(engine.assign_cohort("u-1", day(2024, 5, 1)), Some(day(2024, 3, 11)));
        assert_eq!(engine.cohort_of("u-1"), Some(day(2024, 3, 11)));
        assert_eq!(engine.assign_cohort("", day(2024, 5, 1)), None);
        assert_eq!(sink.count_named(names::COHORT_ASSIGNED), 1);
    }

    #[test]
    fn test_activity_merges_per_day() {
        let (engine, _) = new_engine();
        engine.record_activity("u-1", day(2024, 3, 12), active(3, 1, 60));
        engine.record_activity("u-1", day(2024, 3, 12), active(2, 1, 30));
        assert_eq!(engine.activity_of("u-1", day(2024, 3, 12)), Some(active(5, 2, 90)));
        assert_eq!(engine.activity_of("u-1", day(2024, 3, 13)), None);
    }

    #[test]
    fn test_nothing_collected_while_disabled() {
        let (engine, sink) = new_engine();
        engine.assign_cohort("u-1", day(2024, 3, 13));
        sink.set_enabled(false);

        assert_eq!(engine.assign_cohort("u-2", day(2024, 3, 13)), None);
        assert_eq!(engine.cohort_of("u-2"), None);
        // Existing membership is still readable.
        assert_eq!(engine.assign_cohort("u-1", day(2024, 5, 1)), Some(day(2024, 3, 11)));
        engine.record_activity("u-1", day(2024, 3, 20), active(4, 1, 60));
        assert_eq!(engine.activity_of("u-1", day(2024, 3, 20)), None);
        assert_eq!(sink.count_named(names::COHORT_ASSIGNED), 1);

        sink.set_enabled(true);
        engine.record_activity("u-1", day(2024, 3, 20), active(4, 1, 60));
        assert_eq!(engine.activity_of("u-1", day(2024, 3, 20)), Some(active(4, 1, 60)));
    }

    #[test]
    fn test_day7_retention() {
        let (engine, _) = new_engine();
        let bucket = day(2024, 3, 11);
        for i in 0..50 {
            let user = format!("u-{i}");
            engine.assign_cohort(&user, bucket);
            if i < 20 {
                engine.record_activity(&user, bucket + Duration::days(7), active(1, 1, 10));
            }
        }

        let analysis = engine.analyze(day(2024, 3, 1), day(2024, 3, 31));
        assert_eq!(analysis.cohorts.len(), 1);
        let row = &analysis.cohorts[0];
        assert_eq!(row.total_users, 50);
        assert_eq!(row.retention.day7, 40.0);
        assert_eq!(row.retention.day14, 0.0);
    }

    #[test]
    fn test_retention_means_ever_returned_after() {
        let (engine, _) = new_engine();
        let bucket = day(2024, 3, 11);
        engine.assign_cohort("late", bucket);
        engine.record_activity("late", bucket + Duration::days(45), active(1, 1, 1));
        engine.assign_cohort("idle", bucket);

        let row = &engine.analyze(bucket, bucket).cohorts[0];
        // Active on day 45 only, yet counted for every horizon up to 30.
        assert_eq!(row.retention.day1, 50.0);
        assert_eq!(row.retention.day30, 50.0);
        assert_eq!(row.retention.day90, 0.0);
    }

    #[test]
    fn test_engagement_excludes_inactive_members() {
        let (engine, _) = new_engine();
        let bucket = day(2024, 3, 11);
        for user in ["a", "b", "c", "d"] {
            engine.assign_cohort(user, bucket);
        }
        engine.record_activity("a", bucket, active(10, 2, 600));
        engine.record_activity("b", bucket + Duration::days(1), active(4, 2, 200));

        let row = &engine.analyze(bucket, bucket).cohorts[0];
        assert_eq!(row.active_users, 2);
        assert_eq!(row.engagement.average_events, 7.0);
        assert_eq!(row.engagement.average_sessions, 2.0);
        assert_eq!(row.engagement.average_session_duration, 200.0);
    }

    #[test]
    fn test_empty_range() {
        let (engine, _) = new_engine();
        let analysis = engine.analyze(day(2024, 1, 1), day(2024, 12, 31));
        assert!(analysis.cohorts.is_empty());
        assert_eq!(analysis.summary.average_day7, 0.0);
        assert_eq!(analysis.summary.best_cohort, None);
        assert_eq!(analysis.summary.trend, Trend::Stable);
    }

    fn weekly_cohorts(engine: &CohortEngine, returning: &[usize]) -> NaiveDate {
        let first = day(2024, 1, 1);
        for (week, count) in returning.iter().enumerate() {
            let bucket = first + Duration::weeks(week as i64);
            for i in 0..10 {
                let user = format!("w{week}-{i}");
                engine.assign_cohort(&user, bucket);
                if i < *count {
                    engine.record_activity(&user, bucket + Duration::days(8), active(1, 1, 1));
                }
            }
        }
        first + Duration::weeks(returning.len() as i64)
    }

    #[test]
    fn test_trend_and_best_worst() {
        let (engine, _) = new_engine();
        let end = weekly_cohorts(&engine, &[2, 2, 2, 5, 6, 7]);
        let summary = engine.analyze(day(2024, 1, 1), end).summary;
        assert_eq!(summary.trend, Trend::Improving);
        assert_eq!(summary.best_cohort, Some(day(2024, 2, 5)));
        assert_eq!(summary.worst_cohort, Some(day(2024, 1, 1)));

        let (engine, _) = new_engine();
        let end = weekly_cohorts(&engine, &[8, 8, 8, 3, 3, 3]);
        assert_eq!(engine.analyze(day(2024, 1, 1), end).summary.trend, Trend::Declining);

        let (engine, _) = new_engine();
        let end = weekly_cohorts(&engine, &[5, 5, 5, 5, 5]);
        assert_eq!(engine.analyze(day(2024, 1, 1), end).summary.trend, Trend::Stable);
    }

    #[test]
    fn test_trend_needs_two_previous_cohorts() {
        let (engine, _) = new_engine();
        let end = weekly_cohorts(&engine, &[0, 9, 9, 9]);
        assert_eq!(engine.analyze(day(2024, 1, 1), end).summary.trend, Trend::Stable);
    }
}

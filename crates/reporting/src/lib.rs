//! Behavioural reporting — step-wise funnel conversion and weekly cohort
//! retention, both derived from recorded interactions.

pub mod cohort;
pub mod funnel;

pub use cohort::{CohortAnalysis, CohortEngine, DailyActivity, Trend};
pub use funnel::{FunnelAnalysis, FunnelDefinition, FunnelEngine, FunnelStep, StepOrdering, TimeRange};

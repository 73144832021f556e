//! Controlled experiments — definitions, sticky weighted assignment,
//! exposure/conversion reporting and per-variant analysis.

pub mod analysis;
pub mod definition;
pub mod registry;

pub use analysis::{ExperimentAnalysis, Recommendation, VariantAnalysis};
pub use definition::{
    ConfigValue, ExperimentDefinition, ExperimentStatus, MetricDefinition, MetricGoal, MetricKind, Targeting,
    Variant, VariantConfig,
};
pub use registry::{Assignment, ExperimentRegistry};

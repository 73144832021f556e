//! Scripted interaction file replayed by `beacon replay`.

use std::path::Path;

use anyhow::Context;
use beacon_analytics::{DeviceInfo, NavigationContext, Tracker};
use beacon_core::types::{ConnectionType, DeviceClass, Properties};
use beacon_experiments::{ExperimentDefinition, ExperimentRegistry, ExperimentStatus};
use beacon_reporting::{CohortEngine, DailyActivity, FunnelDefinition, FunnelEngine};
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceSpec {
    #[serde(default)]
    pub viewport_width: u32,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub connection: ConnectionType,
}

impl DeviceSpec {
    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            device_class: DeviceClass::from_viewport_width(self.viewport_width),
            locale: self.locale.clone(),
            connection: self.connection,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Interaction {
    Identify {
        user_id: Option<String>,
    },
    PageView {
        route: String,
        #[serde(default)]
        properties: Properties,
    },
    Track {
        event: String,
        #[serde(default)]
        properties: Properties,
    },
    Assign {
        test_id: String,
    },
    Convert {
        test_id: String,
        metric: String,
        #[serde(default)]
        value: Option<f64>,
    },
    FunnelStep {
        funnel: String,
        step: String,
        #[serde(default)]
        properties: Properties,
    },
    Signup {
        user_id: String,
        date: NaiveDate,
    },
    Activity {
        user_id: String,
        date: NaiveDate,
        #[serde(default)]
        events: u64,
        #[serde(default)]
        sessions: u64,
        #[serde(default)]
        duration_secs: u64,
    },
    Connection {
        connection: ConnectionType,
    },
    Consent {
        granted: bool,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub referrer: Option<String>,
    #[serde(default)]
    pub device: DeviceSpec,
    #[serde(default)]
    pub experiments: Vec<ExperimentDefinition>,
    #[serde(default)]
    pub funnels: Vec<FunnelDefinition>,
    #[serde(default)]
    pub interactions: Vec<Interaction>,
    #[serde(default)]
    pub cohort_start: Option<NaiveDate>,
    #[serde(default)]
    pub cohort_end: Option<NaiveDate>,
}

impl Scenario {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing scenario {}", path.display()))
    }

    pub fn navigation(&self) -> NavigationContext {
        let mut navigation = NavigationContext {
            url: self.url.clone(),
            referrer: None,
        };
        if let Some(referrer) = &self.referrer {
            navigation = navigation.with_referrer(referrer.clone());
        }
        navigation
    }

    /// Register every experiment and funnel. Draft experiments are started.
    pub fn register(
        &self,
        registry: &ExperimentRegistry,
        funnels: &FunnelEngine,
    ) -> anyhow::Result<()> {
        for definition in &self.experiments {
            let id = definition.id.clone();
            let draft = definition.status == ExperimentStatus::Draft;
            registry
                .register(definition.clone())
                .with_context(|| format!("registering experiment {id}"))?;
            if draft {
                registry.start(&id)?;
            }
        }
        for funnel in &self.funnels {
            funnels
                .define_funnel(funnel.clone())
                .with_context(|| format!("defining funnel {}", funnel.name))?;
        }
        Ok(())
    }
}

/// The engines a scenario drives.
pub struct Engines<'a> {
    pub tracker: &'a Tracker,
    pub registry: &'a ExperimentRegistry,
    pub funnels: &'a FunnelEngine,
    pub cohorts: &'a CohortEngine,
}

impl Engines<'_> {
    /// Apply one interaction as the tracker's current visitor.
    pub fn apply(&self, interaction: &Interaction) {
        let visitor = self.tracker.visitor();
        match interaction {
            Interaction::Identify { user_id } => self.tracker.identify(user_id.clone()),
            Interaction::PageView { route, properties } => {
                self.tracker.track_page_view(route, properties.clone());
                let mut observed = properties.clone();
                observed.insert("route".to_string(), route.clone().into());
                self.funnels
                    .observe(beacon_core::types::names::PAGE_VIEW, &observed, &visitor);
            }
            Interaction::Track { event, properties } => {
                self.tracker.track(event, properties.clone());
                self.funnels.observe(event, properties, &visitor);
            }
            Interaction::Assign { test_id } => match self.registry.assign(test_id, &visitor) {
                Some(assignment) => debug!(test_id = %test_id, variant_id = %assignment.variant_id, "replayed assignment"),
                None => debug!(test_id = %test_id, "no assignment"),
            },
            Interaction::Convert {
                test_id,
                metric,
                value,
            } => {
                if !self.registry.track_conversion(test_id, metric, &visitor, *value) {
                    debug!(test_id = %test_id, metric = %metric, "conversion not recorded");
                }
            }
            Interaction::FunnelStep {
                funnel,
                step,
                properties,
            } => {
                self.funnels.record_step(funnel, step, &visitor, properties.clone());
            }
            Interaction::Signup { user_id, date } => {
                self.cohorts.assign_cohort(user_id, *date);
            }
            Interaction::Activity {
                user_id,
                date,
                events,
                sessions,
                duration_secs,
            } => self.cohorts.record_activity(
                user_id,
                *date,
                DailyActivity {
                    events: *events,
                    sessions: *sessions,
                    duration_secs: *duration_secs,
                },
            ),
            Interaction::Connection { connection } => self.tracker.set_connection(*connection),
            Interaction::Consent { granted } => {
                if !granted {
                    warn!("consent revoked during replay");
                }
                self.tracker.set_consent(*granted);
            }
        }
    }

    pub fn replay(&self, scenario: &Scenario) {
        for interaction in &scenario.interactions {
            self.apply(interaction);
        }
        info!(interactions = scenario.interactions.len(), "scenario replayed");
    }
}

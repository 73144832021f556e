//! End-to-end flow: experiments, funnels and cohorts report through the
//! tracker, which batches everything to the collector.

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use beacon_analytics::{DeviceInfo, LogCollector, NavigationContext, Tracker};
    use beacon_core::config::BeaconConfig;
    use beacon_core::consent::ConsentState;
    use beacon_core::event_bus::EventSink;
    use beacon_core::storage::{FileStore, KeyValueStore, MemoryStore};
    use beacon_core::types::{names, ConnectionType, DeviceClass, Event, Properties};
    use beacon_experiments::{ExperimentDefinition, ExperimentRegistry, MetricGoal, MetricKind, Variant};
    use beacon_reporting::{CohortEngine, DailyActivity, FunnelDefinition, FunnelEngine, FunnelStep};
    use chrono::NaiveDate;

    struct Harness {
        tracker: Arc<Tracker>,
        collector: Arc<LogCollector>,
        registry: ExperimentRegistry,
        funnels: FunnelEngine,
        cohorts: CohortEngine,
    }

    fn harness(store: Arc<dyn KeyValueStore>, consent: ConsentState) -> Harness {
        let config = BeaconConfig::default();
        let collector = Arc::new(LogCollector::retaining());
        let tracker = Tracker::new(
            &config,
            &NavigationContext::new("https://discover.example.com/home?utm_campaign=spring"),
            DeviceInfo {
                device_class: DeviceClass::Desktop,
                locale: Some("fr-FR".into()),
                connection: ConnectionType::Ethernet,
            },
            collector.clone(),
            Arc::new(consent),
        );
        let sink: Arc<dyn EventSink> = tracker.clone();
        let registry = ExperimentRegistry::new(&config.experiments, store, sink.clone()).with_seed(42);
        registry
            .register(
                ExperimentDefinition::new(
                    "hero",
                    "Hero layout",
                    vec![Variant::new("control", 50.0), Variant::new("carousel", 50.0)],
                )
                .with_metric("play", MetricKind::Conversion, MetricGoal::Increase),
            )
            .unwrap();
        registry.start("hero").unwrap();

        let funnels = FunnelEngine::new(sink.clone());
        funnels
            .define_funnel(FunnelDefinition::new(
                "watch",
                vec![FunnelStep::new("browse", "page_view"), FunnelStep::new("play", "play")],
                24,
            ))
            .unwrap();

        Harness {
            tracker,
            collector,
            registry,
            funnels,
            cohorts: CohortEngine::new(sink),
        }
    }

    fn delivered(collector: &LogCollector) -> Vec<Event> {
        collector.batches().into_iter().flat_map(|b| b.events).collect()
    }

    #[tokio::test]
    async fn test_experiment_exposure_reaches_collector() {
        let h = harness(Arc::new(MemoryStore::new()), ConsentState::fixed(true));
        h.tracker.start();
        h.tracker.identify(Some("u-1".into()));

        let visitor = h.tracker.visitor();
        let assignment = h.registry.assign("hero", &visitor).unwrap();
        h.tracker.track("play", Properties::new());
        assert!(h.registry.track_conversion("hero", "play", &visitor, Some(1.0)));

        h.tracker.shutdown().await;
        let events = delivered(&h.collector);
        let names: Vec<&str> = events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec![names::SESSION_START, names::AB_TEST_ASSIGNED, "play", names::AB_TEST_CONVERSION]
        );

        // Events after the assignment carry the experiment in their context.
        assert!(events[0].context.experiments.is_empty());
        for event in &events[1..] {
            assert_eq!(event.context.experiments["hero"], assignment.variant_id);
            assert_eq!(event.user_id.as_deref(), Some("u-1"));
        }
        assert_eq!(events[0].properties["utm_campaign"], "spring");

        let analysis = h.registry.analyze("hero").unwrap();
        assert_eq!(analysis.total_participants, 1);
        let variant = analysis
            .variants
            .iter()
            .find(|v| v.variant_id == assignment.variant_id)
            .unwrap();
        assert_eq!(variant.converters, 1);
    }

    #[tokio::test]
    async fn test_consent_denial_collects_nothing() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let h = harness(store.clone(), ConsentState::fixed(true));
        h.tracker.track("browse", Properties::new());
        h.tracker.set_consent(false);

        let visitor = h.tracker.visitor();
        assert!(h.registry.assign("hero", &visitor).is_none());
        assert!(!h.funnels.record_step("watch", "browse", &visitor, Properties::new()));
        assert_eq!(h.funnels.observe("play", &Properties::new(), &visitor), 0);
        let signup = NaiveDate::from_ymd_opt(2024, 3, 13).unwrap();
        assert!(h.cohorts.assign_cohort("u-9", signup).is_none());
        h.cohorts.record_activity("u-9", signup, DailyActivity { events: 3, sessions: 1, duration_secs: 60 });
        h.tracker.track("play", Properties::new());

        assert!(h.funnels.records("watch").is_empty());
        assert!(h.cohorts.activity_of("u-9", signup).is_none());
        assert_eq!(h.registry.analyze("hero").unwrap().total_participants, 0);
        let key = format!("beacon.ab.hero.{}", visitor.identity().scoped_key());
        assert!(store.get(&key).is_none());

        h.tracker.shutdown().await;
        assert_eq!(h.collector.event_count(), 0);
        assert_eq!(h.tracker.stats().pending, 0);
    }

    #[tokio::test]
    async fn test_funnel_and_cohort_reports_are_tracked() {
        let h = harness(Arc::new(MemoryStore::new()), ConsentState::fixed(true));
        let visitor = h.tracker.visitor();

        assert_eq!(h.funnels.observe("page_view", &Properties::new(), &visitor), 1);
        assert_eq!(h.funnels.observe("play", &Properties::new(), &visitor), 1);
        let signup = NaiveDate::from_ymd_opt(2024, 3, 13).unwrap();
        h.cohorts.assign_cohort("u-9", signup);
        h.cohorts.assign_cohort("u-9", signup);

        h.tracker.shutdown().await;
        let events = delivered(&h.collector);
        let steps: Vec<_> = events.iter().filter(|e| e.name == names::FUNNEL_STEP).collect();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].properties["step"], "browse");
        assert_eq!(steps[0].session_id, visitor.session_id.clone().unwrap());

        let cohort: Vec<_> = events.iter().filter(|e| e.name == names::COHORT_ASSIGNED).collect();
        assert_eq!(cohort.len(), 1);
        assert_eq!(cohort[0].user_id.as_deref(), Some("u-9"));
        assert_eq!(cohort[0].properties["cohort"], "2024-03-11");

        let analysis = h.funnels.analyze("watch", None).unwrap();
        assert_eq!(analysis.overall_conversion_rate, 100.0);
    }

    #[tokio::test]
    async fn test_assignment_survives_restart_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacon.json");

        let first = {
            let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(&path).unwrap());
            let h = harness(store, ConsentState::fixed(true));
            h.tracker.identify(Some("returning".into()));
            let assignment = h.registry.assign("hero", &h.tracker.visitor()).unwrap();
            h.tracker.shutdown().await;
            assignment
        };

        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(&path).unwrap());
        let h = harness(store, ConsentState::fixed(true));
        h.tracker.identify(Some("returning".into()));
        for _ in 0..5 {
            let again = h.registry.assign("hero", &h.tracker.visitor()).unwrap();
            assert_eq!(again.variant_id, first.variant_id);
            assert_eq!(again.assigned_at, first.assigned_at);
        }

        // Restored assignments annotate context without a second exposure.
        h.tracker.track("play", Properties::new());
        h.tracker.shutdown().await;
        let events = delivered(&h.collector);
        assert!(events.iter().all(|e| e.name != names::AB_TEST_ASSIGNED));
        assert_eq!(events[0].context.experiments["hero"], first.variant_id);
    }
}

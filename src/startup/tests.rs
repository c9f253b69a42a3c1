use super::*;
use crate::bus::{LocalMessageBus, MessageBus, COMPONENT_READY_TOPIC};
use crate::config::OrchestratorConfig;
use crate::context::{LaunchStatus, OrchestratorContext};
use crate::events::{EventFilter, OrchestratorEvent};
use crate::process::tests::FakeProcess;
use crate::registry::{ComponentRecord, ComponentState};
use crate::transport::LoopbackHub;
use anyhow::anyhow;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

fn create_coordinator(
    config: OrchestratorConfig,
    bus: Option<Arc<dyn MessageBus>>,
) -> (Arc<StartupCoordinator>, Arc<OrchestratorContext>, Arc<LoopbackHub>) {
    let hub = Arc::new(LoopbackHub::new());
    let ctx = OrchestratorContext::new(config, hub.clone(), bus);
    (StartupCoordinator::new(Arc::clone(&ctx)), ctx, hub)
}

/// Start function that appends its component id to `log`
fn logging_start(id: &str, log: &Arc<Mutex<Vec<String>>>) -> StartFn {
    let id = id.to_string();
    let log = Arc::clone(log);
    StartFn::from_sync(move || {
        log.lock().push(id.clone());
        Ok(true)
    })
}

fn counting_start(counter: &Arc<AtomicU32>) -> StartFn {
    let counter = Arc::clone(counter);
    StartFn::from_sync(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    })
}

async fn explode() -> anyhow::Result<bool> {
    panic!("start exploded")
}

#[tokio::test(start_paused = true)]
async fn test_ordered_startup_follows_dependencies() {
    let (coordinator, ctx, hub) = create_coordinator(OrchestratorConfig::default(), None);
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut specs = BTreeMap::new();
    specs.insert(
        "C".to_string(),
        ComponentSpec::new(logging_start("C", &log)).with_dependencies(["B"]),
    );
    specs.insert(
        "A".to_string(),
        ComponentSpec::new(logging_start("A", &log)),
    );
    specs.insert(
        "B".to_string(),
        ComponentSpec::new(logging_start("B", &log)).with_dependencies(["A"]),
    );

    let report = coordinator.start_components(specs, true).await;

    assert_eq!(*log.lock(), vec!["A", "B", "C"]);
    assert_eq!(report.order, vec!["A", "B", "C"]);
    assert_eq!(report.summary(), "3 of 3 succeeded");
    assert!(!report.had_cycles());
    for id in ["A", "B", "C"] {
        assert_eq!(ctx.state_of(id), Some(ComponentState::Ready));
        assert_eq!(ctx.launch_status(id), Some(LaunchStatus::Running));
        assert_eq!(hub.registration_count(id), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_mutual_dependency_terminates_with_entry_per_component() {
    let (coordinator, ctx, _hub) = create_coordinator(OrchestratorConfig::default(), None);
    let mut cycles = ctx
        .event_bus()
        .subscribe_filtered(EventFilter::EventTypes(vec!["cycles_broken"]), "test");

    let mut specs = BTreeMap::new();
    specs.insert(
        "A".to_string(),
        ComponentSpec::new(StartFn::from_bool(true))
            .with_dependencies(["B"])
            .with_timeout(Duration::from_secs(5)),
    );
    specs.insert(
        "B".to_string(),
        ComponentSpec::new(StartFn::from_bool(true))
            .with_dependencies(["A"])
            .with_timeout(Duration::from_secs(5)),
    );

    let report = coordinator.start_components(specs, true).await;

    assert_eq!(report.total(), 2);
    assert!(report.had_cycles());
    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.order, vec!["A", "B"]);

    let events = cycles.drain();
    assert_eq!(events.len(), 1);
    match &events[0] {
        OrchestratorEvent::CyclesBroken { removed_edges, .. } => {
            assert_eq!(removed_edges, &vec![("A".to_string(), "B".to_string())]);
        }
        other => panic!("Unexpected event: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_self_dependency_is_broken_before_launch() {
    let (coordinator, ctx, _hub) = create_coordinator(OrchestratorConfig::default(), None);
    let mut cycles = ctx
        .event_bus()
        .subscribe_filtered(EventFilter::EventTypes(vec!["cycles_broken"]), "test");

    let mut specs = BTreeMap::new();
    specs.insert(
        "hermes".to_string(),
        ComponentSpec::new(StartFn::from_bool(true))
            .with_dependencies(["hermes"])
            .with_timeout(Duration::from_secs(3)),
    );

    let report = coordinator.start_components(specs, false).await;

    assert!(report.had_cycles());
    assert_eq!(report.summary(), "1 of 1 succeeded");
    let events = cycles.drain();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        OrchestratorEvent::CyclesBroken { removed_edges, .. }
            if removed_edges == &vec![("hermes".to_string(), "hermes".to_string())]
    ));
}

#[tokio::test(start_paused = true)]
async fn test_parallel_startup_isolates_failures() {
    let (coordinator, ctx, _hub) = create_coordinator(OrchestratorConfig::default(), None);
    let mut launches = ctx
        .event_bus()
        .subscribe_filtered(EventFilter::EventTypes(vec!["launch_completed"]), "test");

    let mut specs = BTreeMap::new();
    specs.insert("A".to_string(), ComponentSpec::new(StartFn::from_bool(false)));
    specs.insert(
        "B".to_string(),
        ComponentSpec::new(StartFn::from_bool(true))
            .with_dependencies(["A"])
            .with_timeout(Duration::from_secs(3)),
    );
    specs.insert("C".to_string(), ComponentSpec::new(StartFn::from_bool(true)));

    let report = coordinator.start_components(specs, false).await;

    assert_eq!(report.summary(), "1 of 3 succeeded");
    assert_eq!(report.failed(), vec!["A", "B"]);
    assert_eq!(ctx.state_of("A"), Some(ComponentState::Failed));
    assert_eq!(ctx.state_of("B"), Some(ComponentState::Failed));
    assert_eq!(ctx.state_of("C"), Some(ComponentState::Ready));

    let reason_of_b = launches
        .drain()
        .into_iter()
        .find_map(|event| match event {
            OrchestratorEvent::LaunchCompleted {
                component_id,
                reason,
                ..
            } if component_id == "B" => reason,
            _ => None,
        })
        .unwrap();
    assert!(reason_of_b.contains("not satisfied"));
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_timeout_waits_without_deadline() {
    let (coordinator, ctx, _hub) = create_coordinator(OrchestratorConfig::default(), None);

    let mut specs = BTreeMap::new();
    specs.insert(
        "A".to_string(),
        ComponentSpec::new(StartFn::from_bool(true))
            .with_dependencies(["B"])
            .with_timeout(Duration::from_secs(u64::MAX)),
    );
    specs.insert("B".to_string(), ComponentSpec::new(StartFn::from_bool(true)));

    let report = coordinator.start_components(specs, false).await;

    assert_eq!(report.summary(), "2 of 2 succeeded");
    assert_eq!(ctx.state_of("A"), Some(ComponentState::Ready));
    assert_eq!(ctx.launch_status("A"), Some(LaunchStatus::Running));
}

#[tokio::test(start_paused = true)]
async fn test_dependency_wait_times_out() {
    let (coordinator, ctx, _hub) = create_coordinator(OrchestratorConfig::default(), None);
    let started = Instant::now();

    let ok = coordinator
        .start_component(
            "hermes",
            &StartFn::from_bool(true),
            &["harmonia".to_string()],
            Duration::from_secs(3),
        )
        .await;

    assert!(!ok);
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(ctx.state_of("hermes"), Some(ComponentState::Failed));
    assert_eq!(ctx.launch_status("hermes"), Some(LaunchStatus::Failed));
}

#[tokio::test]
async fn test_start_fn_error_and_panic_become_false() {
    let (coordinator, ctx, _hub) = create_coordinator(OrchestratorConfig::default(), None);

    let erroring = StartFn::from_sync(|| Err(anyhow!("port 8080 in use")));
    assert!(
        !coordinator
            .start_component("erroring", &erroring, &[], Duration::from_secs(1))
            .await
    );

    let panicking = StartFn::from_async(explode);
    assert!(
        !coordinator
            .start_component("panicking", &panicking, &[], Duration::from_secs(1))
            .await
    );

    assert_eq!(ctx.state_of("erroring"), Some(ComponentState::Failed));
    assert_eq!(ctx.state_of("panicking"), Some(ComponentState::Failed));
}

#[tokio::test]
async fn test_ready_component_is_announced_on_bus() {
    let bus = Arc::new(LocalMessageBus::default());
    let (coordinator, _ctx, _hub) =
        create_coordinator(OrchestratorConfig::default(), Some(bus.clone()));
    let mut ready = bus.subscribe(COMPONENT_READY_TOPIC);

    assert!(
        coordinator
            .start_component("hermes", &StartFn::from_bool(true), &[], Duration::from_secs(1))
            .await
    );

    let message = ready.recv().await.unwrap();
    assert_eq!(message.payload, json!({ "component": "hermes" }));
}

#[tokio::test(start_paused = true)]
async fn test_trigger_is_armed_once() {
    let bus = Arc::new(LocalMessageBus::default());
    let (coordinator, ctx, _hub) =
        create_coordinator(OrchestratorConfig::default(), Some(bus.clone()));
    let starts = Arc::new(AtomicU32::new(0));
    coordinator.register_spec("hermes", ComponentSpec::new(counting_start(&starts)));

    let instruction = LaunchInstruction::Trigger {
        topic: "hermes.wake".to_string(),
    };
    assert!(coordinator.apply_instruction("hermes", instruction.clone()).await);
    assert!(coordinator.apply_instruction("hermes", instruction).await);
    assert!(coordinator.is_trigger_armed("hermes"));
    assert_eq!(ctx.launch_status("hermes"), Some(LaunchStatus::Deferred));
    assert_eq!(starts.load(Ordering::SeqCst), 0);

    assert_eq!(bus.publish("hermes.wake", json!({})), 1);
    sleep(Duration::from_millis(100)).await;

    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.state_of("hermes"), Some(ComponentState::Ready));
}

#[tokio::test]
async fn test_trigger_without_bus_is_a_noop() {
    let (coordinator, ctx, _hub) = create_coordinator(OrchestratorConfig::default(), None);
    coordinator.register_spec("hermes", ComponentSpec::new(StartFn::from_bool(true)));

    let instruction = LaunchInstruction::Trigger {
        topic: "hermes.wake".to_string(),
    };
    assert!(!coordinator.apply_instruction("hermes", instruction).await);
    assert!(!coordinator.is_trigger_armed("hermes"));
    assert_eq!(ctx.state_of("hermes"), None);
}

#[tokio::test]
async fn test_manual_instruction_records_intent_only() {
    let (coordinator, ctx, _hub) = create_coordinator(OrchestratorConfig::default(), None);
    let starts = Arc::new(AtomicU32::new(0));
    coordinator.register_spec("hermes", ComponentSpec::new(counting_start(&starts)));

    assert!(
        coordinator
            .apply_instruction("hermes", LaunchInstruction::Manual)
            .await
    );
    assert_eq!(ctx.launch_status("hermes"), Some(LaunchStatus::Manual));
    assert_eq!(starts.load(Ordering::SeqCst), 0);
    assert_eq!(ctx.state_of("hermes"), None);
}

#[tokio::test(start_paused = true)]
async fn test_strict_launch_three_way_outcome() {
    let (coordinator, ctx, _hub) = create_coordinator(OrchestratorConfig::default(), None);

    ctx.register(ComponentRecord::new("failed-dep", "l").with_state(ComponentState::Failed));
    ctx.register(ComponentRecord::new("slow-dep", "l").with_state(ComponentState::Initializing));
    ctx.register(ComponentRecord::new("ready-dep", "l").with_state(ComponentState::Ready));

    for (id, dep) in [
        ("on-failed", "failed-dep"),
        ("on-slow", "slow-dep"),
        ("on-absent", "absent-dep"),
        ("on-ready", "ready-dep"),
    ] {
        coordinator.register_spec(
            id,
            ComponentSpec::new(StartFn::from_bool(true)).with_dependencies([dep]),
        );
    }

    match coordinator.launch_component("on-failed").await {
        LaunchOutcome::Failed(reason) => assert!(reason.contains("failed-dep")),
        other => panic!("Unexpected outcome: {:?}", other),
    }
    assert_eq!(ctx.state_of("on-failed"), Some(ComponentState::Failed));

    assert_eq!(
        coordinator.launch_component("on-slow").await,
        LaunchOutcome::RetryLater
    );
    assert_eq!(ctx.state_of("on-slow"), None);

    assert!(matches!(
        coordinator.launch_component("on-absent").await,
        LaunchOutcome::Failed(_)
    ));
    assert_eq!(ctx.state_of("on-absent"), Some(ComponentState::Failed));

    assert_eq!(
        coordinator.launch_component("on-ready").await,
        LaunchOutcome::Launched
    );
    assert_eq!(ctx.state_of("on-ready"), Some(ComponentState::Ready));
}

#[tokio::test(start_paused = true)]
async fn test_strict_launch_enforces_wall_clock_timeout() {
    let (coordinator, ctx, _hub) = create_coordinator(OrchestratorConfig::default(), None);
    let hanging = StartFn::from_async(|| async {
        sleep(Duration::from_secs(3600)).await;
        Ok(true)
    });
    coordinator.register_spec("hermes", ComponentSpec::new(hanging));

    match coordinator.launch_component("hermes").await {
        LaunchOutcome::Failed(reason) => assert!(reason.contains("timed out")),
        other => panic!("Unexpected outcome: {:?}", other),
    }
    assert_eq!(ctx.state_of("hermes"), Some(ComponentState::Failed));
}

#[tokio::test(start_paused = true)]
async fn test_restart_replaces_instance_and_terminates_process() {
    let (coordinator, ctx, _hub) = create_coordinator(OrchestratorConfig::default(), None);
    let starts = Arc::new(AtomicU32::new(0));
    coordinator.register_spec("hermes", ComponentSpec::new(counting_start(&starts)));
    assert!(coordinator.start_registered("hermes").await);

    let process = FakeProcess::running();
    let terminated = Arc::clone(&process.terminated);
    ctx.track_process("hermes", Box::new(process));
    let first_instance = ctx.record("hermes").unwrap().instance_id;

    assert!(coordinator.restart_component("hermes", "operator request").await);

    let record = ctx.record("hermes").unwrap();
    assert_ne!(record.instance_id, first_instance);
    assert_eq!(record.state, ComponentState::Ready);
    assert!(terminated.load(Ordering::SeqCst));
    assert!(!ctx.has_process("hermes"));
    assert_eq!(starts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_restart_of_unknown_component_is_refused() {
    let (coordinator, _ctx, _hub) = create_coordinator(OrchestratorConfig::default(), None);
    assert!(!coordinator.restart_component("ghost", "probe").await);
}

#[tokio::test(start_paused = true)]
async fn test_stop_component_reaches_inactive() {
    let (coordinator, ctx, _hub) = create_coordinator(OrchestratorConfig::default(), None);
    coordinator.register_spec("hermes", ComponentSpec::new(StartFn::from_bool(true)));
    coordinator.start_registered("hermes").await;

    assert!(coordinator.stop_component("hermes").await);
    assert_eq!(ctx.state_of("hermes"), Some(ComponentState::Inactive));
    assert_eq!(ctx.launch_status("hermes"), Some(LaunchStatus::Stopped));
    assert!(!ctx.running_set().contains("hermes"));

    assert!(!coordinator.stop_component("ghost").await);
}

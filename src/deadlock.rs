//! Periodic detection of dependency cycles, stuck launches and orphaned records.

use crate::config::DeadlockConfig;
use crate::context::OrchestratorContext;
use crate::events::OrchestratorEvent;
use crate::registry::ComponentState;
use crate::resolver::BrokenCycle;
use crate::startup::StartupCoordinator;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What one detection pass found and did
#[derive(Debug, Clone, Default)]
pub struct DeadlockReport {
    pub cycles_broken: Vec<BrokenCycle>,
    /// Components found in INITIALIZING past the stuck threshold
    pub stuck: Vec<String>,
    /// Stuck components that came back up after a restart
    pub restarted: Vec<String>,
    pub orphans: Vec<String>,
}

impl DeadlockReport {
    pub fn is_clean(&self) -> bool {
        self.cycles_broken.is_empty() && self.stuck.is_empty() && self.orphans.is_empty()
    }
}

pub struct DeadlockDetector {
    ctx: Arc<OrchestratorContext>,
    coordinator: Arc<StartupCoordinator>,
    config: DeadlockConfig,
}

impl DeadlockDetector {
    pub fn new(coordinator: Arc<StartupCoordinator>) -> Self {
        let ctx = Arc::clone(coordinator.context());
        let config = ctx.config().deadlock.clone();
        Self {
            ctx,
            coordinator,
            config,
        }
    }

    pub async fn check_once(&self) -> DeadlockReport {
        self.check_at(Utc::now()).await
    }

    /// Run one detection pass as of `now`
    pub async fn check_at(&self, now: DateTime<Utc>) -> DeadlockReport {
        let mut report = DeadlockReport {
            cycles_broken: self.break_cycles(),
            ..Default::default()
        };

        let stuck_threshold = self.config.stuck_threshold_secs as i64;
        let stuck: Vec<(String, i64)> = self.ctx.with_state(|s| {
            s.registry
                .all()
                .into_iter()
                .filter(|r| r.state == ComponentState::Initializing)
                .map(|r| {
                    let elapsed = r.age_seconds(now);
                    (r.component_id, elapsed)
                })
                .filter(|(_, elapsed)| *elapsed > stuck_threshold)
                .collect()
        });

        for (id, elapsed) in stuck {
            self.ctx.event_bus().emit(OrchestratorEvent::StuckComponent {
                component_id: id.clone(),
                elapsed_seconds: elapsed,
                timestamp: now,
            });

            if self
                .coordinator
                .restart_component(&id, &format!("stuck initializing for {}s", elapsed))
                .await
            {
                report.restarted.push(id.clone());
            }
            report.stuck.push(id);
        }

        report.orphans = self.flag_orphans(now);

        if report.is_clean() {
            debug!("Deadlock check clean");
        } else {
            info!(
                "Deadlock check: {} cycles broken, {} stuck ({} restarted), {} orphans",
                report.cycles_broken.len(),
                report.stuck.len(),
                report.restarted.len(),
                report.orphans.len()
            );
        }
        report
    }

    fn break_cycles(&self) -> Vec<BrokenCycle> {
        let broken = match self.ctx.with_state(|s| s.resolver.resolve_cycles()) {
            Ok(broken) => broken,
            Err(e) => {
                error!("Deadlock check could not break cycle: {}", e);
                return Vec::new();
            }
        };

        if !broken.is_empty() {
            self.ctx.event_bus().emit(OrchestratorEvent::CyclesBroken {
                cycles: broken.iter().map(|b| b.cycle.clone()).collect(),
                removed_edges: broken
                    .iter()
                    .map(|b| (b.removed_edge.from.clone(), b.removed_edge.to.clone()))
                    .collect(),
                timestamp: Utc::now(),
            });
        }
        broken
    }

    /// Flag registered components that are not running and older than the orphan age.
    ///
    /// Orphans are reported only; the record stays in the registry.
    fn flag_orphans(&self, now: DateTime<Utc>) -> Vec<String> {
        let orphan_age = self.config.orphan_age_secs as i64;
        let orphans: Vec<(String, i64)> = self.ctx.with_state(|s| {
            let running = s.running_set();
            s.registry
                .all()
                .into_iter()
                .filter(|r| !running.contains(&r.component_id))
                .map(|r| {
                    let age = r.age_seconds(now);
                    (r.component_id, age)
                })
                .filter(|(_, age)| *age > orphan_age)
                .collect()
        });

        orphans
            .into_iter()
            .map(|(id, age)| {
                warn!("Component {} looks orphaned ({}s old, not running)", id, age);
                self.ctx.event_bus().emit(OrchestratorEvent::OrphanDetected {
                    component_id: id.clone(),
                    age_seconds: age,
                    timestamp: now,
                });
                id
            })
            .collect()
    }

    pub async fn run(self, cancel: CancellationToken) {
        let period = self.config.check_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Deadlock detector started (interval {:?})", period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_once().await;
                }
            }
        }
        info!("Deadlock detector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::context::LaunchStatus;
    use crate::events::EventFilter;
    use crate::process::tests::FakeProcess;
    use crate::registry::ComponentRecord;
    use crate::startup::{ComponentSpec, StartFn};
    use crate::transport::LoopbackHub;
    use std::sync::atomic::Ordering;

    fn create_detector() -> (DeadlockDetector, Arc<StartupCoordinator>, Arc<OrchestratorContext>) {
        let ctx = OrchestratorContext::new(
            OrchestratorConfig::default(),
            Arc::new(LoopbackHub::new()),
            None,
        );
        let coordinator = StartupCoordinator::new(Arc::clone(&ctx));
        (
            DeadlockDetector::new(Arc::clone(&coordinator)),
            coordinator,
            ctx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_component_is_relaunched_as_new_instance() {
        let (detector, coordinator, ctx) = create_detector();
        coordinator.register_spec("hermes", ComponentSpec::new(StartFn::from_bool(true)));

        let now = Utc::now();
        let stuck = ComponentRecord::new("hermes", ctx.launcher_id())
            .with_state(ComponentState::Initializing)
            .with_start_time(now - chrono::Duration::seconds(130));
        let stuck_instance = stuck.instance_id;
        ctx.register(stuck);

        let process = FakeProcess::running();
        let terminated = Arc::clone(&process.terminated);
        ctx.track_process("hermes", Box::new(process));

        let report = detector.check_at(now).await;

        assert_eq!(report.stuck, vec!["hermes"]);
        assert_eq!(report.restarted, vec!["hermes"]);
        let record = ctx.record("hermes").unwrap();
        assert_ne!(record.instance_id, stuck_instance);
        assert_eq!(record.state, ComponentState::Ready);
        assert!(terminated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_recent_initializing_component_is_left_alone() {
        let (detector, _coordinator, ctx) = create_detector();
        let now = Utc::now();
        ctx.register(
            ComponentRecord::new("hermes", "l")
                .with_state(ComponentState::Initializing)
                .with_start_time(now - chrono::Duration::seconds(30)),
        );

        let report = detector.check_at(now).await;
        assert!(report.stuck.is_empty());
        assert_eq!(ctx.state_of("hermes"), Some(ComponentState::Initializing));
    }

    #[tokio::test]
    async fn test_orphans_are_flagged_not_removed() {
        let (detector, _coordinator, ctx) = create_detector();
        let mut orphans = ctx
            .event_bus()
            .subscribe_filtered(EventFilter::EventTypes(vec!["orphan_detected"]), "test");
        let now = Utc::now();

        ctx.register(
            ComponentRecord::new("abandoned", "other-launcher")
                .with_state(ComponentState::Ready)
                .with_start_time(now - chrono::Duration::seconds(400)),
        );
        ctx.register(
            ComponentRecord::new("veteran", "l")
                .with_state(ComponentState::Ready)
                .with_start_time(now - chrono::Duration::seconds(400)),
        );
        ctx.set_launch_status("veteran", LaunchStatus::Running);

        let report = detector.check_at(now).await;

        assert_eq!(report.orphans, vec!["abandoned"]);
        assert!(ctx.record("abandoned").is_some());
        assert_eq!(orphans.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_cycles_in_live_graph_are_broken() {
        let (detector, coordinator, ctx) = create_detector();
        coordinator.register_spec(
            "A",
            ComponentSpec::new(StartFn::from_bool(true))
                .with_dependencies(["B"])
                .with_priority(5),
        );
        coordinator.register_spec(
            "B",
            ComponentSpec::new(StartFn::from_bool(true)).with_dependencies(["A"]),
        );

        let report = detector.check_once().await;
        assert_eq!(report.cycles_broken.len(), 1);
        assert!(ctx.with_state(|s| s.resolver.detect_cycles().is_empty()));

        let again = detector.check_once().await;
        assert!(again.is_clean());
    }
}

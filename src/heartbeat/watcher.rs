use crate::config::HeartbeatConfig;
use crate::context::OrchestratorContext;
use crate::recovery::{RecoveryAction, RecoveryConfig, RecoveryManager};
use crate::registry::ComponentState;
use crate::startup::StartupCoordinator;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use super::HeartbeatMonitor;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone)]
struct MissTracker {
    count: u32,
    last_seen: Option<DateTime<Utc>>,
}

/// Consumer-side liveness tracking.
///
/// Counts consecutive missed heartbeats per component and walks the
/// component towards DEGRADED and FAILED. A FAILED component is handed to
/// the coordinator for a jittered restart; a late heartbeat does not revive it.
/// Misses are not counted while the sender cannot reach the hub.
pub struct HeartbeatWatcher {
    ctx: Arc<OrchestratorContext>,
    coordinator: Option<Arc<StartupCoordinator>>,
    sender: Option<Arc<HeartbeatMonitor>>,
    config: HeartbeatConfig,
    misses: Mutex<HashMap<String, MissTracker>>,
    recovery: Mutex<RecoveryManager>,
}

impl HeartbeatWatcher {
    pub fn new(
        ctx: Arc<OrchestratorContext>,
        coordinator: Option<Arc<StartupCoordinator>>,
        sender: Option<Arc<HeartbeatMonitor>>,
    ) -> Arc<Self> {
        let config = ctx.config().heartbeat.clone();
        let recovery = RecoveryManager::with_config(RecoveryConfig::from(&config));
        Arc::new(Self {
            ctx,
            coordinator,
            sender,
            config,
            misses: Mutex::new(HashMap::new()),
            recovery: Mutex::new(recovery),
        })
    }

    /// A heartbeat arrived: reset the miss count and lift DEGRADED back to READY
    pub fn observe_heartbeat(&self, id: &str) -> bool {
        self.clear_misses(id, Some(Utc::now()))
    }

    fn clear_misses(&self, id: &str, heartbeat_at: Option<DateTime<Utc>>) -> bool {
        {
            let mut misses = self.misses.lock();
            let tracker = misses.entry(id.to_string()).or_default();
            tracker.count = 0;
            tracker.last_seen = heartbeat_at.or(tracker.last_seen);
        }

        let state = self.ctx.with_state(|s| {
            if let Some(at) = heartbeat_at {
                s.registry.record_heartbeat(id, at);
            }
            if s.registry.state_of(id) == Some(ComponentState::Degraded) {
                s.registry
                    .update_state(id, ComponentState::Ready, "heartbeat resumed");
            }
            s.registry.state_of(id)
        });

        match state {
            Some(state) if state.is_available() => {
                self.recovery.lock().reset(id);
                true
            }
            Some(state) => {
                debug!("Heartbeat from {} ignored in {}", id, state);
                false
            }
            None => false,
        }
    }

    /// Count one missed heartbeat; returns the component's state afterwards
    pub fn record_miss(&self, id: &str) -> Option<ComponentState> {
        let state = self.ctx.state_of(id)?;
        if !matches!(
            state,
            ComponentState::Ready | ComponentState::Active | ComponentState::Degraded
        ) {
            return Some(state);
        }

        let count = {
            let mut misses = self.misses.lock();
            let tracker = misses.entry(id.to_string()).or_default();
            tracker.count += 1;
            tracker.count
        };
        warn!("{} missed heartbeat ({} in a row)", id, count);

        if count >= self.config.failed_after_misses {
            let reason = format!("{} missed heartbeats", count);
            let failed = self.ctx.with_state(|s| {
                if s.registry.state_of(id).map(|st| st.is_available()).unwrap_or(false) {
                    s.registry
                        .update_state(id, ComponentState::Degraded, &reason);
                }
                s.registry.update_state(id, ComponentState::Failed, &reason)
            });
            self.misses.lock().remove(id);

            if failed {
                self.schedule_restart(id);
            }
            return self.ctx.state_of(id);
        }

        if count >= self.config.degraded_after_misses && state.is_available() {
            let reason = format!("{} missed heartbeats", count);
            self.ctx
                .update_state(id, ComponentState::Degraded, &reason);
        }

        self.ctx.state_of(id)
    }

    pub fn miss_count(&self, id: &str) -> u32 {
        self.misses.lock().get(id).map(|t| t.count).unwrap_or(0)
    }

    /// When the last heartbeat of a component was observed
    pub fn last_observed(&self, id: &str) -> Option<DateTime<Utc>> {
        self.misses.lock().get(id).and_then(|t| t.last_seen)
    }

    pub fn restart_count(&self, id: &str) -> u32 {
        self.recovery.lock().restart_count(id)
    }

    /// Hand a FAILED component to the coordinator after its jitter delay
    fn schedule_restart(&self, id: &str) -> Option<Duration> {
        if !self.config.auto_restart {
            info!("{} failed, automatic restart disabled", id);
            return None;
        }
        let Some(coordinator) = self.coordinator.as_ref() else {
            debug!("{} failed, no coordinator to restart it", id);
            return None;
        };

        let action = self.recovery.lock().handle_failure(id);
        match action {
            RecoveryAction::RestartAfter(delay) => {
                let coordinator = Arc::clone(coordinator);
                let cancel = self.ctx.child_token();
                let component = id.to_string();

                self.ctx.spawn_task(&format!("restart:{}", id), async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = sleep(delay) => {
                            coordinator
                                .restart_component(&component, "missed heartbeats")
                                .await;
                        }
                    }
                });
                Some(delay)
            }
            RecoveryAction::GiveUp => {
                warn!("{} stays FAILED, restart budget exhausted", id);
                None
            }
        }
    }

    /// Evaluate every live component against the heartbeat tolerance at `now`.
    ///
    /// A component whose last heartbeat (or start, if none yet) is older than
    /// 1.5 intervals accrues one miss; a fresh heartbeat clears earlier misses.
    /// Components the sender cannot get through to the hub are held as they are.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<String> {
        let tolerance = chrono::Duration::from_std(self.config.retry_interval() * 3 / 2)
            .unwrap_or_else(|_| chrono::Duration::seconds(5));

        let candidates: Vec<(String, ComponentState, DateTime<Utc>)> = self.ctx.with_state(|s| {
            s.registry
                .all()
                .into_iter()
                .filter(|r| {
                    matches!(
                        r.state,
                        ComponentState::Ready | ComponentState::Active | ComponentState::Degraded
                    )
                })
                .map(|r| {
                    let seen = r.last_heartbeat.unwrap_or(r.start_time);
                    (r.component_id, r.state, seen)
                })
                .collect()
        });

        let mut missed = Vec::new();
        for (id, state, seen) in candidates {
            if self.sender.as_ref().map(|m| m.is_unreachable(&id)).unwrap_or(false) {
                debug!("{} heartbeat stale while hub unreachable, not counted", id);
                continue;
            }
            if now - seen > tolerance {
                self.record_miss(&id);
                missed.push(id);
                continue;
            }

            let had_misses = self.miss_count(&id) > 0;
            if had_misses || state == ComponentState::Degraded {
                self.clear_misses(&id, None);
            }
        }
        missed
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.config.retry_interval();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Heartbeat watcher started (interval {:?})", period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(Utc::now());
                }
            }
        }
        info!("Heartbeat watcher stopped");
    }
}

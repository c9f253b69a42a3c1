use crate::config::HeartbeatConfig;
use crate::context::OrchestratorContext;
use crate::error::{EventBusError, OrchestratorError};
use crate::events::{EventFilter, OrchestratorEvent};
use crate::registry::ComponentState;
use crate::transport::HeartbeatRequest;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, sleep, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct LoopHandle {
    join: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Sender-side liveness: one heartbeat loop per component plus a hub probe
pub struct HeartbeatMonitor {
    ctx: Arc<OrchestratorContext>,
    config: HeartbeatConfig,
    loops: Mutex<HashMap<String, LoopHandle>>,
    background: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    cancel: Mutex<CancellationToken>,
    hub_available: AtomicBool,
    // components whose last heartbeat POST failed
    unreachable: Mutex<HashSet<String>>,
}

impl HeartbeatMonitor {
    pub fn new(ctx: Arc<OrchestratorContext>) -> Arc<Self> {
        let config = ctx.config().heartbeat.clone();
        let cancel = ctx.child_token();
        Arc::new(Self {
            ctx,
            config,
            loops: Mutex::new(HashMap::new()),
            background: Mutex::new(Vec::new()),
            cancel: Mutex::new(cancel),
            hub_available: AtomicBool::new(true),
            unreachable: Mutex::new(HashSet::new()),
        })
    }

    fn token(&self) -> CancellationToken {
        let mut cancel = self.cancel.lock();
        if cancel.is_cancelled() && !self.ctx.shutdown_token().is_cancelled() {
            *cancel = self.ctx.child_token();
        }
        cancel.clone()
    }

    /// Spawn loops for every registered component, the hub probe and the state listener
    pub fn start(self: &Arc<Self>) {
        let cancel = self.token();

        let ids = self.ctx.with_state(|s| {
            s.registry
                .all()
                .into_iter()
                .filter(|r| {
                    !matches!(
                        r.state,
                        ComponentState::Stopping | ComponentState::Inactive
                    )
                })
                .map(|r| r.component_id)
                .collect::<Vec<_>>()
        });
        for id in ids {
            self.watch(&id);
        }

        let probe = tokio::spawn(Arc::clone(self).probe_loop(cancel.clone()));
        let listener = tokio::spawn(Arc::clone(self).listen(cancel));

        let mut background = self.background.lock();
        background.push(("hub-probe", probe));
        background.push(("state-listener", listener));

        info!(
            "Heartbeat monitor started (interval {:?}, probe every {:?})",
            self.config.retry_interval(),
            self.config.hub_probe_interval()
        );
    }

    /// Start the heartbeat loop of a component; `false` if it already runs
    pub fn watch(self: &Arc<Self>, id: &str) -> bool {
        let mut loops = self.loops.lock();
        if let Some(existing) = loops.get(id) {
            if !existing.join.is_finished() {
                return false;
            }
        }

        let cancel = self.token().child_token();
        let join = tokio::spawn(Arc::clone(self).heartbeat_loop(id.to_string(), cancel.clone()));
        loops.insert(id.to_string(), LoopHandle { join, cancel });
        debug!("Heartbeat loop started for {}", id);
        true
    }

    /// Cancel the heartbeat loop of a component
    pub fn unwatch(&self, id: &str) -> bool {
        self.unreachable.lock().remove(id);
        match self.loops.lock().remove(id) {
            Some(handle) => {
                handle.cancel.cancel();
                debug!("Heartbeat loop stopped for {}", id);
                true
            }
            None => false,
        }
    }

    pub fn is_watching(&self, id: &str) -> bool {
        self.loops
            .lock()
            .get(id)
            .map(|h| !h.join.is_finished())
            .unwrap_or(false)
    }

    /// Components with a live heartbeat loop, sorted
    pub fn watched(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .loops
            .lock()
            .iter()
            .filter(|(_, h)| !h.join.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn hub_available(&self) -> bool {
        self.hub_available.load(Ordering::SeqCst)
    }

    /// Whether heartbeats of `id` currently cannot reach the hub.
    ///
    /// While this holds, a stale `last_heartbeat` says nothing about the
    /// component itself.
    pub fn is_unreachable(&self, id: &str) -> bool {
        !self.hub_available() || self.unreachable.lock().contains(id)
    }

    /// Cancel every task, wait for them within the shutdown grace and forget them
    pub async fn stop(&self) {
        self.cancel.lock().cancel();

        let mut handles: Vec<(String, JoinHandle<()>)> = self
            .loops
            .lock()
            .drain()
            .map(|(id, h)| (id, h.join))
            .collect();
        handles.extend(
            self.background
                .lock()
                .drain(..)
                .map(|(name, join)| (name.to_string(), join)),
        );
        self.unreachable.lock().clear();

        let grace = std::time::Duration::from_secs(self.ctx.config().system.shutdown_grace_secs);
        let deadline = Instant::now() + grace;
        for (name, mut join) in handles {
            if timeout_at(deadline, &mut join).await.is_err() {
                warn!("Heartbeat task {} did not stop in time, aborting", name);
                join.abort();
            }
        }
        info!("Heartbeat monitor stopped");
    }

    async fn heartbeat_loop(self: Arc<Self>, id: String, cancel: CancellationToken) {
        let mut ticker = interval(self.config.retry_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // reset only by a successful heartbeat
        let mut failures_in_row: u32 = 0;
        // reset after each re-registration
        let mut since_reregister: u32 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(status) = self.ctx.state_of(&id) else {
                debug!("{} is no longer registered, ending heartbeats", id);
                break;
            };

            let request = HeartbeatRequest {
                component: id.clone(),
                status,
                timestamp: Utc::now(),
            };

            match self.ctx.transport().heartbeat(&request).await {
                Ok(()) => {
                    if failures_in_row > 0 {
                        info!("Heartbeat of {} recovered after {} failures", id, failures_in_row);
                    }
                    failures_in_row = 0;
                    since_reregister = 0;
                    self.ctx
                        .with_state(|s| s.registry.record_heartbeat(&id, request.timestamp));
                    self.unreachable.lock().remove(&id);
                }
                Err(e) => {
                    failures_in_row += 1;
                    since_reregister += 1;
                    self.unreachable.lock().insert(id.clone());
                    warn!(
                        "Heartbeat of {} failed ({} in a row): {}",
                        id, failures_in_row, e
                    );

                    if since_reregister >= self.config.failures_before_reregister {
                        since_reregister = 0;
                        self.spawn_reregistration(&id);
                    }

                    if let Some(max) = self.config.max_failures {
                        if failures_in_row >= max {
                            let err = OrchestratorError::HeartbeatFailure {
                                component: id.clone(),
                                details: format!("{} consecutive failures, last: {}", failures_in_row, e),
                            };
                            error!("{}", err);
                            self.ctx
                                .update_state(&id, ComponentState::Error, &err.to_string());
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Re-register in the background; the heartbeat cadence is not interrupted
    fn spawn_reregistration(&self, id: &str) {
        let ctx = Arc::clone(&self.ctx);
        let component = id.to_string();
        info!("Re-registering {} after repeated heartbeat failures", id);
        self.ctx.spawn_task(&format!("reregister:{}", id), async move {
            match ctx.register_with_hub(&component).await {
                Ok(_) => info!("{} re-registered", component),
                Err(e) => warn!("{}", e),
            }
        });
    }

    async fn probe_loop(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.config.hub_probe_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let available = self.ctx.transport().check_health().await;
            let previous = self.hub_available.swap(available, Ordering::SeqCst);
            if previous != available {
                self.ctx
                    .event_bus()
                    .emit(OrchestratorEvent::HubAvailabilityChanged {
                        available,
                        timestamp: Utc::now(),
                    });
            }

            if !available {
                self.reconnect_all(&cancel).await;
            }
        }
    }

    /// Re-register every component, staggered to avoid a reconnect storm
    async fn reconnect_all(&self, cancel: &CancellationToken) {
        let ids = self.ctx.with_state(|s| s.registry.ids());
        let stagger = self.config.reconnect_stagger();
        info!("Hub unavailable, reconnecting {} components", ids.len());

        for (index, id) in ids.iter().enumerate() {
            if index > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(stagger) => {}
                }
            }
            match self.ctx.register_with_hub(id).await {
                Ok(_) => debug!("{} reconnected", id),
                Err(e) => debug!("{}", e),
            }
        }
    }

    /// Follow state changes: watch components that become READY, drop stopped ones
    async fn listen(self: Arc<Self>, cancel: CancellationToken) {
        let mut receiver = self
            .ctx
            .event_bus()
            .subscribe_filtered(EventFilter::EventTypes(vec!["state_changed"]), "heartbeat-monitor");

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = receiver.recv() => event,
            };

            match event {
                Ok(OrchestratorEvent::StateChanged {
                    component_id,
                    new_state,
                    ..
                }) => match new_state {
                    ComponentState::Ready => {
                        self.watch(&component_id);
                    }
                    ComponentState::Stopping | ComponentState::Inactive => {
                        self.unwatch(&component_id);
                    }
                    _ => {}
                },
                Ok(_) => {}
                Err(EventBusError::Lagged { .. }) => continue,
                Err(_) => break,
            }
        }
    }
}

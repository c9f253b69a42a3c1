use crate::config::HeartbeatConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Recovery action to take after a component failed
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// Restart the component after the given delay
    RestartAfter(Duration),
    /// The restart budget is spent; leave the component FAILED
    GiveUp,
}

/// How the restart delay of a component is derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Same delay for every restart of a component
    #[default]
    NameDerived,
    /// Delay also varies with the restart attempt
    NameAndAttempt,
}

/// Recovery strategy configuration
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Automatic restarts per component before giving up
    pub max_restarts: u32,
    /// Upper bound of the restart jitter
    pub max_jitter: Duration,
    pub strategy: JitterStrategy,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            max_jitter: Duration::from_millis(900),
            strategy: JitterStrategy::NameDerived,
        }
    }
}

impl From<&HeartbeatConfig> for RecoveryConfig {
    fn from(config: &HeartbeatConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            max_jitter: Duration::from_millis(config.max_restart_jitter_ms),
            strategy: if config.jitter_per_attempt {
                JitterStrategy::NameAndAttempt
            } else {
                JitterStrategy::NameDerived
            },
        }
    }
}

/// Tracks restart attempts per component
pub struct RecoveryManager {
    config: RecoveryConfig,
    restart_counts: HashMap<String, u32>,
    last_restart_times: HashMap<String, Instant>,
}

impl RecoveryManager {
    pub fn new() -> Self {
        Self::with_config(RecoveryConfig::default())
    }

    pub fn with_config(config: RecoveryConfig) -> Self {
        Self {
            config,
            restart_counts: HashMap::new(),
            last_restart_times: HashMap::new(),
        }
    }

    /// Decide what to do about a FAILED component and count the attempt
    pub fn handle_failure(&mut self, component: &str) -> RecoveryAction {
        let restart_count = self.restart_count(component);

        if restart_count >= self.config.max_restarts {
            error!(
                "Maximum restarts ({}) exceeded for component {}",
                self.config.max_restarts, component
            );
            return RecoveryAction::GiveUp;
        }

        self.restart_counts
            .insert(component.to_string(), restart_count + 1);
        self.last_restart_times
            .insert(component.to_string(), Instant::now());

        let delay = restart_jitter(
            component,
            restart_count,
            self.config.max_jitter,
            self.config.strategy,
        );

        info!(
            "Scheduling restart of {} in {:?} (attempt {}/{})",
            component,
            delay,
            restart_count + 1,
            self.config.max_restarts
        );

        RecoveryAction::RestartAfter(delay)
    }

    /// Reset the restart count after the component proved healthy again
    pub fn reset(&mut self, component: &str) {
        if self.restart_counts.remove(component).is_some() {
            info!("Component {} recovered, reset restart count", component);
        }
        self.last_restart_times.remove(component);
    }

    pub fn restart_count(&self, component: &str) -> u32 {
        self.restart_counts.get(component).copied().unwrap_or(0)
    }

    /// Time since the last scheduled restart of a component
    pub fn since_last_restart(&self, component: &str) -> Option<Duration> {
        self.last_restart_times
            .get(component)
            .map(|at| at.elapsed())
    }

    pub fn has_exceeded_restart_limit(&self, component: &str) -> bool {
        self.restart_count(component) >= self.config.max_restarts
    }
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::new()
    }
}

const JITTER_STEP_MS: u64 = 100;

/// Deterministic restart delay in 100 ms steps within `[0, max]`.
///
/// Components failing together get different delays, so their restarts do
/// not hit the hub at the same instant.
pub fn restart_jitter(
    component: &str,
    attempt: u32,
    max: Duration,
    strategy: JitterStrategy,
) -> Duration {
    let steps = max.as_millis() as u64 / JITTER_STEP_MS;
    if steps == 0 {
        return Duration::ZERO;
    }

    let mut hash = fnv1a(component.as_bytes());
    if strategy == JitterStrategy::NameAndAttempt {
        hash = fnv1a_extend(hash, &attempt.to_le_bytes());
    }

    Duration::from_millis((hash % (steps + 1)) * JITTER_STEP_MS)
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    fnv1a_extend(FNV_OFFSET, bytes)
}

fn fnv1a_extend(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

//! Liveness tracking.
//!
//! [`HeartbeatMonitor`] sends heartbeats to the hub on behalf of every
//! component and reconnects them when the hub comes back.
//! [`HeartbeatWatcher`] counts missed heartbeats and moves components to
//! DEGRADED and FAILED, scheduling restarts for the latter.

mod monitor;
mod watcher;


pub use monitor::HeartbeatMonitor;
pub use watcher::HeartbeatWatcher;

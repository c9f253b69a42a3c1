//! Hub transport seam.
//!
//! The remote service registry ("hub") is reached only through
//! [`HubTransport`]. Transport failures reach the core as a
//! [`TransportError`] carrying a message, nothing more.

use crate::registry::{ComponentRecord, ComponentState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Body of `POST /registration/register`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub component_id: String,
    pub name: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl RegistrationRequest {
    /// Build a request from a registry record; `version` and `capabilities` come from metadata
    pub fn from_record(record: &ComponentRecord) -> Self {
        let capabilities = record
            .metadata
            .get("capabilities")
            .map(|caps| {
                caps.split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut metadata = record.metadata.clone();
        metadata.insert("instance_id".to_string(), record.instance_id.to_string());
        metadata.insert("launcher_id".to_string(), record.launcher_id.clone());

        Self {
            component_id: record.component_id.clone(),
            name: record.display_name().to_string(),
            version: record
                .metadata
                .get("version")
                .cloned()
                .unwrap_or_else(|| "0.0.0".to_string()),
            capabilities,
            metadata,
        }
    }
}

/// Body of `POST /registration/heartbeat`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub component: String,
    pub status: ComponentState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Client side of the remote registry
#[async_trait]
pub trait HubTransport: Send + Sync {
    /// Register a component and return the hub-issued token
    async fn register(&self, request: &RegistrationRequest) -> Result<String, TransportError>;

    /// Post a heartbeat
    async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<(), TransportError>;

    /// `GET /health`
    async fn check_health(&self) -> bool;
}

/// In-process hub used for standalone runs and tests.
///
/// Availability can be toggled and failures injected per component.
#[derive(Default)]
pub struct LoopbackHub {
    unavailable: AtomicBool,
    registrations: Mutex<Vec<RegistrationRequest>>,
    heartbeats: Mutex<Vec<HeartbeatRequest>>,
    failing_heartbeats: Mutex<HashMap<String, u32>>,
    health_checks: AtomicU64,
    register_attempts: AtomicU64,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Fail the next `count` heartbeats of a component
    pub fn fail_heartbeats(&self, component: &str, count: u32) {
        self.failing_heartbeats
            .lock()
            .insert(component.to_string(), count);
    }

    pub fn registrations(&self) -> Vec<RegistrationRequest> {
        self.registrations.lock().clone()
    }

    pub fn registration_count(&self, component: &str) -> usize {
        self.registrations
            .lock()
            .iter()
            .filter(|r| r.component_id == component)
            .count()
    }

    pub fn heartbeats(&self) -> Vec<HeartbeatRequest> {
        self.heartbeats.lock().clone()
    }

    /// Registration calls including the ones rejected while unavailable
    pub fn register_attempts(&self) -> u64 {
        self.register_attempts.load(Ordering::SeqCst)
    }

    pub fn health_checks(&self) -> u64 {
        self.health_checks.load(Ordering::SeqCst)
    }

    fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HubTransport for LoopbackHub {
    async fn register(&self, request: &RegistrationRequest) -> Result<String, TransportError> {
        self.register_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.is_available() {
            return Err(TransportError::new("hub unavailable"));
        }
        debug!("Loopback hub registered {}", request.component_id);
        self.registrations.lock().push(request.clone());
        Ok(Uuid::new_v4().to_string())
    }

    async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<(), TransportError> {
        if !self.is_available() {
            return Err(TransportError::new("hub unavailable"));
        }

        {
            let mut failing = self.failing_heartbeats.lock();
            if let Some(remaining) = failing.get_mut(&request.component) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TransportError::new("injected heartbeat failure"));
                }
            }
        }

        self.heartbeats.lock().push(request.clone());
        Ok(())
    }

    async fn check_health(&self) -> bool {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        self.is_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_request_from_record() {
        let record = ComponentRecord::new("hermes", "launcher-1")
            .with_metadata("name", "Hermes Messenger")
            .with_metadata("version", "1.2.0")
            .with_metadata("capabilities", "route, publish,");

        let request = RegistrationRequest::from_record(&record);
        assert_eq!(request.component_id, "hermes");
        assert_eq!(request.name, "Hermes Messenger");
        assert_eq!(request.version, "1.2.0");
        assert_eq!(request.capabilities, vec!["route", "publish"]);
        assert_eq!(
            request.metadata.get("launcher_id").map(String::as_str),
            Some("launcher-1")
        );

        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("component_id").is_some());
        assert!(json.get("capabilities").unwrap().is_array());
    }

    #[tokio::test]
    async fn test_loopback_hub_failure_injection() {
        let hub = LoopbackHub::new();
        let request = HeartbeatRequest {
            component: "hermes".to_string(),
            status: ComponentState::Ready,
            timestamp: Utc::now(),
        };

        hub.fail_heartbeats("hermes", 2);
        assert!(hub.heartbeat(&request).await.is_err());
        assert!(hub.heartbeat(&request).await.is_err());
        assert!(hub.heartbeat(&request).await.is_ok());
        assert_eq!(hub.heartbeats().len(), 1);

        hub.set_available(false);
        assert!(!hub.check_health().await);
        assert!(hub.heartbeat(&request).await.is_err());
        assert_eq!(hub.health_checks(), 1);
    }
}

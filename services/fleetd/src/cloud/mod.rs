//! Compute-provider interface and mock implementation.
//!
//! The manager abstracts single-instance lifecycle operations:
//! - Creating and deleting fleet-tagged instances
//! - Listing the current fleet
//! - Health checks for stale detection
//!
//! Create is fire-and-forget: it returns once the provider accepts the
//! request, without waiting for boot. Waiting would serialize a slow
//! provider call inside the reconcile loop.

mod http;

pub use http::HttpCloud;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::CloudError;
use crate::fleet::{HealthState, RunnerInstance, RunnerSpec, RunnerState};

/// Compute-provider instance lifecycle operations.
#[async_trait]
pub trait CloudInstanceManager: Send + Sync {
    /// List all instances tagged as belonging to this fleet.
    ///
    /// Instances in transient provider states are skipped, not errors.
    async fn list(&self) -> Result<Vec<RunnerInstance>, CloudError>;

    /// Provision one instance. Returns as soon as the provider accepts.
    async fn create(&self, spec: &RunnerSpec) -> Result<RunnerInstance, CloudError>;

    /// Delete an instance. Idempotent: unknown ids are not an error.
    async fn delete(&self, id: &str) -> Result<(), CloudError>;

    /// Health-check one instance.
    async fn health_check(&self, id: &str) -> Result<HealthState, CloudError>;
}

/// In-memory provider for tests and development.
pub struct MockCloud {
    instances: Mutex<HashMap<String, RunnerInstance>>,
    id_counter: AtomicU64,

    /// Fail the next N create calls.
    fail_creates: AtomicU32,

    /// Instance ids that report unresponsive health.
    unresponsive: Mutex<Vec<String>>,
}

impl MockCloud {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            id_counter: AtomicU64::new(0),
            fail_creates: AtomicU32::new(0),
            unresponsive: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `n` create calls fail with a provision error.
    pub fn fail_next_creates(&self, n: u32) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    /// Mark an instance as unresponsive to health checks.
    pub fn set_unresponsive(&self, id: &str) {
        self.unresponsive.lock().unwrap().push(id.to_string());
    }

    /// Seed an instance directly, bypassing the create path.
    pub fn insert(&self, instance: RunnerInstance) {
        self.instances
            .lock()
            .unwrap()
            .insert(instance.id.clone(), instance);
    }

    /// Flip an instance's state in place.
    pub fn set_state(&self, id: &str, state: RunnerState) {
        if let Some(instance) = self.instances.lock().unwrap().get_mut(id) {
            instance.state = state;
        }
    }

    pub fn instance_count(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    fn next_id(&self) -> String {
        let counter = self.id_counter.fetch_add(1, Ordering::SeqCst);
        format!("i-{counter:08x}")
    }
}

impl Default for MockCloud {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudInstanceManager for MockCloud {
    async fn list(&self) -> Result<Vec<RunnerInstance>, CloudError> {
        let mut instances: Vec<_> = self.instances.lock().unwrap().values().cloned().collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(instances)
    }

    async fn create(&self, spec: &RunnerSpec) -> Result<RunnerInstance, CloudError> {
        let remaining = self.fail_creates.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_creates.store(remaining - 1, Ordering::SeqCst);
            return Err(CloudError::Provision("mock create failure".to_string()));
        }

        let instance = RunnerInstance {
            id: self.next_id(),
            name: spec.name.clone(),
            state: RunnerState::Provisioning,
            created_at: Utc::now(),
        };
        self.instances
            .lock()
            .unwrap()
            .insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    async fn delete(&self, id: &str) -> Result<(), CloudError> {
        // Idempotent: removing a missing id is fine.
        self.instances.lock().unwrap().remove(id);
        Ok(())
    }

    async fn health_check(&self, id: &str) -> Result<HealthState, CloudError> {
        if self.unresponsive.lock().unwrap().iter().any(|u| u == id) {
            return Ok(HealthState::Unresponsive);
        }
        match self.instances.lock().unwrap().get(id) {
            Some(_) => Ok(HealthState::Healthy),
            None => Err(CloudError::NotFound(id.to_string())),
        }
    }
}

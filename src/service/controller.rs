//! Service controllers and their lifecycle state machine
//!
//! A controller is the runtime instance of a [`super::ServiceDefinition`].
//! The state field is the single source of truth for the service's
//! lifecycle; every transition is validated against the legal edge set and
//! happens atomically behind the per-controller lock.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use arc_swap::ArcSwapOption;

use super::{Injector, ServiceActivator, ServiceDefinition, ServiceName, ServiceValue};
use crate::core::error::{DeployError, DeployResult};

/// Lifecycle states of a service controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceState {
    /// Created, not yet installed into the graph
    New,
    /// Inactive; eligible for start once all dependencies are up
    Down,
    /// Down substate: a dependency is unavailable, start is not attempted
    /// until an explicit retry
    MissingDependency,
    Starting,
    Up,
    Stopping,
    /// Start action failed; terminal until explicit retry or removal
    StartFailed,
}

impl ServiceState {
    /// Whether the service is inactive (plain down or quarantined).
    pub fn is_down(self) -> bool {
        matches!(self, ServiceState::Down | ServiceState::MissingDependency)
    }

    /// Whether the service holds no runtime obligations (safe to remove).
    pub fn is_stopped(self) -> bool {
        matches!(
            self,
            ServiceState::New
                | ServiceState::Down
                | ServiceState::MissingDependency
                | ServiceState::StartFailed
        )
    }

    fn can_transition(self, to: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, to),
            (New, Down)
                | (Down, Starting)
                | (Down, MissingDependency)
                | (MissingDependency, Down)
                | (MissingDependency, MissingDependency)
                | (Starting, Up)
                | (Starting, StartFailed)
                | (Up, Stopping)
                | (Stopping, Down)
                | (StartFailed, Down)
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::New => "NEW",
            ServiceState::Down => "DOWN",
            ServiceState::MissingDependency => "MISSING_DEPENDENCY",
            ServiceState::Starting => "STARTING",
            ServiceState::Up => "UP",
            ServiceState::Stopping => "STOPPING",
            ServiceState::StartFailed => "START_FAILED",
        };
        f.write_str(name)
    }
}

/// Runtime instance of a service definition.
pub struct ServiceController {
    name: ServiceName,
    dependencies: Vec<ServiceName>,
    activator: Arc<dyn ServiceActivator>,
    injectors: Vec<Box<dyn Injector>>,
    state: Mutex<ServiceState>,
    dependents: Mutex<Vec<ServiceName>>,
    value: ArcSwapOption<ServiceValue>,
}

impl std::fmt::Debug for ServiceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceController")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

impl ServiceController {
    pub(crate) fn new(definition: ServiceDefinition) -> Self {
        Self {
            name: definition.name,
            dependencies: definition.dependencies,
            activator: definition.activator,
            injectors: definition.injectors,
            state: Mutex::new(ServiceState::New),
            dependents: Mutex::new(Vec::new()),
            value: ArcSwapOption::const_empty(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &[ServiceName] {
        &self.dependencies
    }

    /// Services that declared this one as a dependency.
    pub fn dependents(&self) -> Vec<ServiceName> {
        self.dependents.lock().expect("dependents lock").clone()
    }

    pub(crate) fn add_dependent(&self, name: ServiceName) {
        let mut dependents = self.dependents.lock().expect("dependents lock");
        if !dependents.contains(&name) {
            dependents.push(name);
        }
    }

    pub(crate) fn remove_dependent(&self, name: &str) {
        let mut dependents = self.dependents.lock().expect("dependents lock");
        dependents.retain(|dependent| dependent != name);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        *self.state.lock().expect("state lock")
    }

    /// Atomically move to `to`, validating the edge.
    pub(crate) fn transition(&self, to: ServiceState) -> DeployResult<()> {
        let mut state = self.state.lock().expect("state lock");
        if !state.can_transition(to) {
            return Err(DeployError::Internal(format!(
                "illegal state transition {} -> {to} for service {}",
                *state, self.name
            )));
        }
        log::debug!("service {}: {} -> {to}", self.name, *state);
        *state = to;
        Ok(())
    }

    /// The value produced by the last successful start, if the service is up.
    pub fn value(&self) -> Option<ServiceValue> {
        self.value.load_full().map(|value| (*value).clone())
    }

    pub(crate) fn publish_value(&self, value: ServiceValue) {
        self.value.store(Some(Arc::new(value)));
    }

    pub(crate) fn clear_value(&self) {
        self.value.store(None);
    }

    pub(crate) fn activator(&self) -> Arc<dyn ServiceActivator> {
        self.activator.clone()
    }

    pub(crate) fn injectors(&self) -> &[Box<dyn Injector>] {
        &self.injectors
    }

    pub(crate) fn uninject_all(&self) {
        for injector in &self.injectors {
            injector.uninject();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::StartContext;
    use async_trait::async_trait;

    struct NoopActivator;

    #[async_trait]
    impl ServiceActivator for NoopActivator {
        async fn start(&self, _ctx: &StartContext) -> DeployResult<ServiceValue> {
            Ok(ServiceValue::new(()))
        }

        async fn stop(&self) {}
    }

    fn controller(name: &str) -> ServiceController {
        ServiceController::new(ServiceDefinition::new(name, Arc::new(NoopActivator)))
    }

    #[test]
    fn test_legal_lifecycle_walk() {
        let c = controller("db");
        assert_eq!(c.state(), ServiceState::New);
        for to in [
            ServiceState::Down,
            ServiceState::Starting,
            ServiceState::Up,
            ServiceState::Stopping,
            ServiceState::Down,
        ] {
            c.transition(to).unwrap();
            assert_eq!(c.state(), to);
        }
    }

    #[test]
    fn test_start_failed_is_the_sole_error_exit() {
        let c = controller("db");
        c.transition(ServiceState::Down).unwrap();
        c.transition(ServiceState::Starting).unwrap();
        c.transition(ServiceState::StartFailed).unwrap();
        // terminal until explicit retry
        assert!(c.transition(ServiceState::Starting).is_err());
        assert!(c.transition(ServiceState::Up).is_err());
        c.transition(ServiceState::Down).unwrap();
    }

    #[test]
    fn test_illegal_edges_rejected() {
        let c = controller("db");
        assert!(c.transition(ServiceState::Up).is_err());
        c.transition(ServiceState::Down).unwrap();
        assert!(c.transition(ServiceState::Stopping).is_err());
        assert!(c.transition(ServiceState::New).is_err());
    }

    #[test]
    fn test_dependents_deduplicated() {
        let c = controller("db");
        c.add_dependent("pool".to_string());
        c.add_dependent("pool".to_string());
        assert_eq!(c.dependents(), vec!["pool".to_string()]);
        c.remove_dependent("pool");
        assert!(c.dependents().is_empty());
    }
}

//! Service model for the deployment runtime
//!
//! A service is a named unit of runtime behavior with declared dependencies,
//! a start action and a stop action. Processors register service definitions
//! during the pipeline; the [`graph::ServiceGraph`] turns them into
//! controllers and drives them through their lifecycle in dependency order.

pub mod controller;
pub mod graph;

use std::{any::Any, collections::HashMap, sync::Arc, sync::Mutex};

use async_trait::async_trait;

use crate::core::error::{DeployError, DeployResult};

pub use controller::{ServiceController, ServiceState};
pub use graph::{ActivationReport, ServiceBatch, ServiceGraph};

/// Unique service identifier, e.g. `"component.shop.app.cart"`.
pub type ServiceName = String;

/// Opaque value produced by a started service and consumed by its dependents.
#[derive(Clone)]
pub struct ServiceValue(Arc<dyn Any + Send + Sync>);

impl ServiceValue {
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Wrap an already shared value without another allocation.
    pub fn from_arc<T: Send + Sync + 'static>(value: Arc<T>) -> Self {
        Self(value)
    }

    /// Recover the typed value. `None` when the stored type differs.
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.0.clone().downcast::<T>().ok()
    }
}

impl std::fmt::Debug for ServiceValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ServiceValue")
    }
}

/// Typed receiver slot populated from a dependency value before start.
///
/// A definition owns the slot through an `Arc`, hands a [`ValueInjector`]
/// over it to the graph, and reads the slot from its start action.
pub struct InjectedValue<T> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T> Default for InjectedValue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InjectedValue<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.slot.lock().expect("injected value lock").clone()
    }

    fn set(&self, value: Arc<T>) {
        *self.slot.lock().expect("injected value lock") = Some(value);
    }

    fn clear(&self) {
        *self.slot.lock().expect("injected value lock") = None;
    }
}

/// Receives one dependency's value before the owning service starts.
pub trait Injector: Send + Sync {
    /// Name of the dependency this injector consumes.
    fn dependency(&self) -> &str;

    /// Deliver the dependency's value. Runs before the start action.
    fn inject(&self, value: &ServiceValue) -> DeployResult<()>;

    /// Drop the delivered value again. Runs after the service stopped.
    fn uninject(&self) {}
}

/// Injector that fills a typed [`InjectedValue`] slot.
pub struct ValueInjector<T: Send + Sync + 'static> {
    dependency: ServiceName,
    target: Arc<InjectedValue<T>>,
}

impl<T: Send + Sync + 'static> ValueInjector<T> {
    pub fn new(dependency: impl Into<ServiceName>, target: Arc<InjectedValue<T>>) -> Self {
        Self {
            dependency: dependency.into(),
            target,
        }
    }
}

impl<T: Send + Sync + 'static> Injector for ValueInjector<T> {
    fn dependency(&self) -> &str {
        &self.dependency
    }

    fn inject(&self, value: &ServiceValue) -> DeployResult<()> {
        let typed = value.downcast::<T>().ok_or_else(|| {
            DeployError::Internal(format!(
                "dependency {} produced a value of an unexpected type",
                self.dependency
            ))
        })?;
        self.target.set(typed);
        Ok(())
    }

    fn uninject(&self) {
        self.target.clear();
    }
}

/// Context handed to a start action: the values of all declared dependencies.
pub struct StartContext {
    service: ServiceName,
    values: HashMap<ServiceName, ServiceValue>,
}

impl StartContext {
    pub(crate) fn new(service: ServiceName, values: HashMap<ServiceName, ServiceValue>) -> Self {
        Self { service, values }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn value(&self, dependency: &str) -> Option<&ServiceValue> {
        self.values.get(dependency)
    }

    /// Typed dependency lookup; fails when the dependency is absent or of a
    /// different type.
    pub fn require<T: Send + Sync + 'static>(&self, dependency: &str) -> DeployResult<Arc<T>> {
        self.values
            .get(dependency)
            .and_then(|value| value.downcast::<T>())
            .ok_or_else(|| {
                DeployError::Internal(format!(
                    "service {} has no usable value for dependency {dependency}",
                    self.service
                ))
            })
    }
}

/// Start/stop behavior of one service.
#[async_trait]
pub trait ServiceActivator: Send + Sync {
    /// Start the service. The returned value is published to dependents.
    async fn start(&self, ctx: &StartContext) -> DeployResult<ServiceValue>;

    /// Stop the service. Best effort; the graph logs but never propagates
    /// stop failures.
    async fn stop(&self);
}

/// A named service plus everything needed to run it.
pub struct ServiceDefinition {
    pub name: ServiceName,
    pub dependencies: Vec<ServiceName>,
    pub activator: Arc<dyn ServiceActivator>,
    pub injectors: Vec<Box<dyn Injector>>,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<ServiceName>, activator: Arc<dyn ServiceActivator>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            activator,
            injectors: Vec::new(),
        }
    }

    pub fn with_dependency(mut self, name: impl Into<ServiceName>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    pub fn with_injector(mut self, injector: Box<dyn Injector>) -> Self {
        self.injectors.push(injector);
        self
    }
}

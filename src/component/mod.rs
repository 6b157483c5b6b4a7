//! Managed components and their interceptor machinery
//!
//! A component is a managed runtime object with lifecycle hooks and
//! per-method interceptor chains. Component and interceptor behavior is
//! resolved through an explicit [`HandlerRegistry`] mapping stable handler
//! ids to statically known handler objects; an unknown id is a typed
//! configuration-time error, never a runtime crash.

pub mod builtin;
pub mod chain;
pub mod interceptor;
pub mod runtime;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value as JsonValue;

use crate::core::error::DeployResult;

pub use chain::{build_lifecycle_chains, build_method_chains, ComponentChains, LifecycleChains};
pub use interceptor::{Interceptor, InterceptorFactory, Invocation};
pub use runtime::{ComponentInstance, ComponentRuntime};

/// Mutable state bound to one component or interceptor instance: injected
/// resources plus whatever the handler wants to stash between calls.
#[derive(Default)]
pub struct InstanceState {
    resources: DashMap<String, JsonValue>,
}

impl InstanceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_resource(&self, name: impl Into<String>, value: JsonValue) {
        self.resources.insert(name.into(), value);
    }

    pub fn resource(&self, name: &str) -> Option<JsonValue> {
        self.resources.get(name).map(|entry| entry.value().clone())
    }
}

/// Statically known behavior of a component target.
///
/// The method table stands in for the original's reflective method set
/// (inherited methods included): it must list every invocable method,
/// lifecycle hooks included.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Stable handler id referenced from component configuration.
    fn id(&self) -> &str;

    /// Every invocable method of the target.
    fn methods(&self) -> &[&'static str];

    async fn invoke(
        &self,
        method: &str,
        args: JsonValue,
        state: &InstanceState,
    ) -> DeployResult<JsonValue>;
}

/// An interceptor handler: defines named AROUND-INVOKE methods that wrap
/// component method dispatch.
#[async_trait]
pub trait AroundInvoke: Send + Sync {
    /// Stable handler id referenced from interceptor bindings.
    fn id(&self) -> &str;

    /// The interceptor methods this handler defines.
    fn methods(&self) -> &[&'static str];

    /// Run the named interceptor method. Implementations call
    /// `invocation.proceed()` to continue the chain.
    async fn intercept(
        &self,
        method: &str,
        state: &InstanceState,
        invocation: &mut Invocation<'_>,
    ) -> DeployResult<JsonValue>;
}

/// Registry mapping handler ids to component targets and interceptors.
///
/// The runtime owns one registry and passes it by reference to the chain
/// builder; there is no ambient global table. A self-intercepting component
/// registers the same object as both target and interceptor.
#[derive(Default)]
pub struct HandlerRegistry {
    targets: DashMap<String, Arc<dyn MethodHandler>>,
    interceptors: DashMap<String, Arc<dyn AroundInvoke>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the built-in handlers.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        builtin::register_builtins(&registry);
        registry
    }

    pub fn register_target(&self, handler: Arc<dyn MethodHandler>) {
        self.targets.insert(handler.id().to_string(), handler);
    }

    pub fn register_interceptor(&self, handler: Arc<dyn AroundInvoke>) {
        self.interceptors.insert(handler.id().to_string(), handler);
    }

    pub fn target(&self, id: &str) -> Option<Arc<dyn MethodHandler>> {
        self.targets.get(id).map(|entry| entry.value().clone())
    }

    pub fn interceptor(&self, id: &str) -> Option<Arc<dyn AroundInvoke>> {
        self.interceptors.get(id).map(|entry| entry.value().clone())
    }
}

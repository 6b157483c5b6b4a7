//! Interceptors, invocation contexts, and interceptor factories
//!
//! A chain is an ordered list of interceptor objects terminated by the
//! actual method dispatch. Chains are fixed once built; everything that
//! varies per call travels in the [`Invocation`] context value.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::{AroundInvoke, InstanceState, MethodHandler};
use crate::core::error::{DeployError, DeployResult};

/// Per-call context passed through one interceptor chain.
pub struct Invocation<'a> {
    method: &'a str,
    /// Call parameters; interceptors may rewrite them before proceeding.
    pub args: JsonValue,
    /// Free-form data interceptors use to talk to each other.
    pub data: HashMap<String, JsonValue>,
    chain: &'a [Arc<dyn Interceptor>],
    position: usize,
}

impl<'a> Invocation<'a> {
    pub fn new(method: &'a str, args: JsonValue, chain: &'a [Arc<dyn Interceptor>]) -> Self {
        Self {
            method,
            args,
            data: HashMap::new(),
            chain,
            position: 0,
        }
    }

    pub fn method(&self) -> &str {
        self.method
    }

    /// Run the remainder of the chain.
    ///
    /// Errors raised by the invoked target pass through unmodified;
    /// proceeding past the end of a chain is a chain-internal error.
    pub async fn proceed(&mut self) -> DeployResult<JsonValue> {
        let Some(next) = self.chain.get(self.position) else {
            return Err(DeployError::InterceptorChain(format!(
                "proceed past the end of the chain for method {}",
                self.method
            )));
        };
        let next = next.clone();
        self.position += 1;
        next.invoke(self).await
    }
}

/// One live link of an interceptor chain, bound to instance state.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn invoke(&self, invocation: &mut Invocation<'_>) -> DeployResult<JsonValue>;
}

/// Produces a live interceptor bound to one component instance.
///
/// Factories are created once at chain-build time and invoked once per
/// component instance creation.
pub trait InterceptorFactory: Send + Sync {
    /// Stable description of this link, e.g. `around(audit.log)`. Chain
    /// building is deterministic, so equal configurations yield equal
    /// description sequences.
    fn describe(&self) -> String;

    /// Create the interceptor for an instance whose component-scope state
    /// is `component_state`.
    fn create(&self, component_state: &Arc<InstanceState>) -> DeployResult<Arc<dyn Interceptor>>;
}

/// Around-invoke link dispatching to an interceptor handler method.
struct AroundInterceptor {
    handler: Arc<dyn AroundInvoke>,
    method: String,
    state: Arc<InstanceState>,
}

#[async_trait]
impl Interceptor for AroundInterceptor {
    async fn invoke(&self, invocation: &mut Invocation<'_>) -> DeployResult<JsonValue> {
        self.handler
            .intercept(&self.method, &self.state, invocation)
            .await
    }
}

/// Factory for a foreign interceptor handler: each component instance gets
/// its own interceptor instance state with the recorded resource
/// injections applied.
pub struct InjectingFactory {
    handler: Arc<dyn AroundInvoke>,
    method: String,
    /// Sorted by resource name so instantiation order is deterministic.
    injections: Vec<(String, JsonValue)>,
}

impl InjectingFactory {
    pub fn new(
        handler: Arc<dyn AroundInvoke>,
        method: impl Into<String>,
        mut injections: Vec<(String, JsonValue)>,
    ) -> Self {
        injections.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            handler,
            method: method.into(),
            injections,
        }
    }
}

impl InterceptorFactory for InjectingFactory {
    fn describe(&self) -> String {
        format!("around({}.{})", self.handler.id(), self.method)
    }

    fn create(&self, _component_state: &Arc<InstanceState>) -> DeployResult<Arc<dyn Interceptor>> {
        let state = Arc::new(InstanceState::new());
        for (name, value) in &self.injections {
            state.set_resource(name.clone(), value.clone());
        }
        Ok(Arc::new(AroundInterceptor {
            handler: self.handler.clone(),
            method: self.method.clone(),
            state,
        }))
    }
}

/// Factory for a component intercepting itself: the component instance is
/// reused as the interceptor instance, so the link shares the component's
/// own state instead of creating a second object.
pub struct PassthroughFactory {
    handler: Arc<dyn AroundInvoke>,
    method: String,
}

impl PassthroughFactory {
    pub fn new(handler: Arc<dyn AroundInvoke>, method: impl Into<String>) -> Self {
        Self {
            handler,
            method: method.into(),
        }
    }
}

impl InterceptorFactory for PassthroughFactory {
    fn describe(&self) -> String {
        format!("self({}.{})", self.handler.id(), self.method)
    }

    fn create(&self, component_state: &Arc<InstanceState>) -> DeployResult<Arc<dyn Interceptor>> {
        Ok(Arc::new(AroundInterceptor {
            handler: self.handler.clone(),
            method: self.method.clone(),
            state: component_state.clone(),
        }))
    }
}

/// Terminal link performing the actual method dispatch.
struct InvokingInterceptor {
    handler: Arc<dyn MethodHandler>,
    state: Arc<InstanceState>,
}

#[async_trait]
impl Interceptor for InvokingInterceptor {
    async fn invoke(&self, invocation: &mut Invocation<'_>) -> DeployResult<JsonValue> {
        self.handler
            .invoke(invocation.method(), invocation.args.clone(), &self.state)
            .await
    }
}

/// Factory for the constant terminal dispatch link.
pub struct InvokingFactory {
    handler: Arc<dyn MethodHandler>,
}

impl InvokingFactory {
    pub fn new(handler: Arc<dyn MethodHandler>) -> Self {
        Self { handler }
    }
}

impl InterceptorFactory for InvokingFactory {
    fn describe(&self) -> String {
        format!("invoke({})", self.handler.id())
    }

    fn create(&self, component_state: &Arc<InstanceState>) -> DeployResult<Arc<dyn Interceptor>> {
        Ok(Arc::new(InvokingInterceptor {
            handler: self.handler.clone(),
            state: component_state.clone(),
        }))
    }
}

/// Terminal link for a lifecycle chain: dispatches the configured target
/// method with no arguments.
struct LifecycleInterceptor {
    handler: Arc<dyn MethodHandler>,
    method: String,
    state: Arc<InstanceState>,
}

#[async_trait]
impl Interceptor for LifecycleInterceptor {
    async fn invoke(&self, _invocation: &mut Invocation<'_>) -> DeployResult<JsonValue> {
        self.handler
            .invoke(&self.method, JsonValue::Null, &self.state)
            .await
    }
}

/// Factory for one lifecycle (post-construct / pre-destroy) link.
pub struct LifecycleFactory {
    handler: Arc<dyn MethodHandler>,
    method: String,
}

impl LifecycleFactory {
    pub fn new(handler: Arc<dyn MethodHandler>, method: impl Into<String>) -> Self {
        Self {
            handler,
            method: method.into(),
        }
    }
}

impl InterceptorFactory for LifecycleFactory {
    fn describe(&self) -> String {
        format!("lifecycle({}.{})", self.handler.id(), self.method)
    }

    fn create(&self, component_state: &Arc<InstanceState>) -> DeployResult<Arc<dyn Interceptor>> {
        Ok(Arc::new(LifecycleInterceptor {
            handler: self.handler.clone(),
            method: self.method.clone(),
            state: component_state.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Target;

    #[async_trait]
    impl MethodHandler for Target {
        fn id(&self) -> &str {
            "target"
        }

        fn methods(&self) -> &[&'static str] {
            &["greet"]
        }

        async fn invoke(
            &self,
            method: &str,
            args: JsonValue,
            _state: &InstanceState,
        ) -> DeployResult<JsonValue> {
            match method {
                "greet" => Ok(serde_json::json!({ "greeting": args })),
                other => Err(DeployError::Invocation(format!("no method {other}"))),
            }
        }
    }

    struct Tagger;

    #[async_trait]
    impl AroundInvoke for Tagger {
        fn id(&self) -> &str {
            "tagger"
        }

        fn methods(&self) -> &[&'static str] {
            &["tag"]
        }

        async fn intercept(
            &self,
            _method: &str,
            state: &InstanceState,
            invocation: &mut Invocation<'_>,
        ) -> DeployResult<JsonValue> {
            let tag = state.resource("tag").unwrap_or(JsonValue::Null);
            let mut result = invocation.proceed().await?;
            if let Some(object) = result.as_object_mut() {
                object.insert("tag".to_string(), tag);
            }
            Ok(result)
        }
    }

    #[tokio::test]
    async fn test_chain_runs_interceptor_around_dispatch() {
        let state = Arc::new(InstanceState::new());
        let around = InjectingFactory::new(
            Arc::new(Tagger),
            "tag",
            vec![("tag".to_string(), serde_json::json!("audited"))],
        );
        let terminal = InvokingFactory::new(Arc::new(Target));
        let chain = vec![
            around.create(&state).unwrap(),
            terminal.create(&state).unwrap(),
        ];

        let mut invocation = Invocation::new("greet", serde_json::json!("hi"), &chain);
        let result = invocation.proceed().await.unwrap();
        assert_eq!(result["greeting"], "hi");
        assert_eq!(result["tag"], "audited");
    }

    #[tokio::test]
    async fn test_proceed_past_end_is_a_chain_error() {
        let chain: Vec<Arc<dyn Interceptor>> = Vec::new();
        let mut invocation = Invocation::new("greet", JsonValue::Null, &chain);
        let err = invocation.proceed().await.unwrap_err();
        assert!(matches!(err, DeployError::InterceptorChain(_)));
    }

    #[tokio::test]
    async fn test_target_errors_pass_through_unmodified() {
        let state = Arc::new(InstanceState::new());
        let terminal = InvokingFactory::new(Arc::new(Target));
        let chain = vec![terminal.create(&state).unwrap()];
        let mut invocation = Invocation::new("missing", JsonValue::Null, &chain);
        let err = invocation.proceed().await.unwrap_err();
        assert!(matches!(err, DeployError::Invocation(_)));
    }

    #[tokio::test]
    async fn test_passthrough_shares_component_state() {
        let state = Arc::new(InstanceState::new());
        state.set_resource("tag", serde_json::json!("self"));
        let around = PassthroughFactory::new(Arc::new(Tagger), "tag");
        let terminal = InvokingFactory::new(Arc::new(Target));
        let chain = vec![
            around.create(&state).unwrap(),
            terminal.create(&state).unwrap(),
        ];

        let mut invocation = Invocation::new("greet", serde_json::json!("hi"), &chain);
        let result = invocation.proceed().await.unwrap();
        // the self-interceptor read the component's own state
        assert_eq!(result["tag"], "self");
    }
}

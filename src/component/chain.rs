//! Per-method interceptor chain building
//!
//! Given a component configuration and its target handler's method table,
//! build one ordered factory list per method: every matching AROUND-INVOKE
//! binding in declaration order, terminated by the constant invoking
//! factory. Matching is computed once here, never per call, and a build
//! either produces chains for every method or fails as a whole.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use once_cell::sync::Lazy;
use regex::Regex;

use super::{
    interceptor::{
        InjectingFactory, Interceptor, InterceptorFactory, InvokingFactory, LifecycleFactory,
        PassthroughFactory,
    },
    HandlerRegistry, InstanceState,
};
use crate::{
    config::{ComponentConfig, MethodSelector},
    core::error::{DeployError, DeployResult},
};

static MATCH_ALL: Lazy<Regex> = Lazy::new(|| Regex::new("^(?:.*)$").expect("match-all regex"));

/// A binding's method filter, compiled once at build time.
enum MethodFilter {
    Pattern(Regex),
    Methods(HashSet<String>),
}

impl MethodFilter {
    fn from_selector(selector: &MethodSelector) -> DeployResult<Self> {
        match selector {
            MethodSelector::Pattern(pattern) if pattern == ".*" => {
                Ok(MethodFilter::Pattern(MATCH_ALL.clone()))
            }
            // anchored: a filter matches whole method names, not substrings
            MethodSelector::Pattern(pattern) => Regex::new(&format!("^(?:{pattern})$"))
                .map(MethodFilter::Pattern)
                .map_err(|e| {
                    DeployError::InterceptorBinding(format!(
                        "invalid method filter {pattern}: {e}"
                    ))
                }),
            MethodSelector::Methods(methods) => Ok(MethodFilter::Methods(
                methods.iter().cloned().collect(),
            )),
        }
    }

    fn matches(&self, method: &str) -> bool {
        match self {
            MethodFilter::Pattern(pattern) => pattern.is_match(method),
            MethodFilter::Methods(methods) => methods.contains(method),
        }
    }
}

/// The fixed per-method factory chains of one component.
pub struct ComponentChains {
    component: String,
    methods: BTreeMap<&'static str, Vec<Arc<dyn InterceptorFactory>>>,
}

impl ComponentChains {
    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn method_names(&self) -> Vec<&'static str> {
        self.methods.keys().copied().collect()
    }

    pub fn factories(&self, method: &str) -> Option<&[Arc<dyn InterceptorFactory>]> {
        self.methods.get(method).map(|factories| factories.as_slice())
    }

    /// Chain descriptions per method. Building is deterministic: equal
    /// configurations yield equal maps.
    pub fn describe(&self) -> BTreeMap<&'static str, Vec<String>> {
        self.methods
            .iter()
            .map(|(method, factories)| {
                (
                    *method,
                    factories.iter().map(|factory| factory.describe()).collect(),
                )
            })
            .collect()
    }

    /// Create the live per-instance chains for one component instance.
    pub(crate) fn instantiate(
        &self,
        state: &Arc<InstanceState>,
    ) -> DeployResult<HashMap<&'static str, Vec<Arc<dyn Interceptor>>>> {
        let mut chains = HashMap::with_capacity(self.methods.len());
        for (method, factories) in &self.methods {
            let chain = factories
                .iter()
                .map(|factory| factory.create(state))
                .collect::<DeployResult<Vec<_>>>()?;
            chains.insert(*method, chain);
        }
        Ok(chains)
    }
}

impl std::fmt::Debug for ComponentChains {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentChains")
            .field("component", &self.component)
            .field("methods", &self.method_names())
            .finish()
    }
}

/// Separate single-method chains keyed by lifecycle event.
pub struct LifecycleChains {
    component: String,
    post_construct: Vec<Arc<dyn InterceptorFactory>>,
    pre_destroy: Vec<Arc<dyn InterceptorFactory>>,
}

impl LifecycleChains {
    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn post_construct(&self) -> &[Arc<dyn InterceptorFactory>] {
        &self.post_construct
    }

    pub fn pre_destroy(&self) -> &[Arc<dyn InterceptorFactory>] {
        &self.pre_destroy
    }
}

impl std::fmt::Debug for LifecycleChains {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleChains")
            .field("component", &self.component)
            .field("post_construct", &self.post_construct.len())
            .field("pre_destroy", &self.pre_destroy.len())
            .finish()
    }
}

/// Build the AROUND-INVOKE chains for every method of `config`'s target.
pub fn build_method_chains(
    config: &ComponentConfig,
    handlers: &HandlerRegistry,
) -> DeployResult<ComponentChains> {
    let target = handlers.target(&config.target).ok_or_else(|| {
        DeployError::InterceptorBinding(format!(
            "failed to load component target handler {}",
            config.target
        ))
    })?;
    let methods = target.methods();
    let mut chains: BTreeMap<&'static str, Vec<Arc<dyn InterceptorFactory>>> =
        methods.iter().map(|method| (*method, Vec::new())).collect();

    for binding in &config.interceptors {
        let filter = MethodFilter::from_selector(&binding.filter)?;
        let around = handlers.interceptor(&binding.interceptor).ok_or_else(|| {
            DeployError::InterceptorBinding(format!(
                "failed to load interceptor handler {}",
                binding.interceptor
            ))
        })?;
        if !around.methods().contains(&binding.method.as_str()) {
            return Err(DeployError::InterceptorBinding(format!(
                "no interceptor method {} on handler {}",
                binding.method, binding.interceptor
            )));
        }

        // identity rule: a component intercepting itself reuses the
        // component instance instead of creating a second object
        let factory: Arc<dyn InterceptorFactory> = if binding.interceptor == config.target {
            Arc::new(PassthroughFactory::new(around, &binding.method))
        } else {
            let injections = binding
                .injections
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            Arc::new(InjectingFactory::new(around, &binding.method, injections))
        };

        for method in methods {
            if filter.matches(method) {
                chains
                    .get_mut(method)
                    .expect("method chain pre-seeded")
                    .push(factory.clone());
            }
        }
    }

    for method in methods {
        chains
            .get_mut(method)
            .expect("method chain pre-seeded")
            .push(Arc::new(InvokingFactory::new(target.clone())));
    }

    Ok(ComponentChains {
        component: config.name.clone(),
        methods: chains,
    })
}

/// Resolve the post-construct and pre-destroy chains against the target
/// handler's method table.
pub fn build_lifecycle_chains(
    config: &ComponentConfig,
    handlers: &HandlerRegistry,
) -> DeployResult<LifecycleChains> {
    let target = handlers.target(&config.target).ok_or_else(|| {
        DeployError::LifecycleBinding(format!(
            "failed to load component target handler {}",
            config.target
        ))
    })?;

    let resolve = |method: &String| -> DeployResult<Arc<dyn InterceptorFactory>> {
        if !target.methods().contains(&method.as_str()) {
            return Err(DeployError::LifecycleBinding(format!(
                "lifecycle method {method} does not exist on target {}",
                config.target
            )));
        }
        Ok(Arc::new(LifecycleFactory::new(target.clone(), method)))
    };

    Ok(LifecycleChains {
        component: config.name.clone(),
        post_construct: config
            .post_construct
            .iter()
            .map(resolve)
            .collect::<DeployResult<Vec<_>>>()?,
        pre_destroy: config
            .pre_destroy
            .iter()
            .map(resolve)
            .collect::<DeployResult<Vec<_>>>()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{AroundInvoke, Invocation, MethodHandler};
    use crate::config::InterceptorBinding;
    use async_trait::async_trait;
    use serde_json::Value as JsonValue;

    struct CartHandler;

    #[async_trait]
    impl MethodHandler for CartHandler {
        fn id(&self) -> &str {
            "cart-handler"
        }

        fn methods(&self) -> &[&'static str] {
            &["checkout", "get_total", "get_items", "start"]
        }

        async fn invoke(
            &self,
            _method: &str,
            args: JsonValue,
            _state: &InstanceState,
        ) -> DeployResult<JsonValue> {
            Ok(args)
        }
    }

    struct Audit;

    #[async_trait]
    impl AroundInvoke for Audit {
        fn id(&self) -> &str {
            "audit"
        }

        fn methods(&self) -> &[&'static str] {
            &["log"]
        }

        async fn intercept(
            &self,
            _method: &str,
            _state: &InstanceState,
            invocation: &mut Invocation<'_>,
        ) -> DeployResult<JsonValue> {
            invocation.proceed().await
        }
    }

    /// A target that also defines its own interceptor method.
    struct SelfAware;

    #[async_trait]
    impl MethodHandler for SelfAware {
        fn id(&self) -> &str {
            "self-aware"
        }

        fn methods(&self) -> &[&'static str] {
            &["work"]
        }

        async fn invoke(
            &self,
            _method: &str,
            args: JsonValue,
            _state: &InstanceState,
        ) -> DeployResult<JsonValue> {
            Ok(args)
        }
    }

    #[async_trait]
    impl AroundInvoke for SelfAware {
        fn id(&self) -> &str {
            "self-aware"
        }

        fn methods(&self) -> &[&'static str] {
            &["guard"]
        }

        async fn intercept(
            &self,
            _method: &str,
            _state: &InstanceState,
            invocation: &mut Invocation<'_>,
        ) -> DeployResult<JsonValue> {
            invocation.proceed().await
        }
    }

    fn registry() -> HandlerRegistry {
        let registry = HandlerRegistry::new();
        registry.register_target(Arc::new(CartHandler));
        registry.register_interceptor(Arc::new(Audit));
        let self_aware = Arc::new(SelfAware);
        registry.register_target(self_aware.clone());
        registry.register_interceptor(self_aware);
        registry
    }

    fn binding(filter: MethodSelector) -> InterceptorBinding {
        InterceptorBinding {
            interceptor: "audit".to_string(),
            method: "log".to_string(),
            filter,
            injections: Default::default(),
        }
    }

    fn config(bindings: Vec<InterceptorBinding>) -> ComponentConfig {
        ComponentConfig {
            name: "cart".to_string(),
            target: "cart-handler".to_string(),
            post_construct: vec![],
            pre_destroy: vec![],
            instantiation: Default::default(),
            pool_size: 8,
            interceptors: bindings,
            dependencies: vec![],
        }
    }

    #[test]
    fn test_pattern_filter_selects_matching_methods() {
        let registry = registry();
        let chains = build_method_chains(
            &config(vec![binding(MethodSelector::Pattern("get_.*".to_string()))]),
            &registry,
        )
        .unwrap();

        let described = chains.describe();
        assert_eq!(
            described["get_total"],
            vec!["around(audit.log)", "invoke(cart-handler)"]
        );
        assert_eq!(
            described["get_items"],
            vec!["around(audit.log)", "invoke(cart-handler)"]
        );
        // unmatched methods still get the terminal dispatch link
        assert_eq!(described["checkout"], vec!["invoke(cart-handler)"]);
    }

    #[test]
    fn test_anchored_pattern_does_not_match_substrings() {
        let registry = registry();
        let chains = build_method_chains(
            &config(vec![binding(MethodSelector::Pattern("art".to_string()))]),
            &registry,
        )
        .unwrap();
        // "start" contains "art" but the filter matches whole names only
        assert_eq!(chains.describe()["start"], vec!["invoke(cart-handler)"]);
    }

    #[test]
    fn test_bindings_apply_in_declaration_order() {
        let registry = registry();
        let chains = build_method_chains(
            &config(vec![
                binding(MethodSelector::Methods(vec!["checkout".to_string()])),
                binding(MethodSelector::Pattern(".*".to_string())),
            ]),
            &registry,
        )
        .unwrap();
        assert_eq!(
            chains.describe()["checkout"],
            vec![
                "around(audit.log)",
                "around(audit.log)",
                "invoke(cart-handler)"
            ]
        );
    }

    #[test]
    fn test_chain_build_is_deterministic() {
        let registry = registry();
        let cfg = config(vec![
            binding(MethodSelector::Pattern("get_.*".to_string())),
            binding(MethodSelector::Methods(vec!["checkout".to_string()])),
        ]);
        let first = build_method_chains(&cfg, &registry).unwrap();
        let second = build_method_chains(&cfg, &registry).unwrap();
        assert_eq!(first.describe(), second.describe());
        assert_eq!(first.method_names(), second.method_names());
    }

    #[test]
    fn test_unknown_interceptor_fails_the_whole_build() {
        let registry = registry();
        let mut bad = binding(MethodSelector::default());
        bad.interceptor = "missing".to_string();
        let err = build_method_chains(&config(vec![bad]), &registry).unwrap_err();
        assert!(
            matches!(&err, DeployError::InterceptorBinding(msg) if msg.contains("missing")),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn test_unknown_interceptor_method_fails_the_whole_build() {
        let registry = registry();
        let mut bad = binding(MethodSelector::default());
        bad.method = "nope".to_string();
        let err = build_method_chains(&config(vec![bad]), &registry).unwrap_err();
        assert!(
            matches!(&err, DeployError::InterceptorBinding(msg) if msg.contains("nope")),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn test_self_interceptor_reuses_the_component_instance() {
        let registry = registry();
        let cfg = ComponentConfig {
            name: "worker".to_string(),
            target: "self-aware".to_string(),
            post_construct: vec![],
            pre_destroy: vec![],
            instantiation: Default::default(),
            pool_size: 8,
            interceptors: vec![InterceptorBinding {
                interceptor: "self-aware".to_string(),
                method: "guard".to_string(),
                filter: MethodSelector::default(),
                injections: Default::default(),
            }],
            dependencies: vec![],
        };
        let chains = build_method_chains(&cfg, &registry).unwrap();
        assert_eq!(
            chains.describe()["work"],
            vec!["self(self-aware.guard)", "invoke(self-aware)"]
        );
    }

    #[test]
    fn test_lifecycle_binding_to_missing_method_fails() {
        let registry = registry();
        let mut cfg = config(vec![]);
        cfg.post_construct = vec!["init".to_string()];
        let err = build_lifecycle_chains(&cfg, &registry).unwrap_err();
        assert!(
            matches!(&err, DeployError::LifecycleBinding(msg) if msg.contains("init")),
            "error must name the missing method: {err}"
        );
    }

    #[test]
    fn test_lifecycle_chains_resolve_in_configured_order() {
        let registry = registry();
        let mut cfg = config(vec![]);
        cfg.post_construct = vec!["start".to_string(), "checkout".to_string()];
        let chains = build_lifecycle_chains(&cfg, &registry).unwrap();
        let described: Vec<String> = chains
            .post_construct()
            .iter()
            .map(|factory| factory.describe())
            .collect();
        assert_eq!(
            described,
            vec![
                "lifecycle(cart-handler.start)",
                "lifecycle(cart-handler.checkout)"
            ]
        );
        assert!(chains.pre_destroy().is_empty());
    }
}

//! Component runtime: lifecycle and instance management
//!
//! Owns instance acquisition and return atop the built interceptor chains.
//! `start` and `stop` are effective exactly once across the component's
//! life; instances are fresh per call or pooled per the configured policy,
//! and a pooled instance is only ever reused after it has been returned.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use log::{debug, warn};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::{
    chain::{ComponentChains, LifecycleChains},
    interceptor::{Interceptor, InterceptorFactory, Invocation},
    InstanceState,
};
use crate::{
    config::InstantiationPolicy,
    core::error::{DeployError, DeployResult},
};

/// One live instantiation: target state plus resolved per-instance chains.
pub struct ComponentInstance {
    id: Uuid,
    component: String,
    state: Arc<InstanceState>,
    chains: HashMap<&'static str, Vec<Arc<dyn Interceptor>>>,
}

impl ComponentInstance {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn state(&self) -> &Arc<InstanceState> {
        &self.state
    }

    /// Invoke a method through its interceptor chain.
    pub async fn invoke(&self, method: &str, args: JsonValue) -> DeployResult<JsonValue> {
        let chain = self.chains.get(method).ok_or_else(|| {
            DeployError::Invocation(format!(
                "no method {method} on component {}",
                self.component
            ))
        })?;
        Invocation::new(method, args, chain).proceed().await
    }
}

#[derive(Clone, Copy, PartialEq)]
enum RuntimeState {
    New,
    Up,
    Down,
}

/// A started component: chains, lifecycle hooks, and the instance pool.
pub struct ComponentRuntime {
    name: String,
    policy: InstantiationPolicy,
    pool_size: usize,
    chains: Arc<ComponentChains>,
    lifecycle: Arc<LifecycleChains>,
    state: Mutex<RuntimeState>,
    /// Component-scope state; lifecycle chains run against it.
    scope_state: Arc<InstanceState>,
    pool: Mutex<Vec<ComponentInstance>>,
    outstanding: Mutex<HashSet<Uuid>>,
}

impl ComponentRuntime {
    pub fn new(
        name: impl Into<String>,
        policy: InstantiationPolicy,
        pool_size: usize,
        chains: Arc<ComponentChains>,
        lifecycle: Arc<LifecycleChains>,
    ) -> Self {
        Self {
            name: name.into(),
            policy,
            pool_size,
            chains,
            lifecycle,
            state: Mutex::new(RuntimeState::New),
            scope_state: Arc::new(InstanceState::new()),
            pool: Mutex::new(Vec::new()),
            outstanding: Mutex::new(HashSet::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the post-construct chains and open the instance window.
    ///
    /// Effective once; repeated calls are logged no-ops. Starting again
    /// after `stop` fails: a component lives exactly one start/stop cycle.
    pub async fn start(&self) -> DeployResult<()> {
        {
            let mut state = self.state.lock().expect("runtime state lock");
            match *state {
                RuntimeState::New => *state = RuntimeState::Up,
                RuntimeState::Up => {
                    warn!("component {} is already started", self.name);
                    return Ok(());
                }
                RuntimeState::Down => {
                    return Err(DeployError::ComponentNotAvailable(self.name.clone()))
                }
            }
        }
        debug!("component {}: running post-construct hooks", self.name);
        if let Err(err) = self
            .run_lifecycle("post-construct", self.lifecycle.post_construct())
            .await
        {
            *self.state.lock().expect("runtime state lock") = RuntimeState::Down;
            return Err(err);
        }
        Ok(())
    }

    /// Run the pre-destroy chains and close the instance window.
    /// Effective once; repeated calls are logged no-ops.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().expect("runtime state lock");
            match *state {
                RuntimeState::Up => *state = RuntimeState::Down,
                _ => {
                    warn!("component {} is not started, ignoring stop", self.name);
                    return;
                }
            }
        }
        debug!("component {}: running pre-destroy hooks", self.name);
        if let Err(err) = self
            .run_lifecycle("pre-destroy", self.lifecycle.pre_destroy())
            .await
        {
            warn!("component {}: pre-destroy hook failed: {err}", self.name);
        }
        self.pool.lock().expect("pool lock").clear();
    }

    async fn run_lifecycle(
        &self,
        event: &str,
        factories: &[Arc<dyn InterceptorFactory>],
    ) -> DeployResult<()> {
        for factory in factories {
            let link = factory.create(&self.scope_state)?;
            let chain = vec![link];
            Invocation::new(event, JsonValue::Null, &chain)
                .proceed()
                .await?;
        }
        Ok(())
    }

    /// Yield an instance with its per-call chains bound: a fresh object, or
    /// one drawn from the pool per the instantiation policy.
    pub fn get_instance(&self) -> DeployResult<ComponentInstance> {
        if *self.state.lock().expect("runtime state lock") != RuntimeState::Up {
            return Err(DeployError::ComponentNotAvailable(self.name.clone()));
        }

        if self.policy == InstantiationPolicy::Pooled {
            if let Some(instance) = self.pool.lock().expect("pool lock").pop() {
                self.outstanding
                    .lock()
                    .expect("outstanding lock")
                    .insert(instance.id);
                return Ok(instance);
            }
        }

        let state = Arc::new(InstanceState::new());
        let chains = self.chains.instantiate(&state)?;
        let instance = ComponentInstance {
            id: Uuid::new_v4(),
            component: self.name.clone(),
            state,
            chains,
        };
        self.outstanding
            .lock()
            .expect("outstanding lock")
            .insert(instance.id);
        Ok(instance)
    }

    /// Release an instance. Unknown or already returned instances are
    /// tolerated (an instance may race its own invocation cleanup).
    pub fn return_instance(&self, instance: ComponentInstance) {
        let known = self
            .outstanding
            .lock()
            .expect("outstanding lock")
            .remove(&instance.id);
        if !known {
            debug!(
                "component {}: ignoring return of unknown instance {}",
                self.name, instance.id
            );
            return;
        }
        if self.policy == InstantiationPolicy::Pooled
            && *self.state.lock().expect("runtime state lock") == RuntimeState::Up
        {
            let mut pool = self.pool.lock().expect("pool lock");
            if pool.len() < self.pool_size {
                pool.push(instance);
            }
        }
    }
}

//! Service graph: registration, cycle validation, and lifecycle scheduling
//!
//! The graph owns every [`ServiceController`] and drives activation and
//! deactivation in dependency order. The ready set (services whose
//! dependencies are all up) is dispatched concurrently on tokio tasks; state
//! bookkeeping and dependent notification stay on the scheduler loop, so a
//! dependent can only be dispatched after its dependency's value is published
//! and its state reads `UP`.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use dashmap::DashMap;
use log::{debug, error, info, warn};
use tokio::task::JoinSet;

use super::{
    controller::{ServiceController, ServiceState},
    ServiceDefinition, ServiceName, ServiceValue, StartContext,
};
use crate::core::error::{DeployError, DeployResult};

/// Buffer for service definitions registered during one pipeline phase.
///
/// Definitions collect here and are installed into the graph as one
/// all-or-nothing batch when the phase ends: a duplicate name or a cycle
/// anywhere in the batch leaves none of its services registered.
#[derive(Default)]
pub struct ServiceBatch {
    pending: Mutex<Vec<ServiceDefinition>>,
}

impl ServiceBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, definition: ServiceDefinition) {
        self.pending.lock().expect("batch lock").push(definition);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().expect("batch lock").is_empty()
    }

    fn take(&self) -> Vec<ServiceDefinition> {
        std::mem::take(&mut *self.pending.lock().expect("batch lock"))
    }
}

/// Outcome of one activation pass.
#[derive(Default, Debug)]
pub struct ActivationReport {
    pub started: Vec<ServiceName>,
    pub failed: Vec<(ServiceName, DeployError)>,
    pub missing: Vec<ServiceName>,
}

impl ActivationReport {
    pub fn all_up(&self) -> bool {
        self.failed.is_empty() && self.missing.is_empty()
    }
}

/// The set of all registered services and their dependency edges.
pub struct ServiceGraph {
    controllers: DashMap<ServiceName, Arc<ServiceController>>,
    /// Serializes registration so cycle checks see a consistent edge set.
    registration: Mutex<()>,
    stop_requested: AtomicBool,
}

impl Default for ServiceGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceGraph {
    pub fn new() -> Self {
        Self {
            controllers: DashMap::new(),
            registration: Mutex::new(()),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServiceController>> {
        self.controllers.get(name).map(|entry| entry.value().clone())
    }

    pub fn state_of(&self, name: &str) -> Option<ServiceState> {
        self.get(name).map(|controller| controller.state())
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Typed lookup of an up service's published value.
    pub fn require<T: Send + Sync + 'static>(&self, name: &str) -> DeployResult<Arc<T>> {
        let controller = self
            .get(name)
            .ok_or_else(|| DeployError::Internal(format!("service {name} is not registered")))?;
        if controller.state() != ServiceState::Up {
            return Err(DeployError::Internal(format!(
                "service {name} is not up (state {})",
                controller.state()
            )));
        }
        controller
            .value()
            .and_then(|value| value.downcast::<T>())
            .ok_or_else(|| {
                DeployError::Internal(format!("service {name} published no usable value"))
            })
    }

    /// Register a single service immediately (a batch of one).
    pub fn register(&self, definition: ServiceDefinition) -> DeployResult<Arc<ServiceController>> {
        let name = definition.name.clone();
        self.install(vec![definition])?;
        Ok(self.get(&name).expect("controller just installed"))
    }

    /// Install every definition buffered in `batch`, atomically.
    pub fn install_batch(&self, batch: &ServiceBatch) -> DeployResult<Vec<ServiceName>> {
        let definitions = batch.take();
        if definitions.is_empty() {
            return Ok(Vec::new());
        }
        self.install(definitions)
    }

    fn install(&self, definitions: Vec<ServiceDefinition>) -> DeployResult<Vec<ServiceName>> {
        let _guard = self.registration.lock().expect("registration lock");

        // Name uniqueness across the batch and the installed graph.
        let mut batch_names = HashSet::new();
        for definition in &definitions {
            if !batch_names.insert(definition.name.clone())
                || self.controllers.contains_key(&definition.name)
            {
                return Err(DeployError::DuplicateService(definition.name.clone()));
            }
        }

        // Cycle validation over installed edges plus the whole batch.
        let mut edges: HashMap<ServiceName, Vec<ServiceName>> = HashMap::new();
        for entry in self.controllers.iter() {
            edges.insert(entry.key().clone(), entry.value().dependencies().to_vec());
        }
        for definition in &definitions {
            edges.insert(definition.name.clone(), definition.dependencies.clone());
        }
        for definition in &definitions {
            if let Some(cycle) = find_cycle(&edges, &definition.name) {
                return Err(DeployError::CycleDetected(cycle));
            }
        }

        let mut installed = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let name = definition.name.clone();
            debug!("registering service {name}");
            let controller = Arc::new(ServiceController::new(definition));
            controller.transition(ServiceState::Down)?;
            self.controllers.insert(name.clone(), controller);
            installed.push(name);
        }

        // Reverse links, covering both early- and late-registering sides.
        for name in &installed {
            let controller = self.get(name).expect("installed controller");
            for dependency in controller.dependencies() {
                if let Some(dependency) = self.get(dependency) {
                    dependency.add_dependent(name.clone());
                }
            }
        }
        let installed_set: HashSet<&ServiceName> = installed.iter().collect();
        let existing: Vec<(ServiceName, Vec<ServiceName>)> = self
            .controllers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().dependencies().to_vec()))
            .collect();
        for (name, dependencies) in existing {
            for dependency in dependencies {
                if installed_set.contains(&dependency) {
                    if let Some(dependency) = self.get(&dependency) {
                        dependency.add_dependent(name.clone());
                    }
                }
            }
        }

        Ok(installed)
    }

    /// Reset a failed service so the next activation pass attempts it again.
    pub fn retry(&self, name: &str) -> DeployResult<()> {
        let controller = self
            .get(name)
            .ok_or_else(|| DeployError::Internal(format!("service {name} is not registered")))?;
        controller.transition(ServiceState::Down)
    }

    /// Start every service whose dependencies can be satisfied.
    ///
    /// Ready services start concurrently; a start failure quarantines all
    /// transitive dependents as `MISSING_DEPENDENCY` and never crashes the
    /// graph. Settles when no further work remains.
    pub async fn activate(&self) -> DeployResult<ActivationReport> {
        self.stop_requested.store(false, Ordering::SeqCst);

        let mut report = ActivationReport::default();
        let mut join_set: JoinSet<(ServiceName, DeployResult<ServiceValue>)> = JoinSet::new();
        let mut task_names: HashMap<tokio::task::Id, ServiceName> = HashMap::new();

        for controller in self.snapshot() {
            if self.ready_to_start(&controller) {
                self.dispatch_start(controller, &mut join_set, &mut task_names)?;
            }
        }

        while let Some(joined) = join_set.join_next_with_id().await {
            let (name, result) = match joined {
                Ok((id, (name, result))) => {
                    task_names.remove(&id);
                    (name, result)
                }
                Err(join_error) => {
                    let name = task_names
                        .remove(&join_error.id())
                        .unwrap_or_else(|| "<unknown>".to_string());
                    (
                        name.clone(),
                        Err(DeployError::Internal(format!(
                            "start action for {name} panicked: {join_error}"
                        ))),
                    )
                }
            };

            let controller = match self.get(&name) {
                Some(controller) => controller,
                None => continue,
            };

            match result {
                Ok(value) => {
                    // Publish before the UP transition: a dependent observing
                    // UP must be able to read the value.
                    controller.publish_value(value);
                    controller.transition(ServiceState::Up)?;
                    info!("service {name} is up");
                    report.started.push(name.clone());
                    if !self.stop_requested.load(Ordering::SeqCst) {
                        for dependent in controller.dependents() {
                            if let Some(dependent) = self.get(&dependent) {
                                if self.ready_to_start(&dependent) {
                                    self.dispatch_start(
                                        dependent,
                                        &mut join_set,
                                        &mut task_names,
                                    )?;
                                }
                            }
                        }
                    }
                }
                Err(cause) => {
                    error!("service {name} failed to start: {cause}");
                    controller.transition(ServiceState::StartFailed)?;
                    self.quarantine_dependents(&name, &mut report)?;
                    report.failed.push((
                        name.clone(),
                        DeployError::StartFailed {
                            service: name,
                            cause: Box::new(cause),
                        },
                    ));
                }
            }
        }

        // Whatever is still plainly down was never dispatchable: one of its
        // dependencies is unregistered, failed, or quarantined itself.
        if !self.stop_requested.load(Ordering::SeqCst) {
            for controller in self.snapshot() {
                if controller.state() == ServiceState::Down {
                    controller.transition(ServiceState::MissingDependency)?;
                    warn!(
                        "service {} is missing a dependency and will not be started",
                        controller.name()
                    );
                    report.missing.push(controller.name().to_string());
                }
            }
        }

        info!(
            "activation settled: {} up, {} failed, {} missing dependencies",
            report.started.len(),
            report.failed.len(),
            report.missing.len()
        );
        Ok(report)
    }

    /// Stop every running service, dependents before dependencies.
    ///
    /// In-flight starts are never preempted; a concurrent activation stops
    /// dispatching new starts as soon as this is called.
    pub async fn deactivate(&self) -> DeployResult<()> {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.stop_set(None).await
    }

    /// Stop and remove the named services in reverse dependency order.
    ///
    /// Running dependents outside the removal set are stopped as well: a
    /// service can only stop after everything depending on it has stopped.
    pub async fn remove_services(&self, names: &[ServiceName]) -> DeployResult<()> {
        let subset: HashSet<ServiceName> = names.iter().cloned().collect();
        let scope = self.dependent_closure(&subset);
        self.stop_set(Some(&scope)).await?;

        let ordered = self.reverse_dependency_order(&subset);
        let _guard = self.registration.lock().expect("registration lock");
        for name in ordered {
            if let Some((_, controller)) = self.controllers.remove(&name) {
                debug!("removed service {name}");
                for dependency in controller.dependencies() {
                    if let Some(dependency) = self.get(dependency) {
                        dependency.remove_dependent(&name);
                    }
                }
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<Arc<ServiceController>> {
        self.controllers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// `names` plus everything transitively depending on them.
    fn dependent_closure(&self, names: &HashSet<ServiceName>) -> HashSet<ServiceName> {
        let mut closure = names.clone();
        let mut queue: Vec<ServiceName> = names.iter().cloned().collect();
        while let Some(name) = queue.pop() {
            if let Some(controller) = self.get(&name) {
                for dependent in controller.dependents() {
                    if closure.insert(dependent.clone()) {
                        queue.push(dependent);
                    }
                }
            }
        }
        closure
    }

    fn ready_to_start(&self, controller: &ServiceController) -> bool {
        if self.stop_requested.load(Ordering::SeqCst) || !controller.state().is_down() {
            return false;
        }
        controller.dependencies().iter().all(|dependency| {
            self.state_of(dependency)
                .map(|state| state == ServiceState::Up)
                .unwrap_or(false)
        })
    }

    /// Move a ready controller to STARTING and spawn its start action.
    fn dispatch_start(
        &self,
        controller: Arc<ServiceController>,
        join_set: &mut JoinSet<(ServiceName, DeployResult<ServiceValue>)>,
        task_names: &mut HashMap<tokio::task::Id, ServiceName>,
    ) -> DeployResult<()> {
        if controller.state() == ServiceState::MissingDependency {
            controller.transition(ServiceState::Down)?;
        }
        controller.transition(ServiceState::Starting)?;

        // Dependency values are gathered here, under the scheduler, so the
        // spawned task never races a dependency's teardown.
        let mut values = HashMap::new();
        for dependency in controller.dependencies() {
            if let Some(value) = self.get(dependency).and_then(|c| c.value()) {
                values.insert(dependency.clone(), value);
            }
        }

        let name = controller.name().to_string();
        debug!("starting service {name}");
        let handle = join_set.spawn(async move {
            let name = controller.name().to_string();
            for injector in controller.injectors() {
                let value = match values.get(injector.dependency()) {
                    Some(value) => value,
                    None => {
                        return (
                            name.clone(),
                            Err(DeployError::Internal(format!(
                                "service {name} is missing a value for dependency {}",
                                injector.dependency()
                            ))),
                        )
                    }
                };
                if let Err(err) = injector.inject(value) {
                    return (name.clone(), Err(err));
                }
            }
            let ctx = StartContext::new(name.clone(), values);
            let result = controller.activator().start(&ctx).await;
            (name, result)
        });
        task_names.insert(handle.id(), name);
        Ok(())
    }

    /// Quarantine everything transitively depending on `failed`.
    fn quarantine_dependents(
        &self,
        failed: &str,
        report: &mut ActivationReport,
    ) -> DeployResult<()> {
        let mut queue: Vec<ServiceName> = self
            .get(failed)
            .map(|controller| controller.dependents())
            .unwrap_or_default();
        let mut seen: HashSet<ServiceName> = queue.iter().cloned().collect();

        while let Some(name) = queue.pop() {
            if let Some(controller) = self.get(&name) {
                if controller.state().is_down() {
                    controller.transition(ServiceState::MissingDependency)?;
                    warn!("service {name} is missing a dependency and will not be started");
                    report.missing.push(name.clone());
                }
                for dependent in controller.dependents() {
                    if seen.insert(dependent.clone()) {
                        queue.push(dependent);
                    }
                }
            }
        }
        Ok(())
    }

    fn dependents_stopped(&self, controller: &ServiceController) -> bool {
        controller.dependents().iter().all(|dependent| {
            self.state_of(dependent)
                .map(|state| {
                    !matches!(
                        state,
                        ServiceState::Up | ServiceState::Starting | ServiceState::Stopping
                    )
                })
                .unwrap_or(true)
        })
    }

    /// Stop services (all, or a subset), dependents before dependencies.
    async fn stop_set(&self, subset: Option<&HashSet<ServiceName>>) -> DeployResult<()> {
        let in_scope = |name: &str| subset.map(|set| set.contains(name)).unwrap_or(true);

        let mut join_set: JoinSet<ServiceName> = JoinSet::new();
        for controller in self.snapshot() {
            if in_scope(controller.name())
                && controller.state() == ServiceState::Up
                && self.dependents_stopped(&controller)
            {
                self.dispatch_stop(controller, &mut join_set)?;
            }
        }

        while let Some(joined) = join_set.join_next().await {
            let name = match joined {
                Ok(name) => name,
                Err(join_error) => {
                    error!("stop action panicked: {join_error}");
                    continue;
                }
            };
            let controller = match self.get(&name) {
                Some(controller) => controller,
                None => continue,
            };
            controller.transition(ServiceState::Down)?;
            controller.clear_value();
            controller.uninject_all();
            info!("service {name} is down");

            for dependency in controller.dependencies() {
                if let Some(dependency) = self.get(dependency) {
                    if in_scope(dependency.name())
                        && dependency.state() == ServiceState::Up
                        && self.dependents_stopped(&dependency)
                    {
                        self.dispatch_stop(dependency, &mut join_set)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn dispatch_stop(
        &self,
        controller: Arc<ServiceController>,
        join_set: &mut JoinSet<ServiceName>,
    ) -> DeployResult<()> {
        controller.transition(ServiceState::Stopping)?;
        debug!("stopping service {}", controller.name());
        join_set.spawn(async move {
            let name = controller.name().to_string();
            controller.activator().stop().await;
            name
        });
        Ok(())
    }

    /// Removal order for a subset: every service before its dependencies.
    fn reverse_dependency_order(&self, subset: &HashSet<ServiceName>) -> Vec<ServiceName> {
        let mut blocking: HashMap<ServiceName, usize> = HashMap::new();
        for name in subset {
            blocking.entry(name.clone()).or_insert(0);
            if let Some(controller) = self.get(name) {
                for dependency in controller.dependencies() {
                    if subset.contains(dependency) {
                        *blocking.entry(dependency.clone()).or_insert(0) += 1;
                    }
                }
            }
        }

        let mut ready: Vec<ServiceName> = blocking
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| name.clone())
            .collect();
        ready.sort();

        let mut ordered = Vec::with_capacity(subset.len());
        while let Some(name) = ready.pop() {
            if let Some(controller) = self.get(&name) {
                for dependency in controller.dependencies() {
                    if let Some(count) = blocking.get_mut(dependency) {
                        *count -= 1;
                        if *count == 0 {
                            ready.push(dependency.clone());
                        }
                    }
                }
            }
            ordered.push(name);
        }
        ordered
    }
}

/// Path-based cycle search from `root` over `edges`. Returns the cycle
/// members in dependency order when `root` can reach itself.
fn find_cycle(
    edges: &HashMap<ServiceName, Vec<ServiceName>>,
    root: &ServiceName,
) -> Option<Vec<ServiceName>> {
    fn walk(
        edges: &HashMap<ServiceName, Vec<ServiceName>>,
        root: &ServiceName,
        current: &ServiceName,
        path: &mut Vec<ServiceName>,
        visited: &mut HashSet<ServiceName>,
    ) -> bool {
        let Some(dependencies) = edges.get(current) else {
            return false;
        };
        for dependency in dependencies {
            if dependency == root {
                return true;
            }
            if visited.insert(dependency.clone()) {
                path.push(dependency.clone());
                if walk(edges, root, dependency, path, visited) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }

    let mut path = vec![root.clone()];
    let mut visited = HashSet::new();
    if walk(edges, root, root, &mut path, &mut visited) {
        Some(path)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{InjectedValue, ServiceActivator, ValueInjector};
    use async_trait::async_trait;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    type EventLog = Arc<Mutex<Vec<String>>>;

    struct Recording {
        name: &'static str,
        log: EventLog,
        fail: bool,
    }

    impl Recording {
        fn definition(name: &'static str, log: &EventLog, deps: &[&str]) -> ServiceDefinition {
            Self::definition_failing(name, log, deps, false)
        }

        fn definition_failing(
            name: &'static str,
            log: &EventLog,
            deps: &[&str],
            fail: bool,
        ) -> ServiceDefinition {
            let mut definition = ServiceDefinition::new(
                name,
                Arc::new(Recording {
                    name,
                    log: log.clone(),
                    fail,
                }),
            );
            for dep in deps {
                definition = definition.with_dependency(*dep);
            }
            definition
        }
    }

    #[async_trait]
    impl ServiceActivator for Recording {
        async fn start(&self, _ctx: &StartContext) -> DeployResult<ServiceValue> {
            if self.fail {
                return Err(DeployError::Invocation(format!("{} refused", self.name)));
            }
            self.log
                .lock()
                .unwrap()
                .push(format!("start {}", self.name));
            Ok(ServiceValue::new(self.name.to_string()))
        }

        async fn stop(&self) {
            self.log.lock().unwrap().push(format!("stop {}", self.name));
        }
    }

    fn position(log: &EventLog, event: &str) -> usize {
        log.lock()
            .unwrap()
            .iter()
            .position(|entry| entry == event)
            .unwrap_or_else(|| panic!("event {event} not recorded"))
    }

    #[tokio::test]
    async fn test_activation_starts_in_dependency_order() {
        init_log();
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let graph = ServiceGraph::new();
        graph.register(Recording::definition("db", &log, &[])).unwrap();
        graph
            .register(Recording::definition("pool", &log, &["db"]))
            .unwrap();
        graph
            .register(Recording::definition("app", &log, &["pool"]))
            .unwrap();

        let report = graph.activate().await.unwrap();
        assert!(report.all_up());
        assert_eq!(report.started.len(), 3);
        for name in ["db", "pool", "app"] {
            assert_eq!(graph.state_of(name), Some(ServiceState::Up));
        }
        assert!(position(&log, "start db") < position(&log, "start pool"));
        assert!(position(&log, "start pool") < position(&log, "start app"));
    }

    #[tokio::test]
    async fn test_start_failure_quarantines_transitive_dependents() {
        init_log();
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let graph = ServiceGraph::new();
        graph.register(Recording::definition("db", &log, &[])).unwrap();
        graph
            .register(Recording::definition_failing("pool", &log, &["db"], true))
            .unwrap();
        graph
            .register(Recording::definition("app", &log, &["pool"]))
            .unwrap();

        let report = graph.activate().await.unwrap();
        assert_eq!(graph.state_of("db"), Some(ServiceState::Up));
        assert_eq!(graph.state_of("pool"), Some(ServiceState::StartFailed));
        assert_eq!(
            graph.state_of("app"),
            Some(ServiceState::MissingDependency)
        );
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(
            report.failed[0].1,
            DeployError::StartFailed { .. }
        ));
        assert_eq!(report.missing, vec!["app".to_string()]);
        // the quarantined service's start action never ran
        assert!(!log.lock().unwrap().iter().any(|e| e == "start app"));
    }

    #[tokio::test]
    async fn test_batch_cycle_rejected_atomically() {
        init_log();
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let graph = ServiceGraph::new();
        let batch = ServiceBatch::new();
        batch.add(Recording::definition("a", &log, &["b"]));
        batch.add(Recording::definition("b", &log, &["a"]));

        let err = graph.install_batch(&batch).unwrap_err();
        match err {
            DeployError::CycleDetected(cycle) => {
                assert!(cycle.contains(&"a".to_string()));
                assert!(cycle.contains(&"b".to_string()));
            }
            other => panic!("expected CycleDetected, got {other}"),
        }
        assert!(graph.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        init_log();
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let graph = ServiceGraph::new();
        graph.register(Recording::definition("db", &log, &[])).unwrap();
        let err = graph
            .register(Recording::definition("db", &log, &[]))
            .unwrap_err();
        assert!(matches!(err, DeployError::DuplicateService(name) if name == "db"));
        assert_eq!(graph.len(), 1);
    }

    #[tokio::test]
    async fn test_injector_receives_value_before_start() {
        init_log();
        let graph = ServiceGraph::new();

        struct Db;
        #[async_trait]
        impl ServiceActivator for Db {
            async fn start(&self, _ctx: &StartContext) -> DeployResult<ServiceValue> {
                Ok(ServiceValue::new(42u32))
            }
            async fn stop(&self) {}
        }

        struct Pool {
            db: Arc<InjectedValue<u32>>,
        }
        #[async_trait]
        impl ServiceActivator for Pool {
            async fn start(&self, ctx: &StartContext) -> DeployResult<ServiceValue> {
                let injected = self.db.get().expect("injector ran before start");
                let from_ctx: Arc<u32> = ctx.require("db")?;
                assert_eq!(*injected, *from_ctx);
                Ok(ServiceValue::new(*injected + 1))
            }
            async fn stop(&self) {}
        }

        let slot = Arc::new(InjectedValue::new());
        graph
            .register(ServiceDefinition::new("db", Arc::new(Db)))
            .unwrap();
        graph
            .register(
                ServiceDefinition::new("pool", Arc::new(Pool { db: slot.clone() }))
                    .with_dependency("db")
                    .with_injector(Box::new(ValueInjector::new("db", slot.clone()))),
            )
            .unwrap();

        let report = graph.activate().await.unwrap();
        assert!(report.all_up());
        assert_eq!(*graph.require::<u32>("pool").unwrap(), 43);

        graph.deactivate().await.unwrap();
        assert!(slot.get().is_none(), "uninject runs on stop");
    }

    #[tokio::test]
    async fn test_deactivation_stops_dependents_first() {
        init_log();
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let graph = ServiceGraph::new();
        graph.register(Recording::definition("db", &log, &[])).unwrap();
        graph
            .register(Recording::definition("pool", &log, &["db"]))
            .unwrap();
        graph
            .register(Recording::definition("app", &log, &["pool"]))
            .unwrap();

        graph.activate().await.unwrap();
        graph.deactivate().await.unwrap();

        for name in ["db", "pool", "app"] {
            assert_eq!(graph.state_of(name), Some(ServiceState::Down));
        }
        assert!(position(&log, "stop app") < position(&log, "stop pool"));
        assert!(position(&log, "stop pool") < position(&log, "stop db"));
    }

    #[tokio::test]
    async fn test_partial_start_rolls_back_completely() {
        init_log();
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let graph = ServiceGraph::new();
        graph.register(Recording::definition("db", &log, &[])).unwrap();
        graph
            .register(Recording::definition_failing("pool", &log, &["db"], true))
            .unwrap();

        graph.activate().await.unwrap();
        assert_eq!(graph.state_of("db"), Some(ServiceState::Up));

        graph.deactivate().await.unwrap();
        assert_eq!(graph.state_of("db"), Some(ServiceState::Down));
        assert!(position(&log, "stop db") > position(&log, "start db"));
    }

    #[tokio::test]
    async fn test_retry_after_failure_recovers_dependents() {
        init_log();
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let graph = ServiceGraph::new();
        let flaky = Arc::new(Mutex::new(true));

        struct Flaky {
            fail: Arc<Mutex<bool>>,
        }
        #[async_trait]
        impl ServiceActivator for Flaky {
            async fn start(&self, _ctx: &StartContext) -> DeployResult<ServiceValue> {
                if *self.fail.lock().unwrap() {
                    return Err(DeployError::Invocation("flaky".to_string()));
                }
                Ok(ServiceValue::new(()))
            }
            async fn stop(&self) {}
        }

        graph
            .register(ServiceDefinition::new(
                "pool",
                Arc::new(Flaky {
                    fail: flaky.clone(),
                }),
            ))
            .unwrap();
        graph
            .register(Recording::definition("app", &log, &["pool"]))
            .unwrap();

        graph.activate().await.unwrap();
        assert_eq!(graph.state_of("pool"), Some(ServiceState::StartFailed));
        assert_eq!(
            graph.state_of("app"),
            Some(ServiceState::MissingDependency)
        );

        *flaky.lock().unwrap() = false;
        graph.retry("pool").unwrap();
        let report = graph.activate().await.unwrap();
        assert!(report.all_up());
        assert_eq!(graph.state_of("pool"), Some(ServiceState::Up));
        assert_eq!(graph.state_of("app"), Some(ServiceState::Up));
    }

    #[tokio::test]
    async fn test_remove_services_in_reverse_dependency_order() {
        init_log();
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let graph = ServiceGraph::new();
        graph.register(Recording::definition("db", &log, &[])).unwrap();
        graph
            .register(Recording::definition("pool", &log, &["db"]))
            .unwrap();
        graph.activate().await.unwrap();

        graph
            .remove_services(&["db".to_string(), "pool".to_string()])
            .await
            .unwrap();
        assert!(graph.is_empty());
        assert!(position(&log, "stop pool") < position(&log, "stop db"));
    }
}

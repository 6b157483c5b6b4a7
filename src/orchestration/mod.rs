//! Runtime orchestration
//!
//! [`DeploymentRuntime`] ties the pieces together: it owns the unit
//! registry, the service graph, the handler registry, and the pipeline, and
//! drives deploy/undeploy in the correct order. Collaborators receive these
//! objects by reference; nothing here is ambient global state.

use std::sync::Arc;

use futures::future::join_all;
use log::{error, info, warn};

use crate::{
    component::HandlerRegistry,
    config::{Config, UnitConfig},
    core::error::{DeployError, DeployResult},
    deployment::{
        keys, processors::standard_processors, DeploymentPipeline, DeploymentProcessor,
        DeploymentUnit, DeploymentUnitRegistry, Phase,
    },
    service::{ActivationReport, ServiceGraph},
};

/// The deployment runtime: turns unit configurations into live services.
pub struct DeploymentRuntime {
    units: DeploymentUnitRegistry,
    graph: Arc<ServiceGraph>,
    handlers: Arc<HandlerRegistry>,
    pipeline: DeploymentPipeline,
}

impl DeploymentRuntime {
    /// A runtime with the standard processor set and built-in handlers.
    pub fn new() -> Self {
        Self::with_handlers(Arc::new(HandlerRegistry::with_builtins()))
    }

    pub fn with_handlers(handlers: Arc<HandlerRegistry>) -> Self {
        let graph = Arc::new(ServiceGraph::new());
        let mut pipeline = DeploymentPipeline::new(graph.clone(), handlers.clone());
        for (phase, processor) in standard_processors() {
            pipeline.add_processor(phase, processor);
        }
        Self {
            units: DeploymentUnitRegistry::new(),
            graph,
            handlers,
            pipeline,
        }
    }

    /// Extend the pipeline before anything is deployed.
    pub fn add_processor(&mut self, phase: Phase, processor: Arc<dyn DeploymentProcessor>) {
        self.pipeline.add_processor(phase, processor);
    }

    pub fn graph(&self) -> &Arc<ServiceGraph> {
        &self.graph
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn units(&self) -> &DeploymentUnitRegistry {
        &self.units
    }

    /// Deploy every unit in the manifest. Independent unit trees run
    /// concurrently; one tree failing never aborts its siblings.
    pub async fn deploy_manifest(&self, config: &Config) -> DeployResult<ActivationReport> {
        let results = join_all(
            config
                .units
                .iter()
                .map(|unit| self.deploy_unit(unit.clone())),
        )
        .await;
        let mut first_failure = None;
        for result in results {
            if let Err(err) = result {
                error!("unit deployment failed: {err}");
                first_failure.get_or_insert(err);
            }
        }
        if let Some(err) = first_failure {
            return Err(err);
        }
        self.activate().await
    }

    /// Deploy one unit tree through the pipeline. Call [`Self::activate`]
    /// afterwards (or use [`Self::deploy_manifest`]) to start its services.
    pub async fn deploy_unit(&self, config: UnitConfig) -> DeployResult<()> {
        let name = config.name.clone();
        info!("deploying unit {name}");
        let unit = DeploymentUnit::root(&name);
        unit.attachments().put(&keys::UNIT_DESCRIPTOR, config)?;
        self.units.register(unit.clone())?;

        if let Err(err) = self.pipeline.deploy(unit.clone()).await {
            // leave nothing half-processed behind
            self.pipeline.undeploy(&unit).await;
            self.units.remove(&name);
            return Err(err);
        }
        Ok(())
    }

    /// Activate the service graph and report the outcome.
    pub async fn activate(&self) -> DeployResult<ActivationReport> {
        let report = self.graph.activate().await?;
        if !report.all_up() {
            warn!(
                "activation incomplete: {} failed, {} missing dependencies",
                report.failed.len(),
                report.missing.len()
            );
        }
        Ok(report)
    }

    /// Undeploy one unit: its services stop and are removed in reverse
    /// dependency order, then applied processors revert in reverse order.
    pub async fn undeploy(&self, name: &str) -> DeployResult<()> {
        let unit = self.units.remove(name).ok_or_else(|| {
            DeployError::Configuration(format!("deployment unit is not registered: {name}"))
        })?;
        info!("undeploying unit {name}");
        self.pipeline.undeploy(&unit).await;
        unit.attachments().remove(&keys::UNIT_DESCRIPTOR);
        Ok(())
    }

    /// Undeploy every unit in reverse registration order.
    pub async fn shutdown(&self) {
        for name in self.units.names().into_iter().rev() {
            if let Err(err) = self.undeploy(&name).await {
                warn!("shutdown: {err}");
            }
        }
        if let Err(err) = self.graph.deactivate().await {
            warn!("shutdown: service graph deactivation incomplete: {err}");
        }
    }
}

impl Default for DeploymentRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::processors::component_service_name;
    use crate::service::ServiceState;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn manifest() -> Config {
        Config::from_yaml(
            r#"
---
units:
  - name: shop.app
    components:
      - name: cart
        target: echo
        post_construct: [init]
  - name: billing.app
    components:
      - name: invoices
        target: echo
        "#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_manifest_roundtrip() {
        init_log();
        let runtime = DeploymentRuntime::new();
        let report = runtime.deploy_manifest(&manifest()).await.unwrap();
        assert!(report.all_up(), "unexpected report: {report:?}");
        assert_eq!(runtime.units().len(), 2);
        assert_eq!(
            runtime
                .graph()
                .state_of(&component_service_name("shop.app", "cart")),
            Some(ServiceState::Up)
        );

        runtime.shutdown().await;
        assert!(runtime.units().is_empty());
        assert!(runtime.graph().is_empty());
    }

    #[tokio::test]
    async fn test_failed_unit_is_rolled_back_and_unregistered() {
        init_log();
        let runtime = DeploymentRuntime::new();
        let config = Config::from_yaml(
            r#"
---
units:
  - name: broken.app
    components:
      - name: cart
        target: no-such-handler
        "#,
        )
        .unwrap();

        let err = runtime.deploy_manifest(&config).await.unwrap_err();
        assert!(matches!(err, DeployError::Processing { .. }));
        assert!(runtime.units().is_empty());
        assert!(runtime.graph().is_empty());
    }

    #[tokio::test]
    async fn test_undeploy_unknown_unit_is_an_error() {
        init_log();
        let runtime = DeploymentRuntime::new();
        assert!(matches!(
            runtime.undeploy("ghost.app").await,
            Err(DeployError::Configuration(_))
        ));
    }
}

//! The phase pipeline
//!
//! Phases run strictly in declared order; processors run in declared order
//! within their phase. The first failing processor aborts the rest of the
//! owning unit's pipeline. Undeploy reverts applied processors in exact
//! reverse order, best effort. Subunits run the same phases as their parent
//! and siblings run concurrently once the parent's own pipeline completes.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use log::{debug, error, warn};

use super::{phase::Phase, DeploymentUnit};
use crate::{
    component::HandlerRegistry,
    core::error::{DeployError, DeployResult},
    service::{ServiceBatch, ServiceDefinition, ServiceGraph},
};

/// Everything a processor may touch while deploying one unit in one phase.
pub struct ProcessorContext {
    unit: Arc<DeploymentUnit>,
    phase: Phase,
    batch: Arc<ServiceBatch>,
    graph: Arc<ServiceGraph>,
    handlers: Arc<HandlerRegistry>,
}

impl ProcessorContext {
    pub fn unit(&self) -> &Arc<DeploymentUnit> {
        &self.unit
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Register a service definition. Buffered definitions are installed as
    /// one atomic batch when the current phase ends.
    pub fn register_service(&self, definition: ServiceDefinition) {
        self.batch.add(definition);
    }

    pub fn service_graph(&self) -> &Arc<ServiceGraph> {
        &self.graph
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }
}

/// One unit of work within a phase.
///
/// Processors read and write their unit's attachments and may register
/// services. `deploy` failures abort the unit's remaining pipeline;
/// `undeploy` failures are recorded by the pipeline but never stop the
/// remaining reverts.
#[async_trait]
pub trait DeploymentProcessor: Send + Sync {
    /// Stable processor identity, used in logs and error attribution.
    fn name(&self) -> &str;

    async fn deploy(&self, ctx: &ProcessorContext) -> DeployResult<()>;

    async fn undeploy(&self, _unit: &Arc<DeploymentUnit>) -> DeployResult<()> {
        Ok(())
    }
}

/// Ordered set of named phases, each holding an ordered processor list.
pub struct DeploymentPipeline {
    phases: BTreeMap<Phase, Vec<Arc<dyn DeploymentProcessor>>>,
    graph: Arc<ServiceGraph>,
    handlers: Arc<HandlerRegistry>,
}

impl DeploymentPipeline {
    pub fn new(graph: Arc<ServiceGraph>, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            phases: BTreeMap::new(),
            graph,
            handlers,
        }
    }

    /// Append a processor to a phase. Declaration order is execution order.
    pub fn add_processor(&mut self, phase: Phase, processor: Arc<dyn DeploymentProcessor>) {
        self.phases.entry(phase).or_default().push(processor);
    }

    /// Deploy a unit tree: the unit's own phases first, then all subunits
    /// concurrently. A subunit failure never aborts its siblings; the first
    /// failure is reported after every subunit has been attempted.
    pub async fn deploy(&self, unit: Arc<DeploymentUnit>) -> DeployResult<()> {
        self.deploy_boxed(unit).await
    }

    fn deploy_boxed(&self, unit: Arc<DeploymentUnit>) -> BoxFuture<'_, DeployResult<()>> {
        Box::pin(async move {
            self.run_phases(&unit).await?;

            let children = unit.children();
            if children.is_empty() {
                return Ok(());
            }
            let results = join_all(
                children
                    .into_iter()
                    .map(|child| self.deploy_boxed(child)),
            )
            .await;
            let mut first_failure = None;
            for result in results {
                if let Err(err) = result {
                    error!("subunit deployment failed: {err}");
                    first_failure.get_or_insert(err);
                }
            }
            match first_failure {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }

    async fn run_phases(&self, unit: &Arc<DeploymentUnit>) -> DeployResult<()> {
        let unit_name = unit.qualified_name();
        for phase in Phase::ALL {
            let processors = match self.phases.get(&phase) {
                Some(processors) if !processors.is_empty() => processors,
                _ => continue,
            };
            debug!("unit {unit_name}: entering phase {phase}");

            let batch = Arc::new(ServiceBatch::new());
            let ctx = ProcessorContext {
                unit: unit.clone(),
                phase,
                batch: batch.clone(),
                graph: self.graph.clone(),
                handlers: self.handlers.clone(),
            };

            for processor in processors {
                debug!("unit {unit_name}: running processor {}", processor.name());
                if let Err(cause) = processor.deploy(&ctx).await {
                    error!(
                        "unit {unit_name}: processor {} failed in phase {phase}: {cause}",
                        processor.name()
                    );
                    return Err(DeployError::Processing {
                        processor: processor.name().to_string(),
                        unit: unit_name,
                        cause: Box::new(cause),
                    });
                }
                unit.record_applied(processor.clone());
            }

            // Commit this phase's service registrations as one batch; a
            // rejected batch aborts the pipeline like a processor failure.
            let installed = self.graph.install_batch(&batch)?;
            unit.record_installed_services(&installed);
        }
        Ok(())
    }

    /// Undeploy a unit tree: subunits first (concurrently), then the unit's
    /// own services in reverse dependency order, then applied processors in
    /// reverse order. Best effort throughout; a second undeploy of the same
    /// unit is a no-op.
    pub async fn undeploy(&self, unit: &Arc<DeploymentUnit>) {
        self.undeploy_boxed(unit.clone()).await
    }

    fn undeploy_boxed(&self, unit: Arc<DeploymentUnit>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let unit_name = unit.qualified_name();

            join_all(
                unit.children()
                    .into_iter()
                    .map(|child| self.undeploy_boxed(child)),
            )
            .await;

            let services = unit.take_installed_services();
            if !services.is_empty() {
                if let Err(err) = self.graph.remove_services(&services).await {
                    warn!("unit {unit_name}: service removal incomplete: {err}");
                }
            }

            for processor in unit.take_applied().into_iter().rev() {
                debug!(
                    "unit {unit_name}: reverting processor {}",
                    processor.name()
                );
                if let Err(err) = processor.undeploy(&unit).await {
                    warn!(
                        "unit {unit_name}: revert of {} failed: {err}",
                        processor.name()
                    );
                }
            }

            unit.clear_children();
        })
    }
}

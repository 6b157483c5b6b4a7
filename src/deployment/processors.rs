//! Built-in deployment processors
//!
//! The standard processor set turns a unit's descriptor into subunits,
//! component configurations, derived service dependencies, built interceptor
//! chains, and finally one registered service per component.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info};

use super::{keys, DeploymentProcessor, DeploymentUnit, ProcessorContext};
use crate::{
    component::{
        build_lifecycle_chains, build_method_chains, ComponentChains, ComponentRuntime,
        LifecycleChains,
    },
    config::InstantiationPolicy,
    core::error::{DeployError, DeployResult},
    service::{
        ServiceActivator, ServiceDefinition, ServiceName, ServiceValue, StartContext,
    },
};

/// A service dependency derived for one component.
#[derive(Clone, Debug)]
pub struct ServiceDependency {
    pub component: String,
    pub service: ServiceName,
}

/// STRUCTURE: materialize subunits declared in the unit's descriptor.
pub struct StructureProcessor;

#[async_trait]
impl DeploymentProcessor for StructureProcessor {
    fn name(&self) -> &str {
        "structure"
    }

    async fn deploy(&self, ctx: &ProcessorContext) -> DeployResult<()> {
        let unit = ctx.unit();
        let Some(descriptor) = unit.attachments().get(&keys::UNIT_DESCRIPTOR) else {
            return Ok(());
        };
        for subunit in &descriptor.subunits {
            debug!(
                "unit {}: materializing subunit {}",
                unit.name(),
                subunit.name
            );
            let child = unit.create_child(&subunit.name);
            child
                .attachments()
                .put(&keys::UNIT_DESCRIPTOR, subunit.clone())?;
            child.attachments().put(&keys::SUB_UNIT, true)?;
        }
        Ok(())
    }

    // Subunits are reverted and dropped by the pipeline itself.
}

/// PARSE: turn the raw descriptor into component-config attachments and
/// the provider marker.
pub struct DescriptorProcessor;

#[async_trait]
impl DeploymentProcessor for DescriptorProcessor {
    fn name(&self) -> &str {
        "descriptor"
    }

    async fn deploy(&self, ctx: &ProcessorContext) -> DeployResult<()> {
        let unit = ctx.unit();
        let Some(descriptor) = unit.attachments().get(&keys::UNIT_DESCRIPTOR) else {
            return Ok(());
        };
        for component in &descriptor.components {
            unit.attachments()
                .append(&keys::COMPONENT_CONFIGS, component.clone());
        }
        if let Some(provider) = &descriptor.provider {
            unit.set_marker(&keys::PROVIDER, provider.clone())?;
        }
        Ok(())
    }

    async fn undeploy(&self, unit: &Arc<DeploymentUnit>) -> DeployResult<()> {
        unit.attachments().remove_list(&keys::COMPONENT_CONFIGS);
        // the marker lives on the root; the root's own revert clears it
        if unit.parent().is_none() {
            unit.attachments().remove(&keys::PROVIDER);
        }
        Ok(())
    }
}

/// DEPENDENCIES: derive the service dependencies of every component.
pub struct DependenciesProcessor;

#[async_trait]
impl DeploymentProcessor for DependenciesProcessor {
    fn name(&self) -> &str {
        "dependencies"
    }

    async fn deploy(&self, ctx: &ProcessorContext) -> DeployResult<()> {
        let unit = ctx.unit();
        let provider = unit.get_marker(&keys::PROVIDER);
        for component in unit.attachments().get_list(&keys::COMPONENT_CONFIGS) {
            for dependency in &component.dependencies {
                unit.attachments().append(
                    &keys::SERVICE_DEPENDENCIES,
                    ServiceDependency {
                        component: component.name.clone(),
                        service: dependency.clone(),
                    },
                );
            }
            if let Some(provider) = &provider {
                unit.attachments().append(
                    &keys::SERVICE_DEPENDENCIES,
                    ServiceDependency {
                        component: component.name.clone(),
                        service: format!("provider.{provider}"),
                    },
                );
            }
        }
        Ok(())
    }

    async fn undeploy(&self, unit: &Arc<DeploymentUnit>) -> DeployResult<()> {
        unit.attachments().remove_list(&keys::SERVICE_DEPENDENCIES);
        Ok(())
    }
}

/// CONFIGURE: build the per-method interceptor chains of every component.
/// A binding failure aborts the unit's deploy; there is no partial chain.
pub struct InterceptorInstallProcessor;

#[async_trait]
impl DeploymentProcessor for InterceptorInstallProcessor {
    fn name(&self) -> &str {
        "interceptor-install"
    }

    async fn deploy(&self, ctx: &ProcessorContext) -> DeployResult<()> {
        let unit = ctx.unit();
        for component in unit.attachments().get_list(&keys::COMPONENT_CONFIGS) {
            let chains = build_method_chains(&component, ctx.handlers())?;
            unit.attachments().append(&keys::METHOD_CHAINS, chains);
        }
        Ok(())
    }

    async fn undeploy(&self, unit: &Arc<DeploymentUnit>) -> DeployResult<()> {
        unit.attachments().remove_list(&keys::METHOD_CHAINS);
        Ok(())
    }
}

/// CONFIGURE: resolve the lifecycle chains of every component.
pub struct LifecycleInstallProcessor;

#[async_trait]
impl DeploymentProcessor for LifecycleInstallProcessor {
    fn name(&self) -> &str {
        "lifecycle-install"
    }

    async fn deploy(&self, ctx: &ProcessorContext) -> DeployResult<()> {
        let unit = ctx.unit();
        for component in unit.attachments().get_list(&keys::COMPONENT_CONFIGS) {
            let chains = build_lifecycle_chains(&component, ctx.handlers())?;
            unit.attachments().append(&keys::LIFECYCLE_CHAINS, chains);
        }
        Ok(())
    }

    async fn undeploy(&self, unit: &Arc<DeploymentUnit>) -> DeployResult<()> {
        unit.attachments().remove_list(&keys::LIFECYCLE_CHAINS);
        Ok(())
    }
}

/// INSTALL: register one service per component. The service's start action
/// instantiates and starts a [`ComponentRuntime`]; its stop action stops it.
pub struct ComponentInstallProcessor;

#[async_trait]
impl DeploymentProcessor for ComponentInstallProcessor {
    fn name(&self) -> &str {
        "component-install"
    }

    async fn deploy(&self, ctx: &ProcessorContext) -> DeployResult<()> {
        let unit = ctx.unit();
        let configs = unit.attachments().get_list(&keys::COMPONENT_CONFIGS);
        if configs.is_empty() {
            return Ok(());
        }
        let method_chains = unit.attachments().get_list(&keys::METHOD_CHAINS);
        let lifecycle_chains = unit.attachments().get_list(&keys::LIFECYCLE_CHAINS);
        let dependencies = unit.attachments().get_list(&keys::SERVICE_DEPENDENCIES);

        for config in configs {
            let chains = method_chains
                .iter()
                .find(|chains| chains.component() == config.name)
                .cloned()
                .ok_or_else(|| {
                    DeployError::Internal(format!(
                        "no interceptor chains built for component {}",
                        config.name
                    ))
                })?;
            let lifecycle = lifecycle_chains
                .iter()
                .find(|chains| chains.component() == config.name)
                .cloned()
                .ok_or_else(|| {
                    DeployError::Internal(format!(
                        "no lifecycle chains built for component {}",
                        config.name
                    ))
                })?;

            let service_name = component_service_name(&unit.qualified_name(), &config.name);
            let mut definition = ServiceDefinition::new(
                service_name.clone(),
                Arc::new(ComponentActivator {
                    component: config.name.clone(),
                    policy: config.instantiation,
                    pool_size: config.pool_size,
                    chains,
                    lifecycle,
                    runtime: Mutex::new(None),
                }),
            );
            for dependency in dependencies
                .iter()
                .filter(|dependency| dependency.component == config.name)
            {
                definition = definition.with_dependency(dependency.service.clone());
            }
            debug!("unit {}: installing {service_name}", unit.name());
            ctx.register_service(definition);
        }
        Ok(())
    }

    // Installed services are removed by the pipeline in reverse dependency
    // order before processors revert.
}

/// The service name of a component, scoped by its unit.
pub fn component_service_name(unit: &str, component: &str) -> ServiceName {
    format!("component.{unit}.{component}")
}

/// Start/stop action of a component service. Every start builds a fresh
/// [`ComponentRuntime`], so a retried service gets a new one-shot runtime.
struct ComponentActivator {
    component: String,
    policy: InstantiationPolicy,
    pool_size: usize,
    chains: Arc<ComponentChains>,
    lifecycle: Arc<LifecycleChains>,
    runtime: Mutex<Option<Arc<ComponentRuntime>>>,
}

#[async_trait]
impl ServiceActivator for ComponentActivator {
    async fn start(&self, _ctx: &StartContext) -> DeployResult<ServiceValue> {
        let runtime = Arc::new(ComponentRuntime::new(
            self.component.clone(),
            self.policy,
            self.pool_size,
            self.chains.clone(),
            self.lifecycle.clone(),
        ));
        runtime.start().await?;
        info!("component {} is available", self.component);
        *self.runtime.lock().expect("component runtime lock") = Some(runtime.clone());
        Ok(ServiceValue::from_arc(runtime))
    }

    async fn stop(&self) {
        let runtime = self
            .runtime
            .lock()
            .expect("component runtime lock")
            .take();
        if let Some(runtime) = runtime {
            runtime.stop().await;
            info!("component {} is no longer available", self.component);
        }
    }
}

/// The standard processor set, in phase order.
pub fn standard_processors() -> Vec<(super::Phase, Arc<dyn DeploymentProcessor>)> {
    use super::Phase;
    vec![
        (
            Phase::Structure,
            Arc::new(StructureProcessor) as Arc<dyn DeploymentProcessor>,
        ),
        (Phase::Parse, Arc::new(DescriptorProcessor)),
        (Phase::Dependencies, Arc::new(DependenciesProcessor)),
        (Phase::Configure, Arc::new(InterceptorInstallProcessor)),
        (Phase::Configure, Arc::new(LifecycleInstallProcessor)),
        (Phase::Install, Arc::new(ComponentInstallProcessor)),
    ]
}

//! Deployment units and their registry
//!
//! A deployment unit is one node in a tree of artifacts being processed: a
//! top-level bundle and the subunits nested inside it. Every unit owns an
//! [`AttachmentStore`]; cross-cutting markers are the one documented
//! exception to per-unit storage and always resolve against the root-most
//! ancestor.

pub mod keys;
pub mod phase;
pub mod pipeline;
pub mod processors;

use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use log::debug;

use crate::{
    core::attachment::{AttachmentKey, AttachmentStore},
    core::error::{DeployError, DeployResult},
    service::ServiceName,
};

pub use phase::Phase;
pub use pipeline::{DeploymentPipeline, DeploymentProcessor, ProcessorContext};

/// One node in the deployment tree.
pub struct DeploymentUnit {
    name: String,
    parent: Weak<DeploymentUnit>,
    children: Mutex<Vec<Arc<DeploymentUnit>>>,
    attachments: AttachmentStore,
    /// Processors that successfully applied, in order, for reverse revert.
    applied: Mutex<Vec<Arc<dyn DeploymentProcessor>>>,
    /// Services installed on behalf of this unit, for reverse removal.
    installed_services: Mutex<Vec<ServiceName>>,
}

impl DeploymentUnit {
    /// Create a top-level unit.
    pub fn root(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            parent: Weak::new(),
            children: Mutex::new(Vec::new()),
            attachments: AttachmentStore::new(),
            applied: Mutex::new(Vec::new()),
            installed_services: Mutex::new(Vec::new()),
        })
    }

    /// Create a subunit nested under `self`.
    pub fn create_child(self: &Arc<Self>, name: impl Into<String>) -> Arc<Self> {
        let child = Arc::new(Self {
            name: name.into(),
            parent: Arc::downgrade(self),
            children: Mutex::new(Vec::new()),
            attachments: AttachmentStore::new(),
            applied: Mutex::new(Vec::new()),
            installed_services: Mutex::new(Vec::new()),
        });
        self.children
            .lock()
            .expect("children lock")
            .push(child.clone());
        child
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scoped name including every ancestor, e.g. `shop.app/catalog.war`.
    pub fn qualified_name(self: &Arc<Self>) -> String {
        match self.parent() {
            Some(parent) => format!("{}/{}", parent.qualified_name(), self.name),
            None => self.name.clone(),
        }
    }

    pub fn parent(&self) -> Option<Arc<DeploymentUnit>> {
        self.parent.upgrade()
    }

    pub fn children(&self) -> Vec<Arc<DeploymentUnit>> {
        self.children.lock().expect("children lock").clone()
    }

    /// The root-most ancestor. The tree has no cycles, so this terminates.
    pub fn root_unit(self: &Arc<Self>) -> Arc<DeploymentUnit> {
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    pub fn attachments(&self) -> &AttachmentStore {
        &self.attachments
    }

    /// Store a cross-unit marker. Markers always live on the root unit so
    /// they are visible to every unit of the tree.
    pub fn set_marker<T: Send + Sync + 'static>(
        self: &Arc<Self>,
        key: &AttachmentKey<T>,
        value: T,
    ) -> DeployResult<()> {
        self.root_unit().attachments.put(key, value)?;
        Ok(())
    }

    /// Read a cross-unit marker from the root unit.
    pub fn get_marker<T: Send + Sync + 'static>(
        self: &Arc<Self>,
        key: &AttachmentKey<T>,
    ) -> Option<Arc<T>> {
        self.root_unit().attachments.get(key)
    }

    pub(crate) fn record_applied(&self, processor: Arc<dyn DeploymentProcessor>) {
        self.applied.lock().expect("applied lock").push(processor);
    }

    /// Drain the applied-processor history; a second drain yields nothing,
    /// which makes repeated undeploys no-ops.
    pub(crate) fn take_applied(&self) -> Vec<Arc<dyn DeploymentProcessor>> {
        std::mem::take(&mut *self.applied.lock().expect("applied lock"))
    }

    pub(crate) fn record_installed_services(&self, names: &[ServiceName]) {
        self.installed_services
            .lock()
            .expect("services lock")
            .extend_from_slice(names);
    }

    pub(crate) fn take_installed_services(&self) -> Vec<ServiceName> {
        std::mem::take(&mut *self.installed_services.lock().expect("services lock"))
    }

    pub fn installed_services(&self) -> Vec<ServiceName> {
        self.installed_services
            .lock()
            .expect("services lock")
            .clone()
    }

    pub(crate) fn clear_children(&self) {
        self.children.lock().expect("children lock").clear();
    }
}

/// Registry of deployed top-level units.
///
/// Owned by the runtime and passed by reference to collaborators; there is
/// no process-wide ambient registry.
#[derive(Default)]
pub struct DeploymentUnitRegistry {
    units: DashMap<String, Arc<DeploymentUnit>>,
    order: Mutex<Vec<String>>,
}

impl DeploymentUnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, unit: Arc<DeploymentUnit>) -> DeployResult<()> {
        let name = unit.name().to_string();
        if self.units.contains_key(&name) {
            return Err(DeployError::Configuration(format!(
                "deployment unit is already registered: {name}"
            )));
        }
        debug!("registering deployment unit {name}");
        self.units.insert(name.clone(), unit);
        self.order.lock().expect("order lock").push(name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<DeploymentUnit>> {
        self.units.get(name).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<DeploymentUnit>> {
        self.order.lock().expect("order lock").retain(|n| n != name);
        self.units.remove(name).map(|(_, unit)| unit)
    }

    /// Unit names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.order.lock().expect("order lock").clone()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static PROVIDER: AttachmentKey<String> = AttachmentKey::new("test.provider");

    #[test]
    fn test_tree_walk_terminates_at_root() {
        let root = DeploymentUnit::root("shop.app");
        let war = root.create_child("catalog.war");
        let jar = war.create_child("model.jar");

        assert_eq!(jar.qualified_name(), "shop.app/catalog.war/model.jar");
        assert_eq!(jar.root_unit().name(), "shop.app");
        assert_eq!(root.root_unit().name(), "shop.app");
        assert_eq!(war.children().len(), 1);
    }

    #[test]
    fn test_markers_resolve_against_the_root() {
        let root = DeploymentUnit::root("shop.app");
        let war = root.create_child("catalog.war");
        let jar = war.create_child("model.jar");

        // marked from a leaf, visible everywhere in the tree
        jar.set_marker(&PROVIDER, "hibernate".to_string()).unwrap();
        assert_eq!(*root.get_marker(&PROVIDER).unwrap(), "hibernate");
        assert_eq!(*war.get_marker(&PROVIDER).unwrap(), "hibernate");
        // and stored on the root, not the leaf
        assert!(jar.attachments().get(&PROVIDER).is_none());
        assert!(root.attachments().get(&PROVIDER).is_some());
    }

    #[test]
    fn test_registry_rejects_duplicate_units() {
        let registry = DeploymentUnitRegistry::new();
        registry.register(DeploymentUnit::root("shop.app")).unwrap();
        let err = registry
            .register(DeploymentUnit::root("shop.app"))
            .unwrap_err();
        assert!(matches!(err, DeployError::Configuration(_)));
        assert_eq!(registry.names(), vec!["shop.app".to_string()]);
        registry.remove("shop.app");
        assert!(registry.is_empty());
    }
}

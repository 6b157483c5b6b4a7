//! Well-known attachment keys
//!
//! Keys are grouped by the phase that writes them. Slot identity is the key
//! name; keep names unique across the crate.

use crate::{
    component::{ComponentChains, LifecycleChains},
    config::UnitConfig,
    core::attachment::{AttachmentKey, AttachmentListKey},
};

use super::processors::ServiceDependency;

pub use crate::config::ComponentConfig;

//
// CREATION
//

/// The unit's raw descriptor, attached when the unit is created.
pub static UNIT_DESCRIPTOR: AttachmentKey<UnitConfig> = AttachmentKey::once("unit.descriptor");

//
// STRUCTURE
//

/// Marks a unit materialized as a subunit of its parent.
pub static SUB_UNIT: AttachmentKey<bool> = AttachmentKey::new("unit.subunit");

//
// PARSE
//

/// External provider marker. Always stored on the root unit so it is
/// visible to every unit of the tree.
pub static PROVIDER: AttachmentKey<String> = AttachmentKey::new("unit.provider");

/// Component configurations discovered in the unit's descriptor.
pub static COMPONENT_CONFIGS: AttachmentListKey<ComponentConfig> =
    AttachmentListKey::new("component.configs");

//
// DEPENDENCIES
//

/// Service dependencies derived for each component.
pub static SERVICE_DEPENDENCIES: AttachmentListKey<ServiceDependency> =
    AttachmentListKey::new("component.service-dependencies");

//
// CONFIGURE
//

/// Per-method interceptor chains, one entry per component.
pub static METHOD_CHAINS: AttachmentListKey<ComponentChains> =
    AttachmentListKey::new("component.method-chains");

/// Lifecycle chains, one entry per component.
pub static LIFECYCLE_CHAINS: AttachmentListKey<LifecycleChains> =
    AttachmentListKey::new("component.lifecycle-chains");

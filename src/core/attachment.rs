//! Typed attachment storage for deployment units
//!
//! Every deployment unit carries an [`AttachmentStore`]: a heterogeneous map
//! from declared attachment keys to values of the key's type. Processors use
//! it to hand state from one pipeline phase to the next without depending on
//! each other directly.

use std::{any::Any, marker::PhantomData, sync::Arc};

use dashmap::DashMap;

use super::error::{DeployError, DeployResult};

/// Strongly typed identifier for one single-value slot of metadata.
///
/// Keys are declared once (usually as `pub static` items next to the code
/// that owns the slot) and are immutable after declaration. Slot identity is
/// the key name, so names must be globally unique.
pub struct AttachmentKey<T> {
    name: &'static str,
    write_once: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> AttachmentKey<T> {
    /// Declare a single-value key. Repeated `put` calls overwrite.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            write_once: false,
            _marker: PhantomData,
        }
    }

    /// Declare a write-once key. A second `put` fails with
    /// [`DeployError::DuplicateAttachment`].
    pub const fn once(name: &'static str) -> Self {
        Self {
            name,
            write_once: true,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Strongly typed identifier for an ordered, append-only sequence of values.
pub struct AttachmentListKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> AttachmentListKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

enum Entry {
    Single(Arc<dyn Any + Send + Sync>),
    List(Vec<Arc<dyn Any + Send + Sync>>),
}

/// Heterogeneous key/value store owned by one deployment unit.
///
/// A unit's store has a single mutator at a time while its pipeline runs;
/// reads from other threads are safe at any point after the writing phase
/// completes. Stores of different units may be used concurrently without
/// restriction.
#[derive(Default)]
pub struct AttachmentStore {
    entries: DashMap<&'static str, Entry>,
}

impl AttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value under a single-value key.
    ///
    /// Returns the previous value for plain keys. Fails with
    /// `DuplicateAttachment` when a write-once key is already set.
    pub fn put<T: Send + Sync + 'static>(
        &self,
        key: &AttachmentKey<T>,
        value: T,
    ) -> DeployResult<Option<Arc<T>>> {
        if key.write_once && self.entries.contains_key(key.name) {
            return Err(DeployError::DuplicateAttachment(key.name.to_string()));
        }
        let previous = self
            .entries
            .insert(key.name, Entry::Single(Arc::new(value)));
        Ok(previous.and_then(|entry| match entry {
            Entry::Single(value) => value.downcast::<T>().ok(),
            Entry::List(_) => None,
        }))
    }

    /// Read a single-value key. Absent keys and type mismatches yield `None`.
    pub fn get<T: Send + Sync + 'static>(&self, key: &AttachmentKey<T>) -> Option<Arc<T>> {
        self.entries.get(key.name).and_then(|entry| match &*entry {
            Entry::Single(value) => value.clone().downcast::<T>().ok(),
            Entry::List(_) => None,
        })
    }

    /// Append a value to a list key, preserving insertion order.
    pub fn append<T: Send + Sync + 'static>(&self, key: &AttachmentListKey<T>, value: T) {
        let mut entry = self
            .entries
            .entry(key.name)
            .or_insert_with(|| Entry::List(Vec::new()));
        if let Entry::List(values) = entry.value_mut() {
            values.push(Arc::new(value));
        }
    }

    /// Read the full sequence stored under a list key, in insertion order.
    pub fn get_list<T: Send + Sync + 'static>(&self, key: &AttachmentListKey<T>) -> Vec<Arc<T>> {
        self.entries
            .get(key.name)
            .map(|entry| match &*entry {
                Entry::List(values) => values
                    .iter()
                    .filter_map(|value| value.clone().downcast::<T>().ok())
                    .collect(),
                Entry::Single(_) => Vec::new(),
            })
            .unwrap_or_default()
    }

    /// Remove a single-value entry, returning it if present.
    pub fn remove<T: Send + Sync + 'static>(&self, key: &AttachmentKey<T>) -> Option<Arc<T>> {
        self.entries
            .remove(key.name)
            .and_then(|(_, entry)| match entry {
                Entry::Single(value) => value.downcast::<T>().ok(),
                Entry::List(_) => None,
            })
    }

    /// Remove a list entry, returning its values in insertion order.
    pub fn remove_list<T: Send + Sync + 'static>(&self, key: &AttachmentListKey<T>) -> Vec<Arc<T>> {
        self.entries
            .remove(key.name)
            .map(|(_, entry)| match entry {
                Entry::List(values) => values
                    .into_iter()
                    .filter_map(|value| value.downcast::<T>().ok())
                    .collect(),
                Entry::Single(_) => Vec::new(),
            })
            .unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

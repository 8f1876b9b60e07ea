//! Versioned state store
//!
//! Holds the current value of every name together with a monotonic version
//! counter. Versions are what the scheduler compares to decide staleness, so
//! they must be reproduced exactly when a workflow is restored.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Version counter of a single name. `0` means "never written".
pub type Version = u64;

/// A value together with the version it was written at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: Value,
    pub version: Version,
}

impl VersionedValue {
    pub fn new(value: Value, version: Version) -> Self {
        Self { value, version }
    }
}

/// Name → version mapping consumed by a node
pub type InputVersions = BTreeMap<String, Version>;

/// Current values by name, each with its version
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    values: BTreeMap<String, VersionedValue>,
}

impl StateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from persisted versioned values
    pub fn from_versioned(values: HashMap<String, VersionedValue>) -> Self {
        Self {
            values: values.into_iter().collect(),
        }
    }

    /// Latest committed value of `name`
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name).map(|v| &v.value)
    }

    /// Whether `name` currently has a value
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Whether every name in `names` has a value
    pub fn contains_all<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> bool {
        names.into_iter().all(|n| self.values.contains_key(n))
    }

    /// Overwrite `name`, returning its new version (previous + 1)
    pub fn set(&mut self, name: impl Into<String>, value: Value) -> Version {
        let name = name.into();
        let version = self.version_of(&name) + 1;
        self.values.insert(name, VersionedValue::new(value, version));
        version
    }

    /// Write a caller-supplied value.
    ///
    /// The version only moves when the value actually changes, so supplying
    /// the same inputs again does not make anything stale.
    pub fn set_input(&mut self, name: impl Into<String>, value: Value) -> Option<Version> {
        let name = name.into();
        match self.values.get(&name) {
            Some(existing) if existing.value == value => None,
            _ => Some(self.set(name, value)),
        }
    }

    /// Put back a value at an exact version (used when restoring a workflow)
    pub fn restore(&mut self, name: impl Into<String>, value: Value, version: Version) {
        self.values
            .insert(name.into(), VersionedValue::new(value, version));
    }

    /// Current version of `name`, `0` if absent
    pub fn version_of(&self, name: &str) -> Version {
        self.values.get(name).map(|v| v.version).unwrap_or(0)
    }

    /// Current versions of every present name in `names`
    pub fn versions_of<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> InputVersions {
        names
            .into_iter()
            .filter_map(|n| self.values.get(n).map(|v| (n.clone(), v.version)))
            .collect()
    }

    /// Values for `names` that are present
    pub fn values_of<'a>(
        &self,
        names: impl IntoIterator<Item = &'a String>,
    ) -> BTreeMap<String, Value> {
        names
            .into_iter()
            .filter_map(|n| self.values.get(n).map(|v| (n.clone(), v.value.clone())))
            .collect()
    }

    /// All names currently held
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    /// Plain values, without versions
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }

    /// Values with versions
    pub fn versioned(&self) -> &BTreeMap<String, VersionedValue> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

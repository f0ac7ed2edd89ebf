//! Layer-name to device placement maps

use std::collections::btree_map;
use std::collections::BTreeMap;

use serde::Serialize;

use crate::device::DeviceId;
use crate::error::Result;

/// Placement directive handed to the model loader: component name -> device
///
/// The empty key `""` addresses the root module, so `{"": cuda:0}` places the
/// whole model on device 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DeviceMapping {
    entries: BTreeMap<String, DeviceId>,
}

impl DeviceMapping {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Everything on device 0
    pub fn single_device() -> Self {
        let mut mapping = Self::new();
        mapping.insert(String::new(), DeviceId::PRIMARY);
        mapping
    }

    pub(crate) fn insert(&mut self, key: String, device: DeviceId) -> Option<DeviceId> {
        self.entries.insert(key, device)
    }

    pub fn get(&self, key: &str) -> Option<DeviceId> {
        self.entries.get(key).copied()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, DeviceId> {
        self.entries.iter()
    }

    /// Number of entries placed on `device`
    pub fn count_on(&self, device: DeviceId) -> usize {
        self.entries.values().filter(|&&d| d == device).count()
    }

    /// Rewrite every key as `{prefix}.{key}` and anchor the root on device 0
    ///
    /// Adapter wrappers nest the base model's module tree under `prefix`; the
    /// adapter's own parameters live at the root and always go to device 0.
    pub fn to_adapter_mapping(&self, prefix: &str) -> DeviceMapping {
        let mut adapter = Self::single_device();
        for (key, &device) in &self.entries {
            adapter.insert(format!("{}.{}", prefix, key), device);
        }
        adapter
    }

    /// Pretty JSON in the shape model loaders accept
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl<'a> IntoIterator for &'a DeviceMapping {
    type Item = (&'a String, &'a DeviceId);
    type IntoIter = btree_map::Iter<'a, String, DeviceId>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

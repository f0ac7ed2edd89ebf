//! Allocator configuration and the per-model topology store

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::topology::{ModelTopology, Topology, TopologyRecord};

/// Default location of the topology store
pub const DEFAULT_TOPOLOGY_PATH: &str = "./config/device_map_config.json";

/// Prefix under which PEFT-style adapters nest the base model
pub const DEFAULT_ADAPTER_PREFIX: &str = "base_model.model";

/// Allocator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Path to the JSON topology store
    pub topology_path: PathBuf,
    /// Name prefix applied to mappings handed to the adapter loader
    pub adapter_prefix: String,
    /// Split layers by free device memory; when false everything goes to device 0
    pub device_aware: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            topology_path: PathBuf::from(DEFAULT_TOPOLOGY_PATH),
            adapter_prefix: DEFAULT_ADAPTER_PREFIX.to_string(),
            device_aware: true,
        }
    }
}

impl AllocatorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("LAYERMAP_TOPOLOGY_PATH") {
            config.topology_path = PathBuf::from(path);
        }
        if let Ok(prefix) = std::env::var("LAYERMAP_ADAPTER_PREFIX") {
            config.adapter_prefix = prefix;
        }
        if let Ok(flag) = std::env::var("LAYERMAP_DEVICE_AWARE") {
            if let Some(enabled) = parse_flag("LAYERMAP_DEVICE_AWARE", &flag) {
                config.device_aware = enabled;
            }
        }

        config
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
        })?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// `true` or `false`; anything else is logged and ignored
fn parse_flag(var: &str, value: &str) -> Option<bool> {
    match value.trim().parse() {
        Ok(enabled) => Some(enabled),
        Err(_) => {
            tracing::warn!(var, value, "ignoring non-boolean value, expected true or false");
            None
        }
    }
}

/// Read-only topology store keyed by model identifier
///
/// Every configured entry is validated when the store is loaded, so a
/// malformed topology fails before any device is queried. Entries are handed
/// out as shared `Arc`s and need no locking.
#[derive(Debug, Clone, Default)]
pub struct TopologyRegistry {
    entries: HashMap<String, Option<Arc<ModelTopology>>>,
}

impl TopologyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON object of `model id -> record | null`
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let registry = Self::from_json_str(&content)?;
        tracing::debug!(
            path = %path.display(),
            models = registry.entries.len(),
            "loaded topology store"
        );
        Ok(registry)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let records: BTreeMap<String, Option<TopologyRecord>> = serde_json::from_str(content)?;

        let mut registry = Self::new();
        for (model_id, record) in records {
            match record {
                Some(record) => {
                    let topology = ModelTopology::from_record(model_id.as_str(), record)?;
                    registry.insert(topology);
                }
                None => registry.insert_unconfigured(model_id),
            }
        }
        Ok(registry)
    }

    /// Register a validated topology
    pub fn insert(&mut self, topology: ModelTopology) {
        self.entries
            .insert(topology.model_id().to_string(), Some(Arc::new(topology)));
    }

    /// Register a model that should always be placed on device 0
    pub fn insert_unconfigured(&mut self, model_id: impl Into<String>) {
        self.entries.insert(model_id.into(), None);
    }

    /// Look up a model; unknown and unconfigured models are both [`Topology::Absent`]
    pub fn lookup(&self, model_id: &str) -> Topology {
        match self.entries.get(model_id) {
            Some(Some(topology)) => Topology::Configured(Arc::clone(topology)),
            _ => Topology::Absent,
        }
    }

    /// Known model identifiers, sorted
    pub fn models(&self) -> Vec<&str> {
        let mut models: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        models.sort_unstable();
        models
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

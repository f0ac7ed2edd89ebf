//! Static per-model layer topology

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::error::{LayerMapError, Result};

/// Topology entry as stored in the configuration source
///
/// Counts are signed so that negative values can be rejected with a
/// configuration error instead of a parse failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyRecord {
    /// Container module holding the repeating blocks (e.g. `transformer`)
    pub top_layer: String,
    /// Name of each repeating block (e.g. `layers`)
    pub layer_name: String,
    /// Repeating blocks in the full model
    pub total_layers: i64,
    /// Repeating blocks placed by the allocator
    pub layers: i64,
    /// Pinned non-repeating components, component name -> device label
    #[serde(default)]
    pub device_map: BTreeMap<String, String>,
}

/// Validated, immutable layer topology of one model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelTopology {
    model_id: String,
    top_layer: String,
    layer_name: String,
    total_layers: usize,
    layers: usize,
    fixed_placements: BTreeMap<String, DeviceId>,
}

impl ModelTopology {
    /// Create a topology with no fixed placements
    pub fn new(
        model_id: impl Into<String>,
        top_layer: impl Into<String>,
        layer_name: impl Into<String>,
        total_layers: usize,
        layers: usize,
    ) -> Result<Self> {
        let topology = Self {
            model_id: model_id.into(),
            top_layer: top_layer.into(),
            layer_name: layer_name.into(),
            total_layers,
            layers,
            fixed_placements: BTreeMap::new(),
        };
        topology.validate()?;
        Ok(topology)
    }

    /// Pin a non-repeating component to a device
    pub fn with_fixed_placement(mut self, component: impl Into<String>, device: DeviceId) -> Result<Self> {
        let component = component.into();
        if self.fixed_placements.contains_key(&component) {
            return Err(LayerMapError::config(
                &self.model_id,
                format!("duplicate fixed placement '{}'", component),
            ));
        }
        self.fixed_placements.insert(component, device);
        self.validate()?;
        Ok(self)
    }

    /// Validate a configuration record
    pub fn from_record(model_id: impl Into<String>, record: TopologyRecord) -> Result<Self> {
        let model_id = model_id.into();

        let total_layers = non_negative(&model_id, "total_layers", record.total_layers)?;
        let layers = non_negative(&model_id, "layers", record.layers)?;

        let mut fixed_placements = BTreeMap::new();
        for (component, label) in record.device_map {
            let device: DeviceId = label.parse().map_err(|_| {
                LayerMapError::config(
                    &model_id,
                    format!("fixed placement '{}' has invalid device label '{}'", component, label),
                )
            })?;
            fixed_placements.insert(component, device);
        }

        let topology = Self {
            model_id,
            top_layer: record.top_layer,
            layer_name: record.layer_name,
            total_layers,
            layers,
            fixed_placements,
        };
        topology.validate()?;
        Ok(topology)
    }

    /// Check structural invariants
    pub fn validate(&self) -> Result<()> {
        if self.top_layer.is_empty() {
            return Err(LayerMapError::config(&self.model_id, "top_layer must not be empty"));
        }
        if self.layer_name.is_empty() {
            return Err(LayerMapError::config(&self.model_id, "layer_name must not be empty"));
        }
        if i64::try_from(self.total_layers).is_err() {
            return Err(LayerMapError::config(
                &self.model_id,
                format!("total_layers ({}) is out of range", self.total_layers),
            ));
        }
        if self.layers > self.total_layers {
            return Err(LayerMapError::config(
                &self.model_id,
                format!(
                    "layers ({}) exceeds total_layers ({})",
                    self.layers, self.total_layers
                ),
            ));
        }
        if let Some(component) = self
            .fixed_placements
            .keys()
            .find(|name| self.generated_index(name).is_some())
        {
            return Err(LayerMapError::config(
                &self.model_id,
                format!("fixed placement '{}' collides with a generated layer key", component),
            ));
        }
        Ok(())
    }

    /// Fully-qualified name of repeating layer `index`
    pub fn layer_key(&self, index: usize) -> String {
        format!("{}.{}.{}", self.top_layer, self.layer_name, index)
    }

    /// Index of a generated layer key, if `name` is one
    fn generated_index(&self, name: &str) -> Option<usize> {
        let suffix = name
            .strip_prefix(self.top_layer.as_str())?
            .strip_prefix('.')?
            .strip_prefix(self.layer_name.as_str())?
            .strip_prefix('.')?;
        let index: usize = suffix.parse().ok()?;
        (index < self.layers && index.to_string() == suffix).then_some(index)
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn top_layer(&self) -> &str {
        &self.top_layer
    }

    pub fn layer_name(&self) -> &str {
        &self.layer_name
    }

    pub fn total_layers(&self) -> usize {
        self.total_layers
    }

    pub fn layers(&self) -> usize {
        self.layers
    }

    /// Repeating layers held outside this allocation; they count against device 0
    pub fn pinned_layers(&self) -> usize {
        self.total_layers - self.layers
    }

    pub fn fixed_placements(&self) -> &BTreeMap<String, DeviceId> {
        &self.fixed_placements
    }
}

fn non_negative(model_id: &str, field: &str, value: i64) -> Result<usize> {
    usize::try_from(value).map_err(|_| {
        LayerMapError::config(model_id, format!("{} must be non-negative, got {}", field, value))
    })
}

/// Result of a topology lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    /// Model has a layer topology
    Configured(Arc<ModelTopology>),
    /// Model is unknown or explicitly unconfigured; place everything on device 0
    Absent,
}

impl Topology {
    pub fn is_absent(&self) -> bool {
        matches!(self, Topology::Absent)
    }

    pub fn as_configured(&self) -> Option<&ModelTopology> {
        match self {
            Topology::Configured(topology) => Some(topology),
            Topology::Absent => None,
        }
    }
}

impl From<ModelTopology> for Topology {
    fn from(topology: ModelTopology) -> Self {
        Topology::Configured(Arc::new(topology))
    }
}

//! Memory-proportional layer allocation
//!
//! Layers are split across devices in proportion to each device's free
//! memory, then laid out contiguously in device order:
//!
//! 1. `c[d] = round(T * free[d] / total_free)` for every device `d`
//! 2. The rounding error `T - sum(c)` is folded into a single device: the one
//!    with the most free memory when layers are missing, the one with the
//!    least when there are too many (lowest id wins ties)
//! 3. Layer indices are walked in order, filling device 0 first, then device
//!    1, and so on, so every device holds one contiguous run of layers
//!
//! Repeating layers that are pinned outside this allocation
//! (`total_layers - layers`) are charged against device 0's budget before
//! the walk starts.

use serde::Serialize;

use crate::config::{AllocatorConfig, TopologyRegistry};
use crate::device::{DeviceId, DeviceInventory, FreeMemorySample};
use crate::error::{LayerMapError, Result};
use crate::mapping::DeviceMapping;
use crate::topology::{ModelTopology, Topology};

/// Layer budget of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceShare {
    pub device: DeviceId,
    pub free_bytes: u64,
    /// Layers assigned; the remainder correction can push the smallest device below zero
    pub layers: i64,
}

/// Per-device layer counts summing exactly to the model's total layer count
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerDistribution {
    total_layers: usize,
    shares: Vec<DeviceShare>,
}

impl LayerDistribution {
    pub fn shares(&self) -> &[DeviceShare] {
        &self.shares
    }

    pub fn total_layers(&self) -> usize {
        self.total_layers
    }

    /// Layers assigned to `device`, if it was part of the sample
    pub fn layers_on(&self, device: DeviceId) -> Option<i64> {
        self.shares
            .iter()
            .find(|share| share.device == device)
            .map(|share| share.layers)
    }

    pub fn contains(&self, device: DeviceId) -> bool {
        self.shares.iter().any(|share| share.device == device)
    }

    /// Sum of all per-device counts
    pub fn sum(&self) -> i64 {
        self.shares.iter().map(|share| share.layers).sum()
    }
}

/// Split `topology.total_layers()` across the sampled devices by free memory
///
/// Rounds half away from zero using exact integer arithmetic. When no device
/// reports free memory every device is weighted equally. An empty sample
/// yields a single share on device 0 holding every layer.
pub fn compute_layer_distribution(
    topology: &ModelTopology,
    sample: &FreeMemorySample,
) -> LayerDistribution {
    let total_layers = topology.total_layers();

    if sample.is_empty() {
        return LayerDistribution {
            total_layers,
            shares: vec![DeviceShare {
                device: DeviceId::PRIMARY,
                free_bytes: 0,
                layers: total_layers as i64,
            }],
        };
    }

    let equal_split = sample.total_free() == 0;
    let weight = |free_bytes: u64| -> u128 {
        if equal_split {
            1
        } else {
            free_bytes as u128
        }
    };
    let total_weight: u128 = sample.devices().iter().map(|d| weight(d.free_bytes)).sum();

    let mut shares: Vec<DeviceShare> = sample
        .devices()
        .iter()
        .map(|d| {
            let scaled = total_layers as u128 * weight(d.free_bytes);
            let mut layers = scaled / total_weight;
            if 2 * (scaled % total_weight) >= total_weight {
                layers += 1;
            }
            DeviceShare {
                device: d.id,
                free_bytes: d.free_bytes,
                layers: layers as i64,
            }
        })
        .collect();

    // first index wins ties on both ends
    let mut max_idx = 0;
    let mut min_idx = 0;
    for (i, share) in shares.iter().enumerate() {
        if share.free_bytes > shares[max_idx].free_bytes {
            max_idx = i;
        }
        if share.free_bytes < shares[min_idx].free_bytes {
            min_idx = i;
        }
    }

    let provisional: i64 = shares.iter().map(|share| share.layers).sum();
    let diff = total_layers as i64 - provisional;
    let target = if diff > 0 { max_idx } else { min_idx };
    shares[target].layers += diff;

    tracing::debug!(
        model = topology.model_id(),
        total_layers,
        diff,
        corrected = %shares[target].device,
        counts = ?shares.iter().map(|s| s.layers).collect::<Vec<_>>(),
        "computed layer distribution"
    );

    LayerDistribution {
        total_layers,
        shares,
    }
}

/// Expand a distribution into a per-layer placement map
///
/// Fixed placements are copied in first; repeating layers
/// `0..topology.layers()` then fill devices in order. An absent topology maps
/// the whole model to device 0.
pub fn build_device_mapping(
    topology: &Topology,
    distribution: &LayerDistribution,
) -> Result<DeviceMapping> {
    let topology = match topology {
        Topology::Configured(topology) => topology,
        Topology::Absent => return Ok(DeviceMapping::single_device()),
    };

    if distribution.total_layers() != topology.total_layers() {
        return Err(LayerMapError::config(
            topology.model_id(),
            format!(
                "distribution covers {} layers, topology has {}",
                distribution.total_layers(),
                topology.total_layers()
            ),
        ));
    }

    let mut mapping = DeviceMapping::new();
    for (component, &device) in topology.fixed_placements() {
        if !distribution.contains(device) {
            return Err(LayerMapError::UnknownDevice {
                component: component.clone(),
                device: device.ordinal(),
                available: distribution.shares().len(),
            });
        }
        mapping.insert(component.clone(), device);
    }

    let shares = distribution.shares();
    let mut cursor = 0usize;
    let mut used = topology.pinned_layers() as i64;

    for index in 0..topology.layers() {
        if used < shares[cursor].layers {
            used += 1;
        } else {
            cursor += 1;
            if cursor == shares.len() {
                return Err(LayerMapError::Internal(format!(
                    "layer budget exhausted at {}",
                    topology.layer_key(index)
                )));
            }
            used = 1;
        }
        mapping.insert(topology.layer_key(index), shares[cursor].device);
    }

    debug_assert_eq!(
        mapping.len(),
        topology.fixed_placements().len() + topology.layers()
    );
    Ok(mapping)
}

/// Everything one allocation decided, for reporting
#[derive(Debug, Clone, Serialize)]
pub struct AllocationPlan {
    pub model_id: String,
    /// Absent when no device was queried
    pub sample: Option<FreeMemorySample>,
    /// Absent when the degenerate single-device mapping was used
    pub distribution: Option<LayerDistribution>,
    pub mapping: DeviceMapping,
}

impl AllocationPlan {
    fn single_device(model_id: &str, sample: Option<FreeMemorySample>) -> Self {
        Self {
            model_id: model_id.to_string(),
            sample,
            distribution: None,
            mapping: DeviceMapping::single_device(),
        }
    }
}

/// Topology lookup, device sampling and mapping in one call
#[derive(Debug)]
pub struct LayerAllocator<I> {
    registry: TopologyRegistry,
    inventory: I,
    config: AllocatorConfig,
}

impl<I: DeviceInventory> LayerAllocator<I> {
    pub fn new(registry: TopologyRegistry, inventory: I, config: AllocatorConfig) -> Self {
        Self {
            registry,
            inventory,
            config,
        }
    }

    /// Load the topology store named by `config.topology_path`
    pub fn from_config(config: AllocatorConfig, inventory: I) -> Result<Self> {
        let registry = TopologyRegistry::from_json_file(&config.topology_path)?;
        Ok(Self::new(registry, inventory, config))
    }

    pub fn inventory(&self) -> &I {
        &self.inventory
    }

    /// Compute the full allocation for `model_id`
    pub fn plan(&self, model_id: &str) -> Result<AllocationPlan> {
        let topology = self.registry.lookup(model_id);
        let configured = match topology.as_configured() {
            Some(configured) => configured,
            None => {
                tracing::info!(model = model_id, "no layer topology configured, placing model on cuda:0");
                return Ok(AllocationPlan::single_device(model_id, None));
            }
        };
        configured.validate()?;

        if !self.config.device_aware {
            tracing::warn!(model = model_id, "device-aware placement disabled, placing model on cuda:0");
            return Ok(AllocationPlan::single_device(model_id, None));
        }

        let sample = self.inventory.sample()?;
        if sample.is_empty() {
            tracing::warn!(model = model_id, "no accelerator devices visible, placing model on cuda:0");
            return Ok(AllocationPlan::single_device(model_id, Some(sample)));
        }
        if sample.total_free() == 0 {
            tracing::warn!(
                model = model_id,
                devices = sample.len(),
                "no free memory reported on any device, splitting layers evenly"
            );
        }

        let distribution = compute_layer_distribution(configured, &sample);
        let mapping = build_device_mapping(&topology, &distribution)?;

        tracing::info!(
            model = model_id,
            devices = sample.len(),
            layers = configured.layers(),
            entries = mapping.len(),
            "layer allocation complete"
        );

        Ok(AllocationPlan {
            model_id: model_id.to_string(),
            sample: Some(sample),
            distribution: Some(distribution),
            mapping,
        })
    }

    /// Placement map for loading `model_id`
    pub fn allocate(&self, model_id: &str) -> Result<DeviceMapping> {
        Ok(self.plan(model_id)?.mapping)
    }

    /// Placement map for `model_id` wrapped by an adapter under the configured prefix
    pub fn allocate_for_adapter(&self, model_id: &str) -> Result<DeviceMapping> {
        let mapping = self.allocate(model_id)?;
        Ok(mapping.to_adapter_mapping(&self.config.adapter_prefix))
    }
}

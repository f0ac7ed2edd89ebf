//! LayerMap Core - memory-proportional layer placement across accelerators
//!
//! Large transformer models often do not fit on one GPU. This crate decides
//! which device each repeating layer block goes to so a model loader can
//! shard the model across every visible device.
//!
//! # Pipeline
//!
//! 1. [`TopologyRegistry`] resolves a model id to its [`ModelTopology`]
//!    (top module, layer block name, layer counts, pinned components)
//! 2. A [`DeviceInventory`] samples free memory on every device
//! 3. [`compute_layer_distribution`] converts memory ratios into integer layer
//!    counts that sum exactly to the model's layer count
//! 4. [`build_device_mapping`] walks layer indices in order and emits a
//!    `layer name -> device` map for the loader
//!
//! Models wrapped by an adapter nest their module tree under a prefix;
//! [`DeviceMapping::to_adapter_mapping`] rewrites a map for that case.
//!
//! # Example
//!
//! ```
//! use layermap_core::{
//!     AllocatorConfig, DeviceId, LayerAllocator, ModelTopology, RuntimeInventory,
//!     SimulatedRuntime, TopologyRegistry,
//! };
//!
//! let mut registry = TopologyRegistry::new();
//! registry.insert(ModelTopology::new("llama-7b", "model", "layers", 8, 8)?);
//!
//! let inventory = RuntimeInventory::new(SimulatedRuntime::new(vec![100, 300]));
//! let allocator = LayerAllocator::new(registry, inventory, AllocatorConfig::default());
//!
//! let mapping = allocator.allocate("llama-7b")?;
//! assert_eq!(mapping.get("model.layers.1"), Some(DeviceId::new(0)));
//! assert_eq!(mapping.get("model.layers.2"), Some(DeviceId::new(1)));
//! # Ok::<(), layermap_core::LayerMapError>(())
//! ```

pub mod allocator;
pub mod config;
pub mod device;
pub mod error;
pub mod loader;
pub mod mapping;
pub mod topology;

pub use allocator::{
    build_device_mapping, compute_layer_distribution, AllocationPlan, DeviceShare,
    LayerAllocator, LayerDistribution,
};
pub use config::{AllocatorConfig, TopologyRegistry, DEFAULT_ADAPTER_PREFIX, DEFAULT_TOPOLOGY_PATH};
#[cfg(feature = "cuda")]
pub use device::CudaRuntime;
pub use device::{
    DeviceId, DeviceInventory, DeviceMemory, DeviceRuntime, FreeMemorySample, RuntimeInventory,
    SimulatedRuntime,
};
pub use error::{LayerMapError, Result};
pub use loader::{AdapterLoader, InstructionPrompt, ModelLoader, PlacedModel};
pub use mapping::DeviceMapping;
pub use topology::{ModelTopology, Topology, TopologyRecord};

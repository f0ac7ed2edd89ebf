//! Accelerator enumeration and free-memory sampling
//!
//! Device runtimes such as CUDA expose memory queries against a thread's
//! *current* device, so reading every device means switching the current
//! device once per ordinal. [`RuntimeInventory`] hides that behind a single
//! bulk [`DeviceInventory::sample`] call and serializes the switch-then-query
//! sequence process-wide, so concurrent allocation requests never observe
//! each other's context switches.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[cfg(feature = "cuda")]
use std::sync::Arc;

#[cfg(feature = "cuda")]
use cudarc::driver::CudaDevice;

use crate::error::{LayerMapError, Result};

/// Guards the runtime's global "current device" across all inventories.
static DEVICE_CONTEXT: Mutex<()> = parking_lot::const_mutex(());

/// Ordinal identifier of an accelerator device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "DeviceLabel", into = "String")]
pub struct DeviceId(usize);

impl DeviceId {
    /// The implicit device everything lands on when placement is not device-aware
    pub const PRIMARY: DeviceId = DeviceId(0);

    pub const fn new(ordinal: usize) -> Self {
        Self(ordinal)
    }

    pub const fn ordinal(self) -> usize {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cuda:{}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = LayerMapError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let ordinal = trimmed.strip_prefix("cuda:").unwrap_or(trimmed);
        ordinal
            .parse::<usize>()
            .map(DeviceId)
            .map_err(|_| LayerMapError::DeviceLabel(s.to_string()))
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.to_string()
    }
}

/// Raw device label as it appears in configuration: `"cuda:1"`, `"1"` or `1`
#[derive(Deserialize)]
#[serde(untagged)]
enum DeviceLabel {
    Ordinal(usize),
    Text(String),
}

impl TryFrom<DeviceLabel> for DeviceId {
    type Error = LayerMapError;

    fn try_from(label: DeviceLabel) -> Result<Self> {
        match label {
            DeviceLabel::Ordinal(n) => Ok(DeviceId(n)),
            DeviceLabel::Text(s) => s.parse(),
        }
    }
}

/// Free memory observed on one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceMemory {
    pub id: DeviceId,
    pub free_bytes: u64,
}

/// Point-in-time free-memory snapshot, one entry per visible device in ordinal order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FreeMemorySample {
    devices: Vec<DeviceMemory>,
}

impl FreeMemorySample {
    pub fn new(devices: Vec<DeviceMemory>) -> Self {
        Self { devices }
    }

    /// Build a sample where device `i` reports `free[i]` bytes
    pub fn from_free_bytes(free: &[u64]) -> Self {
        let devices = free
            .iter()
            .enumerate()
            .map(|(i, &free_bytes)| DeviceMemory {
                id: DeviceId::new(i),
                free_bytes,
            })
            .collect();
        Self { devices }
    }

    pub fn devices(&self) -> &[DeviceMemory] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Sum of free bytes across devices (u128 so byte counts never overflow)
    pub fn total_free(&self) -> u128 {
        self.devices.iter().map(|d| d.free_bytes as u128).sum()
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.devices.iter().any(|d| d.id == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.devices.iter().map(|d| d.id)
    }
}

/// Low-level device runtime, mirroring a driver API with a global current device
pub trait DeviceRuntime: Send + Sync {
    /// Number of visible devices
    fn device_count(&self) -> Result<usize>;

    /// Make `id` the current device of the calling thread
    fn set_current_device(&self, id: DeviceId) -> Result<()>;

    /// Free bytes on `id`; `id` must be the current device
    fn free_memory(&self, id: DeviceId) -> Result<u64>;
}

/// Bulk free-memory query over every visible device
pub trait DeviceInventory: Send + Sync {
    fn sample(&self) -> Result<FreeMemorySample>;
}

/// [`DeviceInventory`] over a stateful [`DeviceRuntime`]
pub struct RuntimeInventory<R> {
    runtime: R,
}

impl<R: DeviceRuntime> RuntimeInventory<R> {
    pub fn new(runtime: R) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }
}

impl<R: DeviceRuntime> DeviceInventory for RuntimeInventory<R> {
    fn sample(&self) -> Result<FreeMemorySample> {
        let _context = DEVICE_CONTEXT.lock();

        let count = self.runtime.device_count()?;
        let mut devices = Vec::with_capacity(count);
        for ordinal in 0..count {
            let id = DeviceId::new(ordinal);
            self.runtime.set_current_device(id)?;
            let free_bytes = self.runtime.free_memory(id)?;
            tracing::debug!(device = %id, free_bytes, "sampled free memory");
            devices.push(DeviceMemory { id, free_bytes });
        }

        Ok(FreeMemorySample::new(devices))
    }
}

impl<T: DeviceInventory + ?Sized> DeviceInventory for Box<T> {
    fn sample(&self) -> Result<FreeMemorySample> {
        (**self).sample()
    }
}

impl<R> fmt::Debug for RuntimeInventory<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeInventory")
            .field("runtime", &std::any::type_name::<R>())
            .finish()
    }
}

/// Runtime reporting a fixed free-memory figure per device
///
/// Used for dry runs (`layermap --free-mem`) and tests. It counts the memory
/// queries it serves and can be told to fail on one device.
#[derive(Debug, Default)]
pub struct SimulatedRuntime {
    free: Vec<u64>,
    failing: Option<DeviceId>,
    current: Mutex<Option<DeviceId>>,
    queries: AtomicUsize,
}

impl SimulatedRuntime {
    pub fn new(free: Vec<u64>) -> Self {
        Self {
            free,
            ..Default::default()
        }
    }

    /// Make every query against `id` fail
    pub fn with_failure(mut self, id: DeviceId) -> Self {
        self.failing = Some(id);
        self
    }

    /// Number of `free_memory` calls served so far
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }
}

impl DeviceRuntime for SimulatedRuntime {
    fn device_count(&self) -> Result<usize> {
        Ok(self.free.len())
    }

    fn set_current_device(&self, id: DeviceId) -> Result<()> {
        if id.ordinal() >= self.free.len() {
            return Err(LayerMapError::device_query(
                Some(id.ordinal()),
                "invalid device ordinal",
            ));
        }
        *self.current.lock() = Some(id);
        Ok(())
    }

    fn free_memory(&self, id: DeviceId) -> Result<u64> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        if self.failing == Some(id) {
            return Err(LayerMapError::device_query(Some(id.ordinal()), "simulated driver failure"));
        }
        if *self.current.lock() != Some(id) {
            return Err(LayerMapError::device_query(
                Some(id.ordinal()),
                "device is not current",
            ));
        }
        Ok(self.free[id.ordinal()])
    }
}

/// CUDA driver runtime (via cudarc)
#[cfg(feature = "cuda")]
#[derive(Default)]
pub struct CudaRuntime {
    current: Mutex<Option<Arc<CudaDevice>>>,
}

#[cfg(feature = "cuda")]
impl CudaRuntime {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(feature = "cuda")]
impl DeviceRuntime for CudaRuntime {
    fn device_count(&self) -> Result<usize> {
        cudarc::driver::result::init()
            .map_err(|e| LayerMapError::device_query(None, format!("cuInit failed: {:?}", e)))?;
        let count = cudarc::driver::result::device::get_count()
            .map_err(|e| LayerMapError::device_query(None, format!("{:?}", e)))?;
        Ok(count.max(0) as usize)
    }

    fn set_current_device(&self, id: DeviceId) -> Result<()> {
        let device = CudaDevice::new(id.ordinal()).map_err(|e| {
            LayerMapError::device_query(Some(id.ordinal()), format!("Failed to create CUDA device: {:?}", e))
        })?;
        device.bind_to_thread().map_err(|e| {
            LayerMapError::device_query(Some(id.ordinal()), format!("Failed to bind device to thread: {:?}", e))
        })?;
        *self.current.lock() = Some(device);
        Ok(())
    }

    fn free_memory(&self, id: DeviceId) -> Result<u64> {
        let current = self.current.lock();
        match current.as_ref() {
            Some(device) if device.ordinal() == id.ordinal() => {}
            _ => {
                return Err(LayerMapError::device_query(
                    Some(id.ordinal()),
                    "device is not current",
                ))
            }
        }
        let (free, _total) = cudarc::driver::result::mem_get_info()
            .map_err(|e| LayerMapError::device_query(Some(id.ordinal()), format!("{:?}", e)))?;
        Ok(free as u64)
    }
}

#[cfg(feature = "cuda")]
impl fmt::Debug for CudaRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let current = self.current.lock().as_ref().map(|d| d.ordinal());
        f.debug_struct("CudaRuntime").field("current", &current).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_labels() {
        assert_eq!("cuda:3".parse::<DeviceId>().unwrap(), DeviceId::new(3));
        assert_eq!("2".parse::<DeviceId>().unwrap(), DeviceId::new(2));
        assert!("cpu".parse::<DeviceId>().is_err());
        assert!("cuda:-1".parse::<DeviceId>().is_err());
        assert_eq!(DeviceId::new(1).to_string(), "cuda:1");
    }

    #[test]
    fn test_device_id_serde() {
        let id: DeviceId = serde_json::from_str("\"cuda:4\"").unwrap();
        assert_eq!(id, DeviceId::new(4));
        let id: DeviceId = serde_json::from_str("5").unwrap();
        assert_eq!(id, DeviceId::new(5));
        assert!(serde_json::from_str::<DeviceId>("\"disk\"").is_err());
        assert_eq!(serde_json::to_string(&DeviceId::new(0)).unwrap(), "\"cuda:0\"");
    }

    #[test]
    fn test_runtime_inventory_sample() {
        let inventory = RuntimeInventory::new(SimulatedRuntime::new(vec![100, 300, 0]));
        let sample = inventory.sample().unwrap();

        assert_eq!(sample.len(), 3);
        assert_eq!(sample.total_free(), 400);
        assert_eq!(
            sample.ids().collect::<Vec<_>>(),
            vec![DeviceId::new(0), DeviceId::new(1), DeviceId::new(2)]
        );
        assert_eq!(sample.devices()[1].free_bytes, 300);
        assert_eq!(inventory.runtime().queries(), 3);
    }

    #[test]
    fn test_runtime_inventory_propagates_failure() {
        let runtime = SimulatedRuntime::new(vec![10, 20]).with_failure(DeviceId::new(1));
        let inventory = RuntimeInventory::new(runtime);

        match inventory.sample() {
            Err(LayerMapError::DeviceQuery { device, .. }) => assert_eq!(device, Some(1)),
            other => panic!("expected device query error, got {:?}", other),
        }
    }

    #[test]
    fn test_simulated_runtime_requires_current_device() {
        let runtime = SimulatedRuntime::new(vec![10, 20]);
        assert!(runtime.free_memory(DeviceId::new(0)).is_err());
        runtime.set_current_device(DeviceId::new(1)).unwrap();
        assert_eq!(runtime.free_memory(DeviceId::new(1)).unwrap(), 20);
        assert!(runtime.set_current_device(DeviceId::new(2)).is_err());
    }

    #[test]
    fn test_concurrent_samples_do_not_interleave() {
        let inventory = std::sync::Arc::new(RuntimeInventory::new(SimulatedRuntime::new(vec![
            1, 2, 3, 4, 5, 6, 7, 8,
        ])));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let inventory = inventory.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let sample = inventory.sample().unwrap();
                        assert_eq!(sample.total_free(), 36);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(inventory.runtime().queries(), 8 * 50 * 8);
    }

    #[test]
    #[cfg(feature = "cuda")]
    fn test_cuda_inventory_sample() {
        let inventory = RuntimeInventory::new(CudaRuntime::new());
        let sample = inventory.sample().unwrap();
        assert!(sample.devices().iter().all(|d| d.free_bytes > 0));
    }
}

//! Device descriptors and per-device configuration records
//!
//! A [`DeviceDescriptor`] is produced once by enumeration and never changes.
//! A [`DeviceConfig`] exists for each opened logical id and is owned by the
//! backend that created it; callers reach it through a [`ConfigHandle`],
//! which carries the owning id so no reverse lookup is ever needed.

use crate::backend::BackendKind;
use crate::config::DEFAULT_TIMEOUT_MS;
use crate::error::{DispatchError, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Logical device id, flat across all backends
pub type DeviceId = usize;

/// Information about a discovered device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Logical id (0, 1, 2, ...)
    pub id: DeviceId,

    /// Backend serving this id
    pub backend: BackendKind,

    /// Device or board name
    pub name: String,

    /// DMA channels (1 for compute devices)
    pub channel_count: u32,

    /// PCI or platform vendor id
    pub vendor_id: u32,

    /// PCI device id (0 when the platform does not report one)
    pub device_id: u32,

    /// Maximum clock frequency in MHz (0 when unknown)
    pub frequency_mhz: u32,

    /// Global memory in bytes (0 when unknown)
    pub global_memory_bytes: u64,
}

/// How a compute device receives its input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputKind {
    /// Parse the text file named by `input_path`
    #[default]
    File,

    /// Caller buffer holds native-endian `f32` values, row-major
    Float,

    /// Caller buffer holds native-endian `i32` values, row-major
    Int,
}

/// PCIe transfer parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcieParams {
    /// Destination offset in words for writes
    pub dest_offset: u32,

    /// Mark each write as the last of its transaction
    pub last: bool,
}

impl Default for PcieParams {
    fn default() -> Self {
        Self {
            dest_offset: 0,
            last: true,
        }
    }
}

/// Clustering parameters for a compute device
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeParams {
    /// Smallest cluster count to try
    pub min_clusters: usize,

    /// Largest cluster count to try
    pub max_clusters: usize,

    /// Convergence threshold (fraction of rows changing cluster)
    pub threshold: f32,

    /// Rows in a raw input buffer
    pub row_count: usize,

    /// Columns in a raw input buffer
    pub col_count: usize,

    /// Kernel bitstream / binary image
    pub bit_image_path: PathBuf,

    /// Runs per cluster count
    pub loops: usize,

    /// Ask the kernel to compute RMSE and pick the best count by it
    pub compute_rmse: bool,
}

impl Default for ComputeParams {
    fn default() -> Self {
        Self {
            min_clusters: 5,
            max_clusters: 5,
            threshold: 0.001,
            row_count: 0,
            col_count: 0,
            bit_image_path: PathBuf::new(),
            loops: 1,
            compute_rmse: false,
        }
    }
}

/// Backend-specific part of a configuration
#[derive(Debug, Clone, PartialEq)]
pub enum BackendParams {
    /// DMA transfer parameters
    Pcie(PcieParams),

    /// Clustering parameters
    Compute(ComputeParams),
}

impl BackendParams {
    /// Backend family these parameters belong to
    #[must_use]
    pub const fn kind(&self) -> BackendKind {
        match self {
            Self::Pcie(_) => BackendKind::Pcie,
            Self::Compute(_) => BackendKind::Compute,
        }
    }
}

/// Per-opened-device configuration
///
/// The owning id and backend kind are fixed at creation; everything else is
/// caller-tunable between `open` and `configure`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    id: DeviceId,
    kind: BackendKind,

    /// Input mode (compute only)
    pub input_kind: InputKind,

    /// Input data file (compute file mode)
    pub input_path: Option<PathBuf>,

    /// Where the compute kernel writes per-row membership
    pub output_path: Option<PathBuf>,

    /// Write length in words (PCIe)
    pub input_len: u32,

    /// Read length in words (PCIe)
    pub output_len: u32,

    /// Write timeout in milliseconds
    pub write_timeout_ms: u64,

    /// Read timeout in milliseconds
    pub read_timeout_ms: u64,

    /// Backend-specific parameters
    pub params: BackendParams,
}

impl DeviceConfig {
    /// Fresh PCIe configuration for `id`
    #[must_use]
    pub fn pcie(id: DeviceId) -> Self {
        Self::with_params(id, BackendParams::Pcie(PcieParams::default()))
    }

    /// Fresh compute configuration for `id`
    #[must_use]
    pub fn compute(id: DeviceId, params: ComputeParams) -> Self {
        Self::with_params(id, BackendParams::Compute(params))
    }

    fn with_params(id: DeviceId, params: BackendParams) -> Self {
        Self {
            id,
            kind: params.kind(),
            input_kind: InputKind::default(),
            input_path: None,
            output_path: None,
            input_len: 0,
            output_len: 0,
            write_timeout_ms: DEFAULT_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_TIMEOUT_MS,
            params,
        }
    }

    /// Owning logical id
    #[must_use]
    pub const fn id(&self) -> DeviceId {
        self.id
    }

    /// Backend that created this configuration
    #[must_use]
    pub const fn backend_kind(&self) -> BackendKind {
        self.kind
    }

    /// PCIe parameters, if this is a PCIe configuration
    #[must_use]
    pub const fn pcie_params(&self) -> Option<&PcieParams> {
        match &self.params {
            BackendParams::Pcie(p) => Some(p),
            BackendParams::Compute(_) => None,
        }
    }

    /// Compute parameters, if this is a compute configuration
    #[must_use]
    pub const fn compute_params(&self) -> Option<&ComputeParams> {
        match &self.params {
            BackendParams::Compute(p) => Some(p),
            BackendParams::Pcie(_) => None,
        }
    }

    /// Check the parameters agree with the owning backend
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the parameter variant was swapped for the
    /// other backend's.
    pub fn check_kind(&self) -> Result<()> {
        if self.params.kind() == self.kind {
            Ok(())
        } else {
            Err(DispatchError::invalid_config(
                self.id,
                format!(
                    "{} parameters on a {} device",
                    self.params.kind(),
                    self.kind
                ),
            ))
        }
    }
}

/// Shared handle to a live [`DeviceConfig`]
///
/// Clones refer to the same record: a change made through one is visible
/// through every other. Once the config is closed the handle goes stale and
/// every operation on it fails with `InvalidConfig`.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    id: DeviceId,
    kind: BackendKind,
    inner: Arc<Mutex<DeviceConfig>>,
}

impl ConfigHandle {
    fn new(config: DeviceConfig) -> Self {
        Self {
            id: config.id,
            kind: config.kind,
            inner: Arc::new(Mutex::new(config)),
        }
    }

    /// Owning logical id
    #[must_use]
    pub const fn id(&self) -> DeviceId {
        self.id
    }

    /// Backend that owns this config
    #[must_use]
    pub const fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Copy of the current configuration
    #[must_use]
    pub fn snapshot(&self) -> DeviceConfig {
        self.inner.lock().clone()
    }

    /// Modify the configuration in place
    pub fn update<R>(&self, f: impl FnOnce(&mut DeviceConfig) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Whether two handles refer to the same record
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Live configurations of one backend, keyed by backend-local index
#[derive(Debug, Default)]
pub(crate) struct ConfigTable {
    entries: BTreeMap<usize, ConfigHandle>,
}

impl ConfigTable {
    /// Return the live config at `key`, creating it if absent
    pub fn open_or_insert(
        &mut self,
        key: usize,
        create: impl FnOnce() -> DeviceConfig,
    ) -> ConfigHandle {
        self.entries
            .entry(key)
            .or_insert_with(|| ConfigHandle::new(create()))
            .clone()
    }

    /// Live config at `key`
    pub fn get(&self, key: usize) -> Option<&ConfigHandle> {
        self.entries.get(&key)
    }

    /// Check `handle` is the live config at `key`
    pub fn resolve(&self, key: usize, handle: &ConfigHandle) -> Result<()> {
        match self.entries.get(&key) {
            Some(live) if live.same_as(handle) => Ok(()),
            Some(_) => Err(DispatchError::invalid_config(
                handle.id(),
                "handle superseded by a later open",
            )),
            None => Err(DispatchError::invalid_config(handle.id(), "device not open")),
        }
    }

    /// Drop the entry at `key` if it is `handle`; returns whether it was
    pub fn remove(&mut self, key: usize, handle: &ConfigHandle) -> bool {
        if self.resolve(key, handle).is_ok() {
            self.entries.remove(&key);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_is_create_or_fetch() {
        let mut table = ConfigTable::default();
        let a = table.open_or_insert(5, || DeviceConfig::pcie(5));
        let b = table.open_or_insert(5, || panic!("must not create twice"));
        assert!(a.same_as(&b));

        a.update(|c| c.input_len = 512);
        assert_eq!(b.snapshot().input_len, 512);
    }

    #[test]
    fn removed_handle_goes_stale() {
        let mut table = ConfigTable::default();
        let old = table.open_or_insert(0, || DeviceConfig::pcie(0));
        assert!(table.remove(0, &old));
        assert!(!table.remove(0, &old));
        assert!(table.is_empty());

        let fresh = table.open_or_insert(0, || DeviceConfig::pcie(0));
        assert!(!fresh.same_as(&old));
        assert!(table.resolve(0, &fresh).is_ok());
        assert!(matches!(
            table.resolve(0, &old),
            Err(DispatchError::InvalidConfig { id: 0, .. })
        ));
        // a stale handle never removes its successor
        assert!(!table.remove(0, &old));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn swapped_params_are_detected() {
        let mut cfg = DeviceConfig::pcie(2);
        assert!(cfg.check_kind().is_ok());
        cfg.params = BackendParams::Compute(ComputeParams::default());
        assert!(cfg.check_kind().is_err());
        assert_eq!(cfg.backend_kind(), BackendKind::Pcie);
        assert!(cfg.pcie_params().is_none());
    }
}

//! Device registry and dispatcher
//!
//! Owns one compute backend and one PCIe backend and presents them as a
//! single flat id space:
//!
//! ```text
//! id:  0 .. C-1        C .. C+P-1
//!      compute devices  PCIe boards
//! ```
//!
//! where `C` and `P` are fixed by the first enumeration. Both backends sit
//! behind one mutex, so the one-shot enumeration is atomic and operations
//! from different threads are serialised. Each operation blocks for the
//! full device I/O.

use crate::backend::{BackendKind, DeviceBackend};
use crate::backends::{ComputeBackend, PcieBackend};
use crate::compute::{ClusterKernel, ComputePlatform};
use crate::config::RegistryConfig;
use crate::device::{ConfigHandle, DeviceDescriptor, DeviceId};
use crate::dma::RiffaDevice;
use crate::error::{DispatchError, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Process-wide view of every device
#[derive(Debug)]
pub struct DeviceRegistry {
    inner: Mutex<Backends>,
}

#[derive(Debug)]
struct Backends {
    compute: Box<dyn DeviceBackend>,
    pcie: Box<dyn DeviceBackend>,
    table: Vec<DeviceDescriptor>,
    enumerated: bool,
}

impl DeviceRegistry {
    /// Registry over explicit backends
    #[must_use]
    pub fn new(compute: Box<dyn DeviceBackend>, pcie: Box<dyn DeviceBackend>) -> Self {
        Self {
            inner: Mutex::new(Backends {
                compute,
                pcie,
                table: Vec::new(),
                enumerated: false,
            }),
        }
    }

    /// Registry over the real DMA device and the given compute runtime
    #[must_use]
    pub fn from_config(
        config: &RegistryConfig,
        platform: Box<dyn ComputePlatform>,
        kernel: Box<dyn ClusterKernel>,
    ) -> Self {
        let mut compute = ComputeBackend::new(platform, kernel, config.compute_vendor.clone())
            .with_defaults(config.compute_defaults.clone());
        if let Some(pattern) = &config.probe_pattern {
            compute = compute.with_probe(pattern.clone());
        }
        let pcie = PcieBackend::with_max_boards(
            Box::new(RiffaDevice::new(config.device_path.clone())),
            config.max_boards,
        );
        debug!(
            "Registry: DMA device {}, compute vendor '{}', mode {}",
            config.device_path.display(),
            config.compute_vendor,
            config.emulation.as_str()
        );
        Self::new(Box::new(compute), Box::new(pcie))
    }

    /// Every device, compute first, in id order
    ///
    /// Enumerates both backends on first use.
    pub fn list_all(&self) -> Vec<DeviceDescriptor> {
        let mut inner = self.inner.lock();
        inner.ensure_enumerated();
        inner.table.clone()
    }

    /// Total number of devices
    pub fn device_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.ensure_enumerated();
        inner.table.len()
    }

    /// Descriptor for one id
    ///
    /// # Errors
    ///
    /// Returns `UnknownDevice` if no backend serves `id`.
    pub fn descriptor(&self, id: DeviceId) -> Result<DeviceDescriptor> {
        let mut inner = self.inner.lock();
        inner.ensure_enumerated();
        inner.table.get(id).cloned().ok_or(DispatchError::UnknownDevice {
            id,
            count: inner.table.len(),
        })
    }

    /// Create or fetch the config for `id`
    ///
    /// Opening an id that is already open returns a handle to the same
    /// config.
    ///
    /// # Errors
    ///
    /// Returns `UnknownDevice` if no backend serves `id`, or the backend's
    /// open error.
    pub fn open(&self, id: DeviceId) -> Result<ConfigHandle> {
        let mut inner = self.inner.lock();
        inner.ensure_enumerated();
        let handle = inner.backend_for_id(id)?.open(id)?;
        debug!("Opened id {id} on {}", handle.kind());
        Ok(handle)
    }

    /// Validate and apply the config of an open id
    ///
    /// # Errors
    ///
    /// Returns `UnknownDevice`, `InvalidConfig`, or the backend's error.
    pub fn configure(&self, id: DeviceId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_enumerated();
        inner.backend_for_id(id)?.configure(id)
    }

    /// Send `data` to the device behind `config`, returning bytes accepted
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a stale or mismatched handle, or the
    /// backend's transfer error.
    pub fn write(&self, config: &ConfigHandle, channel: u32, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.backend_for_handle(config)?.write(config, channel, data)
    }

    /// Fill `buffer` from the device behind `config`, returning bytes read
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a stale or mismatched handle, or the
    /// backend's transfer error.
    pub fn read(&self, config: &ConfigHandle, channel: u32, buffer: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.backend_for_handle(config)?.read(config, channel, buffer)
    }

    /// Reset the device behind `config`
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a stale or mismatched handle, or the
    /// backend's reset error.
    pub fn reset(&self, config: &ConfigHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.backend_for_handle(config)?.reset(config)
    }

    /// Release `config`; closing an already-closed config succeeds
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the handle's kind disagrees with its id.
    pub fn close(&self, config: &ConfigHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.backend_for_handle(config)?.close(config)
    }
}

impl Backends {
    fn ensure_enumerated(&mut self) {
        if self.enumerated {
            return;
        }
        self.enumerated = true;

        let compute = self.compute.enumerate(0).unwrap_or_else(|e| {
            warn!("{e}; continuing without compute devices");
            Vec::new()
        });
        let pcie = self
            .pcie
            .enumerate(self.compute.device_count())
            .unwrap_or_else(|e| {
                warn!("{e}; continuing without PCIe boards");
                Vec::new()
            });

        info!(
            "Registered {} device(s): {} compute, {} PCIe",
            compute.len() + pcie.len(),
            compute.len(),
            pcie.len()
        );
        self.table = compute;
        self.table.extend(pcie);
    }

    fn kind_for_id(&self, id: DeviceId) -> Result<BackendKind> {
        if id < self.compute.device_count() {
            Ok(BackendKind::Compute)
        } else if id < self.table.len() {
            Ok(BackendKind::Pcie)
        } else {
            Err(DispatchError::UnknownDevice {
                id,
                count: self.table.len(),
            })
        }
    }

    fn backend(&mut self, kind: BackendKind) -> &mut (dyn DeviceBackend + 'static) {
        match kind {
            BackendKind::Compute => &mut *self.compute,
            BackendKind::Pcie => &mut *self.pcie,
        }
    }

    fn backend_for_id(&mut self, id: DeviceId) -> Result<&mut (dyn DeviceBackend + 'static)> {
        let kind = self.kind_for_id(id)?;
        Ok(self.backend(kind))
    }

    /// Backend recorded in the handle, after checking the id range agrees
    fn backend_for_handle(
        &mut self,
        config: &ConfigHandle,
    ) -> Result<&mut (dyn DeviceBackend + 'static)> {
        let by_range = self.kind_for_id(config.id()).map_err(|_| {
            DispatchError::invalid_config(config.id(), "no device with this id")
        })?;
        if by_range != config.kind() {
            return Err(DispatchError::invalid_config(
                config.id(),
                format!("{} config on a {by_range} id", config.kind()),
            ));
        }
        Ok(self.backend(config.kind()))
    }
}

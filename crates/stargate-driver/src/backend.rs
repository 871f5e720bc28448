//! Backend abstraction for device dispatch
//!
//! Both the PCIe DMA backend and the compute-offload backend sit behind one
//! capability interface so the registry can route by id without knowing
//! which hardware serves it, and tests can substitute doubles.

use crate::device::{ConfigHandle, DeviceDescriptor, DeviceId};
use crate::error::Result;
use std::fmt::Debug;

/// Device backend trait - one per hardware family
///
/// Every operation is synchronous and blocks for the full duration of the
/// underlying device I/O.
pub trait DeviceBackend: Debug + Send {
    /// Backend family
    fn kind(&self) -> BackendKind;

    /// Discover devices, at most once per backend lifetime
    ///
    /// The first call probes hardware and assigns logical ids starting at
    /// `id_offset`; later calls return the cached descriptors unchanged and
    /// ignore `id_offset`.
    ///
    /// # Errors
    ///
    /// Returns `EnumerationFailure` if the driver or platform API fails. The
    /// backend is still marked registered, with no devices.
    fn enumerate(&mut self, id_offset: usize) -> Result<Vec<DeviceDescriptor>>;

    /// Number of devices found by enumeration (0 before it runs)
    fn device_count(&self) -> usize;

    /// Registration state
    fn registration(&self) -> RegistrationState;

    /// Create or fetch the configuration for a logical id
    ///
    /// # Errors
    ///
    /// Returns error if the id is not served by this backend or the device
    /// cannot be opened.
    fn open(&mut self, id: DeviceId) -> Result<ConfigHandle>;

    /// Validate and apply the current configuration for an open id
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the id is not open or its parameters are
    /// inconsistent, or `BackendInit` if the device cannot be brought up.
    fn configure(&mut self, id: DeviceId) -> Result<()>;

    /// Move caller data to the device, returning bytes accepted
    ///
    /// # Errors
    ///
    /// Returns error if the config is stale or the transfer fails.
    fn write(&mut self, config: &ConfigHandle, channel: u32, data: &[u8]) -> Result<usize>;

    /// Fill `buffer` from the device, returning bytes produced
    ///
    /// # Errors
    ///
    /// Returns error if the config is stale or the transfer fails.
    fn read(&mut self, config: &ConfigHandle, channel: u32, buffer: &mut [u8]) -> Result<usize>;

    /// Reset the device behind `config`
    ///
    /// # Errors
    ///
    /// Returns error if the config is stale or the reset request fails.
    fn reset(&mut self, config: &ConfigHandle) -> Result<()>;

    /// Release `config` and any OS resources held for it
    ///
    /// Closing a config that is no longer live is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error only if releasing an OS resource fails.
    fn close(&mut self, config: &ConfigHandle) -> Result<()>;
}

/// Backend family identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// PCIe board driven through DMA channel ioctls
    Pcie,

    /// Compute accelerator driven through a vendor platform API
    Compute,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pcie => write!(f, "PCIe"),
            Self::Compute => write!(f, "Compute"),
        }
    }
}

/// One-way enumeration guard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationState {
    /// Hardware not yet probed
    #[default]
    NotRegistered,

    /// Enumeration ran; descriptors are cached for the process lifetime
    Registered,
}

impl RegistrationState {
    /// Whether enumeration already ran
    #[must_use]
    pub const fn is_registered(self) -> bool {
        matches!(self, Self::Registered)
    }
}

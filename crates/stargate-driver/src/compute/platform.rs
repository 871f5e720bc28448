//! Compute platform discovery
//!
//! A [`ComputePlatform`] is the vendor runtime seen from the host: it lists
//! platforms, lists accelerator devices on a platform, and creates the
//! context plus in-order queue that kernels run on.

use crate::config::EmulationMode;
use crate::error::{DispatchError, Result};
use std::fmt::Debug;
use std::process::Command;
use tracing::{debug, info};

/// A platform reported by the vendor runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    /// Platform name (matched against the configured vendor)
    pub name: String,

    /// Runtime version string
    pub version: String,
}

/// An accelerator device on a platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeDeviceInfo {
    /// Device name
    pub name: String,

    /// Maximum clock frequency in MHz
    pub frequency_mhz: u32,

    /// Global memory in bytes
    pub global_memory_bytes: u64,

    /// Vendor id as the runtime reports it
    pub vendor_id: u32,
}

/// Execution context and in-order command queue for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionQueue {
    /// Device the queue submits to
    pub device: String,

    /// Execution mode the context was created in
    pub mode: EmulationMode,
}

/// Vendor compute runtime
pub trait ComputePlatform: Debug + Send {
    /// All installed platforms
    ///
    /// # Errors
    ///
    /// Returns `EnumerationFailure` if the runtime cannot be queried.
    fn platforms(&self) -> Result<Vec<PlatformInfo>>;

    /// Accelerator devices on `platform`
    ///
    /// # Errors
    ///
    /// Returns `EnumerationFailure` if the runtime cannot be queried.
    fn devices(&self, platform: &PlatformInfo) -> Result<Vec<ComputeDeviceInfo>>;

    /// Create a context and in-order queue on `device`
    ///
    /// # Errors
    ///
    /// Returns `BackendInit` if the context or queue cannot be created.
    fn create_queue(&mut self, device: &ComputeDeviceInfo) -> Result<ExecutionQueue>;
}

/// Host-CPU platform used when no vendor runtime is linked
///
/// Reports one platform under the configured vendor name with a single
/// device, so a registry can be exercised end to end without hardware.
#[derive(Debug, Clone)]
pub struct SoftwarePlatform {
    vendor: String,
    mode: EmulationMode,
}

impl SoftwarePlatform {
    /// Software platform reporting itself as `vendor`
    pub fn new(vendor: impl Into<String>, mode: EmulationMode) -> Self {
        Self {
            vendor: vendor.into(),
            mode,
        }
    }
}

impl ComputePlatform for SoftwarePlatform {
    fn platforms(&self) -> Result<Vec<PlatformInfo>> {
        Ok(vec![PlatformInfo {
            name: self.vendor.clone(),
            version: format!("software ({})", self.mode.as_str()),
        }])
    }

    fn devices(&self, platform: &PlatformInfo) -> Result<Vec<ComputeDeviceInfo>> {
        if platform.name != self.vendor {
            return Ok(Vec::new());
        }
        let threads = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Ok(vec![ComputeDeviceInfo {
            name: format!("host-cpu-{threads}t"),
            frequency_mhz: 0,
            global_memory_bytes: 0,
            vendor_id: 0,
        }])
    }

    fn create_queue(&mut self, device: &ComputeDeviceInfo) -> Result<ExecutionQueue> {
        debug!("Software queue on {}", device.name);
        Ok(ExecutionQueue {
            device: device.name.clone(),
            mode: self.mode.clone(),
        })
    }
}

/// Check `lspci` output for a line containing `pattern`
///
/// # Errors
///
/// Returns `EnumerationFailure` if `lspci` cannot be run.
pub fn probe_pci(pattern: &str) -> Result<bool> {
    let output = Command::new("lspci").output().map_err(|e| {
        DispatchError::enumeration_failure(
            crate::backend::BackendKind::Compute,
            format!("cannot run lspci: {e}"),
        )
    })?;

    let listing = String::from_utf8_lossy(&output.stdout);
    let found = listing_contains(&listing, pattern);
    info!("PCI probe for '{pattern}': {}", if found { "present" } else { "absent" });
    Ok(found)
}

fn listing_contains(listing: &str, pattern: &str) -> bool {
    listing.lines().any(|line| line.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_platform_reports_one_device_under_its_vendor() {
        let platform = SoftwarePlatform::new("Xilinx", EmulationMode::SoftwareEmulation);
        let platforms = platform.platforms().unwrap();
        assert_eq!(platforms.len(), 1);
        assert_eq!(platforms[0].name, "Xilinx");
        assert_eq!(platform.devices(&platforms[0]).unwrap().len(), 1);

        let other = PlatformInfo {
            name: "Other".into(),
            version: String::new(),
        };
        assert!(platform.devices(&other).unwrap().is_empty());
    }

    #[test]
    fn probe_matches_any_listing_line() {
        let listing = "00:00.0 Host bridge: Intel\n\
                       03:00.0 Serial controller: Xilinx Corporation Device 7038\n";
        assert!(listing_contains(listing, "Serial controller: Xilinx"));
        assert!(!listing_contains(listing, "Processing accelerators"));
    }
}

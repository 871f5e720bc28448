//! Host-side dispatch for FPGA accelerators.
//!
//! One registry fronts two very different kinds of hardware:
//!
//! ```text
//! DeviceRegistry  (flat ids, one mutex)
//!   ├─ ComputeBackend  vendor platform runtime + clustering kernel
//!   └─ PcieBackend     RIFFA-style DMA channels via /dev/riffa ioctls
//! ```
//!
//! Every device is used the same way: `open` an id to get a config handle,
//! tune the config, `configure`, then `write`/`read`/`reset`, and `close`.
//!
//! # Quick start
//!
//! ```no_run
//! use stargate_driver::prelude::*;
//!
//! # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let config = RegistryConfig::from_env();
//! let registry = DeviceRegistry::from_config(
//!     &config,
//!     Box::new(SoftwarePlatform::new(&config.compute_vendor, config.emulation.clone())),
//!     Box::new(SoftwareKmeans::new()),
//! );
//!
//! for dev in registry.list_all() {
//!     println!("{}: {} ({})", dev.id, dev.name, dev.backend);
//! }
//!
//! let handle = registry.open(0)?;
//! handle.update(|c| {
//!     c.input_len = 512;
//!     c.output_len = 512;
//! });
//! registry.configure(0)?;
//!
//! let tx: Vec<u8> = (0..2048).map(|i| i as u8).collect();
//! registry.write(&handle, 9, &tx)?;
//! let mut rx = vec![0u8; 2048];
//! registry.read(&handle, 9, &mut rx)?;
//! registry.close(&handle)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod backend;
pub mod backends;
pub mod compute;
mod config;
mod device;
pub mod dma;
mod error;
mod registry;

pub use backend::{BackendKind, DeviceBackend, RegistrationState};
pub use backends::{ComputeBackend, PcieBackend, RawTransfer};
pub use compute::{
    ClusterKernel, ClusterOutput, ClusterRequest, ComputeDeviceInfo, ComputePlatform,
    ExecutionQueue, PlatformInfo, SoftwareKmeans, SoftwarePlatform, StagedInput,
};
pub use config::{
    EmulationMode, RegistryConfig, DEFAULT_COMPUTE_VENDOR, DEFAULT_PROBE_PATTERN,
    DEFAULT_TIMEOUT_MS,
};
pub use device::{
    BackendParams, ComputeParams, ConfigHandle, DeviceConfig, DeviceDescriptor, DeviceId,
    InputKind, PcieParams,
};
pub use dma::{KernelChannel, KernelDevice, RiffaDevice, TransferSpec};
pub use error::{DispatchError, Result};
pub use registry::DeviceRegistry;

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        BackendKind, ComputeParams, ConfigHandle, DeviceConfig, DeviceDescriptor, DeviceRegistry,
        DispatchError, InputKind, RegistryConfig, Result, SoftwareKmeans, SoftwarePlatform,
    };
}

//! Compute-offload collaborators
//!
//! - [`platform`]: vendor runtime discovery and queue creation
//! - [`kernel`]: the clustering kernel contract
//! - [`kmeans`]: host-CPU implementation of that contract
//! - [`input`]: feature-matrix staging from buffers and text files

pub mod input;
pub mod kernel;
pub mod kmeans;
pub mod platform;

pub use input::StagedInput;
pub use kernel::{ClusterKernel, ClusterOutput, ClusterRequest};
pub use kmeans::SoftwareKmeans;
pub use platform::{ComputeDeviceInfo, ComputePlatform, ExecutionQueue, PlatformInfo, SoftwarePlatform};

//! Device backend implementations
//!
//! Two backends:
//! - **Compute**: accelerators found through a vendor platform runtime,
//!   driven by a clustering kernel
//! - **PCIe**: boards behind the RIFFA-style DMA driver (`/dev/riffa`)

pub mod compute;
pub mod pcie;

pub use compute::ComputeBackend;
pub use pcie::{PcieBackend, RawTransfer};

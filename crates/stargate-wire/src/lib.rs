//! Wire model for the stargate device-dispatch layer.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the two fixed layouts the driver crate speaks:
//!
//! - the RIFFA-style PCIe DMA kernel interface (`/dev/riffa`), its ioctl
//!   request numbers and the `#[repr(C)]` records passed through them;
//! - the staged cluster-response buffer handed back to callers of a compute
//!   device.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`pcie`] | Device path, vendor ids, board-count limit, DMA word width |
//! | [`ioctl`] | Request numbers, `ChannelIo` transfer record, `BoardList` record |
//! | [`response`] | `[N][membership..][K*F][centers..]` response codec |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod ioctl;
pub mod pcie;
pub mod response;

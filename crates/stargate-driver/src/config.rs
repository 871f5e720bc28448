//! Registry configuration
//!
//! Defaults describe a host with one RIFFA-style DMA driver and a Xilinx
//! compute platform. Every field can be overridden in code or from the
//! environment:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `STARGATE_DEVICE_PATH` | `device_path` |
//! | `STARGATE_MAX_BOARDS` | `max_boards` |
//! | `STARGATE_COMPUTE_VENDOR` | `compute_vendor` |
//! | `STARGATE_PROBE_PATTERN` | `probe_pattern` |
//! | `STARGATE_SKIP_PROBE=1` | `probe_pattern = None` |
//! | `XCL_EMULATION_MODE`, `XCL_TARGET` | `emulation` |

use crate::device::ComputeParams;
use stargate_wire::pcie::{DEVICE_PATH, MAX_BOARDS};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Transfer timeout applied to freshly opened configs (ms)
pub const DEFAULT_TIMEOUT_MS: u64 = 2500;

/// Platform name the compute backend selects
pub const DEFAULT_COMPUTE_VENDOR: &str = "Xilinx";

/// `lspci` line that proves the compute board is installed
pub const DEFAULT_PROBE_PATTERN: &str = "Serial controller: Xilinx";

/// Registry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConfig {
    /// Kernel DMA device file
    pub device_path: PathBuf,

    /// Boards accepted from one LIST request (at most [`MAX_BOARDS`])
    pub max_boards: usize,

    /// Compute platform name to match during enumeration
    pub compute_vendor: String,

    /// Presence probe run before compute enumeration; `None` skips it
    pub probe_pattern: Option<String>,

    /// Parameters given to newly opened compute configs
    pub compute_defaults: ComputeParams,

    /// Compute platform execution mode
    pub emulation: EmulationMode,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from(DEVICE_PATH),
            max_boards: MAX_BOARDS,
            compute_vendor: DEFAULT_COMPUTE_VENDOR.to_string(),
            probe_pattern: Some(DEFAULT_PROBE_PATTERN.to_string()),
            compute_defaults: ComputeParams::default(),
            emulation: EmulationMode::Hardware,
        }
    }
}

impl RegistryConfig {
    /// Defaults overlaid with the process environment
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlay values found through `lookup` (an environment accessor)
    #[must_use]
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(path) = lookup("STARGATE_DEVICE_PATH") {
            self.device_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup("STARGATE_MAX_BOARDS") {
            match raw.trim().parse::<usize>() {
                Ok(n) => self = self.with_max_boards(n),
                Err(e) => warn!("Ignoring STARGATE_MAX_BOARDS={raw}: {e}"),
            }
        }
        if let Some(vendor) = lookup("STARGATE_COMPUTE_VENDOR") {
            self.compute_vendor = vendor;
        }
        if let Some(pattern) = lookup("STARGATE_PROBE_PATTERN") {
            self.probe_pattern = Some(pattern);
        }
        if lookup("STARGATE_SKIP_PROBE").is_some_and(|v| v == "1") {
            self.probe_pattern = None;
        }
        self.emulation = EmulationMode::detect(&lookup);

        debug!("Registry config: {self:?}");
        self
    }

    /// Use a different kernel device file
    #[must_use]
    pub fn with_device_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.device_path = path.into();
        self
    }

    /// Limit boards accepted from LIST, clamped to [`MAX_BOARDS`]
    #[must_use]
    pub fn with_max_boards(mut self, max_boards: usize) -> Self {
        if max_boards > MAX_BOARDS {
            warn!("max_boards {max_boards} exceeds LIST capacity, clamping to {MAX_BOARDS}");
        }
        self.max_boards = max_boards.min(MAX_BOARDS);
        self
    }

    /// Match a different compute platform name
    #[must_use]
    pub fn with_compute_vendor(mut self, vendor: impl Into<String>) -> Self {
        self.compute_vendor = vendor.into();
        self
    }

    /// Skip the compute presence probe
    #[must_use]
    pub fn without_probe(mut self) -> Self {
        self.probe_pattern = None;
        self
    }

    /// Parameters for newly opened compute configs
    #[must_use]
    pub fn with_compute_defaults(mut self, params: ComputeParams) -> Self {
        self.compute_defaults = params;
        self
    }
}

/// Compute platform execution mode
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EmulationMode {
    /// Real hardware
    #[default]
    Hardware,

    /// Software emulation of the kernel
    SoftwareEmulation,

    /// Named emulation target (`hw_emu`, ...)
    Target(String),
}

impl EmulationMode {
    /// Read `XCL_EMULATION_MODE` / `XCL_TARGET` through `lookup`
    ///
    /// `XCL_EMULATION_MODE=true` selects `XCL_TARGET`, or software emulation
    /// when no target is set; any other value names the mode directly.
    pub fn detect(lookup: impl Fn(&str) -> Option<String>) -> Self {
        match lookup("XCL_EMULATION_MODE").as_deref() {
            None => Self::Hardware,
            Some("true") => lookup("XCL_TARGET").map_or(Self::SoftwareEmulation, Self::parse),
            Some(mode) => Self::parse(mode.to_string()),
        }
    }

    fn parse(mode: String) -> Self {
        match mode.as_str() {
            "hw" => Self::Hardware,
            "sw_emu" => Self::SoftwareEmulation,
            _ => Self::Target(mode),
        }
    }

    /// Mode name as the platform tools spell it
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Hardware => "hw",
            Self::SoftwareEmulation => "sw_emu",
            Self::Target(t) => t,
        }
    }
}

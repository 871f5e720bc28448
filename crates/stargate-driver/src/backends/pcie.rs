//! PCIe DMA backend
//!
//! Serves boards reported by the kernel driver's LIST request. Board `i`
//! is logical id `device_offset + i`, where the offset is the number of ids
//! already claimed when enumeration ran.
//!
//! One kernel handle is shared by every open config: the first `open`
//! creates it and closing the last open config drops it.

use crate::backend::{BackendKind, DeviceBackend, RegistrationState};
use crate::device::{ConfigHandle, ConfigTable, DeviceConfig, DeviceDescriptor, DeviceId};
use crate::dma::{self, KernelChannel, KernelDevice, TransferSpec};
use crate::error::{DispatchError, Result};
use stargate_wire::pcie::{words_to_bytes, MAX_BOARDS};
use tracing::{debug, info, warn};

/// A transfer addressed by device and channel rather than through a config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawTransfer {
    /// DMA channel
    pub channel: u32,
    /// Length in 32-bit words
    pub words: u32,
    /// Destination offset in words (send only)
    pub dest_offset: u32,
    /// Last-transfer flag (send only)
    pub last: bool,
    /// Timeout in milliseconds
    pub timeout_ms: u64,
}

/// PCIe DMA backend
#[derive(Debug)]
pub struct PcieBackend {
    device: Box<dyn KernelDevice>,
    channel: Option<Box<dyn KernelChannel>>,
    state: RegistrationState,
    device_offset: usize,
    boards: Vec<DeviceDescriptor>,
    /// Driver-side board id per board index
    board_ids: Vec<usize>,
    configs: ConfigTable,
    max_boards: usize,
}

impl PcieBackend {
    /// Backend over `device`, accepting up to [`MAX_BOARDS`] boards
    #[must_use]
    pub fn new(device: Box<dyn KernelDevice>) -> Self {
        Self::with_max_boards(device, MAX_BOARDS)
    }

    /// Backend accepting at most `max_boards` boards from LIST
    #[must_use]
    pub fn with_max_boards(device: Box<dyn KernelDevice>, max_boards: usize) -> Self {
        Self {
            device,
            channel: None,
            state: RegistrationState::NotRegistered,
            device_offset: 0,
            boards: Vec::new(),
            board_ids: Vec::new(),
            configs: ConfigTable::default(),
            max_boards: max_boards.min(MAX_BOARDS),
        }
    }

    /// First logical id served by this backend
    #[must_use]
    pub const fn device_offset(&self) -> usize {
        self.device_offset
    }

    /// Whether the shared kernel handle is currently open
    #[must_use]
    pub const fn is_device_open(&self) -> bool {
        self.channel.is_some()
    }

    /// Number of live configs
    #[must_use]
    pub fn open_configs(&self) -> usize {
        self.configs.len()
    }

    /// Send on an open device without going through its config
    ///
    /// Returns bytes accepted.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `id` is not open, otherwise the same
    /// errors as a config-driven write.
    pub fn send_raw(&mut self, id: DeviceId, transfer: &RawTransfer, data: &[u8]) -> Result<usize> {
        let spec = self.raw_spec(id, transfer)?;
        let words = dma::send(self.open_channel()?, &spec, data)?;
        Ok(words_to_bytes(words))
    }

    /// Receive on an open device without going through its config
    ///
    /// Returns bytes received.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `id` is not open, otherwise the same
    /// errors as a config-driven read.
    pub fn receive_raw(
        &mut self,
        id: DeviceId,
        transfer: &RawTransfer,
        buffer: &mut [u8],
    ) -> Result<usize> {
        let spec = self.raw_spec(id, transfer)?;
        let words = dma::receive(self.open_channel()?, &spec, buffer)?;
        Ok(words_to_bytes(words))
    }

    fn raw_spec(&self, id: DeviceId, transfer: &RawTransfer) -> Result<TransferSpec> {
        let key = self.key(id).ok_or_else(|| self.unknown(id))?;
        if self.configs.get(key).is_none() {
            return Err(DispatchError::invalid_config(id, "device not open"));
        }
        self.check_channel(key, transfer.channel)?;
        Ok(TransferSpec {
            board: self.board_ids[key],
            channel: transfer.channel,
            words: transfer.words,
            dest_offset: transfer.dest_offset,
            last: transfer.last,
            timeout_ms: transfer.timeout_ms,
        })
    }

    fn key(&self, id: DeviceId) -> Option<usize> {
        id.checked_sub(self.device_offset)
            .filter(|&key| key < self.boards.len())
    }

    fn unknown(&self, id: DeviceId) -> DispatchError {
        DispatchError::UnknownDevice {
            id,
            count: self.device_offset + self.boards.len(),
        }
    }

    /// Live config behind `handle`, with its table key
    fn resolve(&self, handle: &ConfigHandle) -> Result<(usize, DeviceConfig)> {
        if handle.kind() != BackendKind::Pcie {
            return Err(DispatchError::invalid_config(
                handle.id(),
                format!("{} config given to the PCIe backend", handle.kind()),
            ));
        }
        let key = self
            .key(handle.id())
            .ok_or_else(|| DispatchError::invalid_config(handle.id(), "device not open"))?;
        self.configs.resolve(key, handle)?;
        let config = handle.snapshot();
        config.check_kind()?;
        Ok((key, config))
    }

    fn check_channel(&self, key: usize, channel: u32) -> Result<()> {
        let count = self.boards[key].channel_count;
        if channel < count {
            Ok(())
        } else {
            Err(DispatchError::invalid_argument(format!(
                "channel {channel} out of range, {} has {count}",
                self.boards[key].name
            )))
        }
    }

    fn open_channel(&mut self) -> Result<&mut (dyn KernelChannel + 'static)> {
        self.channel
            .as_deref_mut()
            .ok_or_else(|| DispatchError::invalid_state("DMA device not open"))
    }

    fn transfer_spec(
        &self,
        key: usize,
        channel: u32,
        config: &DeviceConfig,
        write: bool,
    ) -> Result<TransferSpec> {
        let params = config
            .pcie_params()
            .copied()
            .ok_or_else(|| DispatchError::invalid_config(config.id(), "missing PCIe parameters"))?;
        let (words, timeout_ms) = if write {
            (config.input_len, config.write_timeout_ms)
        } else {
            (config.output_len, config.read_timeout_ms)
        };
        Ok(TransferSpec {
            board: self.board_ids[key],
            channel,
            words,
            dest_offset: params.dest_offset,
            last: params.last,
            timeout_ms,
        })
    }
}

impl DeviceBackend for PcieBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Pcie
    }

    fn enumerate(&mut self, id_offset: usize) -> Result<Vec<DeviceDescriptor>> {
        if self.state.is_registered() {
            return Ok(self.boards.clone());
        }
        self.state = RegistrationState::Registered;
        self.device_offset = id_offset;

        let entries = dma::list_boards(&*self.device, self.max_boards)?;

        for entry in entries {
            let Ok(board_id) = usize::try_from(entry.local_id) else {
                warn!("Skipping board '{}' with id {}", entry.name, entry.local_id);
                continue;
            };
            let descriptor = DeviceDescriptor {
                id: id_offset + self.boards.len(),
                backend: BackendKind::Pcie,
                name: entry.name,
                channel_count: u32::try_from(entry.channel_count).unwrap_or(0),
                vendor_id: u32::try_from(entry.vendor_id).unwrap_or(0),
                device_id: u32::try_from(entry.device_id).unwrap_or(0),
                frequency_mhz: 0,
                global_memory_bytes: 0,
            };
            debug!(
                "Board {} -> id {}: {} ({} channels, {:04x}:{:04x})",
                board_id,
                descriptor.id,
                descriptor.name,
                descriptor.channel_count,
                descriptor.vendor_id,
                descriptor.device_id
            );
            self.board_ids.push(board_id);
            self.boards.push(descriptor);
        }

        info!(
            "PCIe backend: {} board(s) on {}",
            self.boards.len(),
            self.device.path().display()
        );
        Ok(self.boards.clone())
    }

    fn device_count(&self) -> usize {
        self.boards.len()
    }

    fn registration(&self) -> RegistrationState {
        self.state
    }

    fn open(&mut self, id: DeviceId) -> Result<ConfigHandle> {
        let key = self.key(id).ok_or_else(|| self.unknown(id))?;

        if self.channel.is_none() {
            self.channel = Some(self.device.open()?);
            debug!("Kernel handle opened for id {id}");
        }

        Ok(self.configs.open_or_insert(key, || DeviceConfig::pcie(id)))
    }

    fn configure(&mut self, id: DeviceId) -> Result<()> {
        let key = self.key(id).ok_or_else(|| self.unknown(id))?;
        let handle = self
            .configs
            .get(key)
            .ok_or_else(|| DispatchError::invalid_config(id, "device not open"))?;
        let config = handle.snapshot();
        config.check_kind()?;

        if config.write_timeout_ms == 0 || config.read_timeout_ms == 0 {
            return Err(DispatchError::invalid_config(id, "timeouts must be non-zero"));
        }
        debug!(
            "Configured id {id}: in={}w out={}w timeouts={}/{}ms",
            config.input_len, config.output_len, config.write_timeout_ms, config.read_timeout_ms
        );
        Ok(())
    }

    fn write(&mut self, config: &ConfigHandle, channel: u32, data: &[u8]) -> Result<usize> {
        let (key, snapshot) = self.resolve(config)?;
        self.check_channel(key, channel)?;
        let spec = self.transfer_spec(key, channel, &snapshot, true)?;
        let words = dma::send(self.open_channel()?, &spec, data)?;
        Ok(words_to_bytes(words))
    }

    fn read(&mut self, config: &ConfigHandle, channel: u32, buffer: &mut [u8]) -> Result<usize> {
        let (key, snapshot) = self.resolve(config)?;
        self.check_channel(key, channel)?;
        let spec = self.transfer_spec(key, channel, &snapshot, false)?;
        let words = dma::receive(self.open_channel()?, &spec, buffer)?;
        Ok(words_to_bytes(words))
    }

    fn reset(&mut self, config: &ConfigHandle) -> Result<()> {
        let (key, _) = self.resolve(config)?;
        let board = self.board_ids[key];
        dma::reset(self.open_channel()?, board)?;
        info!("Reset board {board} (id {})", config.id());
        Ok(())
    }

    fn close(&mut self, config: &ConfigHandle) -> Result<()> {
        let removed = self
            .key(config.id())
            .is_some_and(|key| self.configs.remove(key, config));
        if removed {
            debug!("Closed config for id {}", config.id());
        } else {
            debug!("Close of non-live config for id {} ignored", config.id());
        }

        if self.configs.is_empty() && self.channel.take().is_some() {
            debug!("Kernel handle released");
        }
        Ok(())
    }
}

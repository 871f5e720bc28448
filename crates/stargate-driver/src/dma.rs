//! DMA channel protocol
//!
//! Frames read, write, reset and list requests for the PCIe kernel driver
//! and decodes its integer results. Every request blocks until the driver
//! completes it or the request's own timeout elapses; nothing here retries.
//!
//! The transport is split in two so the protocol can run against a test
//! double:
//!
//! - [`KernelDevice`] opens the character device,
//! - [`KernelChannel`] is one open handle and issues raw requests.
//!
//! Dropping a channel closes the underlying file.

use crate::error::{DispatchError, Result};
use rustix::fs::OFlags;
use stargate_wire::ioctl::{
    BoardEntry, BoardList, ChannelIo, ListError, Transfer, IOCTL_LIST, IOCTL_RECV, IOCTL_RESET,
    IOCTL_SEND,
};
use stargate_wire::pcie::DMA_WORD_BYTES;
use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Opens handles to the kernel DMA device
pub trait KernelDevice: Debug + Send {
    /// Device file path (for diagnostics)
    fn path(&self) -> &Path;

    /// Open a new handle
    ///
    /// # Errors
    ///
    /// Returns `DeviceAbsent` if the device file cannot be opened.
    fn open(&self) -> Result<Box<dyn KernelChannel>>;
}

/// One open handle to the kernel DMA device
///
/// Methods return the driver's raw status: non-negative on success (words
/// transferred for send/recv), `-errno` on failure.
pub trait KernelChannel: Debug + Send {
    /// Issue SEND with `data` as the source buffer
    fn send(&mut self, transfer: &Transfer, data: &[u8]) -> i32;

    /// Issue RECV with `buffer` as the destination
    fn recv(&mut self, transfer: &Transfer, buffer: &mut [u8]) -> i32;

    /// Issue RESET for a board
    fn reset(&mut self, board: i32) -> i32;

    /// Issue LIST, filling `list`
    fn list(&mut self, list: &mut BoardList) -> i32;
}

/// The real `/dev/riffa`-style character device
#[derive(Debug, Clone)]
pub struct RiffaDevice {
    path: PathBuf,
}

impl RiffaDevice {
    /// Device at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl KernelDevice for RiffaDevice {
    fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<Box<dyn KernelChannel>> {
        // Flag bits are small positive values
        #[allow(clippy::cast_possible_wrap)]
        let sync_flag = OFlags::SYNC.bits() as i32;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(sync_flag)
            .open(&self.path)
            .map_err(|e| {
                tracing::debug!("Cannot open {}: {e}", self.path.display());
                DispatchError::DeviceAbsent {
                    path: self.path.clone(),
                }
            })?;

        tracing::debug!("Opened {}", self.path.display());
        Ok(Box::new(RiffaChannel { file }))
    }
}

/// Open handle to the real device
#[derive(Debug)]
struct RiffaChannel {
    file: File,
}

impl RiffaChannel {
    fn status(ret: libc::c_int) -> i32 {
        if ret < 0 {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO);
            -errno
        } else {
            ret
        }
    }
}

impl KernelChannel for RiffaChannel {
    fn send(&mut self, transfer: &Transfer, data: &[u8]) -> i32 {
        let mut io = ChannelIo::for_send(transfer, data);
        // SAFETY: SEND copies `io.len` words out of `io.data`. Invariants: (1) fd is open
        // for the lifetime of self.file; (2) `io` is a #[repr(C)] mirror of the driver's
        // record; (3) send() callers have checked data.len() >= len * 4, so the driver
        // never reads past the slice; (4) the slice outlives this blocking call.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), IOCTL_SEND as _, &raw mut io) };
        Self::status(ret)
    }

    fn recv(&mut self, transfer: &Transfer, buffer: &mut [u8]) -> i32 {
        let mut io = ChannelIo::for_recv(transfer, buffer);
        // SAFETY: RECV writes at most `io.len` words into `io.data`. Invariants: (1) fd is
        // open; (2) record layout matches the driver; (3) buffer.len() >= len * 4 is checked
        // by receive(); (4) the exclusive borrow of `buffer` spans the blocking call.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), IOCTL_RECV as _, &raw mut io) };
        Self::status(ret)
    }

    fn reset(&mut self, board: i32) -> i32 {
        // SAFETY: RESET takes the board id by value and touches no user memory.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), IOCTL_RESET as _, board) };
        Self::status(ret)
    }

    fn list(&mut self, list: &mut BoardList) -> i32 {
        // SAFETY: LIST fills one `fpga_info_list`. Invariants: (1) fd is open; (2) BoardList
        // is #[repr(C)] with the driver's fixed MAX_BOARDS-sized arrays; (3) the exclusive
        // borrow keeps the record alive and unaliased for the call.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), IOCTL_LIST as _, std::ptr::from_mut(list)) };
        Self::status(ret)
    }
}

/// Board-facing parameters of a transfer, before driver encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSpec {
    /// Board-local id
    pub board: usize,
    /// DMA channel
    pub channel: u32,
    /// Length in 32-bit words
    pub words: u32,
    /// Destination offset in words (send only)
    pub dest_offset: u32,
    /// Last-transfer flag (send only)
    pub last: bool,
    /// Timeout in milliseconds; must be non-zero
    pub timeout_ms: u64,
}

impl TransferSpec {
    fn encode(&self, buffer_len: usize) -> Result<Transfer> {
        if self.timeout_ms == 0 {
            return Err(DispatchError::invalid_argument(
                "timeout must be non-zero; the driver treats 0 as wait forever",
            ));
        }
        let needed = self.words as usize * DMA_WORD_BYTES;
        if buffer_len < needed {
            return Err(DispatchError::invalid_argument(format!(
                "buffer holds {buffer_len} bytes, transfer needs {needed}"
            )));
        }
        let board = i32::try_from(self.board)
            .map_err(|_| DispatchError::invalid_argument(format!("board id {}", self.board)))?;
        let channel = i32::try_from(self.channel)
            .map_err(|_| DispatchError::invalid_argument(format!("channel {}", self.channel)))?;

        Ok(Transfer {
            board,
            channel,
            words: self.words,
            offset: self.dest_offset,
            last: self.last,
            timeout_ms: self.timeout_ms,
        })
    }
}

/// Send `spec.words` words of `data`, returning words accepted
///
/// # Errors
///
/// Returns `InvalidArgument` if the request is malformed, or
/// `TransferFailure` with the driver's negative status.
pub fn send(channel: &mut dyn KernelChannel, spec: &TransferSpec, data: &[u8]) -> Result<usize> {
    let transfer = spec.encode(data.len())?;
    let status = channel.send(&transfer, data);
    words_or_failure(status, "send", spec)
}

/// Receive up to `spec.words` words into `buffer`, returning words received
///
/// Offset and last-flag are ignored for receives.
///
/// # Errors
///
/// Returns `InvalidArgument` if the request is malformed, or
/// `TransferFailure` with the driver's negative status.
pub fn receive(
    channel: &mut dyn KernelChannel,
    spec: &TransferSpec,
    buffer: &mut [u8],
) -> Result<usize> {
    let transfer = spec.encode(buffer.len())?;
    let status = channel.recv(&transfer, buffer);
    words_or_failure(status, "receive", spec)
}

/// Reset a board's channels
///
/// # Errors
///
/// Returns `TransferFailure` with the driver's negative status.
pub fn reset(channel: &mut dyn KernelChannel, board: usize) -> Result<()> {
    let board = i32::try_from(board)
        .map_err(|_| DispatchError::invalid_argument(format!("board id {board}")))?;
    let status = channel.reset(board);
    if status < 0 {
        tracing::warn!("Reset of board {board} failed: status {status}");
        return Err(DispatchError::TransferFailure { code: status });
    }
    Ok(())
}

/// Enumerate attached boards, keeping at most `max_boards`
///
/// Opens the device only for the duration of the call. A device file that
/// cannot be opened means no boards are installed and yields an empty list.
///
/// # Errors
///
/// Returns `EnumerationFailure` if LIST fails, or `TooManyBoards` if the
/// driver reports more boards than supported.
pub fn list_boards(device: &dyn KernelDevice, max_boards: usize) -> Result<Vec<BoardEntry>> {
    let mut channel = match device.open() {
        Ok(channel) => channel,
        Err(DispatchError::DeviceAbsent { path }) => {
            tracing::info!("No DMA device at {}, assuming no boards", path.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };

    let mut list = BoardList::default();
    let status = channel.list(&mut list);
    drop(channel);

    if status < 0 {
        return Err(DispatchError::enumeration_failure(
            crate::backend::BackendKind::Pcie,
            format!("LIST returned {status}"),
        ));
    }

    let boards = list.boards().map_err(|e| match e {
        ListError::TooMany { reported, max } => DispatchError::TooManyBoards { reported, max },
        ListError::NegativeCount(_) => {
            DispatchError::enumeration_failure(crate::backend::BackendKind::Pcie, e.to_string())
        }
    })?;

    if boards.len() > max_boards {
        return Err(DispatchError::TooManyBoards {
            reported: i32::try_from(boards.len()).unwrap_or(i32::MAX),
            max: max_boards,
        });
    }

    Ok(boards)
}

fn words_or_failure(status: i32, op: &str, spec: &TransferSpec) -> Result<usize> {
    match usize::try_from(status) {
        Ok(words) => {
            tracing::trace!(
                "{op} board {} chnl {}: {words}/{} words",
                spec.board,
                spec.channel,
                spec.words
            );
            Ok(words)
        }
        Err(_) => {
            tracing::warn!(
                "{op} board {} chnl {} failed: status {status} (timeout {}ms)",
                spec.board,
                spec.channel,
                spec.timeout_ms
            );
            Err(DispatchError::TransferFailure { code: status })
        }
    }
}

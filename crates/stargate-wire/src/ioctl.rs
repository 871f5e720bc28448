//! Kernel request numbers and the records passed through them.
//!
//! Layouts mirror the driver's C structs field for field; every record is
//! `#[repr(C)]` so its address can be handed to `ioctl(2)` directly.
//!
//! | Request | Direction | Argument |
//! |---------|-----------|----------|
//! | `SEND`  | write | `*mut ChannelIo` |
//! | `RECV`  | read  | `*mut ChannelIo` |
//! | `LIST`  | read  | `*mut BoardList` |
//! | `RESET` | write | board id by value |

use crate::pcie::{BOARD_NAME_LEN, MAJOR_NUM, MAX_BOARDS};
use std::fmt;
use std::os::raw::c_ulong;

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;
const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;

const IOC_WRITE: c_ulong = 1;
const IOC_READ: c_ulong = 2;

/// `_IOC(dir, type, nr, size)` from the generic Linux ioctl encoding.
#[must_use]
pub const fn ioc(dir: c_ulong, ty: u8, nr: u8, size: usize) -> c_ulong {
    (dir << IOC_DIRSHIFT)
        | ((size as c_ulong) << IOC_SIZESHIFT)
        | ((ty as c_ulong) << IOC_TYPESHIFT)
        | ((nr as c_ulong) << IOC_NRSHIFT)
}

/// `_IOW(type, nr, T)`.
#[must_use]
pub const fn iow(ty: u8, nr: u8, size: usize) -> c_ulong {
    ioc(IOC_WRITE, ty, nr, size)
}

/// `_IOR(type, nr, T)`.
#[must_use]
pub const fn ior(ty: u8, nr: u8, size: usize) -> c_ulong {
    ioc(IOC_READ, ty, nr, size)
}

// The driver header declares SEND/RECV/LIST with a pointer type as the size
// argument, so the encoded size is the pointer width, not the record size.
const PTR_SIZE: usize = std::mem::size_of::<usize>();

/// Host → board transfer.
pub const IOCTL_SEND: c_ulong = iow(MAJOR_NUM, 1, PTR_SIZE);
/// Board → host transfer.
pub const IOCTL_RECV: c_ulong = ior(MAJOR_NUM, 2, PTR_SIZE);
/// Enumerate attached boards.
pub const IOCTL_LIST: c_ulong = ior(MAJOR_NUM, 3, PTR_SIZE);
/// Reset one board's channels.
pub const IOCTL_RESET: c_ulong = iow(MAJOR_NUM, 4, std::mem::size_of::<i32>());

/// Parameters of one channel transfer, in the driver's own units.
///
/// `words` and `offset` count 32-bit words. `timeout_ms == 0` means "wait
/// forever" to the driver; callers in this workspace never issue that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    /// Board-local id as reported by LIST.
    pub board: i32,
    /// DMA channel on that board.
    pub channel: i32,
    /// Transfer length in words.
    pub words: u32,
    /// Destination offset in words (send only).
    pub offset: u32,
    /// Marks the final transfer of a transaction (send only).
    pub last: bool,
    /// Kernel-side timeout in milliseconds.
    pub timeout_ms: u64,
}

/// `struct fpga_chnl_io`.
#[repr(C)]
#[derive(Debug)]
pub struct ChannelIo {
    /// Board-local id.
    pub id: i32,
    /// Channel number.
    pub chnl: i32,
    /// Length in words.
    pub len: u32,
    /// Destination offset in words.
    pub offset: u32,
    /// Last-transfer flag, 0 or 1.
    pub last: u32,
    /// Timeout in milliseconds.
    pub timeout: u64,
    /// User buffer the driver reads from (SEND) or fills (RECV).
    pub data: *mut u8,
}

impl ChannelIo {
    /// Build a SEND record pointing at `data`.
    ///
    /// The driver only reads through the pointer for SEND.
    #[must_use]
    pub fn for_send(transfer: &Transfer, data: &[u8]) -> Self {
        Self {
            id: transfer.board,
            chnl: transfer.channel,
            len: transfer.words,
            offset: transfer.offset,
            last: u32::from(transfer.last),
            timeout: transfer.timeout_ms,
            data: data.as_ptr().cast_mut(),
        }
    }

    /// Build a RECV record pointing at `buffer`.
    ///
    /// Offset and last-flag are unused by RECV and sent as zero.
    #[must_use]
    pub fn for_recv(transfer: &Transfer, buffer: &mut [u8]) -> Self {
        Self {
            id: transfer.board,
            chnl: transfer.channel,
            len: transfer.words,
            offset: 0,
            last: 0,
            timeout: transfer.timeout_ms,
            data: buffer.as_mut_ptr(),
        }
    }
}

/// `struct fpga_info_list`, filled by LIST.
#[repr(C)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardList {
    /// Number of valid entries.
    pub num_fpgas: i32,
    /// Board-local ids.
    pub id: [i32; MAX_BOARDS],
    /// Channels per board.
    pub num_chnls: [i32; MAX_BOARDS],
    /// NUL-padded board names.
    pub name: [[u8; BOARD_NAME_LEN]; MAX_BOARDS],
    /// PCI vendor ids.
    pub vendor_id: [i32; MAX_BOARDS],
    /// PCI device ids.
    pub device_id: [i32; MAX_BOARDS],
}

/// One decoded LIST entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardEntry {
    /// Board-local id.
    pub local_id: i32,
    /// Board name.
    pub name: String,
    /// Number of DMA channels.
    pub channel_count: i32,
    /// PCI vendor id.
    pub vendor_id: i32,
    /// PCI device id.
    pub device_id: i32,
}

/// A LIST record that cannot be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListError {
    /// The driver reported a negative board count.
    NegativeCount(i32),
    /// The driver reported more boards than the record can carry.
    TooMany {
        /// Count the driver reported.
        reported: i32,
        /// Capacity of the record.
        max: usize,
    },
}

impl fmt::Display for ListError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NegativeCount(n) => write!(f, "driver reported {n} boards"),
            Self::TooMany { reported, max } => {
                write!(f, "driver reported {reported} boards, record holds {max}")
            }
        }
    }
}

impl std::error::Error for ListError {}

impl BoardList {
    /// Decode the valid entries, bounded by [`MAX_BOARDS`].
    ///
    /// # Errors
    ///
    /// Returns [`ListError`] if `num_fpgas` is negative or exceeds the
    /// record capacity.
    pub fn boards(&self) -> Result<Vec<BoardEntry>, ListError> {
        let count = usize::try_from(self.num_fpgas)
            .map_err(|_| ListError::NegativeCount(self.num_fpgas))?;
        if count > MAX_BOARDS {
            return Err(ListError::TooMany {
                reported: self.num_fpgas,
                max: MAX_BOARDS,
            });
        }

        Ok((0..count)
            .map(|i| BoardEntry {
                local_id: self.id[i],
                name: decode_name(&self.name[i]),
                channel_count: self.num_chnls[i],
                vendor_id: self.vendor_id[i],
                device_id: self.device_id[i],
            })
            .collect())
    }

    /// Fill entry `index` (used by drivers and test doubles).
    ///
    /// Names longer than the field are truncated; one byte is always kept
    /// for the terminating NUL.
    pub fn set_entry(&mut self, index: usize, entry: &BoardEntry) {
        self.id[index] = entry.local_id;
        self.num_chnls[index] = entry.channel_count;
        self.vendor_id[index] = entry.vendor_id;
        self.device_id[index] = entry.device_id;

        let mut name = [0u8; BOARD_NAME_LEN];
        let bytes = entry.name.as_bytes();
        let n = bytes.len().min(BOARD_NAME_LEN - 1);
        name[..n].copy_from_slice(&bytes[..n]);
        self.name[index] = name;
    }
}

fn decode_name(raw: &[u8; BOARD_NAME_LEN]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(BOARD_NAME_LEN);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

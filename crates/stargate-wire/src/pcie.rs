//! PCIe identifiers and kernel-interface constants.

/// Character device exposed by the DMA kernel driver.
pub const DEVICE_PATH: &str = "/dev/riffa";

/// Major number the kernel driver registers its ioctls under.
pub const MAJOR_NUM: u8 = 100;

/// Maximum number of boards the driver reports in one LIST request.
///
/// The LIST record is fixed-size; a driver reporting more than this is
/// rejected rather than truncated.
pub const MAX_BOARDS: usize = 5;

/// Width of the board-name field in the LIST record, NUL padded.
pub const BOARD_NAME_LEN: usize = 16;

/// The driver counts transfer lengths and offsets in 32-bit words.
pub const DMA_WORD_BYTES: usize = 4;

/// Errno the driver reports when a transfer exceeds its timeout.
pub const ETIMEDOUT: i32 = 110;

/// Vendor ids of the FPGA families the driver binds to.
pub mod vendor_id {
    /// Xilinx (PCI-SIG assigned).
    pub const XILINX: u16 = 0x10EE;
    /// Altera / Intel PSG (PCI-SIG assigned).
    pub const ALTERA: u16 = 0x1172;
}

/// All vendor ids the kernel driver claims.
pub const ALL_VENDOR_IDS: &[u16] = &[vendor_id::XILINX, vendor_id::ALTERA];

/// Human-readable vendor name for a PCI vendor id.
#[must_use]
pub const fn vendor_name(id: u16) -> &'static str {
    match id {
        vendor_id::XILINX => "Xilinx",
        vendor_id::ALTERA => "Altera",
        _ => "Unknown",
    }
}

/// Convert a word count reported by the driver into bytes.
#[must_use]
pub const fn words_to_bytes(words: usize) -> usize {
    words * DMA_WORD_BYTES
}

/// Number of whole words that fit in `bytes`.
#[must_use]
pub const fn bytes_to_words(bytes: usize) -> usize {
    bytes / DMA_WORD_BYTES
}

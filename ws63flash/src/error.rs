//! Error types for ws63flash.

use std::io;
use thiserror::Error;

/// Result type for ws63flash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for ws63flash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Package file too small to hold the fixed header.
    #[error("Invalid FWPKG: file too small for header")]
    HeaderTruncated,

    /// Package magic number mismatch.
    #[error("Invalid FWPKG: bad magic {found:#010X}")]
    BadMagic {
        /// Magic value found in the file.
        found: u32,
    },

    /// Package declares more entries than the format allows.
    #[error("Invalid FWPKG: {count} entries (max 16)")]
    TooManyEntries {
        /// Declared entry count.
        count: u16,
    },

    /// Package file ends inside an entry record or an image payload.
    #[error("Invalid FWPKG: entry {index} truncated")]
    EntryTruncated {
        /// Index of the truncated entry.
        index: usize,
    },

    /// Entry name is not valid UTF-8.
    #[error("Invalid FWPKG: entry {index} name is not valid UTF-8")]
    NameEncoding {
        /// Index of the offending entry.
        index: usize,
    },

    /// CRC checksum mismatch in the package header.
    #[error("CRC mismatch: expected {expected:#06X}, got {actual:#06X}")]
    CrcMismatch {
        /// Stored CRC value.
        expected: u16,
        /// Computed CRC value.
        actual: u16,
    },

    /// No LoaderBoot entry in the package.
    #[error("No LoaderBoot image in package")]
    NoLoader,

    /// Device never acknowledged the handshake.
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// No complete command frame arrived within the deadline.
    #[error("Timed out waiting for a command frame")]
    FrameTimeout,

    /// Received frame failed its CRC check.
    #[error("Frame CRC mismatch: expected {expected:#06X}, got {actual:#06X}")]
    FrameBadCrc {
        /// CRC carried by the frame.
        expected: u16,
        /// CRC computed over the frame body.
        actual: u16,
    },

    /// Received frame failed the inverted-command check.
    #[error("Frame inverted-command mismatch: cmd {cmd:#04X}, inverse {inv:#04X}")]
    FrameBadCmdInv {
        /// Command byte.
        cmd: u8,
        /// Inverted command byte as received.
        inv: u8,
    },

    /// Receiver never requested CRC mode ('C').
    #[error("Timed out waiting for 'C'")]
    CWaitTimeout,

    /// A YMODEM block was never acknowledged within its deadline.
    #[error("YMODEM block {0} timed out")]
    BlockTimeout(u32),

    /// The YMODEM finish block was never acknowledged.
    #[error("YMODEM finish block failed")]
    FinishFailed,
}

impl Error {
    /// Whether this error is a frame-integrity warning that phases which
    /// merely await an optional device reply may log and tolerate.
    #[must_use]
    pub fn is_frame_warning(&self) -> bool {
        matches!(self, Self::FrameBadCrc { .. } | Self::FrameBadCmdInv { .. })
    }
}

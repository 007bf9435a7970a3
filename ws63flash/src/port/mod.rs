//! Port abstraction for serial communication.
//!
//! The protocol layers (frame, ymodem, flasher) speak to the device
//! through the [`Port`] trait: an ordered byte stream with non-blocking
//! reads, a settable baud rate, and RTS control. The production
//! implementation wraps the `serialport` crate; tests substitute scripted
//! in-memory ports.
//!
//! All reads here are non-blocking. The protocol layers own every
//! deadline and enforce them by polling with short sleeps, which keeps
//! the strict turn-taking of the boot ROM protocol single-threaded.

pub mod native;

use std::time::Duration;

use crate::error::Result;

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Driver-level read/write timeout.
    pub timeout: Duration,
    /// Data bits (the boot ROM expects 8).
    pub data_bits: DataBits,
    /// Parity (the boot ROM expects none).
    pub parity: Parity,
    /// Stop bits (the boot ROM expects one).
    pub stop_bits: StopBits,
    /// Flow control (the boot ROM expects none).
    pub flow_control: FlowControl,
    /// RTS level right after opening. The WS63 boot ROM only talks when
    /// RTS is de-asserted.
    pub rts_on_open: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115_200,
            timeout: Duration::from_millis(1000),
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            rts_on_open: false,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the driver-level timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 5 data bits.
    Five,
    /// 6 data bits.
    Six,
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
    /// Software flow control (XON/XOFF).
    Software,
}

/// Byte-stream interface to the device.
pub trait Port: Send {
    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Set the baud rate.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Set the RTS (Request To Send) pin state.
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Write all bytes, blocking until the driver accepted them.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Number of bytes buffered on the receive side.
    fn bytes_available(&mut self) -> Result<usize>;

    /// Drain and return whatever is currently buffered, without blocking.
    fn read_available(&mut self) -> Result<Vec<u8>>;

    /// Read one buffered byte, or `None` if the line is idle.
    fn read_byte(&mut self) -> Result<Option<u8>>;

    /// Discard driver input/output buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Close the port and release resources.
    ///
    /// Further I/O after closing fails.
    fn close(&mut self) -> Result<()>;
}

// Re-export the production implementation.
pub use native::NativePort;

//! # ws63flash
//!
//! A library for flashing WS63-class chips over a serial (UART) link.
//!
//! This crate provides the building blocks for talking to the WS63 boot
//! ROM:
//!
//! - FWPKG firmware package parsing
//! - Boot ROM command framing and handshake/baud negotiation
//! - YMODEM-CRC file transfer (sender side)
//! - CRC16-XMODEM checksum calculation
//!
//! ## Example
//!
//! ```rust,no_run
//! use ws63flash::{Fwpkg, Ws63Flasher};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Parse and validate the firmware package
//!     let fwpkg = Fwpkg::from_file("firmware.fwpkg")?;
//!
//!     // Flash it: handshake, LoaderBoot, every image, reset
//!     let mut flasher = Ws63Flasher::open("/dev/ttyUSB0", 921600)?;
//!     flasher.run(&fwpkg, |name, current, total| {
//!         println!("Sending {name}: {current}/{total}");
//!     })?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod flasher;
pub mod image;
pub mod port;
pub mod protocol;

// Re-exports for convenience
pub use {
    error::{Error, Result},
    flasher::{erase_extent, FlashConfig, Ws63Flasher, DEFAULT_BAUD},
    image::fwpkg::{BinInfo, Fwpkg, FwpkgHeader, ImageKind},
    port::{NativePort, Port, SerialConfig},
    protocol::frame::{contains_handshake_ack, Command, CommandFrame, Frame, FrameDecoder},
    protocol::ymodem::YmodemConfig,
};

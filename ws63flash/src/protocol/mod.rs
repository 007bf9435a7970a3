//! Protocol implementations.

pub mod crc;
pub mod frame;
pub mod ymodem;

// Re-export common types
pub use frame::{contains_handshake_ack, Command, CommandFrame, Frame, FrameDecoder};

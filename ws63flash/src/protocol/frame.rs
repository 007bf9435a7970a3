//! WS63 boot protocol command frames.
//!
//! Every command and reply on the wire uses the same shape:
//!
//! ```text
//! +------------+--------+-----+------+---------------+--------+
//! |   Magic    | Length | CMD | ~CMD |    Payload    | CRC16  |
//! +------------+--------+-----+------+---------------+--------+
//! |   4 bytes  | 2 bytes| 1   | 1    |   variable    | 2 bytes|
//! +------------+--------+-----+------+---------------+--------+
//! | 0xDEADBEEF |  total | cmd | ~cmd |     data      | CRC    |
//! +------------+--------+-----+------+---------------+--------+
//! ```
//!
//! The length field counts the whole frame including magic and CRC, the
//! inverted command byte is `cmd ^ 0xFF`, and the trailing CRC16-XMODEM
//! (little-endian) covers everything before it.

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::crc::crc16_xmodem;
use byteorder::{LittleEndian, WriteBytesExt};
use log::{trace, warn};
use std::time::{Duration, Instant};

/// Frame magic number.
pub const FRAME_MAGIC: u32 = 0xDEAD_BEEF;

/// Frame magic as it appears on the wire (little-endian).
pub const FRAME_MAGIC_BYTES: [u8; 4] = [0xEF, 0xBE, 0xAD, 0xDE];

/// Minimum frame size: magic(4) + len(2) + cmd(1) + ~cmd(1) + crc(2).
pub const MIN_FRAME_LEN: usize = 10;

/// Largest reply frame the receiver accepts (1024-byte payload + framing).
/// Longer length fields are treated as line noise and resynchronized.
pub const MAX_FRAME_LEN: usize = 1036;

/// Default deadline for receiving a complete frame.
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval while waiting for bytes.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Handshake ACK prefix (first 8 bytes of the boot ROM's reply).
/// Finding this anywhere in the read buffer means the handshake took.
pub const HANDSHAKE_ACK_PREFIX: [u8; 8] = [0xEF, 0xBE, 0xAD, 0xDE, 0x0C, 0x00, 0xE1, 0x1E];

/// WS63 command types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Handshake command (establish connection, negotiate baud).
    Handshake = 0xF0,
    /// Download command (announce flash address and erase extent).
    Download = 0xD2,
    /// Reset command.
    Reset = 0x87,
}

impl Command {
    /// Get the inverted command byte (`cmd ^ 0xFF`).
    #[must_use]
    pub fn inverted(self) -> u8 {
        !(self as u8)
    }
}

/// Command frame builder.
#[derive(Debug)]
pub struct CommandFrame {
    cmd: Command,
    data: Vec<u8>,
}

impl CommandFrame {
    /// Create a new frame with an empty payload.
    pub fn new(cmd: Command) -> Self {
        Self {
            cmd,
            data: Vec::new(),
        }
    }

    /// Create a handshake command frame.
    ///
    /// Payload: baud(4, LE) + data bits(1=8) + stop bits(1=1) + parity(1=0)
    /// + flow control(1=0). The boot ROM switches to `baud` after ACKing.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn handshake(baud: u32) -> Self {
        let mut frame = Self::new(Command::Handshake);
        frame.data.write_u32::<LittleEndian>(baud).unwrap();
        frame.data.push(8); // DataBits = 8
        frame.data.push(1); // StopBits = 1
        frame.data.push(0); // Parity = None
        frame.data.push(0); // FlowCtrl = None
        frame
    }

    /// Create a download command frame.
    ///
    /// Payload: flash address(4) + data length(4) + erase extent(4) +
    /// formal(1=0x00) + ~formal(1=0xFF), all little-endian.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn download(addr: u32, len: u32, erase_size: u32) -> Self {
        let mut frame = Self::new(Command::Download);
        frame.data.write_u32::<LittleEndian>(addr).unwrap();
        frame.data.write_u32::<LittleEndian>(len).unwrap();
        frame.data.write_u32::<LittleEndian>(erase_size).unwrap();
        frame.data.extend_from_slice(&[0x00, 0xFF]);
        frame
    }

    /// Create a reset command frame.
    pub fn reset() -> Self {
        let mut frame = Self::new(Command::Reset);
        frame.data.extend_from_slice(&[0x00, 0x00]);
        frame
    }

    /// Build the complete wire form of the frame.
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn build(&self) -> Vec<u8> {
        let total_len = MIN_FRAME_LEN + self.data.len();
        let mut buf = Vec::with_capacity(total_len);

        buf.write_u32::<LittleEndian>(FRAME_MAGIC).unwrap();
        // Safe cast, frame size < 64KB
        buf.write_u16::<LittleEndian>(total_len as u16).unwrap();
        buf.push(self.cmd as u8);
        buf.push(self.cmd.inverted());
        buf.extend_from_slice(&self.data);

        let crc = crc16_xmodem(&buf);
        buf.write_u16::<LittleEndian>(crc).unwrap();

        buf
    }

    /// Get the command type.
    pub fn command(&self) -> Command {
        self.cmd
    }
}

/// A decoded reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command byte.
    pub cmd: u8,
    /// Payload bytes (between `~cmd` and the CRC).
    pub payload: Vec<u8>,
}

/// Incremental frame decoder.
///
/// Scans the byte stream for the magic sequence, then collects the body
/// once the length field is known. Length fields outside
/// `[MIN_FRAME_LEN, MAX_FRAME_LEN]` drop the decoder back to scanning.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    total_len: usize,
}

impl FrameDecoder {
    /// Create a decoder in the scanning state.
    pub fn new() -> Self {
        Self::default()
    }

    fn resync(&mut self) {
        self.buf.clear();
        self.total_len = 0;
    }

    /// Feed one byte; returns a decode outcome once a full frame is held.
    ///
    /// A returned `Err` reports a frame that arrived complete but failed
    /// its inverted-command or CRC check; the decoder is ready to scan for
    /// the next frame either way.
    pub fn feed(&mut self, byte: u8) -> Option<Result<Frame>> {
        if self.buf.len() < FRAME_MAGIC_BYTES.len() {
            // Magic sync: mismatches restart the scan, re-testing the byte
            // as a possible start of the magic sequence.
            if byte == FRAME_MAGIC_BYTES[self.buf.len()] {
                self.buf.push(byte);
            } else {
                self.resync();
                if byte == FRAME_MAGIC_BYTES[0] {
                    self.buf.push(byte);
                }
            }
            return None;
        }

        self.buf.push(byte);

        if self.buf.len() == 6 {
            self.total_len = usize::from(u16::from_le_bytes([self.buf[4], self.buf[5]]));
            if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&self.total_len) {
                warn!("Discarding frame with length field {}", self.total_len);
                self.resync();
            }
            return None;
        }

        if self.buf.len() < self.total_len {
            return None;
        }

        let frame = std::mem::take(&mut self.buf);
        self.total_len = 0;
        Some(Self::check(&frame))
    }

    fn check(frame: &[u8]) -> Result<Frame> {
        let cmd = frame[6];
        let inv = frame[7];
        if inv != cmd ^ 0xFF {
            return Err(Error::FrameBadCmdInv { cmd, inv });
        }

        let crc_pos = frame.len() - 2;
        let expected = u16::from_le_bytes([frame[crc_pos], frame[crc_pos + 1]]);
        let actual = crc16_xmodem(&frame[..crc_pos]);
        if expected != actual {
            return Err(Error::FrameBadCrc { expected, actual });
        }

        Ok(Frame {
            cmd,
            payload: frame[8..crc_pos].to_vec(),
        })
    }
}

/// Receive one frame from the port.
///
/// Polls for bytes until a complete frame decodes or `timeout` passes
/// with the stream idle; every received byte refreshes the deadline.
/// Integrity failures surface as [`Error::FrameBadCrc`] /
/// [`Error::FrameBadCmdInv`] so callers can decide whether to tolerate
/// them.
pub fn receive_frame<P: Port>(port: &mut P, timeout: Duration) -> Result<Frame> {
    let mut decoder = FrameDecoder::new();
    let mut deadline = Instant::now() + timeout;

    loop {
        match port.read_byte()? {
            Some(byte) => {
                deadline = Instant::now() + timeout;
                if let Some(outcome) = decoder.feed(byte) {
                    if let Ok(ref frame) = outcome {
                        trace!(
                            "Received frame: cmd {:#04X}, {} payload bytes",
                            frame.cmd,
                            frame.payload.len()
                        );
                    }
                    return outcome;
                }
            }
            None => {
                if Instant::now() >= deadline {
                    return Err(Error::FrameTimeout);
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

/// Check if data contains the handshake ACK prefix.
pub fn contains_handshake_ack(data: &[u8]) -> bool {
    data.len() >= HANDSHAKE_ACK_PREFIX.len()
        && data
            .windows(HANDSHAKE_ACK_PREFIX.len())
            .any(|w| w == HANDSHAKE_ACK_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut FrameDecoder, bytes: &[u8]) -> Vec<Result<Frame>> {
        let mut out = Vec::new();
        for &b in bytes {
            if let Some(outcome) = decoder.feed(b) {
                out.push(outcome);
            }
        }
        out
    }

    #[test]
    fn test_command_inverted() {
        assert_eq!(Command::Handshake.inverted(), 0x0F);
        assert_eq!(Command::Download.inverted(), 0x2D);
        assert_eq!(Command::Reset.inverted(), 0x78);
    }

    #[test]
    fn test_handshake_frame_golden_bytes() {
        // 921600 baud (0x000E1000), pinned against the boot ROM.
        let data = CommandFrame::handshake(921_600).build();
        assert_eq!(
            data,
            [
                0xEF, 0xBE, 0xAD, 0xDE, 0x12, 0x00, 0xF0, 0x0F, 0x00, 0x10, 0x0E, 0x00, 0x08,
                0x01, 0x00, 0x00, 0x6E, 0x80
            ]
        );
    }

    #[test]
    fn test_download_frame_layout() {
        let data = CommandFrame::download(0x0080_0000, 0x1000, 0x2000).build();
        assert_eq!(data.len(), 24);
        assert_eq!(&data[0..4], &FRAME_MAGIC_BYTES);
        assert_eq!(&data[4..6], &[0x18, 0x00]);
        assert_eq!(data[6], 0xD2);
        assert_eq!(data[7], 0x2D);
        assert_eq!(&data[8..12], &[0x00, 0x00, 0x80, 0x00]);
        assert_eq!(&data[16..20], &[0x00, 0x20, 0x00, 0x00]);
        assert_eq!(&data[20..22], &[0x00, 0xFF]);
    }

    #[test]
    fn test_reset_frame_golden_bytes() {
        let data = CommandFrame::reset().build();
        assert_eq!(
            data,
            [0xEF, 0xBE, 0xAD, 0xDE, 0x0C, 0x00, 0x87, 0x78, 0x00, 0x00, 0x61, 0x94]
        );
    }

    #[test]
    fn test_frame_length_field_matches_actual() {
        let data = CommandFrame::handshake(115_200).build();
        let len_field = u16::from_le_bytes([data[4], data[5]]) as usize;
        assert_eq!(len_field, data.len());
    }

    #[test]
    fn test_frame_crc_trailer_property() {
        for frame in [
            CommandFrame::handshake(921_600).build(),
            CommandFrame::download(0x0023_0000, 0x4_4000, 0x4_4000).build(),
            CommandFrame::reset().build(),
        ] {
            let crc_pos = frame.len() - 2;
            let stored = u16::from_le_bytes([frame[crc_pos], frame[crc_pos + 1]]);
            assert_eq!(stored, crc16_xmodem(&frame[..crc_pos]));
            assert_eq!(frame[6] ^ frame[7], 0xFF);
        }
    }

    #[test]
    fn test_decode_encoded_frame() {
        let wire = CommandFrame::download(0x0080_0000, 64, 0x2000).build();
        let mut decoder = FrameDecoder::new();
        let frames = decode_all(&mut decoder, &wire);
        assert_eq!(frames.len(), 1);
        let frame = frames[0].as_ref().unwrap();
        assert_eq!(frame.cmd, 0xD2);
        assert_eq!(frame.payload, wire[8..wire.len() - 2]);
    }

    #[test]
    fn test_decode_skips_leading_garbage() {
        let mut wire = vec![0x00, 0x43, 0xEF, 0x12];
        wire.extend_from_slice(&CommandFrame::reset().build());
        let mut decoder = FrameDecoder::new();
        let frames = decode_all(&mut decoder, &wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap().cmd, 0x87);
    }

    #[test]
    fn test_decode_resyncs_on_repeated_magic_prefix() {
        // An extra 0xEF before a genuine frame must not lose it.
        let mut wire = vec![0xEF];
        wire.extend_from_slice(&CommandFrame::reset().build());
        let mut decoder = FrameDecoder::new();
        let frames = decode_all(&mut decoder, &wire);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_decode_rejects_bad_cmd_inv() {
        let mut wire = CommandFrame::reset().build();
        wire[7] = 0x00;
        let crc_pos = wire.len() - 2;
        let crc = crc16_xmodem(&wire[..crc_pos]);
        wire[crc_pos..].copy_from_slice(&crc.to_le_bytes());

        let mut decoder = FrameDecoder::new();
        let frames = decode_all(&mut decoder, &wire);
        assert!(matches!(
            frames[0],
            Err(Error::FrameBadCmdInv { cmd: 0x87, inv: 0x00 })
        ));
    }

    #[test]
    fn test_decode_rejects_bad_crc() {
        let mut wire = CommandFrame::reset().build();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        let mut decoder = FrameDecoder::new();
        let frames = decode_all(&mut decoder, &wire);
        assert!(matches!(frames[0], Err(Error::FrameBadCrc { .. })));
    }

    #[test]
    fn test_decode_resyncs_on_oversize_length() {
        // Magic followed by an absurd length field, then a real frame.
        let mut wire = vec![0xEF, 0xBE, 0xAD, 0xDE, 0xFF, 0xFF];
        wire.extend_from_slice(&CommandFrame::reset().build());
        let mut decoder = FrameDecoder::new();
        let frames = decode_all(&mut decoder, &wire);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_ok());
    }

    #[test]
    fn test_decoder_reusable_across_frames() {
        let mut wire = CommandFrame::reset().build();
        wire.extend_from_slice(&CommandFrame::handshake(921_600).build());
        let mut decoder = FrameDecoder::new();
        let frames = decode_all(&mut decoder, &wire);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref().unwrap().cmd, 0x87);
        assert_eq!(frames[1].as_ref().unwrap().cmd, 0xF0);
    }

    #[test]
    fn test_contains_handshake_ack() {
        assert!(contains_handshake_ack(&HANDSHAKE_ACK_PREFIX));

        let mut data = vec![0x00, 0x43];
        data.extend_from_slice(&HANDSHAKE_ACK_PREFIX);
        data.extend_from_slice(&[0x5A, 0x00, 0x95, 0x22]);
        assert!(contains_handshake_ack(&data));

        assert!(!contains_handshake_ack(&[0x00; 20]));
        assert!(!contains_handshake_ack(&HANDSHAKE_ACK_PREFIX[..7]));
    }
}

//! YMODEM-CRC sender.
//!
//! The WS63 boot ROM receives both the LoaderBoot image and flash images
//! over YMODEM with 1024-byte data blocks and CRC16 trailers. There is no
//! checksum fallback and no streaming ('G') mode.
//!
//! ```text
//! Data block format:
//! +-----+-----+------+---------------+--------+
//! | STX | SEQ | ~SEQ |  DATA (1024)  | CRC16  |
//! +-----+-----+------+---------------+--------+
//! | 1   | 1   | 1    |     1024      | 2 (BE) |
//! +-----+-----+------+---------------+--------+
//! ```
//!
//! Block 0 and the finish block use the short SOH shape with a 128-byte
//! data area. Block 0 carries the file name, a NUL, and the file size as
//! a `0x`-prefixed hex string.

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::crc::crc16_xmodem;
use log::{debug, trace};
use std::time::{Duration, Instant};

/// YMODEM control characters.
pub mod control {
    /// Start of Header (128-byte block).
    pub const SOH: u8 = 0x01;
    /// Start of Text (1024-byte block).
    pub const STX: u8 = 0x02;
    /// End of Transmission.
    pub const EOT: u8 = 0x04;
    /// Acknowledge.
    pub const ACK: u8 = 0x06;
    /// Not Acknowledge.
    pub const NAK: u8 = 0x15;
    /// CRC mode request character.
    pub const C: u8 = b'C';
}

/// Data area size of SOH blocks.
pub const SOH_BLOCK_SIZE: usize = 128;

/// Data area size of STX blocks.
pub const STX_BLOCK_SIZE: usize = 1024;

/// YMODEM timing configuration.
///
/// Defaults match the boot ROM's expectations; tests shrink them to run
/// the protocol against an in-memory port.
#[derive(Debug, Clone)]
pub struct YmodemConfig {
    /// Deadline for the receiver's initial 'C'.
    pub c_timeout: Duration,
    /// Per-attempt wait for ACK/NAK after sending a block.
    pub ack_timeout: Duration,
    /// Overall per-block deadline across retransmissions.
    pub block_timeout: Duration,
    /// Sleep between polls of the receive side.
    pub poll_interval: Duration,
}

impl Default for YmodemConfig {
    fn default() -> Self {
        Self {
            c_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_millis(1500),
            block_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(1),
        }
    }
}

/// Outcome of one ACK wait.
enum AckOutcome {
    Ack,
    Nak,
    Timeout,
}

/// YMODEM send session over a port.
pub struct YmodemSender<'a, P: Port> {
    port: &'a mut P,
    config: YmodemConfig,
}

impl<'a, P: Port> YmodemSender<'a, P> {
    /// Create a sender with default timing.
    pub fn new(port: &'a mut P) -> Self {
        Self {
            port,
            config: YmodemConfig::default(),
        }
    }

    /// Create a sender with custom timing.
    pub fn with_config(port: &'a mut P, config: YmodemConfig) -> Self {
        Self { port, config }
    }

    /// Wait for the receiver to request CRC mode.
    fn wait_for_c(&mut self) -> Result<()> {
        debug!("Waiting for 'C' from receiver...");
        let deadline = Instant::now() + self.config.c_timeout;

        loop {
            match self.port.read_byte()? {
                Some(control::C) => {
                    debug!("Received 'C', starting transfer");
                    return Ok(());
                }
                Some(byte) => trace!("Ignoring {byte:#04X} while waiting for 'C'"),
                None => {
                    if Instant::now() >= deadline {
                        return Err(Error::CWaitTimeout);
                    }
                    std::thread::sleep(self.config.poll_interval);
                }
            }
        }
    }

    /// Read ACK/NAK, one byte at a time, within the per-attempt window.
    fn wait_ack(&mut self) -> Result<AckOutcome> {
        let deadline = Instant::now() + self.config.ack_timeout;

        loop {
            match self.port.read_byte()? {
                Some(control::ACK) => return Ok(AckOutcome::Ack),
                Some(control::NAK) => return Ok(AckOutcome::Nak),
                Some(byte) => trace!("Ignoring {byte:#04X} while waiting for ACK"),
                None => {
                    if Instant::now() >= deadline {
                        return Ok(AckOutcome::Timeout);
                    }
                    std::thread::sleep(self.config.poll_interval);
                }
            }
        }
    }

    /// Build a YMODEM block. The data area is zero-padded and the CRC16
    /// over it is appended big-endian.
    fn build_block(seq: u8, data: &[u8], use_stx: bool) -> Vec<u8> {
        let (header, block_size) = if use_stx {
            (control::STX, STX_BLOCK_SIZE)
        } else {
            (control::SOH, SOH_BLOCK_SIZE)
        };

        let mut block = Vec::with_capacity(3 + block_size + 2);
        block.push(header);
        block.push(seq);
        block.push(!seq);

        if data.len() >= block_size {
            block.extend_from_slice(&data[..block_size]);
        } else {
            block.extend_from_slice(data);
            block.resize(3 + block_size, 0x00);
        }

        let crc = crc16_xmodem(&block[3..3 + block_size]);
        block.push((crc >> 8) as u8);
        block.push((crc & 0xFF) as u8);

        block
    }

    /// Build the block-0 data area: name, NUL, `0x`-prefixed hex size.
    fn build_info_block(filename: &str, filesize: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(SOH_BLOCK_SIZE);
        data.extend_from_slice(filename.as_bytes());
        data.push(0x00);
        data.extend_from_slice(format!("0x{filesize:X}").as_bytes());
        Self::build_block(0, &data, false)
    }

    /// Transmit a block until ACKed or the per-block deadline passes.
    /// NAK and a silent line both trigger retransmission.
    fn send_block(&mut self, block: &[u8], block_no: u32) -> Result<()> {
        let deadline = Instant::now() + self.config.block_timeout;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            trace!("Sending block {block_no} (attempt {attempt})");
            self.port.write_all(block)?;

            match self.wait_ack()? {
                AckOutcome::Ack => {
                    trace!("Block {block_no} ACKed");
                    return Ok(());
                }
                AckOutcome::Nak => debug!("Block {block_no} NAKed, retransmitting"),
                AckOutcome::Timeout => debug!("No ACK for block {block_no}, retransmitting"),
            }

            if Instant::now() >= deadline {
                return Err(Error::BlockTimeout(block_no));
            }
        }
    }

    /// Send EOT until the receiver ACKs it. The boot ROM always answers
    /// eventually, so no overall deadline applies here.
    fn send_eot(&mut self) -> Result<()> {
        debug!("Sending EOT");
        loop {
            self.port.write_all(&[control::EOT])?;
            if matches!(self.wait_ack()?, AckOutcome::Ack) {
                debug!("EOT ACKed");
                return Ok(());
            }
        }
    }

    /// Send the all-zero finish block ending the session.
    fn send_finish(&mut self) -> Result<()> {
        debug!("Sending finish block");
        let block = Self::build_block(0, &[], false);
        self.send_block(&block, 0).map_err(|e| match e {
            Error::BlockTimeout(_) => Error::FinishFailed,
            other => other,
        })
    }

    /// Send one file.
    ///
    /// Protocol sequence: wait for 'C', info block 0, 1024-byte data
    /// blocks numbered from 1 (mod 256), EOT, finish block.
    pub fn send<F>(&mut self, filename: &str, data: &[u8], mut progress: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        debug!("YMODEM send: {} ({} bytes)", filename, data.len());

        self.wait_for_c()?;

        let info = Self::build_info_block(filename, data.len());
        self.send_block(&info, 0)?;

        let total = data.len();
        let mut offset = 0;
        let mut block_no = 1u32;

        while offset < total {
            let chunk_end = (offset + STX_BLOCK_SIZE).min(total);
            #[allow(clippy::cast_possible_truncation)]
            let block = Self::build_block((block_no % 256) as u8, &data[offset..chunk_end], true);
            self.send_block(&block, block_no)?;

            offset = chunk_end;
            block_no += 1;
            progress(offset, total);
        }

        self.send_eot()?;
        self.send_finish()?;

        debug!("YMODEM send complete");
        Ok(())
    }
}

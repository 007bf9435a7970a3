//! WS63 flash session orchestration.
//!
//! A flash session drives the device through three phases:
//!
//! 1. **Handshake** at 115200 baud: the handshake frame is transmitted
//!    repeatedly until the boot ROM answers with its ACK frame and both
//!    sides switch to the negotiated baud rate.
//! 2. **LoaderBoot transfer**: the ROM receives the loader over YMODEM
//!    and runs it from RAM.
//! 3. **Image burning**: for every remaining image, a download command
//!    announces the flash address and erase extent, the loader replies,
//!    and the image follows over YMODEM. A reset command ends the
//!    session.
//!
//! The device's reply to each download command must be fully consumed
//! before the next YMODEM transfer begins, otherwise its bytes would be
//! mistaken for the receiver's leading 'C'.

use crate::error::{Error, Result};
use crate::image::fwpkg::Fwpkg;
use crate::port::{NativePort, Port, SerialConfig};
use crate::protocol::frame::{contains_handshake_ack, receive_frame, CommandFrame, FRAME_TIMEOUT};
use crate::protocol::ymodem::{YmodemConfig, YmodemSender};
use log::{debug, info, trace, warn};
use std::thread;
use std::time::{Duration, Instant};

/// Baud rate the boot ROM listens at before the handshake.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Flash sector granularity of the erase extent.
pub const SECTOR_SIZE: u32 = 0x2000;

/// Session timing configuration.
///
/// Defaults match the boot ROM's pacing; tests shrink them to run a full
/// session against an in-memory port.
#[derive(Debug, Clone)]
pub struct FlashConfig {
    /// Overall handshake deadline.
    pub handshake_timeout: Duration,
    /// Gap between handshake transmissions.
    pub handshake_gap: Duration,
    /// Pause after the baud switch so the device settles.
    pub settle_delay: Duration,
    /// Pause between image transfers.
    pub inter_image_delay: Duration,
    /// Deadline for each reply frame.
    pub frame_timeout: Duration,
    /// YMODEM timing.
    pub ymodem: YmodemConfig,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            handshake_gap: Duration::from_millis(7),
            settle_delay: Duration::from_millis(500),
            inter_image_delay: Duration::from_millis(100),
            frame_timeout: FRAME_TIMEOUT,
            ymodem: YmodemConfig::default(),
        }
    }
}

/// Round a length up to the erase granularity of the flash part.
#[must_use]
pub fn erase_extent(length: u32) -> u32 {
    length.div_ceil(SECTOR_SIZE) * SECTOR_SIZE
}

/// WS63 flasher.
///
/// Generic over the port type `P` so the protocol can run against real
/// serial hardware or scripted test ports.
pub struct Ws63Flasher<P: Port> {
    port: P,
    target_baud: u32,
    config: FlashConfig,
}

impl Ws63Flasher<NativePort> {
    /// Open a serial port at the handshake baud rate (RTS de-asserted)
    /// and wrap it in a flasher.
    pub fn open(port_name: &str, target_baud: u32) -> Result<Self> {
        let port = NativePort::open(&SerialConfig::new(port_name, DEFAULT_BAUD))?;
        Ok(Self::new(port, target_baud))
    }
}

impl<P: Port> Ws63Flasher<P> {
    /// Create a flasher over an already opened port.
    pub fn new(port: P, target_baud: u32) -> Self {
        Self {
            port,
            target_baud,
            config: FlashConfig::default(),
        }
    }

    /// Override the session timing.
    #[must_use]
    pub fn with_config(mut self, config: FlashConfig) -> Self {
        self.config = config;
        self
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Run a complete flash session: handshake, LoaderBoot, every
    /// burnable image, reset. The port is closed on every exit path.
    pub fn run<F>(&mut self, fwpkg: &Fwpkg, progress: F) -> Result<()>
    where
        F: FnMut(&str, usize, usize),
    {
        let result = self.run_phases(fwpkg, progress);
        let closed = self.close();
        result.and(closed)
    }

    fn run_phases<F>(&mut self, fwpkg: &Fwpkg, progress: F) -> Result<()>
    where
        F: FnMut(&str, usize, usize),
    {
        if fwpkg.loader().is_none() {
            return Err(Error::NoLoader);
        }
        self.connect()?;
        self.flash_fwpkg(fwpkg, progress)?;
        self.reset()
    }

    /// Perform the handshake and switch to the negotiated baud rate.
    ///
    /// The handshake frame is retransmitted every few milliseconds; the
    /// read side is drained between sends and scanned for the ACK
    /// prefix.
    pub fn connect(&mut self) -> Result<()> {
        info!(
            "Waiting for device on {} (reset it into download mode)",
            self.port.name()
        );

        self.port.set_rts(false)?;
        self.port.clear_buffers()?;

        let handshake = CommandFrame::handshake(self.target_baud).build();
        let deadline = Instant::now() + self.config.handshake_timeout;
        let mut seen = Vec::new();

        loop {
            self.port.write_all(&handshake)?;
            thread::sleep(self.config.handshake_gap);

            let chunk = self.port.read_available()?;
            if !chunk.is_empty() {
                trace!("Handshake drain: {} bytes", chunk.len());
                seen.extend_from_slice(&chunk);
                if contains_handshake_ack(&seen) {
                    info!("Handshake acknowledged");
                    return self.enter_target_baud();
                }
            }

            if Instant::now() >= deadline {
                return Err(Error::HandshakeTimeout);
            }
        }
    }

    /// Mirror the device's baud switch and let it settle.
    fn enter_target_baud(&mut self) -> Result<()> {
        if self.target_baud != DEFAULT_BAUD {
            debug!("Switching to {} baud", self.target_baud);
            self.port.set_baud_rate(self.target_baud)?;
        }
        thread::sleep(self.config.settle_delay);
        self.port.clear_buffers()?;
        Ok(())
    }

    /// Flash a parsed FWPKG: LoaderBoot first, then every burnable
    /// image in declaration order.
    ///
    /// `progress` receives `(image_name, bytes_sent, bytes_total)`.
    pub fn flash_fwpkg<F>(&mut self, fwpkg: &Fwpkg, mut progress: F) -> Result<()>
    where
        F: FnMut(&str, usize, usize),
    {
        let loader = fwpkg.loader().ok_or(Error::NoLoader)?;

        info!("Sending LoaderBoot: {}", loader.name);
        let loader_data = fwpkg.bin_data(loader)?;
        self.ymodem_send(&loader.name, loader_data, &mut progress)?;

        // The ROM may or may not reply once the loader starts; consume
        // the frame if one arrives.
        self.await_reply(true)?;

        for bin in fwpkg.burnable_bins() {
            info!("Burning {} -> {:#010X}", bin.name, bin.burn_addr);

            let data = fwpkg.bin_data(bin)?;
            let frame = CommandFrame::download(bin.burn_addr, bin.length, erase_extent(bin.length));
            self.send_command(&frame)?;
            self.await_reply(false)?;

            self.ymodem_send(&bin.name, data, &mut progress)?;
            thread::sleep(self.config.inter_image_delay);
        }

        info!("All images sent");
        Ok(())
    }

    /// Reset the device. The reply is best-effort.
    pub fn reset(&mut self) -> Result<()> {
        info!("Resetting device");
        self.send_command(&CommandFrame::reset())?;
        self.await_reply(true)
    }

    /// Close the underlying port.
    pub fn close(&mut self) -> Result<()> {
        self.port.close()
    }

    fn send_command(&mut self, frame: &CommandFrame) -> Result<()> {
        let data = frame.build();
        trace!("Sending {:?} command: {} bytes", frame.command(), data.len());
        self.port.write_all(&data)
    }

    fn ymodem_send<F>(&mut self, name: &str, data: &[u8], progress: &mut F) -> Result<()>
    where
        F: FnMut(&str, usize, usize),
    {
        let config = self.config.ymodem.clone();
        let mut sender = YmodemSender::with_config(&mut self.port, config);
        sender.send(name, data, |current, total| progress(name, current, total))
    }

    /// Receive one reply frame. Integrity failures are logged and
    /// tolerated; a missing reply is fatal unless `tolerate_timeout`.
    fn await_reply(&mut self, tolerate_timeout: bool) -> Result<()> {
        match receive_frame(&mut self.port, self.config.frame_timeout) {
            Ok(frame) => {
                debug!(
                    "Device reply: cmd {:#04X}, {} payload bytes",
                    frame.cmd,
                    frame.payload.len()
                );
                Ok(())
            }
            Err(e) if e.is_frame_warning() => {
                warn!("Ignoring damaged reply frame: {e}");
                Ok(())
            }
            Err(Error::FrameTimeout) if tolerate_timeout => {
                warn!("No reply frame from device, continuing");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

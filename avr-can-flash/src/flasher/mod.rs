//! CAN bootloader flasher.
//!
//! [`FlashEngine`] drives one flash session against one target MCU. It is
//! purely call driven: the embedding application feeds every received CAN
//! frame to [`FlashEngine::handle_frame`], which runs one protocol step to
//! completion and transmits the reply through the [`FrameSender`] before it
//! returns. There are no threads or timers inside; use
//! [`FlashEngine::time_since_bootloader_wait_started`] to implement a
//! timeout.
//!
//! ## Session flow
//!
//! ```text
//!  MCU                                  flasher
//!   |  BOOTLOADER_START (sig, version)  |
//!   |---------------------------------->|  check signature/version
//!   |              FLASH_INIT (sig)     |
//!   |<----------------------------------|
//!   |  FLASH_READY (addr)               |
//!   |---------------------------------->|  [erase] FLASH_ERASE, wait READY
//!   |    FLASH_SET_ADDRESS / FLASH_DATA |
//!   |<----------------------------------|  ... until the image is sent
//!   |    FLASH_DONE | FLASH_DONE_VERIFY |
//!   |<----------------------------------|
//!   |  FLASH_DONE_VERIFY                |
//!   |---------------------------------->|  FLASH_READ / FLASH_READ_DATA
//!   |                         START_APP |  ... until verified
//!   |<----------------------------------|
//! ```
//!
//! ## Example
//!
//! ```rust
//! use avr_can_flash::{CanFrame, FlashConfig, FlashEngine, SessionOutcome};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sender = |id: u32, data: &[u8; 8]| -> std::io::Result<()> {
//!         // hand the frame to the CAN driver here
//!         let _ = (id, data);
//!         Ok(())
//!     };
//!     let mut engine = FlashEngine::new(sender);
//!
//!     let config = FlashConfig::new(0x0042, "atmega328p");
//!     engine.start(config, Some(":0400000001020304F2\n:00000001FF\n"))?;
//!
//!     // Feed frames from the bus until the session is over.
//!     let bootloader_start = [0x00, 0x42, 0x02, 0x00, 0x1E, 0x95, 0x0F, 0x01];
//!     let frame = CanFrame::new(0x1FFF_FF01, &bootloader_start).unwrap();
//!     assert_eq!(engine.handle_frame(&frame)?, SessionOutcome::Continue);
//!     assert!(engine.has_bootloader_responded());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod event;

pub use config::{FlashConfig, ResetFrame};
pub use event::{AbortReason, FlashEvent, FlashState, ProtocolWarning, SessionOutcome};

use crate::bus::{CanFrame, FrameSender};
use crate::error::{Error, Result};
use crate::image::{MemoryImage, ihex};
use crate::protocol::frame::{
    ADDRESS_LOW_MASK, BOOTLOADER_CMD_VERSION, Command, FRAME_LEN, Frame, MAX_DATA_LEN,
};
use crate::target::{Signature, part};
use log::{debug, error, info, trace, warn};
use std::time::{Duration, Instant};

/// Value of flash bytes that were never read back.
const ERASED_BYTE: u8 = 0xFF;

type Observer = Box<dyn FnMut(&FlashEvent) + Send>;

/// Flasher for one target MCU.
///
/// Generic over the sender `S`, which transmits the frames the protocol
/// produces.
pub struct FlashEngine<S: FrameSender> {
    sender: S,
    observer: Option<Observer>,
    session: Option<FlashSession>,
}

impl<S: FrameSender> FlashEngine<S> {
    /// Create an idle flasher transmitting through `sender`.
    pub fn new(sender: S) -> Self {
        Self {
            sender,
            observer: None,
            session: None,
        }
    }

    /// Report [`FlashEvent`]s to `observer`.
    #[must_use]
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: FnMut(&FlashEvent) + Send + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Get a reference to the sender.
    pub fn sender(&self) -> &S {
        &self.sender
    }

    /// Get a mutable reference to the sender.
    pub fn sender_mut(&mut self) -> &mut S {
        &mut self.sender
    }

    /// Consume the flasher and return the sender.
    pub fn into_sender(self) -> S {
        self.sender
    }

    /// Start a new session.
    ///
    /// Any running session is dropped first. `hex` is the Intel HEX image to
    /// flash; it is required unless `config` selects read mode, in which case
    /// it is ignored. On error the flasher stays idle.
    pub fn start(&mut self, config: FlashConfig, hex: Option<&str>) -> Result<()> {
        self.stop();

        let signature = part::resolve(&config.part)?;
        let image = if config.is_read_mode() {
            if hex.is_some() {
                debug!("Read mode, ignoring the given image");
            }
            MemoryImage::new(Vec::new())
        } else {
            let text = hex.ok_or_else(|| {
                Error::Config("an Intel HEX image is required unless reading".into())
            })?;
            ihex::parse(text)?
        };

        info!(
            "Flash session for MCU 0x{:04X} ({}, signature {}): erase={}, read={}, verify={}, force={}",
            config.mcu_id,
            config.part,
            signature,
            config.erase,
            config.read_length,
            config.verifies(),
            config.force
        );
        debug!(
            "CAN ids: remote->mcu 0x{:08X}, mcu->remote 0x{:08X}",
            config.can_id_remote_to_mcu, config.can_id_mcu_to_remote
        );

        let reset = config
            .reset_frame
            .filter(|_| config.send_reset);
        let mut session = FlashSession::new(config, signature, image);

        let mut outbox = Outbox {
            sender: &mut self.sender,
            observer: &mut self.observer,
        };
        match reset {
            Some(reset) => {
                outbox.send_raw(reset.can_id, &reset.data)?;
                info!("Reset message sent to the MCU");
            },
            None => debug!("No reset message configured"),
        }

        info!(
            "Waiting for bootloader start message for MCU ID 0x{:04X} ...",
            session.mcu_id
        );
        session.wait_started = Instant::now();
        self.session = Some(session);
        Ok(())
    }

    /// Drop the current session, if any, and return to idle.
    pub fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            debug!("Flash session stopped in state {}", session.state);
        }
    }

    /// Process one received CAN frame.
    ///
    /// Frames of the wrong length, with a foreign CAN id or for another MCU
    /// are ignored, so several flashers can listen on the same bus. Once the
    /// session is over, every frame just returns the final outcome.
    pub fn handle_frame(&mut self, frame: &CanFrame) -> Result<SessionOutcome> {
        let session = self
            .session
            .as_mut()
            .ok_or(Error::NoSession)?;

        if session.state.is_terminal() {
            return Ok(session.outcome.clone());
        }
        if frame.len() != FRAME_LEN {
            trace!("Ignoring frame with {} data bytes", frame.len());
            return Ok(SessionOutcome::Continue);
        }
        if frame.id != session.can_id_mcu_to_remote {
            trace!("Ignoring frame with CAN id 0x{:08X}", frame.id);
            return Ok(SessionOutcome::Continue);
        }
        let data = frame.data();
        let mcu_id = u16::from_be_bytes([data[0], data[1]]);
        if mcu_id != session.mcu_id {
            trace!("Ignoring frame for MCU 0x{mcu_id:04X}");
            return Ok(SessionOutcome::Continue);
        }

        let mut outbox = Outbox {
            sender: &mut self.sender,
            observer: &mut self.observer,
        };
        match Frame::decode(data) {
            Ok(msg) => session.handle(&msg, &mut outbox),
            Err(e) => {
                debug!("{e}");
                outbox.warn(ProtocolWarning::UnknownCommand(data[2]));
                Ok(SessionOutcome::Continue)
            },
        }
    }

    /// Check whether a session is running or has ended but not been stopped.
    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Protocol state of the current session.
    pub fn state(&self) -> Option<FlashState> {
        self.session
            .as_ref()
            .map(|s| s.state)
    }

    /// Flash address the session is currently working on.
    pub fn current_address(&self) -> Option<u32> {
        self.session
            .as_ref()
            .map(|s| s.cur_addr)
    }

    /// Time since the session started waiting for the bootloader (after the
    /// reset message, if one was sent).
    pub fn time_since_bootloader_wait_started(&self) -> Option<Duration> {
        self.session
            .as_ref()
            .map(|s| s.wait_started.elapsed())
    }

    /// Time since the bootloader handshake completed.
    pub fn flash_elapsed(&self) -> Option<Duration> {
        self.session
            .as_ref()?
            .flash_started
            .map(|t| t.elapsed())
    }

    /// Check whether the bootloader has answered with a valid start message.
    pub fn has_bootloader_responded(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.flash_started.is_some())
    }

    /// Check whether the whole image has been written.
    pub fn is_flashing_finished(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.flashing_finished)
    }

    /// Check whether the written image has been verified.
    pub fn is_verification_finished(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.verification_finished)
    }

    /// Intel HEX text of the flash contents after a completed read.
    pub fn read_back_hex(&self) -> Option<&str> {
        self.session
            .as_ref()?
            .read_back_hex
            .as_deref()
    }

    /// Bytes done and total bytes of the current phase.
    pub fn progress(&self) -> Option<(usize, usize)> {
        self.session
            .as_ref()
            .map(FlashSession::progress)
    }
}

/// Outbound side of one protocol step: the sender plus the event observer.
struct Outbox<'a, S> {
    sender: &'a mut S,
    observer: &'a mut Option<Observer>,
}

impl<S: FrameSender> Outbox<'_, S> {
    fn emit(&mut self, event: FlashEvent) {
        if let Some(observer) = self.observer.as_mut() {
            observer(&event);
        }
    }

    fn warn(&mut self, warning: ProtocolWarning) {
        warn!("{warning}");
        self.emit(FlashEvent::Warning(warning));
    }

    fn send(&mut self, can_id: u32, frame: &Frame) -> Result<()> {
        trace!(
            "Sending {} to 0x{:08X}: {:02X?}",
            frame.command,
            can_id,
            frame.encode()
        );
        self.sender
            .send(can_id, &frame.encode())?;
        self.emit(FlashEvent::FrameSent {
            can_id,
            command: Some(frame.command),
        });
        Ok(())
    }

    fn send_raw(&mut self, can_id: u32, data: &[u8; FRAME_LEN]) -> Result<()> {
        trace!("Sending raw frame to 0x{can_id:08X}: {data:02X?}");
        self.sender
            .send(can_id, data)?;
        self.emit(FlashEvent::FrameSent {
            can_id,
            command: None,
        });
        Ok(())
    }
}

/// State of one flash session.
struct FlashSession {
    mcu_id: u16,
    part: String,
    signature: Signature,
    can_id_remote_to_mcu: u32,
    can_id_mcu_to_remote: u32,
    do_erase: bool,
    read_length: u16,
    do_verify: bool,
    force: bool,
    simple_progress: bool,
    state: FlashState,
    outcome: SessionOutcome,
    /// Flash address the next data byte is written to or read from.
    cur_addr: u32,
    image: MemoryImage,
    image_len: usize,
    read_back: Vec<u8>,
    read_back_hex: Option<String>,
    wait_started: Instant,
    flash_started: Option<Instant>,
    flashing_finished: bool,
    /// Set once the MCU has confirmed `FLASH_DONE_VERIFY`.
    verify_started: bool,
    verification_finished: bool,
}

impl FlashSession {
    fn new(config: FlashConfig, signature: Signature, image: MemoryImage) -> Self {
        let do_verify = config.verifies();
        Self {
            mcu_id: config.mcu_id,
            part: config.part,
            signature,
            can_id_remote_to_mcu: config.can_id_remote_to_mcu,
            can_id_mcu_to_remote: config.can_id_mcu_to_remote,
            do_erase: config.erase,
            read_length: config.read_length,
            do_verify,
            force: config.force,
            simple_progress: config.simple_progress,
            state: FlashState::Init,
            outcome: SessionOutcome::Continue,
            cur_addr: 0,
            image_len: image.data_len(),
            image,
            read_back: Vec::new(),
            read_back_hex: None,
            wait_started: Instant::now(),
            flash_started: None,
            flashing_finished: false,
            verify_started: false,
            verification_finished: false,
        }
    }

    fn handle<S: FrameSender>(
        &mut self,
        msg: &Frame,
        out: &mut Outbox<'_, S>,
    ) -> Result<SessionOutcome> {
        trace!("Received {} in state {}", msg.command, self.state);
        out.emit(FlashEvent::FrameReceived {
            command: msg.command,
        });

        match (self.state, msg.command) {
            (FlashState::Init, Command::BootloaderStart) => self.on_bootloader_start(msg, out),
            (FlashState::Init, Command::FlashReady) => self.on_first_ready(msg, out),

            (FlashState::Flashing, Command::FlashDataError) => {
                out.warn(ProtocolWarning::FlashDataError);
                Ok(SessionOutcome::Continue)
            },
            (FlashState::Flashing, Command::FlashAddressError) => {
                out.warn(ProtocolWarning::FlashAddressError);
                Ok(SessionOutcome::Continue)
            },
            (FlashState::Flashing, Command::FlashReady) => {
                let count = msg.byte_count();
                self.cur_addr += u32::from(count);
                self.image
                    .advance(usize::from(count));
                if self.simple_progress {
                    info!("Flash progress: {:.2}%", self.percent());
                } else {
                    debug!("{count} bytes flashed");
                }
                out.emit(self.progress_event());
                self.on_flash_ready(msg.address(), out)
            },
            (FlashState::Flashing, Command::StartApp) => {
                self.flashing_finished = true;
                info!(
                    "Flash done in {:.1} seconds, MCU is starting the app",
                    self.elapsed_secs()
                );
                Ok(self.finish(out))
            },

            (FlashState::Reading, Command::FlashDoneVerify)
                if self.do_verify && !self.verify_started =>
            {
                info!("Start reading flash to verify ...");
                self.verify_started = true;
                self.image.rewind();
                self.read_for_verify(out)
            },
            // Read replies only count once the verify pass has been confirmed.
            (FlashState::Reading, Command::FlashReadData) if self.accepts_read_replies() => {
                self.on_read_data(msg, out)
            },
            (FlashState::Reading, Command::FlashReadAddressError)
                if self.accepts_read_replies() =>
            {
                if self.do_verify {
                    warn!("Flash ended at 0x{:04X} before the image did", self.cur_addr);
                    Ok(self.abort(
                        AbortReason::VerifyMismatch {
                            address: self.cur_addr,
                        },
                        out,
                    ))
                } else {
                    debug!("End of flash reached at 0x{:04X}", self.cur_addr);
                    self.finish_read(out)
                }
            },
            (FlashState::Reading, Command::StartApp) => {
                info!("MCU is starting the app");
                Ok(self.finish(out))
            },

            (state, command) => {
                out.warn(ProtocolWarning::UnexpectedCommand { state, command });
                Ok(SessionOutcome::Continue)
            },
        }
    }

    fn on_bootloader_start<S: FrameSender>(
        &mut self,
        msg: &Frame,
        out: &mut Outbox<'_, S>,
    ) -> Result<SessionOutcome> {
        let actual = msg.signature();
        if actual != self.signature {
            error!(
                "Got bootloader start but the device signature {actual} does not match {} for {}",
                self.signature, self.part
            );
            return Ok(self.abort(
                AbortReason::SignatureMismatch {
                    expected: self.signature,
                    actual,
                },
                out,
            ));
        }

        let version = msg.version();
        if version != BOOTLOADER_CMD_VERSION {
            if !self.force {
                return Ok(self.abort(
                    AbortReason::VersionMismatch {
                        expected: BOOTLOADER_CMD_VERSION,
                        actual: version,
                    },
                    out,
                ));
            }
            out.warn(ProtocolWarning::VersionForced {
                expected: BOOTLOADER_CMD_VERSION,
                actual: version,
            });
        }

        info!("Got bootloader start, entering flash mode ...");
        self.flash_started = Some(Instant::now());
        out.send(
            self.can_id_remote_to_mcu,
            &Frame::flash_init(self.mcu_id, self.signature),
        )?;
        Ok(SessionOutcome::Continue)
    }

    /// First `FLASH_READY` after the handshake: read, erase or start writing.
    fn on_first_ready<S: FrameSender>(
        &mut self,
        msg: &Frame,
        out: &mut Outbox<'_, S>,
    ) -> Result<SessionOutcome> {
        if self.read_length > 0 {
            info!("Got flash ready message, reading flash ...");
            self.cur_addr = 0;
            out.send(self.can_id_remote_to_mcu, &Frame::read(self.mcu_id, 0))?;
            self.set_state(FlashState::Reading, out);
        } else if self.do_erase {
            info!("Got flash ready message, erasing flash ...");
            out.send(
                self.can_id_remote_to_mcu,
                &Frame::new(self.mcu_id, Command::FlashErase),
            )?;
            self.do_erase = false;
        } else {
            info!("Got flash ready message, begin flashing ...");
            self.set_state(FlashState::Flashing, out);
            return self.on_flash_ready(msg.address(), out);
        }
        Ok(SessionOutcome::Continue)
    }

    /// Send the next chunk, or finish writing once the image is exhausted.
    ///
    /// `remote_addr` is the flash address the MCU reported in its
    /// `FLASH_READY`.
    fn on_flash_ready<S: FrameSender>(
        &mut self,
        remote_addr: u32,
        out: &mut Outbox<'_, S>,
    ) -> Result<SessionOutcome> {
        trace!("Remote flash address is 0x{remote_addr:04X}");

        let Some(addr) = self.image.address() else {
            info!("All data transmitted, finalizing ...");
            self.flashing_finished = true;
            if self.do_verify {
                out.send(
                    self.can_id_remote_to_mcu,
                    &Frame::new(self.mcu_id, Command::FlashDoneVerify),
                )?;
                self.set_state(FlashState::Reading, out);
                return Ok(SessionOutcome::Continue);
            }
            out.send(
                self.can_id_remote_to_mcu,
                &Frame::new(self.mcu_id, Command::FlashDone),
            )?;
            info!("Flash done in {:.1} seconds", self.elapsed_secs());
            return Ok(self.finish(out));
        };

        // The cursor is authoritative: entering a new record moves to its address.
        self.cur_addr = addr;
        if self.cur_addr != remote_addr {
            debug!("Setting flash address to 0x{:04X} ...", self.cur_addr);
            out.send(
                self.can_id_remote_to_mcu,
                &Frame::set_address(self.mcu_id, self.cur_addr),
            )?;
            return Ok(SessionOutcome::Continue);
        }

        let frame = Frame::data(
            self.mcu_id,
            self.cur_addr,
            self.image
                .peek(MAX_DATA_LEN),
        );
        if !self.simple_progress {
            debug!(
                "Sending {} bytes of flash data for 0x{:04X} ...",
                frame.byte_count(),
                self.cur_addr
            );
        }
        out.send(self.can_id_remote_to_mcu, &frame)?;
        Ok(SessionOutcome::Continue)
    }

    fn on_read_data<S: FrameSender>(
        &mut self,
        msg: &Frame,
        out: &mut Outbox<'_, S>,
    ) -> Result<SessionOutcome> {
        #[allow(clippy::cast_possible_truncation)]
        let expected = self.cur_addr as u8 & ADDRESS_LOW_MASK;
        let actual = msg.address_low();
        if actual != expected {
            error!(
                "Got read data for an unexpected address (0x{:04X} requested)",
                self.cur_addr
            );
            return Ok(self.abort(AbortReason::AddressDesync { expected, actual }, out));
        }

        if !self.simple_progress {
            debug!("Got flash data for 0x{:04X} ...", self.cur_addr);
        }

        if self.do_verify {
            for &byte in msg.payload() {
                // A batch may run past the end of the image.
                let Some(wanted) = self.image.current_byte() else {
                    break;
                };
                if wanted != byte {
                    error!(
                        "Verify failed at 0x{:04X}: expected 0x{wanted:02X}, read 0x{byte:02X}",
                        self.cur_addr
                    );
                    return Ok(self.abort(
                        AbortReason::VerifyMismatch {
                            address: self.cur_addr,
                        },
                        out,
                    ));
                }
                self.cur_addr += 1;
                self.image.advance(1);
            }
            if self.simple_progress {
                info!("Verify progress: {:.2}%", self.percent());
            }
            out.emit(self.progress_event());
            return self.read_for_verify(out);
        }

        for &byte in msg.payload() {
            let idx = self.cur_addr as usize;
            if self.read_back.len() <= idx {
                self.read_back
                    .resize(idx + 1, ERASED_BYTE);
            }
            self.read_back[idx] = byte;
            self.cur_addr += 1;
        }
        out.emit(self.progress_event());

        if self.cur_addr >= u32::from(self.read_length) {
            return self.finish_read(out);
        }
        out.send(
            self.can_id_remote_to_mcu,
            &Frame::read(self.mcu_id, self.cur_addr),
        )?;
        Ok(SessionOutcome::Continue)
    }

    /// Request the next verify chunk, or finish once the image is exhausted.
    fn read_for_verify<S: FrameSender>(
        &mut self,
        out: &mut Outbox<'_, S>,
    ) -> Result<SessionOutcome> {
        let Some(addr) = self.image.address() else {
            self.verification_finished = true;
            info!("Flash and verify done in {:.1} seconds", self.elapsed_secs());
            let outcome = self.finish(out);
            self.start_app(out);
            return Ok(outcome);
        };

        self.cur_addr = addr;
        out.send(
            self.can_id_remote_to_mcu,
            &Frame::read(self.mcu_id, self.cur_addr),
        )?;
        Ok(SessionOutcome::Continue)
    }

    /// Encode what was read, hand it to the caller and start the app.
    fn finish_read<S: FrameSender>(&mut self, out: &mut Outbox<'_, S>) -> Result<SessionOutcome> {
        self.read_back
            .truncate(usize::from(self.read_length));
        let text = ihex::encode(&self.read_back, 0)?;
        let bytes = self.read_back.len();
        self.read_back_hex = Some(text);
        info!(
            "Reading flash done: {bytes} bytes in {:.3} seconds",
            self.elapsed_secs()
        );
        out.emit(FlashEvent::ReadBackReady { bytes });

        let outcome = self.finish(out);
        self.start_app(out);
        Ok(outcome)
    }

    fn accepts_read_replies(&self) -> bool {
        !self.do_verify || self.verify_started
    }

    /// Send `START_APP`. The session is already over, so a failure is only
    /// logged.
    fn start_app<S: FrameSender>(&self, out: &mut Outbox<'_, S>) {
        info!("Starting the app on the MCU ...");
        if let Err(e) = out.send(
            self.can_id_remote_to_mcu,
            &Frame::new(self.mcu_id, Command::StartApp),
        ) {
            warn!("Failed to send START_APP: {e}");
        }
    }

    fn finish<S: FrameSender>(&mut self, out: &mut Outbox<'_, S>) -> SessionOutcome {
        self.set_state(FlashState::Finished, out);
        self.outcome = SessionOutcome::Finished;
        SessionOutcome::Finished
    }

    /// Abort on a fatal error, sending `START_APP` so the MCU does not stay
    /// in the bootloader.
    fn abort<S: FrameSender>(
        &mut self,
        reason: AbortReason,
        out: &mut Outbox<'_, S>,
    ) -> SessionOutcome {
        error!("{reason}, trying to start the app nevertheless ...");
        out.emit(FlashEvent::Aborted(reason.clone()));
        self.set_state(FlashState::Aborted, out);
        self.outcome = SessionOutcome::Aborted(reason);
        self.start_app(out);
        self.outcome.clone()
    }

    fn set_state<S: FrameSender>(&mut self, to: FlashState, out: &mut Outbox<'_, S>) {
        if self.state != to {
            debug!("State {} -> {to}", self.state);
            out.emit(FlashEvent::StateChanged {
                from: self.state,
                to,
            });
            self.state = to;
        }
    }

    fn progress(&self) -> (usize, usize) {
        if self.read_length > 0 {
            let done = (self.cur_addr as usize).min(usize::from(self.read_length));
            (done, usize::from(self.read_length))
        } else {
            (self.image.consumed(), self.image_len)
        }
    }

    fn progress_event(&self) -> FlashEvent {
        let (done, total) = self.progress();
        FlashEvent::Progress { done, total }
    }

    #[allow(clippy::cast_precision_loss)]
    fn percent(&self) -> f64 {
        let (done, total) = self.progress();
        if total == 0 {
            100.0
        } else {
            done as f64 / total as f64 * 100.0
        }
    }

    fn elapsed_secs(&self) -> f64 {
        self.flash_started
            .map_or(0.0, |t| t.elapsed().as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{CAN_ID_MCU_TO_REMOTE, CAN_ID_REMOTE_TO_MCU};
    use std::io;
    use std::sync::{Arc, Mutex};

    const MCU: u16 = 0x0042;

    /// Two records: 16 data bytes at 0x0000, then end-of-file.
    const IMAGE: &str = ":10000000000102030405060708090A0B0C0D0E0F78\n:00000001FF\n";

    /// Sender that records every transmitted frame.
    #[derive(Default)]
    struct RecordingSender {
        frames: Vec<(u32, [u8; 8])>,
        fail: bool,
    }

    impl FrameSender for RecordingSender {
        fn send(&mut self, can_id: u32, data: &[u8; 8]) -> io::Result<()> {
            if self.fail {
                return Err(io::Error::other("bus off"));
            }
            self.frames.push((can_id, *data));
            Ok(())
        }
    }

    impl RecordingSender {
        fn commands(&self) -> Vec<Command> {
            self.frames
                .iter()
                .map(|(_, d)| Command::from_u8(d[2]).unwrap())
                .collect()
        }

        fn count(&self, command: Command) -> usize {
            self.commands()
                .iter()
                .filter(|c| **c == command)
                .count()
        }

        fn last(&self) -> Frame {
            Frame::decode(&self.frames.last().unwrap().1).unwrap()
        }
    }

    fn mcu_frame(frame: Frame) -> CanFrame {
        CanFrame::new(CAN_ID_MCU_TO_REMOTE, &frame.encode()).unwrap()
    }

    fn bootloader_start(version: u8) -> CanFrame {
        let mut frame = Frame::new(MCU, Command::BootloaderStart);
        frame.body = [0x1E, 0x95, 0x0F, version];
        mcu_frame(frame)
    }

    fn ready(acked: u8, address: u32) -> CanFrame {
        let mut frame = Frame::with_address(MCU, Command::FlashReady, address);
        frame.len_and_addr = crate::protocol::frame::pack_len_and_addr(acked, address);
        mcu_frame(frame)
    }

    fn read_data(address: u32, data: &[u8]) -> CanFrame {
        mcu_frame(Frame::with_data(
            MCU,
            Command::FlashReadData,
            address,
            data,
        ))
    }

    fn command(cmd: Command) -> CanFrame {
        mcu_frame(Frame::new(MCU, cmd))
    }

    fn engine(config: FlashConfig, hex: Option<&str>) -> FlashEngine<RecordingSender> {
        let mut engine = FlashEngine::new(RecordingSender::default());
        engine.start(config, hex).unwrap();
        engine
    }

    fn config() -> FlashConfig {
        FlashConfig::new(MCU, "atmega328p").with_verify(false)
    }

    /// Drive an engine through the handshake up to the first `FLASH_READY`.
    fn handshake(engine: &mut FlashEngine<RecordingSender>) {
        assert_eq!(
            engine
                .handle_frame(&bootloader_start(BOOTLOADER_CMD_VERSION))
                .unwrap(),
            SessionOutcome::Continue
        );
        assert_eq!(engine.sender().last().command, Command::FlashInit);
    }

    /// Write the sample image, answering every frame like the bootloader.
    fn flash_image(engine: &mut FlashEngine<RecordingSender>) {
        handshake(engine);
        engine
            .handle_frame(&ready(0, 0xFFFF))
            .unwrap();
        let mut remote = 0xFFFF;
        loop {
            let last = engine.sender().last();
            let reply = match last.command {
                Command::FlashSetAddress => {
                    remote = last.address();
                    ready(0, remote)
                },
                Command::FlashData => {
                    remote += u32::from(last.byte_count());
                    ready(last.byte_count(), remote)
                },
                _ => break,
            };
            engine
                .handle_frame(&reply)
                .unwrap();
        }
    }

    #[test]
    fn test_idle_engine_rejects_frames() {
        let mut engine = FlashEngine::new(RecordingSender::default());
        assert!(matches!(
            engine.handle_frame(&command(Command::FlashReady)),
            Err(Error::NoSession)
        ));
        assert!(!engine.is_active());
        assert_eq!(engine.time_since_bootloader_wait_started(), None);
    }

    #[test]
    fn test_start_unknown_part() {
        let mut engine = FlashEngine::new(RecordingSender::default());
        let err = engine
            .start(FlashConfig::new(MCU, "bogus"), Some(IMAGE))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownDevice(_)));
        assert!(!engine.is_active());
    }

    #[test]
    fn test_start_invalid_hex_leaves_engine_idle() {
        let mut engine = engine(config(), Some(IMAGE));
        let err = engine
            .start(config(), Some(":10000000000102030405060708090A0B0C0D0E0F00\n"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidHex { line: 1, .. }));
        assert!(!engine.is_active());
    }

    #[test]
    fn test_start_requires_image_unless_reading() {
        let mut engine = FlashEngine::new(RecordingSender::default());
        assert!(matches!(
            engine.start(config(), None),
            Err(Error::Config(_))
        ));
        engine
            .start(config().with_read_length(16), None)
            .unwrap();
        assert_eq!(engine.state(), Some(FlashState::Init));
    }

    #[test]
    fn test_start_sends_reset_frame() {
        let reset = ResetFrame::new(0x321, [0xDE, 0xAD, 0, 0, 0, 0, 0, 0]);
        let engine = engine(config().with_reset_frame(reset), Some(IMAGE));
        assert_eq!(engine.sender().frames, vec![(0x321, reset.data)]);
        assert!(engine.time_since_bootloader_wait_started().is_some());

        let engine = self::engine(
            config()
                .with_reset_frame(reset)
                .with_send_reset(false),
            Some(IMAGE),
        );
        assert!(engine.sender().frames.is_empty());
    }

    #[test]
    fn test_reset_send_failure_keeps_engine_idle() {
        let mut engine = FlashEngine::new(RecordingSender {
            fail: true,
            ..Default::default()
        });
        let reset = ResetFrame::new(0x321, [0; 8]);
        let err = engine
            .start(config().with_reset_frame(reset), Some(IMAGE))
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(!engine.is_active());
    }

    #[test]
    fn test_frame_filtering() {
        let mut engine = engine(config(), Some(IMAGE));
        let good = bootloader_start(BOOTLOADER_CMD_VERSION);

        let short = CanFrame::new(CAN_ID_MCU_TO_REMOTE, &good.data()[..7]).unwrap();
        let foreign_id = CanFrame::new(CAN_ID_REMOTE_TO_MCU, good.data()).unwrap();
        let mut other_mcu = Frame::decode(good.data()).unwrap();
        other_mcu.mcu_id = MCU + 1;
        let other_mcu = mcu_frame(other_mcu);

        for frame in [short, foreign_id, other_mcu] {
            assert_eq!(
                engine
                    .handle_frame(&frame)
                    .unwrap(),
                SessionOutcome::Continue
            );
        }
        assert!(engine.sender().frames.is_empty());
        assert_eq!(engine.state(), Some(FlashState::Init));
        assert_eq!(engine.current_address(), Some(0));
        assert!(!engine.has_bootloader_responded());
    }

    #[test]
    fn test_frame_filtering_while_flashing() {
        let mut engine = engine(config(), Some(IMAGE));
        handshake(&mut engine);
        engine
            .handle_frame(&ready(0, 0))
            .unwrap();
        engine
            .handle_frame(&ready(4, 4))
            .unwrap();
        assert_eq!(engine.state(), Some(FlashState::Flashing));
        let sent = engine.sender().frames.len();
        let address = engine.current_address();
        let progress = engine.progress();
        assert_eq!(address, Some(4));
        assert_eq!(progress, Some((4, 16)));

        // Each of these would acknowledge the next chunk if accepted.
        let good = ready(4, 8);
        let short = CanFrame::new(CAN_ID_MCU_TO_REMOTE, &good.data()[..7]).unwrap();
        let foreign_id = CanFrame::new(CAN_ID_REMOTE_TO_MCU, good.data()).unwrap();
        let mut other_mcu = Frame::decode(good.data()).unwrap();
        other_mcu.mcu_id = MCU + 1;
        let other_mcu = mcu_frame(other_mcu);

        for frame in [short, foreign_id, other_mcu] {
            assert_eq!(
                engine
                    .handle_frame(&frame)
                    .unwrap(),
                SessionOutcome::Continue
            );
        }
        assert_eq!(engine.sender().frames.len(), sent);
        assert_eq!(engine.current_address(), address);
        assert_eq!(engine.progress(), progress);
        assert_eq!(engine.state(), Some(FlashState::Flashing));
    }

    #[test]
    fn test_unknown_command_is_a_warning() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let mut engine = FlashEngine::new(RecordingSender::default())
            .with_observer(move |e| sink.lock().unwrap().push(e.clone()));
        engine
            .start(config(), Some(IMAGE))
            .unwrap();

        let frame = CanFrame::new(CAN_ID_MCU_TO_REMOTE, &[0x00, 0x42, 0x33, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(
            engine
                .handle_frame(&frame)
                .unwrap(),
            SessionOutcome::Continue
        );
        assert!(
            events
                .lock()
                .unwrap()
                .contains(&FlashEvent::Warning(ProtocolWarning::UnknownCommand(0x33)))
        );
    }

    #[test]
    fn test_bootloader_start_sends_flash_init() {
        let mut engine = engine(config(), Some(IMAGE));
        handshake(&mut engine);
        assert_eq!(
            engine.sender().frames,
            vec![(
                CAN_ID_REMOTE_TO_MCU,
                [0x00, 0x42, 0x06, 0x00, 0x1E, 0x95, 0x0F, 0x00]
            )]
        );
        assert!(engine.has_bootloader_responded());
        assert!(engine.flash_elapsed().is_some());
        assert_eq!(engine.state(), Some(FlashState::Init));
    }

    #[test]
    fn test_signature_mismatch_aborts() {
        let mut engine = engine(FlashConfig::new(MCU, "atmega2560"), Some(IMAGE));
        let outcome = engine
            .handle_frame(&bootloader_start(BOOTLOADER_CMD_VERSION))
            .unwrap();
        assert_eq!(
            outcome,
            SessionOutcome::Aborted(AbortReason::SignatureMismatch {
                expected: Signature::new([0x1E, 0x98, 0x01]),
                actual: Signature::new([0x1E, 0x95, 0x0F]),
            })
        );
        assert_eq!(engine.sender().commands(), vec![Command::StartApp]);
        assert_eq!(engine.state(), Some(FlashState::Aborted));
        assert!(!engine.has_bootloader_responded());
    }

    #[test]
    fn test_version_mismatch_aborts_unless_forced() {
        let mut engine = engine(config(), Some(IMAGE));
        let outcome = engine
            .handle_frame(&bootloader_start(0x02))
            .unwrap();
        assert_eq!(
            outcome,
            SessionOutcome::Aborted(AbortReason::VersionMismatch {
                expected: 1,
                actual: 2
            })
        );
        assert_eq!(engine.sender().commands(), vec![Command::StartApp]);

        let mut engine = self::engine(config().with_force(true), Some(IMAGE));
        let outcome = engine
            .handle_frame(&bootloader_start(0x02))
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Continue);
        assert_eq!(engine.sender().commands(), vec![Command::FlashInit]);
    }

    #[test]
    fn test_erase_loop() {
        let mut engine = engine(config().with_erase(true), Some(IMAGE));
        handshake(&mut engine);

        engine
            .handle_frame(&ready(0, 0))
            .unwrap();
        assert_eq!(engine.sender().last().command, Command::FlashErase);
        assert_eq!(engine.state(), Some(FlashState::Init));

        engine
            .handle_frame(&ready(0, 0))
            .unwrap();
        assert_eq!(engine.sender().count(Command::FlashErase), 1);
        assert_eq!(engine.state(), Some(FlashState::Flashing));
        assert_eq!(engine.sender().last().command, Command::FlashData);
    }

    #[test]
    fn test_flashing_without_verify() {
        let mut engine = engine(config(), Some(IMAGE));
        flash_image(&mut engine);

        let sent: Vec<Frame> = engine
            .sender()
            .frames
            .iter()
            .map(|(_, d)| Frame::decode(d).unwrap())
            .collect();
        assert_eq!(sent[0].command, Command::FlashInit);
        assert_eq!(sent[1], Frame::set_address(MCU, 0));
        for (i, frame) in sent[2..6].iter().enumerate() {
            let base = i * 4;
            let expected: Vec<u8> = (base..base + 4)
                .map(|b| b as u8)
                .collect();
            assert_eq!(frame.command, Command::FlashData);
            assert_eq!(frame.byte_count(), 4);
            assert_eq!(usize::from(frame.address_low()), base);
            assert_eq!(frame.payload(), expected.as_slice());
        }
        assert_eq!(sent[6].command, Command::FlashDone);
        assert_eq!(sent.len(), 7);

        assert!(engine.is_flashing_finished());
        assert!(!engine.is_verification_finished());
        assert_eq!(engine.state(), Some(FlashState::Finished));
        assert_eq!(engine.progress(), Some((16, 16)));
    }

    #[test]
    fn test_flash_errors_are_warnings() {
        let mut engine = engine(config(), Some(IMAGE));
        handshake(&mut engine);
        engine
            .handle_frame(&ready(0, 0))
            .unwrap();
        let sent = engine.sender().frames.len();

        for cmd in [Command::FlashDataError, Command::FlashAddressError] {
            assert_eq!(
                engine
                    .handle_frame(&command(cmd))
                    .unwrap(),
                SessionOutcome::Continue
            );
        }
        assert_eq!(engine.sender().frames.len(), sent);
        assert_eq!(engine.state(), Some(FlashState::Flashing));
    }

    #[test]
    fn test_start_app_while_flashing_finishes() {
        let mut engine = engine(config(), Some(IMAGE));
        handshake(&mut engine);
        engine
            .handle_frame(&ready(0, 0))
            .unwrap();
        assert_eq!(
            engine
                .handle_frame(&command(Command::StartApp))
                .unwrap(),
            SessionOutcome::Finished
        );
        assert!(engine.is_flashing_finished());
    }

    /// Run the verify pass, answering reads with `flash` contents.
    fn verify_with(flash: &[u8]) -> (FlashEngine<RecordingSender>, SessionOutcome) {
        let mut engine = engine(config().with_verify(true), Some(IMAGE));
        flash_image(&mut engine);
        assert_eq!(engine.sender().last().command, Command::FlashDoneVerify);
        assert_eq!(engine.state(), Some(FlashState::Reading));

        let mut outcome = engine
            .handle_frame(&command(Command::FlashDoneVerify))
            .unwrap();
        while outcome == SessionOutcome::Continue {
            let req = engine.sender().last();
            assert_eq!(req.command, Command::FlashRead);
            let addr = req.address() as usize;
            let end = (addr + 4).min(flash.len());
            outcome = engine
                .handle_frame(&read_data(req.address(), &flash[addr..end]))
                .unwrap();
        }
        (engine, outcome)
    }

    #[test]
    fn test_verify_success() {
        let flash: Vec<u8> = (0..16).collect();
        let (engine, outcome) = verify_with(&flash);
        assert_eq!(outcome, SessionOutcome::Finished);
        assert!(engine.is_verification_finished());
        assert_eq!(engine.sender().count(Command::StartApp), 1);
    }

    #[test]
    fn test_verify_mismatch() {
        let mut flash: Vec<u8> = (0..16).collect();
        flash[5] ^= 0xFF;
        let (engine, outcome) = verify_with(&flash);
        assert_eq!(
            outcome,
            SessionOutcome::Aborted(AbortReason::VerifyMismatch { address: 5 })
        );
        assert!(!engine.is_verification_finished());
        assert_eq!(engine.sender().count(Command::StartApp), 1);
    }

    #[test]
    fn test_read_replies_before_verify_confirmation_are_ignored() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let mut engine = FlashEngine::new(RecordingSender::default())
            .with_observer(move |e| sink.lock().unwrap().push(e.clone()));
        engine
            .start(config().with_verify(true), Some(IMAGE))
            .unwrap();
        flash_image(&mut engine);
        let sent = engine.sender().frames.len();

        for frame in [
            read_data(16, &[0xAA, 0xBB, 0xCC, 0xDD]),
            command(Command::FlashReadAddressError),
        ] {
            assert_eq!(
                engine
                    .handle_frame(&frame)
                    .unwrap(),
                SessionOutcome::Continue
            );
        }
        assert_eq!(engine.sender().frames.len(), sent);
        assert_eq!(engine.state(), Some(FlashState::Reading));
        assert!(!engine.is_verification_finished());
        assert!(events.lock().unwrap().contains(&FlashEvent::Warning(
            ProtocolWarning::UnexpectedCommand {
                state: FlashState::Reading,
                command: Command::FlashReadData,
            }
        )));

        // The confirmed pass still reads and compares every byte.
        engine
            .handle_frame(&command(Command::FlashDoneVerify))
            .unwrap();
        assert_eq!(engine.sender().last(), Frame::read(MCU, 0));
        let mut outcome = SessionOutcome::Continue;
        while outcome == SessionOutcome::Continue {
            let addr = engine.sender().last().address();
            let data: Vec<u8> = (addr..addr + 4)
                .map(|a| a as u8)
                .collect();
            outcome = engine
                .handle_frame(&read_data(addr, &data))
                .unwrap();
        }
        assert_eq!(outcome, SessionOutcome::Finished);
        assert_eq!(engine.sender().count(Command::FlashRead), 4);
        assert!(engine.is_verification_finished());
    }

    #[test]
    fn test_verify_result_survives_start_app_failure() {
        let mut engine = engine(config().with_verify(true), Some(IMAGE));
        flash_image(&mut engine);
        engine
            .handle_frame(&command(Command::FlashDoneVerify))
            .unwrap();

        let mut outcome = SessionOutcome::Continue;
        while outcome == SessionOutcome::Continue {
            let addr = engine.sender().last().address();
            if addr == 12 {
                engine.sender_mut().fail = true;
            }
            let data: Vec<u8> = (addr..addr + 4)
                .map(|a| a as u8)
                .collect();
            outcome = engine
                .handle_frame(&read_data(addr, &data))
                .unwrap();
        }
        assert_eq!(outcome, SessionOutcome::Finished);
        assert_eq!(engine.state(), Some(FlashState::Finished));
        assert!(engine.is_verification_finished());
        assert_eq!(engine.sender().count(Command::StartApp), 0);
    }

    #[test]
    fn test_read_back_survives_start_app_failure() {
        let mut engine = engine(config().with_read_length(4), None);
        handshake(&mut engine);
        engine
            .handle_frame(&ready(0, 0))
            .unwrap();
        engine.sender_mut().fail = true;

        let outcome = engine
            .handle_frame(&read_data(0, &[1, 2, 3, 4]))
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Finished);
        assert_eq!(engine.state(), Some(FlashState::Finished));
        let image = ihex::parse(engine.read_back_hex().unwrap()).unwrap();
        assert_eq!(image.data_len(), 4);
    }

    #[test]
    fn test_verify_truncated_flash() {
        let mut engine = engine(config().with_verify(true), Some(IMAGE));
        flash_image(&mut engine);
        engine
            .handle_frame(&command(Command::FlashDoneVerify))
            .unwrap();
        let outcome = engine
            .handle_frame(&command(Command::FlashReadAddressError))
            .unwrap();
        assert_eq!(
            outcome,
            SessionOutcome::Aborted(AbortReason::VerifyMismatch { address: 0 })
        );
        assert_eq!(engine.sender().count(Command::StartApp), 1);
    }

    #[test]
    fn test_address_desync_aborts() {
        let mut engine = engine(config().with_verify(true), Some(IMAGE));
        flash_image(&mut engine);
        engine
            .handle_frame(&command(Command::FlashDoneVerify))
            .unwrap();
        let outcome = engine
            .handle_frame(&read_data(3, &[3, 4, 5, 6]))
            .unwrap();
        assert_eq!(
            outcome,
            SessionOutcome::Aborted(AbortReason::AddressDesync {
                expected: 0,
                actual: 3
            })
        );
        assert_eq!(engine.sender().last().command, Command::StartApp);
    }

    #[test]
    fn test_raw_read() {
        let mut engine = engine(config().with_read_length(10), None);
        handshake(&mut engine);
        engine
            .handle_frame(&ready(0, 0))
            .unwrap();
        assert_eq!(engine.state(), Some(FlashState::Reading));

        let mut outcome = SessionOutcome::Continue;
        while outcome == SessionOutcome::Continue {
            let req = engine.sender().last();
            assert_eq!(req.command, Command::FlashRead);
            let addr = req.address();
            let data: Vec<u8> = (addr..addr + 4)
                .map(|a| 0xA0 + a as u8)
                .collect();
            outcome = engine
                .handle_frame(&read_data(addr, &data))
                .unwrap();
        }
        assert_eq!(outcome, SessionOutcome::Finished);
        assert_eq!(engine.sender().count(Command::FlashRead), 3);
        assert_eq!(engine.sender().last().command, Command::StartApp);

        let image = ihex::parse(engine.read_back_hex().unwrap()).unwrap();
        let bytes: Vec<(u32, u8)> = image.bytes().collect();
        let expected: Vec<(u32, u8)> = (0..10)
            .map(|a| (a, 0xA0 + a as u8))
            .collect();
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_raw_read_stops_at_end_of_flash() {
        let mut engine = engine(config().with_read_length(1024), None);
        handshake(&mut engine);
        engine
            .handle_frame(&ready(0, 0))
            .unwrap();
        engine
            .handle_frame(&read_data(0, &[1, 2, 3, 4]))
            .unwrap();
        let outcome = engine
            .handle_frame(&command(Command::FlashReadAddressError))
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Finished);

        let image = ihex::parse(engine.read_back_hex().unwrap()).unwrap();
        assert_eq!(image.data_len(), 4);
        assert_eq!(engine.sender().count(Command::StartApp), 1);
    }

    #[test]
    fn test_frames_after_finish_are_ignored() {
        let mut engine = engine(config(), Some(IMAGE));
        flash_image(&mut engine);
        let sent = engine.sender().frames.len();
        assert_eq!(
            engine
                .handle_frame(&ready(0, 16))
                .unwrap(),
            SessionOutcome::Finished
        );
        assert_eq!(engine.sender().frames.len(), sent);
    }

    #[test]
    fn test_restart_discards_previous_session() {
        let mut engine = engine(config().with_erase(true), Some(IMAGE));
        flash_image(&mut engine);
        engine
            .start(config(), Some(IMAGE))
            .unwrap();
        assert_eq!(engine.state(), Some(FlashState::Init));
        assert!(!engine.is_flashing_finished());
        assert!(!engine.has_bootloader_responded());
        assert_eq!(engine.progress(), Some((0, 16)));

        engine.stop();
        assert_eq!(engine.state(), None);
    }

    #[test]
    fn test_observer_sees_state_changes() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let mut engine = FlashEngine::new(RecordingSender::default())
            .with_observer(move |e| sink.lock().unwrap().push(e.clone()));
        engine
            .start(config(), Some(IMAGE))
            .unwrap();
        flash_image(&mut engine);

        let changes: Vec<(FlashState, FlashState)> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                FlashEvent::StateChanged { from, to } => Some((*from, *to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            changes,
            vec![
                (FlashState::Init, FlashState::Flashing),
                (FlashState::Flashing, FlashState::Finished),
            ]
        );
    }
}

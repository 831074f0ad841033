//! Session states, outcomes and the events reported while flashing.

use crate::protocol::frame::Command;
use crate::target::Signature;
use std::fmt;
use thiserror::Error;

/// Protocol state of a flash session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashState {
    /// Waiting for the bootloader handshake (and erase, if requested).
    Init,
    /// Writing the image.
    Flashing,
    /// Reading flash, to verify or to dump it.
    Reading,
    /// Session completed successfully.
    Finished,
    /// Session stopped on a fatal protocol error.
    Aborted,
}

impl FlashState {
    /// Check whether no further frames will be processed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Aborted)
    }
}

impl fmt::Display for FlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Flashing => write!(f, "flashing"),
            Self::Reading => write!(f, "reading"),
            Self::Finished => write!(f, "finished"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Fatal protocol errors.
///
/// Each of them makes the flasher send `START_APP` and abort the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbortReason {
    /// The bootloader runs on a different part than configured.
    #[error("device signature mismatch: expected {expected}, got {actual}")]
    SignatureMismatch {
        /// Signature of the configured part.
        expected: Signature,
        /// Signature reported by the bootloader.
        actual: Signature,
    },

    /// The bootloader speaks another command set version.
    #[error("bootloader command version mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    VersionMismatch {
        /// Version this flasher speaks.
        expected: u8,
        /// Version reported by the bootloader.
        actual: u8,
    },

    /// Read data arrived for another address than requested.
    #[error("read data address mismatch: expected low bits 0x{expected:02X}, got 0x{actual:02X}")]
    AddressDesync {
        /// Low address bits of the requested address.
        expected: u8,
        /// Low address bits reported with the data.
        actual: u8,
    },

    /// Flash contents differ from the image (or end before it does).
    #[error("verify failed at 0x{address:04X}")]
    VerifyMismatch {
        /// First address that differs.
        address: u32,
    },
}

/// Result of handling one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Session is still running.
    Continue,
    /// Session completed successfully.
    Finished,
    /// Session stopped on a fatal protocol error.
    Aborted(AbortReason),
}

impl SessionOutcome {
    /// Check whether the session is over.
    pub fn is_done(&self) -> bool {
        !matches!(self, Self::Continue)
    }
}

/// Non-fatal protocol conditions. The session continues unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolWarning {
    /// A known command arrived in a state that does not expect it.
    #[error("unexpected {command} while {state}")]
    UnexpectedCommand {
        /// Current state.
        state: FlashState,
        /// Received command.
        command: Command,
    },

    /// A frame for this session carried an unknown command byte.
    #[error("unknown command 0x{0:02X}")]
    UnknownCommand(u8),

    /// The bootloader rejected a data frame.
    #[error("flash data error, possibly CAN bus issues")]
    FlashDataError,

    /// The bootloader rejected an address.
    #[error("flash address error, image may not fit this MCU")]
    FlashAddressError,

    /// Version mismatch ignored because flashing was forced.
    #[error("bootloader command version 0x{actual:02X} differs from 0x{expected:02X}, flashing anyway")]
    VersionForced {
        /// Version this flasher speaks.
        expected: u8,
        /// Version reported by the bootloader.
        actual: u8,
    },
}

/// Structured event emitted by the flasher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashEvent {
    /// A frame for this session was accepted.
    FrameReceived {
        /// Received command.
        command: Command,
    },
    /// A frame was handed to the sender.
    FrameSent {
        /// CAN identifier used.
        can_id: u32,
        /// Sent command, `None` for the raw reset frame.
        command: Option<Command>,
    },
    /// The session moved to another state.
    StateChanged {
        /// Previous state.
        from: FlashState,
        /// New state.
        to: FlashState,
    },
    /// Non-fatal protocol condition.
    Warning(ProtocolWarning),
    /// Fatal protocol error; the session is aborted.
    Aborted(AbortReason),
    /// Image bytes written or verified so far.
    Progress {
        /// Bytes done.
        done: usize,
        /// Total bytes.
        total: usize,
    },
    /// Raw read finished; the Intel HEX text is available from the engine.
    ReadBackReady {
        /// Number of bytes read.
        bytes: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(FlashState::Finished.is_terminal());
        assert!(FlashState::Aborted.is_terminal());
        assert!(!FlashState::Reading.is_terminal());
    }

    #[test]
    fn test_abort_reason_messages() {
        let reason = AbortReason::VerifyMismatch { address: 5 };
        assert_eq!(reason.to_string(), "verify failed at 0x0005");

        let reason = AbortReason::SignatureMismatch {
            expected: Signature::new([0x1E, 0x95, 0x0F]),
            actual: Signature::new([0x1E, 0x98, 0x01]),
        };
        assert_eq!(
            reason.to_string(),
            "device signature mismatch: expected 0x1E950F, got 0x1E9801"
        );
    }

    #[test]
    fn test_warning_messages() {
        let warning = ProtocolWarning::UnexpectedCommand {
            state: FlashState::Init,
            command: Command::FlashReadData,
        };
        assert_eq!(warning.to_string(), "unexpected FLASH_READ_DATA while init");
    }
}

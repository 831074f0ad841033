//! Error types for avr-can-flash.

use std::io;
use thiserror::Error;

/// Result type for avr-can-flash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for avr-can-flash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error reported by the frame sender.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid Intel HEX input (or output that does not fit the format).
    ///
    /// `line` is 1-based; `0` refers to the text as a whole.
    #[error("Invalid Intel HEX at line {line}: {reason}")]
    InvalidHex {
        /// Line number of the offending record.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// Part number is not present in the device table.
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// A CAN payload could not be decoded as a bootloader frame.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A frame was handed to an engine without an active session.
    #[error("No flash session is active")]
    NoSession,
}

impl Error {
    pub(crate) fn hex(line: usize, reason: impl Into<String>) -> Self {
        Self::InvalidHex {
            line,
            reason: reason.into(),
        }
    }
}

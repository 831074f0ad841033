//! # avr-can-flash
//!
//! A library for flashing AVR microcontrollers over CAN.
//!
//! This crate implements the remote side of the MCP-CAN-Boot bootloader
//! protocol, including:
//!
//! - Intel HEX parsing and encoding
//! - Image cursor for chunked transfer and verification
//! - 8-byte bootloader frame codec
//! - AVR device signature lookup
//! - Flash, verify and read-back session state machine
//!
//! The library does not own a CAN controller. Received frames are passed to
//! [`FlashEngine::handle_frame`]; outbound frames leave through a
//! [`FrameSender`].
//!
//! ## Supported Parts
//!
//! ATmega32, ATmega328, ATmega328P, ATmega64, ATmega644P, ATmega128,
//! ATmega1284P and ATmega2560.
//!
//! ## Features
//!
//! - `serde`: Serialization support for the session configuration
//!
//! ## Example
//!
//! ```rust,no_run
//! use avr_can_flash::{CanFrame, FlashConfig, FlashEngine};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hex = std::fs::read_to_string("firmware.hex")?;
//!
//!     let mut engine = FlashEngine::new(|id: u32, data: &[u8; 8]| -> std::io::Result<()> {
//!         // write the frame to the CAN driver
//!         let _ = (id, data);
//!         Ok(())
//!     });
//!     engine.start(FlashConfig::new(0x0042, "m328p").with_erase(true), Some(&hex))?;
//!
//!     # let receive = || CanFrame::new(0x1FFF_FF01, &[0; 8]).unwrap();
//!     loop {
//!         let frame = receive();
//!         if engine.handle_frame(&frame)?.is_done() {
//!             break;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bus;
pub mod error;
pub mod flasher;
pub mod image;
pub mod protocol;
pub mod target;

// Re-exports for convenience
pub use {
    bus::{CanFrame, FrameSender},
    error::{Error, Result},
    flasher::{
        AbortReason, FlashConfig, FlashEngine, FlashEvent, FlashState, ProtocolWarning,
        ResetFrame, SessionOutcome,
    },
    image::{HexRecord, MemoryImage, RecordType, ihex},
    protocol::{Command, Frame},
    target::{AvrPart, Signature, resolve, supported_parts},
};

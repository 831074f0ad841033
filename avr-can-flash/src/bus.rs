//! CAN bus boundary.
//!
//! The flasher never touches a CAN controller. Inbound frames are handed to
//! it as [`CanFrame`] values by the embedding application, and outbound
//! frames leave through a [`FrameSender`] supplied at construction. This keeps
//! the protocol logic independent of the bus driver (SocketCAN, an MCP2515
//! over SPI, a test double, ...).
//!
//! ## Example
//!
//! ```rust
//! use avr_can_flash::{CanFrame, FrameSender};
//!
//! let mut sent = Vec::new();
//! let mut sender = |id: u32, data: &[u8; 8]| -> std::io::Result<()> {
//!     sent.push((id, *data));
//!     Ok(())
//! };
//! sender.send(0x1FFF_FF02, &[0; 8]).unwrap();
//!
//! let frame = CanFrame::new(0x1FFF_FF01, &[0x00, 0x01, 0x04, 0, 0, 0, 0, 0]).unwrap();
//! assert_eq!(frame.len(), 8);
//! assert!(frame.is_extended());
//! ```

use crate::protocol::frame::FRAME_LEN;
use std::io;

/// Largest identifier representable in an 11-bit standard frame.
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Largest identifier representable in a 29-bit extended frame.
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// A received CAN data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    /// Frame identifier (11 or 29 bit).
    pub id: u32,
    data: [u8; FRAME_LEN],
    len: u8,
}

impl CanFrame {
    /// Create a frame from an identifier and up to eight data bytes.
    ///
    /// Returns `None` if `data` is longer than a classic CAN payload.
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(id: u32, data: &[u8]) -> Option<Self> {
        if data.len() > FRAME_LEN {
            return None;
        }
        let mut buf = [0u8; FRAME_LEN];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id,
            data: buf,
            len: data.len() as u8,
        })
    }

    /// Payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }

    /// Payload length (DLC).
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    /// Check whether the frame carries no payload.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check whether the identifier needs a 29-bit extended frame.
    pub fn is_extended(&self) -> bool {
        self.id > MAX_STANDARD_ID
    }
}

/// Outbound side of the CAN bus.
///
/// Called synchronously from within the flasher; every call must have handed
/// the frame to the bus driver (or failed) before it returns.
pub trait FrameSender {
    /// Transmit one 8-byte frame with the given identifier.
    fn send(&mut self, can_id: u32, data: &[u8; FRAME_LEN]) -> io::Result<()>;
}

impl<F> FrameSender for F
where
    F: FnMut(u32, &[u8; FRAME_LEN]) -> io::Result<()>,
{
    fn send(&mut self, can_id: u32, data: &[u8; FRAME_LEN]) -> io::Result<()> {
        self(can_id, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_frame_new() {
        let frame = CanFrame::new(0x123, &[1, 2, 3]).unwrap();
        assert_eq!(frame.data(), &[1, 2, 3]);
        assert_eq!(frame.len(), 3);
        assert!(!frame.is_extended());
        assert!(!frame.is_empty());
    }

    #[test]
    fn test_can_frame_rejects_long_payload() {
        assert!(CanFrame::new(0x123, &[0; 9]).is_none());
    }

    #[test]
    fn test_closure_sender() {
        let mut log = Vec::new();
        {
            let mut sender = |id: u32, data: &[u8; 8]| -> io::Result<()> {
                log.push((id, data[2]));
                Ok(())
            };
            sender.send(0x7FF, &[0, 0, 0x80, 0, 0, 0, 0, 0]).unwrap();
        }
        assert_eq!(log, vec![(0x7FF, 0x80)]);
    }

    #[test]
    fn test_boxed_sender() {
        let mut boxed: Box<dyn FnMut(u32, &[u8; 8]) -> io::Result<()>> =
            Box::new(|_, _| Err(io::Error::other("bus off")));
        assert!(boxed.send(1, &[0; 8]).is_err());
    }
}

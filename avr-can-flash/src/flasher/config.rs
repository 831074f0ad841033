//! Flash session configuration.

use crate::error::{Error, Result};
use crate::protocol::frame::{CAN_ID_MCU_TO_REMOTE, CAN_ID_REMOTE_TO_MCU, FRAME_LEN};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Frame sent to the running application to make it jump into the
/// bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ResetFrame {
    /// CAN identifier.
    pub can_id: u32,
    /// Payload.
    pub data: [u8; FRAME_LEN],
}

impl ResetFrame {
    /// Create a reset frame.
    pub fn new(can_id: u32, data: [u8; FRAME_LEN]) -> Self {
        Self { can_id, data }
    }

    /// Parse the payload from hex text such as `"0x01 0x02 ..."`,
    /// `"01:02:..."` or `"0102030405060708"`.
    ///
    /// Missing trailing bytes are zero.
    pub fn parse(can_id: u32, text: &str) -> Result<Self> {
        let digits: String = text
            .replace("0x", "")
            .replace("0X", "")
            .chars()
            .filter(|c| !c.is_whitespace() && !matches!(c, ':' | ',' | '-'))
            .collect();

        if !digits.is_ascii() || digits.len() % 2 != 0 || digits.len() > 2 * FRAME_LEN {
            return Err(Error::Config(format!(
                "reset message must be up to {FRAME_LEN} hex bytes, got '{text}'"
            )));
        }

        let mut data = [0u8; FRAME_LEN];
        for (i, byte) in data
            .iter_mut()
            .take(digits.len() / 2)
            .enumerate()
        {
            let pair = &digits[2 * i..2 * i + 2];
            *byte = u8::from_str_radix(pair, 16).map_err(|_| {
                Error::Config(format!("invalid hex byte '{pair}' in reset message"))
            })?;
        }

        Ok(Self { can_id, data })
    }
}

/// Configuration of one flash session.
///
/// Built once before [`FlashEngine::start`](super::FlashEngine::start) and
/// not changed while the session runs.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FlashConfig {
    /// Id of the target MCU as configured in its bootloader.
    pub mcu_id: u16,
    /// Part number of the target (e.g. `m328p`).
    pub part: String,
    /// Frame that asks the application to enter the bootloader.
    pub reset_frame: Option<ResetFrame>,
    /// Send `reset_frame` (if any) when the session starts.
    pub send_reset: bool,
    /// Erase the flash before writing.
    pub erase: bool,
    /// Read this many bytes back instead of flashing (0 = flash).
    pub read_length: u16,
    /// Read the flash back after writing and compare it with the image.
    pub verify: bool,
    /// Flash even if the bootloader speaks another command set version.
    pub force: bool,
    /// CAN id of frames sent to the bootloader.
    pub can_id_remote_to_mcu: u32,
    /// CAN id of frames sent by the bootloader.
    pub can_id_mcu_to_remote: u32,
    /// Log progress as percentages instead of per-frame details.
    pub simple_progress: bool,
}

impl FlashConfig {
    /// Create a configuration for flashing `part` on MCU `mcu_id`.
    pub fn new(mcu_id: u16, part: impl Into<String>) -> Self {
        Self {
            mcu_id,
            part: part.into(),
            ..Default::default()
        }
    }

    /// Set the reset frame.
    #[must_use]
    pub fn with_reset_frame(mut self, frame: ResetFrame) -> Self {
        self.reset_frame = Some(frame);
        self
    }

    /// Enable or disable sending the reset frame.
    #[must_use]
    pub fn with_send_reset(mut self, send: bool) -> Self {
        self.send_reset = send;
        self
    }

    /// Erase before flashing.
    #[must_use]
    pub fn with_erase(mut self, erase: bool) -> Self {
        self.erase = erase;
        self
    }

    /// Read `length` bytes back instead of flashing.
    #[must_use]
    pub fn with_read_length(mut self, length: u16) -> Self {
        self.read_length = length;
        self
    }

    /// Verify after flashing.
    #[must_use]
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Ignore a bootloader version mismatch.
    #[must_use]
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Set both CAN identifiers.
    #[must_use]
    pub fn with_can_ids(mut self, remote_to_mcu: u32, mcu_to_remote: u32) -> Self {
        self.can_id_remote_to_mcu = remote_to_mcu;
        self.can_id_mcu_to_remote = mcu_to_remote;
        self
    }

    /// Log progress as percentages.
    #[must_use]
    pub fn with_simple_progress(mut self, simple: bool) -> Self {
        self.simple_progress = simple;
        self
    }

    /// Check whether the session reads flash instead of writing it.
    pub fn is_read_mode(&self) -> bool {
        self.read_length > 0
    }

    /// Check whether the session will verify after writing.
    ///
    /// Verification is meaningless when only reading.
    pub fn verifies(&self) -> bool {
        self.verify && !self.is_read_mode()
    }
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            mcu_id: 0,
            part: String::new(),
            reset_frame: None,
            send_reset: true,
            erase: false,
            read_length: 0,
            verify: true,
            force: false,
            can_id_remote_to_mcu: CAN_ID_REMOTE_TO_MCU,
            can_id_mcu_to_remote: CAN_ID_MCU_TO_REMOTE,
            simple_progress: false,
        }
    }
}

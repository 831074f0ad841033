//! CAN bootloader frame format.
//!
//! Every bootloader message is a single 8-byte CAN payload:
//!
//! ```text
//! +----------+-----+-------------+-----------------------+
//! |  MCU id  | CMD | len | addr  |         body          |
//! +----------+-----+-------------+-----------------------+
//! |  2 bytes |  1  | 3b  |  5b   |        4 bytes        |
//! +----------+-----+-------------+-----------------------+
//! | BE u16   | cmd | count, low  | signature + version,  |
//! |          |     | address bits| BE address or data    |
//! +----------+-----+-------------+-----------------------+
//! ```
//!
//! The low address bits in byte 3 only let each side check that both agree
//! on the current flash address; the full address travels in
//! `FLASH_SET_ADDRESS`, `FLASH_READ` and `FLASH_READY`.

use crate::error::{Error, Result};
use crate::target::Signature;
use byteorder::{BigEndian, ByteOrder};
use std::fmt;

/// Payload length of every bootloader frame.
pub const FRAME_LEN: usize = 8;

/// Maximum number of data bytes carried by one frame.
pub const MAX_DATA_LEN: usize = 4;

/// Bootloader command set version this flasher speaks.
pub const BOOTLOADER_CMD_VERSION: u8 = 0x01;

/// Default CAN id for frames sent by the bootloader.
pub const CAN_ID_MCU_TO_REMOTE: u32 = 0x1FFF_FF01;

/// Default CAN id for frames sent to the bootloader.
pub const CAN_ID_REMOTE_TO_MCU: u32 = 0x1FFF_FF02;

/// Mask of the address bits packed into byte 3.
pub const ADDRESS_LOW_MASK: u8 = 0b0001_1111;

const BYTE_MCU_ID: usize = 0;
const BYTE_CMD: usize = 2;
const BYTE_LEN_AND_ADDR: usize = 3;
const BYTE_BODY: usize = 4;

/// Bootloader commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Bootloader is up and announces signature and version (mcu -> remote).
    BootloaderStart = 0b0000_0010,
    /// Enter flash mode (remote -> mcu).
    FlashInit = 0b0000_0110,
    /// Ready for the next command, echoes the current address (mcu -> remote).
    FlashReady = 0b0000_0100,
    /// Set the flash address (remote -> mcu).
    FlashSetAddress = 0b0000_1010,
    /// Address rejected (mcu -> remote).
    FlashAddressError = 0b0000_1011,
    /// Data to write (remote -> mcu).
    FlashData = 0b0000_1000,
    /// Data rejected (mcu -> remote).
    FlashDataError = 0b0000_1101,
    /// All data sent, start the application (remote -> mcu).
    FlashDone = 0b0001_0000,
    /// All data sent, stay for verification (both directions).
    FlashDoneVerify = 0b0101_0000,
    /// Erase the application flash (remote -> mcu).
    FlashErase = 0b0010_0000,
    /// Read flash at an address (remote -> mcu).
    FlashRead = 0b0100_0000,
    /// Flash contents (mcu -> remote).
    FlashReadData = 0b0100_1000,
    /// Read address beyond the end of flash (mcu -> remote).
    FlashReadAddressError = 0b0100_1011,
    /// Leave the bootloader and run the application (both directions).
    StartApp = 0b1000_0000,
}

impl Command {
    /// Map a command byte to a known command.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0b0000_0010 => Self::BootloaderStart,
            0b0000_0110 => Self::FlashInit,
            0b0000_0100 => Self::FlashReady,
            0b0000_1010 => Self::FlashSetAddress,
            0b0000_1011 => Self::FlashAddressError,
            0b0000_1000 => Self::FlashData,
            0b0000_1101 => Self::FlashDataError,
            0b0001_0000 => Self::FlashDone,
            0b0101_0000 => Self::FlashDoneVerify,
            0b0010_0000 => Self::FlashErase,
            0b0100_0000 => Self::FlashRead,
            0b0100_1000 => Self::FlashReadData,
            0b0100_1011 => Self::FlashReadAddressError,
            0b1000_0000 => Self::StartApp,
            _ => return None,
        })
    }

    /// Protocol name of the command.
    pub fn name(self) -> &'static str {
        match self {
            Self::BootloaderStart => "BOOTLOADER_START",
            Self::FlashInit => "FLASH_INIT",
            Self::FlashReady => "FLASH_READY",
            Self::FlashSetAddress => "FLASH_SET_ADDRESS",
            Self::FlashAddressError => "FLASH_ADDRESS_ERROR",
            Self::FlashData => "FLASH_DATA",
            Self::FlashDataError => "FLASH_DATA_ERROR",
            Self::FlashDone => "FLASH_DONE",
            Self::FlashDoneVerify => "FLASH_DONE_VERIFY",
            Self::FlashErase => "FLASH_ERASE",
            Self::FlashRead => "FLASH_READ",
            Self::FlashReadData => "FLASH_READ_DATA",
            Self::FlashReadAddressError => "FLASH_READ_ADDRESS_ERROR",
            Self::StartApp => "START_APP",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded (or to-be-encoded) bootloader frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Target MCU id.
    pub mcu_id: u16,
    /// Command.
    pub command: Command,
    /// Packed byte count and low address bits.
    pub len_and_addr: u8,
    /// Command specific body.
    pub body: [u8; 4],
}

impl Frame {
    /// Frame with an empty body.
    pub fn new(mcu_id: u16, command: Command) -> Self {
        Self {
            mcu_id,
            command,
            len_and_addr: 0,
            body: [0; 4],
        }
    }

    /// `FLASH_INIT` carrying the expected device signature.
    pub fn flash_init(mcu_id: u16, signature: Signature) -> Self {
        let [s0, s1, s2] = signature.bytes();
        Self {
            body: [s0, s1, s2, 0],
            ..Self::new(mcu_id, Command::FlashInit)
        }
    }

    /// Frame with a big-endian address body (`FLASH_SET_ADDRESS`,
    /// `FLASH_READ`, `FLASH_READY`).
    pub fn with_address(mcu_id: u16, command: Command, address: u32) -> Self {
        let mut body = [0; 4];
        BigEndian::write_u32(&mut body, address);
        Self {
            body,
            ..Self::new(mcu_id, command)
        }
    }

    /// `FLASH_SET_ADDRESS` frame.
    pub fn set_address(mcu_id: u16, address: u32) -> Self {
        Self::with_address(mcu_id, Command::FlashSetAddress, address)
    }

    /// `FLASH_READ` frame.
    pub fn read(mcu_id: u16, address: u32) -> Self {
        Self::with_address(mcu_id, Command::FlashRead, address)
    }

    /// Frame carrying up to four data bytes for `address` (`FLASH_DATA`,
    /// `FLASH_READ_DATA`).
    ///
    /// Bytes beyond [`MAX_DATA_LEN`] are ignored.
    #[allow(clippy::cast_possible_truncation)]
    pub fn with_data(mcu_id: u16, command: Command, address: u32, data: &[u8]) -> Self {
        let len = data.len().min(MAX_DATA_LEN);
        let mut body = [0; 4];
        body[..len].copy_from_slice(&data[..len]);
        Self {
            len_and_addr: pack_len_and_addr(len as u8, address),
            body,
            ..Self::new(mcu_id, command)
        }
    }

    /// `FLASH_DATA` frame.
    pub fn data(mcu_id: u16, address: u32, data: &[u8]) -> Self {
        Self::with_data(mcu_id, Command::FlashData, address, data)
    }

    /// Decode a CAN payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() != FRAME_LEN {
            return Err(Error::MalformedFrame(format!(
                "expected {FRAME_LEN} bytes, got {}",
                payload.len()
            )));
        }

        let code = payload[BYTE_CMD];
        let command = Command::from_u8(code)
            .ok_or_else(|| Error::MalformedFrame(format!("unknown command 0x{code:02X}")))?;

        let mut body = [0; 4];
        body.copy_from_slice(&payload[BYTE_BODY..]);

        Ok(Self {
            mcu_id: BigEndian::read_u16(&payload[BYTE_MCU_ID..]),
            command,
            len_and_addr: payload[BYTE_LEN_AND_ADDR],
            body,
        })
    }

    /// Encode into a CAN payload.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        BigEndian::write_u16(&mut buf[BYTE_MCU_ID..], self.mcu_id);
        buf[BYTE_CMD] = self.command as u8;
        buf[BYTE_LEN_AND_ADDR] = self.len_and_addr;
        buf[BYTE_BODY..].copy_from_slice(&self.body);
        buf
    }

    /// Byte count from the top three bits of byte 3.
    pub fn byte_count(&self) -> u8 {
        self.len_and_addr >> 5
    }

    /// Low five address bits from byte 3.
    pub fn address_low(&self) -> u8 {
        self.len_and_addr & ADDRESS_LOW_MASK
    }

    /// Body interpreted as a big-endian address.
    pub fn address(&self) -> u32 {
        BigEndian::read_u32(&self.body)
    }

    /// Body interpreted as device signature (`BOOTLOADER_START`).
    pub fn signature(&self) -> Signature {
        Signature::new([self.body[0], self.body[1], self.body[2]])
    }

    /// Bootloader command set version (`BOOTLOADER_START`).
    pub fn version(&self) -> u8 {
        self.body[3]
    }

    /// Data bytes, limited by the byte count (`FLASH_DATA`, `FLASH_READ_DATA`).
    pub fn payload(&self) -> &[u8] {
        let len = usize::from(self.byte_count()).min(MAX_DATA_LEN);
        &self.body[..len]
    }
}

/// Pack a byte count and the low address bits into byte 3.
#[allow(clippy::cast_possible_truncation)]
pub fn pack_len_and_addr(len: u8, address: u32) -> u8 {
    (len << 5) | (address as u8 & ADDRESS_LOW_MASK)
}

//! Intel HEX parsing and encoding.
//!
//! Only the two record types an AVR image in a 16-bit address space needs are
//! supported:
//!
//! ```text
//! +---+-------+---------+------+----------------+----------+
//! | : | count | address | type |      data      | checksum |
//! +---+-------+---------+------+----------------+----------+
//! | 1 |   2   |    4    |  2   |   2 * count    |    2     |
//! +---+-------+---------+------+----------------+----------+
//!                          00 = data, 01 = end of file
//! ```
//!
//! Field widths are in hex digits. A record is valid when all decoded bytes,
//! checksum included, sum to zero modulo 256. Extended address records
//! (types 02 and 04) are rejected, so images larger than 64 KiB cannot be
//! represented.

use crate::error::{Error, Result};
use crate::image::memory::MemoryImage;
use log::debug;
use std::fmt::Write;

/// Maximum number of data bytes per record.
pub const MAX_RECORD_LEN: usize = 16;

/// Size of the addressable space covered by a 16-bit record address.
pub const ADDRESS_SPACE: usize = 0x1_0000;

/// Intel HEX record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Data record (00).
    Data = 0x00,
    /// End-of-file record (01).
    EndOfFile = 0x01,
}

impl RecordType {
    /// Map a record type byte to a supported type.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Data),
            0x01 => Some(Self::EndOfFile),
            _ => None,
        }
    }
}

/// A single decoded Intel HEX record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    /// Load address of the first data byte.
    pub address: u16,
    /// Record type.
    pub record_type: RecordType,
    /// Payload bytes.
    pub data: Vec<u8>,
    /// Checksum byte as read (or as computed when encoding).
    pub checksum: u8,
}

impl HexRecord {
    /// Build a data record with a correct checksum.
    ///
    /// `data` must not be longer than [`MAX_RECORD_LEN`].
    pub fn data(address: u16, data: &[u8]) -> Self {
        debug_assert!(
            data.len() <= MAX_RECORD_LEN,
            "record data of {} bytes exceeds {MAX_RECORD_LEN}",
            data.len()
        );
        let mut record = Self {
            address,
            record_type: RecordType::Data,
            data: data.to_vec(),
            checksum: 0,
        };
        record.checksum = checksum(&record.header_and_data());
        record
    }

    /// Build the end-of-file record (`:00000001FF`).
    pub fn end_of_file() -> Self {
        Self {
            address: 0,
            record_type: RecordType::EndOfFile,
            data: Vec::new(),
            checksum: 0xFF,
        }
    }

    /// Number of data bytes.
    #[allow(clippy::cast_possible_truncation)]
    pub fn byte_count(&self) -> u8 {
        // Bounded by MAX_RECORD_LEN on both the parse and encode paths.
        self.data.len() as u8
    }

    /// Check whether this is the end-of-file record.
    pub fn is_eof(&self) -> bool {
        self.record_type == RecordType::EndOfFile
    }

    /// Render the record as one Intel HEX line (without line ending).
    pub fn to_line(&self) -> String {
        let mut line = String::with_capacity(11 + 2 * self.data.len());
        line.push(':');
        for byte in self.header_and_data() {
            let _ = write!(line, "{byte:02X}");
        }
        let _ = write!(line, "{:02X}", self.checksum);
        line
    }

    fn header_and_data(&self) -> Vec<u8> {
        let [addr_hi, addr_lo] = self.address.to_be_bytes();
        let mut bytes = vec![self.byte_count(), addr_hi, addr_lo, self.record_type as u8];
        bytes.extend_from_slice(&self.data);
        bytes
    }
}

/// Two's-complement checksum that makes `bytes` plus the result sum to zero.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
        .wrapping_neg()
}

/// Parse Intel HEX text into a memory image.
///
/// Either the whole text is valid or nothing is returned: the first bad
/// record aborts parsing with its line number.
pub fn parse(text: &str) -> Result<MemoryImage> {
    let mut records = Vec::new();
    let mut eof_line = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(eof) = eof_line {
            return Err(Error::hex(
                line_no,
                format!("record after end-of-file record on line {eof}"),
            ));
        }

        let record = parse_record(line).map_err(|reason| Error::hex(line_no, reason))?;
        if record.is_eof() {
            eof_line = Some(line_no);
        }
        records.push(record);
    }

    if records.is_empty() {
        return Err(Error::hex(0, "no records found"));
    }

    debug!(
        "Parsed {} Intel HEX records ({} data bytes)",
        records.len(),
        records
            .iter()
            .map(|r| r.data.len())
            .sum::<usize>()
    );

    Ok(MemoryImage::new(records))
}

fn parse_record(line: &str) -> std::result::Result<HexRecord, String> {
    let digits = line
        .strip_prefix(':')
        .ok_or_else(|| "missing ':' start code".to_string())?;

    if !digits.is_ascii() {
        return Err("non-ASCII characters in record".into());
    }
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits ({})", digits.len()));
    }
    // count(1) + address(2) + type(1) + checksum(1)
    if digits.len() < 10 {
        return Err(format!("truncated record ({} hex digits)", digits.len()));
    }

    let bytes = (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| format!("invalid hex digits '{}'", &digits[i..i + 2]))
        })
        .collect::<std::result::Result<Vec<u8>, String>>()?;

    let byte_count = bytes[0] as usize;
    let available = bytes.len() - 5;
    if byte_count > available {
        return Err(format!(
            "byte count {byte_count} exceeds the {available} data bytes present"
        ));
    }
    if byte_count < available {
        return Err(format!(
            "{} trailing bytes after {byte_count} data bytes",
            available - byte_count
        ));
    }
    if byte_count > MAX_RECORD_LEN {
        return Err(format!(
            "byte count {byte_count} exceeds {MAX_RECORD_LEN} bytes per record"
        ));
    }

    let sum = bytes
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != 0 {
        return Err(format!("checksum mismatch (sum is 0x{sum:02X})"));
    }

    let record_type = RecordType::from_u8(bytes[3])
        .ok_or_else(|| format!("unsupported record type 0x{:02X}", bytes[3]))?;

    Ok(HexRecord {
        address: u16::from_be_bytes([bytes[1], bytes[2]]),
        record_type,
        data: bytes[4..4 + byte_count].to_vec(),
        checksum: bytes[4 + byte_count],
    })
}

/// Encode a flat buffer starting at `base_address` as Intel HEX text.
///
/// Emits 16-byte data records (the last one may be shorter) and one
/// end-of-file record, one per line.
#[allow(clippy::cast_possible_truncation)]
pub fn encode(buffer: &[u8], base_address: u16) -> Result<String> {
    let end = base_address as usize + buffer.len();
    if end > ADDRESS_SPACE {
        return Err(Error::hex(
            0,
            format!(
                "{} bytes at 0x{base_address:04X} exceed the 16-bit address space",
                buffer.len()
            ),
        ));
    }

    let mut out = String::with_capacity(buffer.len() / MAX_RECORD_LEN * 44 + 12);
    for (i, chunk) in buffer
        .chunks(MAX_RECORD_LEN)
        .enumerate()
    {
        // Fits: end <= ADDRESS_SPACE was checked above.
        let address = (base_address as usize + i * MAX_RECORD_LEN) as u16;
        out.push_str(&HexRecord::data(address, chunk).to_line());
        out.push('\n');
    }
    out.push_str(&HexRecord::end_of_file().to_line());
    out.push('\n');

    Ok(out)
}

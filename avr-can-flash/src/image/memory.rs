//! In-memory firmware image with a sequential read cursor.
//!
//! The flasher walks the image front to back, a few bytes per CAN frame. The
//! cursor is a `(line, offset)` pair into the record list: whenever the offset
//! reaches the end of a data record it moves on to the start of the next one,
//! so the cursor either points at an unread byte or is exhausted (sitting on
//! the end-of-file record or past the last record).
//!
//! Records are expected in ascending, gap-free address order; the cursor does
//! not check this.

use crate::image::ihex::HexRecord;

/// Parsed firmware image plus read cursor.
#[derive(Debug, Clone)]
pub struct MemoryImage {
    records: Vec<HexRecord>,
    line: usize,
    offset: usize,
    consumed: usize,
}

impl MemoryImage {
    /// Create an image from records in file order, cursor at the first byte.
    pub fn new(records: Vec<HexRecord>) -> Self {
        let mut image = Self {
            records,
            line: 0,
            offset: 0,
            consumed: 0,
        };
        image.skip_finished_records();
        image
    }

    /// All records in file order.
    pub fn records(&self) -> &[HexRecord] {
        &self.records
    }

    /// Index of the record under the cursor.
    pub fn line(&self) -> usize {
        self.line
    }

    /// Byte offset into the record under the cursor.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Move the cursor back to the first byte.
    pub fn rewind(&mut self) {
        self.line = 0;
        self.offset = 0;
        self.consumed = 0;
        self.skip_finished_records();
    }

    /// Check whether the cursor has reached end-of-file.
    pub fn is_exhausted(&self) -> bool {
        self.records
            .get(self.line)
            .is_none_or(HexRecord::is_eof)
    }

    /// Flash address of the byte under the cursor.
    #[allow(clippy::cast_possible_truncation)]
    pub fn address(&self) -> Option<u32> {
        // Offsets stay below MAX_RECORD_LEN.
        self.current_record()
            .map(|r| u32::from(r.address) + self.offset as u32)
    }

    /// Byte under the cursor.
    pub fn current_byte(&self) -> Option<u8> {
        self.current_record()
            .map(|r| r.data[self.offset])
    }

    /// Up to `max` unread bytes of the current record.
    ///
    /// Never crosses into the next record, so the returned bytes are always
    /// contiguous in flash.
    pub fn peek(&self, max: usize) -> &[u8] {
        match self.current_record() {
            Some(record) => {
                let end = (self.offset + max).min(record.data.len());
                &record.data[self.offset..end]
            },
            None => &[],
        }
    }

    /// Move the cursor forward by up to `count` bytes, crossing record
    /// boundaries as needed.
    ///
    /// Stops early at end-of-file and returns the number of bytes actually
    /// skipped.
    pub fn advance(&mut self, count: usize) -> usize {
        let mut remaining = count;
        while remaining > 0 {
            let Some(record) = self.current_record() else {
                break;
            };
            let step = remaining.min(record.data.len() - self.offset);
            self.offset += step;
            self.consumed += step;
            remaining -= step;
            self.skip_finished_records();
        }
        count - remaining
    }

    /// Total number of data bytes in the image.
    pub fn data_len(&self) -> usize {
        self.records
            .iter()
            .filter(|r| !r.is_eof())
            .map(|r| r.data.len())
            .sum()
    }

    /// Number of data bytes the cursor has moved past.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Address of the first data record, if any.
    pub fn base_address(&self) -> Option<u16> {
        self.records
            .iter()
            .find(|r| !r.is_eof())
            .map(|r| r.address)
    }

    /// Iterate over every data byte with its flash address.
    #[allow(clippy::cast_possible_truncation)]
    pub fn bytes(&self) -> impl Iterator<Item = (u32, u8)> + '_ {
        self.records
            .iter()
            .filter(|r| !r.is_eof())
            .flat_map(|r| {
                r.data
                    .iter()
                    .enumerate()
                    // Indices stay below MAX_RECORD_LEN.
                    .map(move |(i, b)| (u32::from(r.address) + i as u32, *b))
            })
    }

    /// Record under the cursor, `None` once exhausted.
    fn current_record(&self) -> Option<&HexRecord> {
        self.records
            .get(self.line)
            .filter(|r| !r.is_eof())
    }

    fn skip_finished_records(&mut self) {
        while let Some(record) = self.current_record() {
            if self.offset < record.data.len() {
                break;
            }
            self.line += 1;
            self.offset = 0;
        }
    }
}

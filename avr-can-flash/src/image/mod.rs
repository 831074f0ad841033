//! Firmware image formats.

pub mod ihex;
pub mod memory;

pub use ihex::{HexRecord, RecordType};
pub use memory::MemoryImage;

//! Target device descriptions.

pub mod part;

pub use part::{AvrPart, Signature, resolve, supported_parts};

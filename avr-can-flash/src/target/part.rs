//! AVR part numbers and their signature bytes.
//!
//! The bootloader announces the three signature bytes of the chip it runs on
//! in its `BOOTLOADER_START` frame. The flasher resolves the configured part
//! number to the expected signature up front, so a typo in the part number is
//! reported at start-up instead of as a signature mismatch later.

use crate::error::{Error, Result};
use std::fmt;

/// Three-byte AVR device signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature([u8; 3]);

impl Signature {
    /// Create a signature from its three bytes.
    pub const fn new(bytes: [u8; 3]) -> Self {
        Self(bytes)
    }

    /// Signature bytes in the order the device reports them.
    pub const fn bytes(&self) -> [u8; 3] {
        self.0
    }

    /// Signature packed into the low 24 bits of a `u32`.
    pub const fn as_u32(&self) -> u32 {
        (self.0[0] as u32) << 16 | (self.0[1] as u32) << 8 | self.0[2] as u32
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:06X}", self.as_u32())
    }
}

/// A supported AVR part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvrPart {
    /// Canonical part name.
    pub name: &'static str,
    /// Accepted spellings (lowercase).
    pub aliases: &'static [&'static str],
    /// Device signature.
    pub signature: Signature,
}

/// Known parts, each accepted as `mXXX`, `megaXXX` or `atmegaXXX`.
const KNOWN_PARTS: &[AvrPart] = &[
    AvrPart {
        name: "ATmega32",
        aliases: &["m32", "mega32", "atmega32"],
        signature: Signature::new([0x1E, 0x95, 0x02]),
    },
    AvrPart {
        name: "ATmega328",
        aliases: &["m328", "mega328", "atmega328"],
        signature: Signature::new([0x1E, 0x95, 0x14]),
    },
    AvrPart {
        name: "ATmega328P",
        aliases: &["m328p", "mega328p", "atmega328p"],
        signature: Signature::new([0x1E, 0x95, 0x0F]),
    },
    AvrPart {
        name: "ATmega64",
        aliases: &["m64", "mega64", "atmega64"],
        signature: Signature::new([0x1E, 0x96, 0x02]),
    },
    AvrPart {
        name: "ATmega644P",
        aliases: &["m644p", "mega644p", "atmega644p"],
        signature: Signature::new([0x1E, 0x96, 0x0A]),
    },
    AvrPart {
        name: "ATmega128",
        aliases: &["m128", "mega128", "atmega128"],
        signature: Signature::new([0x1E, 0x97, 0x02]),
    },
    AvrPart {
        name: "ATmega1284P",
        aliases: &["m1284p", "mega1284p", "atmega1284p"],
        signature: Signature::new([0x1E, 0x97, 0x05]),
    },
    AvrPart {
        name: "ATmega2560",
        aliases: &["m2560", "mega2560", "atmega2560"],
        signature: Signature::new([0x1E, 0x98, 0x01]),
    },
];

impl AvrPart {
    /// Look up a part by any of its aliases, ignoring case.
    pub fn find(part_number: &str) -> Option<&'static Self> {
        let wanted = part_number
            .trim()
            .to_lowercase();
        KNOWN_PARTS
            .iter()
            .find(|part| part.aliases.contains(&wanted.as_str()))
    }
}

impl fmt::Display for AvrPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.signature)
    }
}

/// Resolve a part number to the signature the bootloader should report.
pub fn resolve(part_number: &str) -> Result<Signature> {
    AvrPart::find(part_number)
        .map(|part| part.signature)
        .ok_or_else(|| Error::UnknownDevice(part_number.to_string()))
}

/// All parts in the device table.
pub fn supported_parts() -> &'static [AvrPart] {
    KNOWN_PARTS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_is_case_insensitive() {
        for name in ["atmega328p", "ATmega328P", "m328p", "MEGA328P"] {
            assert_eq!(resolve(name).unwrap().as_u32(), 0x1E950F, "{name}");
        }
    }

    #[test]
    fn test_resolve_unknown_part() {
        let err = resolve("bogus").unwrap_err();
        assert!(matches!(err, Error::UnknownDevice(ref name) if name == "bogus"));
    }

    #[test]
    fn test_resolve_distinguishes_p_variants() {
        assert_eq!(resolve("m328").unwrap().bytes(), [0x1E, 0x95, 0x14]);
        assert_eq!(resolve("m328p").unwrap().bytes(), [0x1E, 0x95, 0x0F]);
    }

    #[test]
    fn test_no_part_has_zero_signature() {
        assert!(
            supported_parts()
                .iter()
                .all(|p| p.signature.as_u32() != 0)
        );
    }

    #[test]
    fn test_signature_display() {
        let sig = resolve("atmega2560").unwrap();
        assert_eq!(sig.to_string(), "0x1E9801");
        assert_eq!(
            AvrPart::find("m2560").unwrap().to_string(),
            "ATmega2560 (0x1E9801)"
        );
    }
}

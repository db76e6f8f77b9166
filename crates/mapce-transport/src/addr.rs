//! Bluetooth device addressing.

use std::fmt;
use std::str::FromStr;

/// 48-bit Bluetooth device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 6]);

impl Address {
    /// All-zero address, used as a placeholder
    pub const ANY: Self = Self([0; 6]);

    /// Create an address from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Raw address bytes
    #[must_use]
    pub fn to_bytes(self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Error parsing an address from text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid bluetooth address: {0}")]
pub struct AddressParseError(pub String);

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(AddressParseError(s.to_owned()));
        }
        for (slot, part) in bytes.iter_mut().zip(parts) {
            *slot = u8::from_str_radix(part, 16).map_err(|_| AddressParseError(s.to_owned()))?;
        }
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_roundtrip() {
        let addr = Address::from_bytes([0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03]);
        let text = addr.to_string();
        assert_eq!(text, "AA:BB:CC:01:02:03");
        assert_eq!(text.parse::<Address>().unwrap(), addr);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("not-an-address".parse::<Address>().is_err());
        assert!("AA:BB:CC:01:02".parse::<Address>().is_err());
        assert!("AA:BB:CC:01:02:ZZ".parse::<Address>().is_err());
    }
}

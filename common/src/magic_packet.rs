//! Wake-On-Lan magic packet construction.
//!
//! A magic packet is six `0xFF` bytes followed by sixteen repetitions of the
//! target's hardware address.

use core::{fmt, str::FromStr};

use thiserror::Error as ThisError;

/// Length of a magic packet in bytes.
pub const MAGIC_PACKET_LEN: usize = 6 + 16 * 6;

/// Default UDP port magic packets are sent to (the "discard" port).
pub const DEFAULT_WAKE_PORT: u16 = 9;

/// A parsed 48-bit hardware (MAC) address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

/// Reasons a hardware address string was rejected.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum MacParseError {
    #[error("expected 6 octets separated by ':' or '-', got {0}")]
    WrongLength(usize),
    #[error("invalid octet '{0}'")]
    InvalidOctet(String),
}

impl MacAddress {
    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Builds the magic packet that wakes the host owning this address.
    #[must_use]
    pub fn magic_packet(&self) -> [u8; MAGIC_PACKET_LEN] {
        let mut packet = [0xFF_u8; MAGIC_PACKET_LEN];
        for chunk in packet.chunks_exact_mut(6).skip(1) {
            chunk.copy_from_slice(&self.0);
        }
        packet
    }
}

impl FromStr for MacAddress {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(MacParseError::WrongLength(parts.len()));
        }

        let mut octets = [0_u8; 6];
        for (octet, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(MacParseError::InvalidOctet(part.to_string()));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| MacParseError::InvalidOctet(part.to_string()))?;
        }

        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

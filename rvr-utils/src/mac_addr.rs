//
// Copyright (c) The Rvrd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

// 48-bit MAC address (IEEE EUI-48 format).
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct MacAddr([u8; 6]);

// ===== impl MacAddr =====

impl MacAddr {
    pub const LENGTH: usize = 6;
    pub const BROADCAST: Self = Self([0xff; 6]);

    // Prefix reserved for virtual-router MAC addresses (the VRRP virtual MAC
    // convention, 00:00:5e:00:01:xx).
    const VROUTER_PREFIX: [u8; 5] = [0x00, 0x00, 0x5e, 0x00, 0x01];

    pub fn as_bytes(&self) -> [u8; 6] {
        self.0
    }

    /// Returns the shared virtual MAC address for the given virtual-router
    /// group. Both members of a redundant pair present this address on their
    /// public interface.
    pub fn virtual_router(group: u8) -> MacAddr {
        let mut bytes = [0u8; 6];
        bytes[..5].copy_from_slice(&Self::VROUTER_PREFIX);
        bytes[5] = group;
        MacAddr(bytes)
    }

    /// Generates a random unicast MAC address with the locally-administered
    /// bit set. Used for per-instance guest NICs, which must be distinct
    /// within a pair.
    pub fn random_unicast() -> MacAddr {
        let mut bytes = [0u8; 6];
        rand::rng().fill_bytes(&mut bytes);
        // Unicast, locally administered.
        bytes[0] &= !0x01;
        bytes[0] |= 0x02;
        MacAddr(bytes)
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(bytes: [u8; 6]) -> Self {
        MacAddr(bytes)
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5],
        ))
    }
}

/// Error type for MAC address parsing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParseMacAddrError;

impl std::fmt::Display for ParseMacAddrError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid MAC address format")
    }
}

impl std::error::Error for ParseMacAddrError {}

impl FromStr for MacAddr {
    type Err = ParseMacAddrError;

    /// Parse a MAC address from a string.
    ///
    /// Accepts formats:
    /// - Colon-separated: "aa:bb:cc:dd:ee:ff"
    /// - Hyphen-separated: "aa-bb-cc-dd-ee-ff"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = if s.contains(':') {
            s.split(':').collect()
        } else if s.contains('-') {
            s.split('-').collect()
        } else {
            return Err(ParseMacAddrError);
        };

        if parts.len() != 6 {
            return Err(ParseMacAddrError);
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            bytes[i] =
                u8::from_str_radix(part, 16).map_err(|_| ParseMacAddrError)?;
        }

        Ok(MacAddr(bytes))
    }
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_parse_roundtrip() {
        let addr = MacAddr::from([0x02, 0x1a, 0x2b, 0x3c, 0x4d, 0x5e]);
        assert_eq!(addr.to_string(), "02:1a:2b:3c:4d:5e");
        assert_eq!("02:1a:2b:3c:4d:5e".parse::<MacAddr>().unwrap(), addr);
        assert_eq!("02-1a-2b-3c-4d-5e".parse::<MacAddr>().unwrap(), addr);
        assert!("02:1a:2b:3c:4d".parse::<MacAddr>().is_err());
        assert!("021a2b3c4d5e".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_virtual_router() {
        let addr = MacAddr::virtual_router(0x2a);
        assert_eq!(addr.to_string(), "00:00:5e:00:01:2a");
        // Same group always yields the same address.
        assert_eq!(addr, MacAddr::virtual_router(0x2a));
    }

    #[test]
    fn test_random_unicast() {
        let addr = MacAddr::random_unicast();
        let bytes = addr.as_bytes();
        // Unicast, locally administered.
        assert_eq!(bytes[0] & 0x01, 0);
        assert_eq!(bytes[0] & 0x02, 0x02);
    }
}

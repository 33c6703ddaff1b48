//! Discovery beacon wire format
//!
//! ```text
//! app_hash: i32 | group_hash: i32 | kind: i32 | hostname: prefixed string | ipv4: [u8; 4]
//! ```
//!
//! Integers are little-endian; the hostname uses the same 7-bit length prefix
//! as message strings.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

use super::{DiscoveryError, DiscoveryResult};
use crate::protocol::{get_prefixed_str, prefixed_str_len, put_prefixed_str};

const HELLO: i32 = 1;
const GOODBYE: i32 = 2;

/// Whether a beacon announces or withdraws a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconKind {
    Hello,
    Goodbye,
}

impl BeaconKind {
    pub fn to_i32(self) -> i32 {
        match self {
            BeaconKind::Hello => HELLO,
            BeaconKind::Goodbye => GOODBYE,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            HELLO => Some(BeaconKind::Hello),
            GOODBYE => Some(BeaconKind::Goodbye),
            _ => None,
        }
    }
}

/// A decoded discovery datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub app_hash: i32,
    pub group_hash: i32,
    pub kind: BeaconKind,
    pub hostname: String,
    pub address: Ipv4Addr,
}

impl Beacon {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12 + prefixed_str_len(&self.hostname) + 4);
        buf.put_i32_le(self.app_hash);
        buf.put_i32_le(self.group_hash);
        buf.put_i32_le(self.kind.to_i32());
        put_prefixed_str(&mut buf, &self.hostname);
        buf.put_slice(&self.address.octets());
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> DiscoveryResult<Self> {
        if data.remaining() < 12 {
            return Err(DiscoveryError::Truncated(data.len()));
        }
        let app_hash = data.get_i32_le();
        let group_hash = data.get_i32_le();
        let raw_kind = data.get_i32_le();
        let kind = BeaconKind::from_i32(raw_kind).ok_or(DiscoveryError::UnknownKind(raw_kind))?;
        let hostname = get_prefixed_str(&mut data)?;
        if data.remaining() < 4 {
            return Err(DiscoveryError::Truncated(data.remaining()));
        }
        let mut octets = [0u8; 4];
        data.copy_to_slice(&mut octets);

        Ok(Self {
            app_hash,
            group_hash,
            kind,
            hostname,
            address: Ipv4Addr::from(octets),
        })
    }
}

/// Hash an application or group id
///
/// Seed 23, multiplier 31, wrapping, over UTF-16 code units. Peers built on
/// other platforms compute the same value for the same id.
pub fn hash_id(text: &str) -> i32 {
    text.encode_utf16()
        .fold(23i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(unit as i32))
}

/// Directed broadcast address of the subnet `local` sits in
pub fn broadcast_address(local: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(local) | !u32::from(netmask))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Beacon {
        Beacon {
            app_hash: 1,
            group_hash: 2,
            kind: BeaconKind::Hello,
            hostname: "ab".to_string(),
            address: Ipv4Addr::new(10, 0, 0, 7),
        }
    }

    #[test]
    fn test_hash_id() {
        assert_eq!(hash_id(""), 23);
        assert_eq!(hash_id("a"), 810);
        assert_eq!(hash_id("\u{e9}"), 946);
        // Characters outside the BMP hash as two UTF-16 units
        assert_eq!(hash_id("\u{1F600}"), 1_795_002);
        // Long ids wrap instead of overflowing
        let long = "lanlink".repeat(64);
        assert_eq!(hash_id(&long), hash_id(&long));
    }

    #[test]
    fn test_broadcast_address() {
        assert_eq!(
            broadcast_address(Ipv4Addr::new(192, 168, 1, 17), Ipv4Addr::new(255, 255, 255, 0)),
            Ipv4Addr::new(192, 168, 1, 255)
        );
        assert_eq!(
            broadcast_address(Ipv4Addr::new(10, 1, 2, 3), Ipv4Addr::new(255, 255, 0, 0)),
            Ipv4Addr::new(10, 1, 255, 255)
        );
        assert_eq!(
            broadcast_address(Ipv4Addr::LOCALHOST, Ipv4Addr::BROADCAST),
            Ipv4Addr::LOCALHOST
        );
    }

    #[test]
    fn test_beacon_layout() {
        let bytes = sample().encode();
        assert_eq!(
            &bytes[..],
            &[1, 0, 0, 0, 2, 0, 0, 0, 1, 0, 0, 0, 2, b'a', b'b', 10, 0, 0, 7]
        );

        let goodbye = Beacon {
            kind: BeaconKind::Goodbye,
            ..sample()
        };
        assert_eq!(goodbye.encode()[8], 2);
    }

    #[test]
    fn test_decode() {
        let beacon = sample();
        assert_eq!(Beacon::decode(&beacon.encode()).unwrap(), beacon);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        let bytes = sample().encode();
        assert!(matches!(
            Beacon::decode(&bytes[..8]),
            Err(DiscoveryError::Truncated(8))
        ));
        // Missing address bytes
        assert!(Beacon::decode(&bytes[..bytes.len() - 1]).is_err());
        // Hostname longer than the datagram
        assert!(Beacon::decode(&bytes[..14]).is_err());

        let mut unknown = bytes.to_vec();
        unknown[8] = 9;
        assert!(matches!(
            Beacon::decode(&unknown),
            Err(DiscoveryError::UnknownKind(9))
        ));
    }
}

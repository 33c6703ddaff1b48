//! Protocol module - Defines the wire format shared by LanLink peers
//!
//! Every frame on a peer connection is:
//! - 4 bytes body length (little-endian, header included)
//! - 12 bytes header: from uid, to uid, message type (each i32, little-endian)
//! - Variable length payload of primitive or typed values

mod codec;
mod message;
mod pool;

pub use codec::*;
pub use message::*;
pub use pool::*;

/// Maximum size of a message body, header included
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Size of the fixed message header
pub const HEADER_SIZE: usize = 12;

/// Size of the length prefix in front of every frame
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default TCP port for peer connections
pub const DEFAULT_TRANSPORT_PORT: u16 = 1984;

/// Default UDP port for discovery beacons
pub const DEFAULT_DISCOVERY_PORT: u16 = 3279;

/// Number of buffers a pool keeps around for reuse by default
pub const DEFAULT_POOL_CAPACITY: usize = 256;

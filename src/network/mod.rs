//! Network module - Peer connections over non-blocking TCP
//!
//! Provides:
//! - Connection: per-socket framing state machines
//! - Transport: listener, outbound connects and message routing on a
//!   background thread

mod connection;
mod transport;
mod worker;

pub use connection::*;
pub use transport::*;

use serde::{Deserialize, Serialize};
use std::io;
use std::net::{IpAddr, Ipv4Addr};

use crate::protocol::{DEFAULT_POOL_CAPACITY, DEFAULT_TRANSPORT_PORT};

/// Configuration for the peer transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Port to listen on and to connect to on discovered peers
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to bind the listener to
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Give up on an outbound connect after this long
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Free message buffers retained by the pool
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
    /// Pause between background iterations; 0 yields instead of sleeping
    #[serde(default)]
    pub idle_sleep_us: u64,
}

fn default_port() -> u16 {
    DEFAULT_TRANSPORT_PORT
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_backlog() -> i32 {
    10
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_pool_capacity() -> usize {
    DEFAULT_POOL_CAPACITY
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            backlog: default_backlog(),
            connect_timeout_ms: default_connect_timeout(),
            pool_capacity: default_pool_capacity(),
            idle_sleep_us: 0,
        }
    }
}

impl NetworkConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }
}

/// Errors that mean "try again on the next tick"
pub(crate) fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

//! LanLink - Serverless peer messaging for local networks
//!
//! Peers find each other with UDP broadcast beacons, connect over TCP and
//! exchange pooled, length-framed binary messages carrying typed values.

pub mod config;
pub mod discovery;
pub mod network;
pub mod node;
pub mod protocol;

pub use config::Config;
pub use discovery::{Discovery, DiscoveryConfig, DiscoveryEvent, PeerInformation};
pub use network::{NetworkConfig, Transport, TransportEvent};
pub use node::{Node, NodeEvent};
pub use protocol::{Message, MessagePool, MessageType, Value};

//! LanLink Node
//!
//! Owns a [`Transport`] and a [`Discovery`] and connects them: discovered
//! peers become connection requests, lost peers have their pending request
//! withdrawn, and switching groups drops every connection.

use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

use crate::config::Config;
use crate::discovery::{Discovery, DiscoveryError, DiscoveryEvent};
use crate::network::{Transport, TransportError, TransportEvent};

/// Node errors
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),
}

pub type NodeResult<T> = Result<T, NodeError>;

/// Everything a node tick can report
#[derive(Debug)]
pub enum NodeEvent {
    Discovery(DiscoveryEvent),
    Transport(TransportEvent),
}

/// A LanLink peer: discovery plus transport
pub struct Node {
    transport: Transport,
    discovery: Discovery,
}

impl Node {
    pub fn new(config: &Config) -> Self {
        Self {
            transport: Transport::new(config.transport.clone(), config.general.name.clone()),
            discovery: Discovery::new(config.discovery.clone()),
        }
    }

    /// Start the transport first so peers that find us can connect
    pub fn start(&mut self) -> NodeResult<()> {
        self.transport.start()?;
        if let Err(e) = self.discovery.start() {
            self.transport.shutdown();
            return Err(e.into());
        }
        Ok(())
    }

    /// Application tick: discovery first, then the transport
    pub fn update(&mut self) -> Vec<NodeEvent> {
        let mut events = Vec::new();

        for event in self.discovery.update() {
            self.follow(&event);
            events.push(NodeEvent::Discovery(event));
        }

        events.extend(self.transport.update().into_iter().map(NodeEvent::Transport));
        events
    }

    /// Move to another group and drop every current connection
    ///
    /// Returns a `PeerLost` for every peer of the old group.
    pub fn set_group_id(&mut self, group_id: impl Into<String>) -> Vec<NodeEvent> {
        let lost = self.discovery.set_group_id(group_id);
        for event in &lost {
            self.follow(event);
        }
        self.transport.close_all();
        lost.into_iter().map(NodeEvent::Discovery).collect()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    /// Say goodbye on the discovery port, then stop the transport
    pub fn shutdown(&mut self) {
        self.discovery.stop();
        self.transport.shutdown();
    }

    fn follow(&self, event: &DiscoveryEvent) {
        match event {
            DiscoveryEvent::PeerFound(peer) => {
                let ip = IpAddr::V4(peer.address);
                if !self.transport.is_connected_to(ip) {
                    self.transport.connect_to(self.peer_addr(ip));
                }
            }
            DiscoveryEvent::PeerLost(peer) => {
                self.transport
                    .cancel_pending(self.peer_addr(IpAddr::V4(peer.address)));
            }
        }
    }

    fn peer_addr(&self, ip: IpAddr) -> SocketAddr {
        SocketAddr::new(ip, self.transport.config().port)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{Beacon, BeaconKind, DiscoveryConfig, hash_id};
    use crate::network::NetworkConfig;
    use std::net::{Ipv4Addr, UdpSocket};
    use std::time::{Duration, Instant};

    fn config(discovery_port: u16, transport_port: u16) -> Config {
        let mut config = Config::default();
        config.general.name = "tester".to_string();
        config.discovery = DiscoveryConfig {
            app_id: "node-test".to_string(),
            group_id: "g".to_string(),
            port: discovery_port,
            broadcast: false,
            hostname: Some("tester-host".to_string()),
            local_address: Some(Ipv4Addr::LOCALHOST),
            network_mask: Ipv4Addr::BROADCAST,
            ..Default::default()
        };
        config.transport = NetworkConfig::new(transport_port);
        config
    }

    fn send_beacon(port: u16, kind: BeaconKind) {
        let beacon = Beacon {
            app_hash: hash_id("node-test"),
            group_hash: hash_id("g"),
            kind,
            hostname: "remote-host".to_string(),
            address: Ipv4Addr::new(10, 255, 255, 1),
        };
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .send_to(&beacon.encode(), ("127.0.0.1", port))
            .unwrap();
    }

    fn pump_until<F: FnMut(&NodeEvent) -> bool>(node: &mut Node, mut matcher: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if node.update().iter().any(&mut matcher) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_found_peer_becomes_connection_request() {
        let mut node = Node::new(&config(33281, 19861));
        // Keep the background loop from picking up the request
        node.discovery.start().unwrap();

        send_beacon(33281, BeaconKind::Hello);
        assert!(pump_until(&mut node, |e| matches!(
            e,
            NodeEvent::Discovery(DiscoveryEvent::PeerFound(_))
        )));
        let expected: SocketAddr = "10.255.255.1:19861".parse().unwrap();
        assert_eq!(node.transport().pending_connections(), vec![expected]);

        send_beacon(33281, BeaconKind::Goodbye);
        assert!(pump_until(&mut node, |e| matches!(
            e,
            NodeEvent::Discovery(DiscoveryEvent::PeerLost(_))
        )));
        assert!(node.transport().pending_connections().is_empty());
    }

    #[test]
    fn test_group_change_cancels_requests_for_old_peers() {
        let mut node = Node::new(&config(33283, 19863));
        node.discovery.start().unwrap();

        send_beacon(33283, BeaconKind::Hello);
        assert!(pump_until(&mut node, |e| matches!(
            e,
            NodeEvent::Discovery(DiscoveryEvent::PeerFound(_))
        )));
        assert_eq!(node.transport().pending_connections().len(), 1);

        let events = node.set_group_id("other");
        assert!(matches!(
            &events[..],
            [NodeEvent::Discovery(DiscoveryEvent::PeerLost(p))] if p.hostname == "remote-host"
        ));
        assert!(node.transport().pending_connections().is_empty());
        assert!(node.discovery().peers().is_empty());
    }

    #[test]
    fn test_start_and_shutdown() {
        let mut node = Node::new(&config(33282, 19862));
        node.start().unwrap();
        assert!(node.transport().is_running());
        assert!(node.discovery().is_running());

        node.set_group_id("other");
        assert_eq!(node.discovery().group_id(), "other");

        node.shutdown();
        assert!(!node.transport().is_running());
        assert!(!node.discovery().is_running());
    }
}

//! Peer discovery module
//!
//! Finds other LanLink peers on the local network with UDP broadcast beacons.
//! Peers only see each other when both the application id and the group id
//! hash to the same values.

mod beacon;

pub use beacon::*;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::network::is_transient;
use crate::protocol::{MessageError, DEFAULT_DISCOVERY_PORT};

/// Largest beacon we accept
const MAX_DATAGRAM_SIZE: usize = 1024;

/// Discovery errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Beacon truncated at {0} bytes")]
    Truncated(usize),

    #[error("Unknown beacon kind: {0}")]
    UnknownKind(i32),

    #[error("Bad beacon hostname: {0}")]
    Hostname(#[from] MessageError),

    #[error("Already running")]
    AlreadyRunning,
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Identifies the application; peers of other applications are ignored
    #[serde(default = "default_app_id")]
    pub app_id: String,
    /// Identifies a group of peers within the application
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// UDP port beacons are sent to and received on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Beacons per second; 0.5 means one every two seconds
    #[serde(default = "default_beacon_frequency")]
    pub beacon_frequency: f32,
    /// Send beacons; when false we only listen
    #[serde(default = "default_true")]
    pub broadcast: bool,
    /// Netmask of the local network, used to derive the broadcast address
    #[serde(default = "default_network_mask")]
    pub network_mask: Ipv4Addr,
    /// Peers not heard from for this many seconds are dropped
    #[serde(default = "default_max_age")]
    pub max_age_secs: f32,
    /// Name announced in beacons (defaults to the system hostname)
    #[serde(default)]
    pub hostname: Option<String>,
    /// Address announced in beacons (probed when unset)
    #[serde(default)]
    pub local_address: Option<Ipv4Addr>,
}

fn default_app_id() -> String {
    "lanlink".to_string()
}

fn default_group_id() -> String {
    "default".to_string()
}

fn default_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_beacon_frequency() -> f32 {
    0.5
}

fn default_true() -> bool {
    true
}

fn default_network_mask() -> Ipv4Addr {
    Ipv4Addr::new(255, 255, 255, 0)
}

fn default_max_age() -> f32 {
    15.0
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            app_id: default_app_id(),
            group_id: default_group_id(),
            port: default_port(),
            beacon_frequency: default_beacon_frequency(),
            broadcast: true,
            network_mask: default_network_mask(),
            max_age_secs: default_max_age(),
            hostname: None,
            local_address: None,
        }
    }
}

impl DiscoveryConfig {
    /// Time between beacons, `None` when sending is disabled
    pub fn beacon_period(&self) -> Option<Duration> {
        if !self.broadcast || !(self.beacon_frequency > 0.0) {
            return None;
        }
        Duration::try_from_secs_f32(1.0 / self.beacon_frequency).ok()
    }

    pub fn max_age(&self) -> Duration {
        Duration::try_from_secs_f32(self.max_age_secs).unwrap_or(Duration::ZERO)
    }
}

/// A peer heard on the discovery port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInformation {
    pub hostname: String,
    pub address: Ipv4Addr,
    pub last_seen: Instant,
}

/// Events raised by [`Discovery::update`]
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A peer announced itself for the first time
    PeerFound(PeerInformation),
    /// A peer said goodbye or went quiet for longer than the max age
    PeerLost(PeerInformation),
}

/// UDP broadcast discovery
pub struct Discovery {
    config: DiscoveryConfig,
    hostname: String,
    local_address: Ipv4Addr,
    broadcast_target: SocketAddrV4,
    app_hash: i32,
    group_hash: i32,
    hello: Bytes,
    goodbye: Bytes,
    sender: Option<UdpSocket>,
    receiver: Option<UdpSocket>,
    next_beacon: Option<Instant>,
    peers: Vec<PeerInformation>,
}

impl Discovery {
    /// Create a discovery service; nothing is opened until `start`
    pub fn new(config: DiscoveryConfig) -> Self {
        let hostname = config.hostname.clone().unwrap_or_else(local_hostname);
        let local_address = config.local_address.unwrap_or_else(|| {
            probe_local_ipv4().unwrap_or_else(|| {
                tracing::warn!("Could not determine local IPv4 address, using loopback");
                Ipv4Addr::LOCALHOST
            })
        });
        let broadcast_target = SocketAddrV4::new(
            broadcast_address(local_address, config.network_mask),
            config.port,
        );

        let mut discovery = Self {
            app_hash: hash_id(&config.app_id),
            group_hash: hash_id(&config.group_id),
            config,
            hostname,
            local_address,
            broadcast_target,
            hello: Bytes::new(),
            goodbye: Bytes::new(),
            sender: None,
            receiver: None,
            next_beacon: None,
            peers: Vec::new(),
        };
        discovery.build_beacons();
        discovery
    }

    /// Open the sockets and send the first beacon
    pub fn start(&mut self) -> DiscoveryResult<()> {
        if self.receiver.is_some() {
            return Err(DiscoveryError::AlreadyRunning);
        }

        let sender = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
        sender.set_broadcast(true)?;
        sender.set_nonblocking(true)?;
        let receiver = bind_receiver(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.config.port))?;

        self.sender = Some(sender);
        self.receiver = Some(receiver);
        self.next_beacon = Some(Instant::now());

        tracing::info!(
            "Discovery started as '{}' ({}), beacons to {}",
            self.hostname,
            self.local_address,
            self.broadcast_target
        );
        Ok(())
    }

    /// Announce our departure and close the sockets
    pub fn stop(&mut self) {
        if self.receiver.is_none() {
            return;
        }
        self.send_goodbye();
        self.sender = None;
        self.receiver = None;
        self.next_beacon = None;
        tracing::info!("Discovery stopped");
    }

    pub fn is_running(&self) -> bool {
        self.receiver.is_some()
    }

    /// Discovery tick
    pub fn update(&mut self) -> Vec<DiscoveryEvent> {
        self.update_at(Instant::now())
    }

    /// Discovery tick at an explicit time
    ///
    /// Sends a beacon when one is due, drops peers older than the max age,
    /// then drains every pending datagram.
    pub fn update_at(&mut self, now: Instant) -> Vec<DiscoveryEvent> {
        let mut events = Vec::new();

        if let (Some(due), Some(period)) = (self.next_beacon, self.config.beacon_period()) {
            if now >= due {
                self.send_hello();
                // A period too long to represent stops sending
                self.next_beacon = now.checked_add(period);
            }
        }

        let max_age = self.config.max_age();
        let (stale, fresh): (Vec<_>, Vec<_>) = std::mem::take(&mut self.peers)
            .into_iter()
            .partition(|peer| now.saturating_duration_since(peer.last_seen) > max_age);
        self.peers = fresh;
        for peer in stale {
            tracing::info!("Peer '{}' timed out", peer.hostname);
            events.push(DiscoveryEvent::PeerLost(peer));
        }

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            let received = match self.receiver.as_ref() {
                Some(receiver) => receiver.recv_from(&mut buf),
                None => break,
            };
            match received {
                Ok((n, source)) => events.extend(self.handle_datagram(&buf[..n], source, now)),
                Err(e) if is_transient(&e) => break,
                Err(e) => {
                    tracing::debug!("Discovery receive failed: {}", e);
                    break;
                }
            }
        }

        events
    }

    /// Process one beacon received from `source`
    pub fn handle_datagram(
        &mut self,
        data: &[u8],
        source: SocketAddr,
        now: Instant,
    ) -> Vec<DiscoveryEvent> {
        let mut events = Vec::new();

        let beacon = match Beacon::decode(data) {
            Ok(beacon) => beacon,
            Err(e) => {
                tracing::trace!("Ignoring datagram from {}: {}", source, e);
                return events;
            }
        };
        if beacon.app_hash != self.app_hash || beacon.group_hash != self.group_hash {
            tracing::trace!("Ignoring beacon from {} for another app or group", source);
            return events;
        }
        if beacon.hostname == self.hostname {
            return events;
        }

        let index = match self.peers.iter().position(|p| p.hostname == beacon.hostname) {
            Some(index) => index,
            None => {
                let address = match source.ip() {
                    IpAddr::V4(ip) if beacon.address.is_unspecified() => ip,
                    _ => beacon.address,
                };
                let peer = PeerInformation {
                    hostname: beacon.hostname,
                    address,
                    last_seen: now,
                };
                tracing::info!("Found peer '{}' at {}", peer.hostname, peer.address);
                events.push(DiscoveryEvent::PeerFound(peer.clone()));
                self.peers.push(peer);
                self.peers.len() - 1
            }
        };

        match beacon.kind {
            BeaconKind::Hello => self.peers[index].last_seen = now,
            BeaconKind::Goodbye => {
                let peer = self.peers.remove(index);
                tracing::info!("Peer '{}' said goodbye", peer.hostname);
                events.push(DiscoveryEvent::PeerLost(peer));
            }
        }

        events
    }

    /// Move to another group: goodbye under the old id, hello under the new one
    ///
    /// Peers of the old group are forgotten and returned as `PeerLost`, so
    /// anyone met again in the new group is found afresh.
    pub fn set_group_id(&mut self, group_id: impl Into<String>) -> Vec<DiscoveryEvent> {
        let group_id = group_id.into();
        if group_id == self.config.group_id {
            return Vec::new();
        }
        self.send_goodbye();
        tracing::info!("Switching group '{}' -> '{}'", self.config.group_id, group_id);
        self.group_hash = hash_id(&group_id);
        self.config.group_id = group_id;
        self.build_beacons();
        self.send_hello();

        std::mem::take(&mut self.peers)
            .into_iter()
            .map(DiscoveryEvent::PeerLost)
            .collect()
    }

    pub fn group_id(&self) -> &str {
        &self.config.group_id
    }

    /// Peers currently known
    pub fn peers(&self) -> &[PeerInformation] {
        &self.peers
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn local_address(&self) -> Ipv4Addr {
        self.local_address
    }

    /// Where beacons are sent
    pub fn broadcast_target(&self) -> SocketAddrV4 {
        self.broadcast_target
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    fn build_beacons(&mut self) {
        let beacon = |kind| Beacon {
            app_hash: self.app_hash,
            group_hash: self.group_hash,
            kind,
            hostname: self.hostname.clone(),
            address: self.local_address,
        };
        self.hello = beacon(BeaconKind::Hello).encode();
        self.goodbye = beacon(BeaconKind::Goodbye).encode();
    }

    fn send_hello(&self) {
        if self.config.broadcast {
            self.send_beacon(&self.hello);
        }
    }

    fn send_goodbye(&self) {
        self.send_beacon(&self.goodbye);
    }

    fn send_beacon(&self, beacon: &[u8]) {
        if let Some(sender) = self.sender.as_ref() {
            if let Err(e) = sender.send_to(beacon, self.broadcast_target) {
                tracing::debug!("Failed to send beacon to {}: {}", self.broadcast_target, e);
            }
        }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bind the beacon receiver so several processes can share the port
fn bind_receiver(addr: SocketAddrV4) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.bind(&SocketAddr::V4(addr).into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn local_hostname() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|e| {
            tracing::warn!("Could not read hostname: {}", e);
            "localhost".to_string()
        })
}

/// Address of the interface that routes off-host
///
/// Connecting a UDP socket sends nothing; it only makes the OS pick a source
/// address.
fn probe_local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DiscoveryConfig {
        DiscoveryConfig {
            app_id: "test-app".to_string(),
            group_id: "blue".to_string(),
            hostname: Some("me".to_string()),
            local_address: Some(Ipv4Addr::new(10, 0, 0, 1)),
            max_age_secs: 5.0,
            ..Default::default()
        }
    }

    fn beacon(hostname: &str, kind: BeaconKind) -> Bytes {
        Beacon {
            app_hash: hash_id("test-app"),
            group_hash: hash_id("blue"),
            kind,
            hostname: hostname.to_string(),
            address: Ipv4Addr::new(10, 0, 0, 9),
        }
        .encode()
    }

    fn source() -> SocketAddr {
        "10.0.0.9:3279".parse().unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.port, 3279);
        assert_eq!(config.beacon_period(), Some(Duration::from_secs(2)));
        assert_eq!(config.max_age(), Duration::from_secs(15));

        let silent = DiscoveryConfig {
            beacon_frequency: 0.0,
            ..Default::default()
        };
        assert_eq!(silent.beacon_period(), None);
    }

    #[test]
    fn test_broadcast_target_from_config() {
        let discovery = Discovery::new(config());
        assert_eq!(discovery.hostname(), "me");
        assert_eq!(
            discovery.broadcast_target(),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 255), 3279)
        );
    }

    #[test]
    fn test_found_refresh_and_goodbye() {
        let mut discovery = Discovery::new(config());
        let start = Instant::now();

        let events = discovery.handle_datagram(&beacon("other", BeaconKind::Hello), source(), start);
        assert!(matches!(&events[..], [DiscoveryEvent::PeerFound(p)] if p.hostname == "other"));
        assert_eq!(discovery.peers()[0].address, Ipv4Addr::new(10, 0, 0, 9));

        let later = start + Duration::from_secs(3);
        let events = discovery.handle_datagram(&beacon("other", BeaconKind::Hello), source(), later);
        assert!(events.is_empty());
        assert_eq!(discovery.peers()[0].last_seen, later);

        let events = discovery.handle_datagram(&beacon("other", BeaconKind::Goodbye), source(), later);
        assert!(matches!(&events[..], [DiscoveryEvent::PeerLost(p)] if p.hostname == "other"));
        assert!(discovery.peers().is_empty());
    }

    #[test]
    fn test_goodbye_from_unknown_peer() {
        let mut discovery = Discovery::new(config());
        let events = discovery.handle_datagram(
            &beacon("stranger", BeaconKind::Goodbye),
            source(),
            Instant::now(),
        );
        assert!(matches!(
            &events[..],
            [DiscoveryEvent::PeerFound(_), DiscoveryEvent::PeerLost(_)]
        ));
        assert!(discovery.peers().is_empty());
    }

    #[test]
    fn test_filters_foreign_and_own_beacons() {
        let mut discovery = Discovery::new(config());
        let now = Instant::now();

        let other_app = Beacon {
            app_hash: hash_id("another-app"),
            group_hash: hash_id("blue"),
            kind: BeaconKind::Hello,
            hostname: "x".to_string(),
            address: Ipv4Addr::new(10, 0, 0, 3),
        };
        let other_group = Beacon {
            app_hash: hash_id("test-app"),
            group_hash: hash_id("red"),
            ..other_app.clone()
        };
        assert!(discovery.handle_datagram(&other_app.encode(), source(), now).is_empty());
        assert!(discovery.handle_datagram(&other_group.encode(), source(), now).is_empty());
        assert!(discovery.handle_datagram(&beacon("me", BeaconKind::Hello), source(), now).is_empty());
        assert!(discovery.handle_datagram(b"garbage", source(), now).is_empty());
        assert!(discovery.peers().is_empty());
    }

    #[test]
    fn test_unspecified_address_uses_datagram_source() {
        let mut discovery = Discovery::new(config());
        let anonymous = Beacon {
            app_hash: hash_id("test-app"),
            group_hash: hash_id("blue"),
            kind: BeaconKind::Hello,
            hostname: "quiet".to_string(),
            address: Ipv4Addr::UNSPECIFIED,
        };
        discovery.handle_datagram(&anonymous.encode(), source(), Instant::now());
        assert_eq!(discovery.peers()[0].address, Ipv4Addr::new(10, 0, 0, 9));
    }

    #[test]
    fn test_stale_peer_is_lost_exactly_once() {
        let mut discovery = Discovery::new(config());
        let start = Instant::now();
        discovery.handle_datagram(&beacon("other", BeaconKind::Hello), source(), start);

        assert!(discovery.update_at(start + Duration::from_secs(4)).is_empty());

        let events = discovery.update_at(start + Duration::from_secs(6));
        assert!(matches!(&events[..], [DiscoveryEvent::PeerLost(p)] if p.hostname == "other"));
        assert!(discovery.update_at(start + Duration::from_secs(7)).is_empty());
        assert!(discovery.peers().is_empty());
    }

    #[test]
    fn test_set_group_id_changes_filter() {
        let mut discovery = Discovery::new(config());
        let now = Instant::now();
        assert!(discovery.set_group_id("red").is_empty());
        assert_eq!(discovery.group_id(), "red");
        assert!(discovery.set_group_id("red").is_empty());

        assert!(discovery.handle_datagram(&beacon("other", BeaconKind::Hello), source(), now).is_empty());

        let red = Beacon {
            app_hash: hash_id("test-app"),
            group_hash: hash_id("red"),
            kind: BeaconKind::Hello,
            hostname: "other".to_string(),
            address: Ipv4Addr::new(10, 0, 0, 9),
        };
        assert_eq!(discovery.handle_datagram(&red.encode(), source(), now).len(), 1);
    }

    #[test]
    fn test_group_change_forgets_old_peers() {
        let mut discovery = Discovery::new(config());
        let now = Instant::now();
        discovery.handle_datagram(&beacon("other", BeaconKind::Hello), source(), now);
        assert_eq!(discovery.peers().len(), 1);

        let events = discovery.set_group_id("red");
        assert!(matches!(&events[..], [DiscoveryEvent::PeerLost(p)] if p.hostname == "other"));
        assert!(discovery.peers().is_empty());

        // The same host joining the new group is found again
        let red = Beacon {
            app_hash: hash_id("test-app"),
            group_hash: hash_id("red"),
            kind: BeaconKind::Hello,
            hostname: "other".to_string(),
            address: Ipv4Addr::new(10, 0, 0, 9),
        };
        let events = discovery.handle_datagram(&red.encode(), source(), now);
        assert!(matches!(&events[..], [DiscoveryEvent::PeerFound(p)] if p.hostname == "other"));
    }

    #[test]
    fn test_unrepresentable_period_stops_sending() {
        let mut discovery = Discovery::new(DiscoveryConfig {
            port: 33291,
            beacon_frequency: 1e-19,
            network_mask: Ipv4Addr::BROADCAST,
            local_address: Some(Ipv4Addr::LOCALHOST),
            ..config()
        });
        assert!(discovery.config().beacon_period().is_some());
        discovery.start().unwrap();

        let now = Instant::now();
        discovery.update_at(now);
        assert!(discovery.next_beacon.is_none());
        discovery.update_at(now + Duration::from_secs(60));
        assert!(discovery.next_beacon.is_none());
        discovery.stop();
    }

    fn receive_beacons(socket: &UdpSocket, count: usize) -> Vec<Beacon> {
        let mut beacons = Vec::new();
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let deadline = Instant::now() + Duration::from_secs(5);
        while beacons.len() < count && Instant::now() < deadline {
            match socket.recv_from(&mut buf) {
                Ok((n, _)) => beacons.push(Beacon::decode(&buf[..n]).unwrap()),
                Err(e) if is_transient(&e) => std::thread::sleep(Duration::from_millis(10)),
                Err(e) => panic!("receive failed: {}", e),
            }
        }
        beacons
    }

    #[test]
    fn test_group_change_and_stop_send_beacons() {
        // The more specific loopback binding receives what discovery sends
        let capture = bind_receiver(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 33290)).unwrap();
        let mut discovery = Discovery::new(DiscoveryConfig {
            port: 33290,
            network_mask: Ipv4Addr::BROADCAST,
            local_address: Some(Ipv4Addr::LOCALHOST),
            ..config()
        });
        assert_eq!(
            discovery.broadcast_target(),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 33290)
        );
        discovery.start().unwrap();

        discovery.set_group_id("red");
        discovery.stop();

        let sent: Vec<_> = receive_beacons(&capture, 3)
            .into_iter()
            .map(|b| (b.kind, b.group_hash, b.app_hash, b.hostname))
            .collect();
        let app = hash_id("test-app");
        assert_eq!(
            sent,
            vec![
                (BeaconKind::Goodbye, hash_id("blue"), app, "me".to_string()),
                (BeaconKind::Hello, hash_id("red"), app, "me".to_string()),
                (BeaconKind::Goodbye, hash_id("red"), app, "me".to_string()),
            ]
        );
    }

    #[test]
    fn test_receives_beacon_over_loopback() {
        let mut discovery = Discovery::new(DiscoveryConfig {
            port: 33279,
            broadcast: false,
            network_mask: Ipv4Addr::BROADCAST,
            local_address: Some(Ipv4Addr::LOCALHOST),
            ..config()
        });
        discovery.start().unwrap();
        assert!(matches!(discovery.start(), Err(DiscoveryError::AlreadyRunning)));

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(&beacon("remote", BeaconKind::Hello), "127.0.0.1:33279")
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut found = None;
        while found.is_none() && Instant::now() < deadline {
            for event in discovery.update() {
                if let DiscoveryEvent::PeerFound(peer) = event {
                    found = Some(peer);
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let peer = found.unwrap();
        assert_eq!(peer.hostname, "remote");
        assert_eq!(peer.address, Ipv4Addr::new(10, 0, 0, 9));

        discovery.stop();
        assert!(!discovery.is_running());
    }
}

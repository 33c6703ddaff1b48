//! Background networking loop
//!
//! The worker owns the listener, every connection and every in-flight
//! connect. It only touches shared state through the short critical sections
//! in [`Shared`], never while doing socket I/O.

use socket2::{Domain, Protocol, Socket, Type};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::transport::{build_greeting, PeerLink, Shared, TransportEvent};
use super::{is_transient, Connection, ConnectionError, NetworkConfig};
use crate::protocol::{Message, MessagePool};

/// Wait before rebinding a listener that failed
const LISTENER_RETRY: Duration = Duration::from_secs(1);

/// Wait before trying a failed outbound connect again
const CONNECT_RETRY: Duration = Duration::from_millis(500);

type ConnectionId = u64;

struct InFlight {
    addr: SocketAddr,
    socket: Socket,
    started: Instant,
}

pub(crate) struct Worker {
    config: NetworkConfig,
    pool: Arc<MessagePool>,
    shared: Arc<Shared>,
    listener: Option<TcpListener>,
    listener_retry_at: Option<Instant>,
    connections: BTreeMap<ConnectionId, Connection>,
    connecting: Vec<InFlight>,
    retry_at: HashMap<SocketAddr, Instant>,
    next_id: ConnectionId,
}

impl Worker {
    pub(crate) fn new(config: NetworkConfig, pool: Arc<MessagePool>, shared: Arc<Shared>) -> Self {
        Self {
            config,
            pool,
            shared,
            listener: None,
            listener_retry_at: None,
            connections: BTreeMap::new(),
            connecting: Vec::new(),
            retry_at: HashMap::new(),
            next_id: 0,
        }
    }

    /// Loop until the running flag is cleared, then close everything
    pub(crate) fn run(mut self) {
        let pause = Duration::from_micros(self.config.idle_sleep_us);

        while self.shared.running.load(Ordering::SeqCst) {
            self.guarded(Self::tick);

            if pause.is_zero() {
                std::thread::yield_now();
            } else {
                std::thread::sleep(pause);
            }
        }

        self.close_connections("transport shut down");
        self.listener = None;
        self.shared.peers.lock().clear();
    }

    /// Run one step, logging a panic instead of letting it end the loop.
    /// Returns false if the step panicked.
    fn guarded<F: FnOnce(&mut Self)>(&mut self, step: F) -> bool {
        match panic::catch_unwind(AssertUnwindSafe(|| step(self))) {
            Ok(()) => true,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!("Transport loop panicked: {}", reason);
                false
            }
        }
    }

    fn tick(&mut self) {
        if self.shared.close_all.swap(false, Ordering::SeqCst) {
            self.close_connections("closed by request");
        }
        self.accept_connections();
        self.make_connections();
        self.send_and_receive();
        self.publish_peers();
    }

    fn accept_connections(&mut self) {
        if self.listener.is_none() {
            if matches!(self.listener_retry_at, Some(at) if Instant::now() < at) {
                return;
            }
            match self.bind_listener() {
                Ok(listener) => {
                    tracing::info!(
                        "Listening on {}:{}",
                        self.config.bind_address,
                        self.config.port
                    );
                    self.listener = Some(listener);
                    self.listener_retry_at = None;
                }
                Err(e) => {
                    tracing::warn!("Failed to bind port {}: {}", self.config.port, e);
                    self.listener_retry_at = Some(Instant::now() + LISTENER_RETRY);
                    return;
                }
            }
        }

        loop {
            let accepted = match self.listener.as_ref() {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, addr)) => self.accept(stream, addr),
                Err(e) if is_transient(&e) => return,
                Err(e) => {
                    tracing::warn!("Listener failed, rebinding: {}", e);
                    self.listener = None;
                    self.listener_retry_at = Some(Instant::now() + LISTENER_RETRY);
                    return;
                }
            }
        }
    }

    fn bind_listener(&self) -> io::Result<TcpListener> {
        let addr = SocketAddr::new(self.config.bind_address, self.config.port);
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(self.config.backlog)?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    }

    fn accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.is_connected_ip(addr.ip()) {
            tracing::debug!("Already connected to {}, dropping incoming connection", addr.ip());
            return;
        }
        if let Err(e) = stream.set_nonblocking(true) {
            tracing::warn!("Failed to configure connection from {}: {}", addr, e);
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }
        tracing::info!("Accepted connection from {}", addr);
        self.register(stream, addr);
    }

    /// Requests stay in `pending` until they connect, the IP is already
    /// connected, or the owner cancels them. Failed attempts wait
    /// `CONNECT_RETRY` before the next try.
    fn make_connections(&mut self) {
        let now = Instant::now();
        let due: Vec<SocketAddr> = {
            let mut pending = self.shared.pending.lock();
            pending.retain(|addr| !self.is_connected_ip(addr.ip()));
            self.retry_at.retain(|addr, _| pending.contains(addr));
            pending
                .iter()
                .copied()
                .filter(|addr| !matches!(self.retry_at.get(addr), Some(at) if now < *at))
                .collect()
        };

        for addr in due {
            if self.connecting.iter().any(|c| c.addr == addr) {
                continue;
            }
            match start_connect(addr) {
                Ok(socket) => {
                    tracing::debug!("Connecting to {}", addr);
                    self.connecting.push(InFlight {
                        addr,
                        socket,
                        started: now,
                    });
                }
                Err(e) => self.retry_later(addr, &e.to_string()),
            }
        }

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        for attempt in std::mem::take(&mut self.connecting) {
            match poll_connect(&attempt.socket) {
                Ok(true) => {
                    self.shared.pending.lock().retain(|a| *a != attempt.addr);
                    self.retry_at.remove(&attempt.addr);
                    if self.is_connected_ip(attempt.addr.ip()) {
                        tracing::debug!(
                            "{} connected to us meanwhile, closing outbound socket",
                            attempt.addr.ip()
                        );
                        continue;
                    }
                    let stream: TcpStream = attempt.socket.into();
                    tracing::info!("Connected to {}", attempt.addr);
                    self.register(stream, attempt.addr);
                }
                Ok(false) if attempt.started.elapsed() < timeout => self.connecting.push(attempt),
                Ok(false) => self.retry_later(attempt.addr, "timed out"),
                Err(e) => self.retry_later(attempt.addr, &e.to_string()),
            }
        }
    }

    fn retry_later(&mut self, addr: SocketAddr, reason: &str) {
        // Warn on the first failure only
        if self.retry_at.insert(addr, Instant::now() + CONNECT_RETRY).is_none() {
            tracing::warn!("Failed to connect to {}: {}, retrying", addr, reason);
        } else {
            tracing::debug!("Connection to {} failed again: {}", addr, reason);
        }
    }

    fn register(&mut self, stream: TcpStream, addr: SocketAddr) {
        let mut connection = Connection::new(stream, addr, self.pool.clone());

        let name = self.shared.friendly_name.lock().clone();
        match build_greeting(&self.pool, self.shared.uid(), &name) {
            Ok(greeting) => connection.send(greeting),
            Err(e) => tracing::error!("Failed to build greeting: {}", e),
        }

        let id = self.next_id;
        self.next_id += 1;
        self.connections.insert(id, connection);
        self.shared.schedule_event(TransportEvent::PeerConnected { addr });
    }

    fn send_and_receive(&mut self) {
        let outbox = Outgoing::take(&self.pool, &self.shared);
        for msg in &outbox.messages {
            let to_uid = msg.to_uid();
            for connection in self.connections.values_mut() {
                if to_uid != 0 && connection.remote_uid() != to_uid {
                    continue;
                }
                match self.pool.copy_of(msg) {
                    Ok(copy) => connection.send(copy),
                    Err(e) => tracing::error!("Failed to queue message: {}", e),
                }
            }
        }
        drop(outbox);

        let mut received: Vec<Message> = Vec::new();
        let mut dead = Vec::new();
        for (id, connection) in self.connections.iter_mut() {
            let result = connection
                .read_step()
                .and_then(|_| connection.write_step());
            received.extend(connection.drain_incoming());
            if let Err(e) = result {
                dead.push((*id, e));
            }
        }

        let uid = self.shared.uid();
        let (mine, stray): (Vec<_>, Vec<_>) = received
            .into_iter()
            .partition(|msg| msg.to_uid() == 0 || msg.to_uid() == uid);
        if !stray.is_empty() {
            tracing::trace!("Dropping {} message(s) addressed to other peers", stray.len());
            self.pool.recycle_all(stray);
        }
        if !mine.is_empty() {
            self.shared.inbox.lock().extend(mine);
        }

        for (id, error) in dead {
            if let Some(connection) = self.connections.remove(&id) {
                self.retire(connection, error.to_string(), matches!(error, ConnectionError::Closed));
            }
        }
    }

    fn publish_peers(&self) {
        let snapshot: Vec<PeerLink> = self
            .connections
            .values()
            .map(|c| PeerLink {
                addr: c.remote_addr(),
                uid: c.remote_uid(),
            })
            .collect();
        *self.shared.peers.lock() = snapshot;
    }

    fn close_connections(&mut self, reason: &str) {
        for connection in std::mem::take(&mut self.connections).into_values() {
            self.retire(connection, reason.to_string(), true);
        }
        self.connecting.clear();
        self.publish_peers();
    }

    fn retire(&self, mut connection: Connection, reason: String, orderly: bool) {
        let addr = connection.remote_addr();
        connection.close();
        if orderly {
            tracing::info!("Peer {} disconnected: {}", addr, reason);
        } else {
            tracing::warn!("Dropping peer {}: {}", addr, reason);
        }
        self.shared
            .schedule_event(TransportEvent::PeerDisconnected { addr, reason });
    }

    fn is_connected_ip(&self, ip: IpAddr) -> bool {
        self.connections.values().any(|c| c.remote_addr().ip() == ip)
    }
}

/// Messages taken off the shared outbox, recycled on drop even if the
/// fan-out unwinds
struct Outgoing<'a> {
    pool: &'a MessagePool,
    messages: Vec<Message>,
}

impl<'a> Outgoing<'a> {
    fn take(pool: &'a MessagePool, shared: &Shared) -> Self {
        Self {
            pool,
            messages: std::mem::take(&mut *shared.outbox.lock()),
        }
    }
}

impl Drop for Outgoing<'_> {
    fn drop(&mut self) {
        self.pool.recycle_all(std::mem::take(&mut self.messages));
    }
}

/// Open a non-blocking socket and start connecting it
fn start_connect(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => Ok(socket),
        Err(e) if connect_in_progress(&e) => Ok(socket),
        Err(e) => Err(e),
    }
}

/// `Ok(true)` once connected, `Ok(false)` while still in flight
fn poll_connect(socket: &Socket) -> io::Result<bool> {
    if let Some(e) = socket.take_error()? {
        return Err(e);
    }
    match socket.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) if connect_in_progress(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

fn connect_in_progress(e: &io::Error) -> bool {
    is_transient(e) || is_einprogress(e)
}

#[cfg(unix)]
fn is_einprogress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS)
}

#[cfg(not(unix))]
fn is_einprogress(_e: &io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::Scheduled;
    use crate::protocol::{MessageType, LENGTH_PREFIX_SIZE};
    use std::io::{Read, Write};
    use std::net::Ipv4Addr;

    const LOCAL_UID: i32 = 500;

    fn worker(port: u16) -> Worker {
        let mut config = NetworkConfig::new(port);
        config.bind_address = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.connect_timeout_ms = 2000;
        let pool = Arc::new(MessagePool::new(32));
        let shared = Arc::new(Shared::new(LOCAL_UID, "worker".to_string()));
        Worker::new(config, pool, shared)
    }

    /// A connected loopback pair: (client side, server side)
    fn socket_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, addr) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        (client, server, addr)
    }

    fn read_frame(stream: &mut TcpStream) -> Option<Vec<u8>> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        stream.read_exact(&mut prefix).ok()?;
        let mut body = vec![0u8; u32::from_le_bytes(prefix) as usize];
        stream.read_exact(&mut body).ok()?;
        Some(body)
    }

    fn write_frame(stream: &mut TcpStream, msg: &Message) {
        stream
            .write_all(&(msg.len() as u32).to_le_bytes())
            .unwrap();
        stream.write_all(msg.as_bytes()).unwrap();
    }

    fn frame_type(body: &[u8]) -> i32 {
        i32::from_le_bytes([body[8], body[9], body[10], body[11]])
    }

    fn frame_to(body: &[u8]) -> i32 {
        i32::from_le_bytes([body[4], body[5], body[6], body[7]])
    }

    fn pump(worker: &mut Worker, times: usize) {
        for _ in 0..times {
            worker.send_and_receive();
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_registered_connection_is_greeted() {
        let mut worker = worker(0);
        let (mut client, server, addr) = socket_pair();
        worker.register(server, addr);
        pump(&mut worker, 3);

        let greeting = read_frame(&mut client).unwrap();
        assert_eq!(frame_type(&greeting), MessageType::Greeting.to_i32());
        assert!(matches!(
            worker.shared.scheduled.lock().first(),
            Some(Scheduled::Event(TransportEvent::PeerConnected { .. }))
        ));
    }

    #[test]
    fn test_outbox_routing_by_recipient() {
        let mut worker = worker(0);
        let (mut client_a, server_a, addr_a) = socket_pair();
        let (mut client_b, server_b, addr_b) = socket_pair();
        worker.register(server_a, addr_a);
        worker.register(server_b, addr_b);
        let ids: Vec<_> = worker.connections.keys().copied().collect();
        worker.connections.get_mut(&ids[0]).unwrap().set_remote_uid(11);
        worker.connections.get_mut(&ids[1]).unwrap().set_remote_uid(22);

        let mut direct = worker.pool.take();
        direct.set_message_type(MessageType::UserDefined(3));
        direct.set_to_uid(22);
        let mut broadcast = worker.pool.take();
        broadcast.set_message_type(MessageType::UserDefined(4));
        worker.shared.outbox.lock().extend([direct, broadcast]);
        pump(&mut worker, 3);

        // Greeting first, then only what is addressed to each side
        assert_eq!(frame_type(&read_frame(&mut client_a).unwrap()), 0);
        let frame = read_frame(&mut client_a).unwrap();
        assert_eq!(frame_type(&frame), 4);
        assert!(read_frame(&mut client_a).is_none());

        assert_eq!(frame_type(&read_frame(&mut client_b).unwrap()), 0);
        let frame = read_frame(&mut client_b).unwrap();
        assert_eq!((frame_type(&frame), frame_to(&frame)), (3, 22));
        assert_eq!(frame_type(&read_frame(&mut client_b).unwrap()), 4);

        assert_eq!(worker.pool.outstanding(), 0);
    }

    #[test]
    fn test_outbox_is_recycled_without_connections() {
        let mut worker = worker(0);
        let msg = worker.pool.take();
        worker.shared.outbox.lock().push(msg);
        worker.send_and_receive();
        assert!(worker.shared.outbox.lock().is_empty());
        assert_eq!(worker.pool.outstanding(), 0);
    }

    #[test]
    fn test_inbox_drops_messages_for_other_peers() {
        let mut worker = worker(0);
        let (mut client, server, addr) = socket_pair();
        worker.register(server, addr);

        let pool = MessagePool::new(4);
        let mut stray = pool.take();
        stray.set_from_uid(7);
        stray.set_to_uid(999);
        let mut mine = pool.take();
        mine.set_from_uid(7);
        mine.set_to_uid(LOCAL_UID);
        write_frame(&mut client, &stray);
        write_frame(&mut client, &mine);
        pump(&mut worker, 10);

        let inbox = std::mem::take(&mut *worker.shared.inbox.lock());
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].to_uid(), LOCAL_UID);
        let connection = worker.connections.values().next().unwrap();
        assert_eq!(connection.remote_uid(), 7);

        worker.pool.recycle_all(inbox);
        assert_eq!(worker.pool.outstanding(), 0);
    }

    #[test]
    fn test_peer_close_removes_connection() {
        let mut worker = worker(0);
        let (client, server, addr) = socket_pair();
        worker.register(server, addr);
        drop(client);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !worker.connections.is_empty() && Instant::now() < deadline {
            pump(&mut worker, 1);
        }
        assert!(worker.connections.is_empty());
        worker.publish_peers();
        assert!(worker.shared.peers.lock().is_empty());

        let disconnected = worker.shared.scheduled.lock().iter().any(|item| {
            matches!(
                item,
                Scheduled::Event(TransportEvent::PeerDisconnected { .. })
            )
        });
        assert!(disconnected);
        assert_eq!(worker.pool.outstanding(), 0);
    }

    #[test]
    fn test_second_connection_from_same_ip_is_refused() {
        let mut worker = worker(19852);
        worker.accept_connections();
        assert!(worker.listener.is_some());

        let _first = TcpStream::connect("127.0.0.1:19852").unwrap();
        let _second = TcpStream::connect("127.0.0.1:19852").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        worker.accept_connections();

        assert_eq!(worker.connections.len(), 1);
    }

    #[test]
    fn test_outbound_connect_registers_once() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = listener.local_addr().unwrap();
        let mut worker = worker(0);
        worker.shared.pending.lock().extend([target, target]);

        let deadline = Instant::now() + Duration::from_secs(5);
        while worker.connections.is_empty() && Instant::now() < deadline {
            worker.make_connections();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(worker.connections.len(), 1);
        assert!(worker.connecting.is_empty());
        assert!(worker.shared.pending.lock().is_empty());

        // Already connected to that IP: further requests are skipped
        worker.shared.pending.lock().push(target);
        worker.make_connections();
        assert!(worker.connecting.is_empty());
        assert!(worker.shared.pending.lock().is_empty());
        assert_eq!(worker.connections.len(), 1);
    }

    #[test]
    fn test_refused_connect_is_retried_until_cancelled() {
        // Bind then release a port so nothing is listening on it
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let mut worker = worker(0);
        worker.shared.pending.lock().push(target);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !worker.retry_at.contains_key(&target) && Instant::now() < deadline {
            worker.make_connections();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(worker.retry_at.contains_key(&target));
        assert!(worker.connecting.is_empty());
        assert!(worker.connections.is_empty());
        assert_eq!(*worker.shared.pending.lock(), vec![target]);

        // Still backing off: no new attempt yet
        worker.make_connections();
        assert!(worker.connecting.is_empty());

        worker.shared.pending.lock().clear();
        worker.make_connections();
        assert!(worker.retry_at.is_empty());
    }

    #[test]
    fn test_connect_succeeds_once_target_listens() {
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let mut worker = worker(0);
        worker.shared.pending.lock().push(target);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !worker.retry_at.contains_key(&target) && Instant::now() < deadline {
            worker.make_connections();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(worker.retry_at.contains_key(&target));

        let _listener = TcpListener::bind(target).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while worker.connections.is_empty() && Instant::now() < deadline {
            worker.make_connections();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(worker.connections.len(), 1);
        assert!(worker.shared.pending.lock().is_empty());
        assert!(worker.retry_at.is_empty());
    }

    #[test]
    fn test_panicking_step_is_contained() {
        let mut worker = worker(0);
        let msg = worker.pool.take();
        worker.shared.outbox.lock().push(msg);

        let completed = worker.guarded(|w| {
            let _outbox = Outgoing::take(&w.pool, &w.shared);
            panic!("fan-out failed");
        });
        assert!(!completed);
        assert!(worker.shared.outbox.lock().is_empty());
        assert_eq!(worker.pool.outstanding(), 0);

        // The loop carries on with the next step
        let (_client, server, addr) = socket_pair();
        worker.register(server, addr);
        assert!(worker.guarded(Worker::tick));
        assert_eq!(worker.shared.peers.lock().len(), 1);
    }

    #[test]
    fn test_close_all_flag() {
        let mut worker = worker(0);
        let (_client, server, addr) = socket_pair();
        worker.register(server, addr);
        worker.shared.close_all.store(true, Ordering::SeqCst);
        worker.tick();

        assert!(worker.connections.is_empty());
        assert!(!worker.shared.close_all.load(Ordering::SeqCst));
        assert_eq!(worker.pool.outstanding(), 0);
    }
}

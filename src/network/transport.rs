//! LanLink Transport
//!
//! The application-facing half of the peer set. Everything that touches
//! sockets runs on a background thread (see `worker.rs`); this handle only
//! moves messages in and out of the shared queues.

use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;

use super::worker::Worker;
use super::NetworkConfig;
use crate::protocol::{Message, MessageError, MessagePool, MessageType, PoolResult};

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Transport already running")]
    AlreadyRunning,
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Events surfaced on the application tick
#[derive(Debug)]
pub enum TransportEvent {
    /// A connection was established (either direction)
    PeerConnected { addr: SocketAddr },
    /// A connection was closed
    PeerDisconnected { addr: SocketAddr, reason: String },
    /// A peer announced itself with a greeting
    PeerJoined { uid: i32, name: String },
    /// A message for the application; recycle it when done
    Message(Message),
}

/// A live connection as seen from the application side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerLink {
    pub addr: SocketAddr,
    /// Remote identity, 0 until the peer has sent something
    pub uid: i32,
}

type ScheduledCall = Box<dyn FnOnce() + Send + 'static>;

/// Work raised on one driver and run on the application tick
pub(crate) enum Scheduled {
    Event(TransportEvent),
    Call(ScheduledCall),
}

/// State shared between the application tick and the background loop
pub(crate) struct Shared {
    pub(crate) uid: AtomicI32,
    pub(crate) friendly_name: Mutex<String>,
    pub(crate) pending: Mutex<Vec<SocketAddr>>,
    pub(crate) inbox: Mutex<Vec<Message>>,
    pub(crate) outbox: Mutex<Vec<Message>>,
    pub(crate) scheduled: Mutex<Vec<Scheduled>>,
    pub(crate) peers: Mutex<Vec<PeerLink>>,
    pub(crate) close_all: AtomicBool,
    pub(crate) running: AtomicBool,
}

impl Shared {
    pub(crate) fn new(uid: i32, friendly_name: String) -> Self {
        Self {
            uid: AtomicI32::new(uid),
            friendly_name: Mutex::new(friendly_name),
            pending: Mutex::new(Vec::new()),
            inbox: Mutex::new(Vec::new()),
            outbox: Mutex::new(Vec::new()),
            scheduled: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
            close_all: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    pub(crate) fn uid(&self) -> i32 {
        self.uid.load(Ordering::SeqCst)
    }

    pub(crate) fn schedule_event(&self, event: TransportEvent) {
        self.scheduled.lock().push(Scheduled::Event(event));
    }
}

/// Generate a random non-zero identity
pub(crate) fn random_uid() -> i32 {
    loop {
        let uid = rand::random::<i32>();
        if uid != 0 {
            return uid;
        }
    }
}

/// Build a greeting carrying the friendly name
pub(crate) fn build_greeting(pool: &MessagePool, uid: i32, name: &str) -> Result<Message, MessageError> {
    let mut greeting = pool.take();
    greeting.set_from_uid(uid);
    greeting.set_to_uid(0);
    greeting.set_message_type(MessageType::Greeting);
    if let Err(e) = greeting.write_str(name) {
        pool.recycle_all([greeting]);
        return Err(e);
    }
    Ok(greeting)
}

/// LanLink peer transport
pub struct Transport {
    config: NetworkConfig,
    pool: Arc<MessagePool>,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Transport {
    /// Create a transport with a fresh random identity; call `start` to run it
    pub fn new(config: NetworkConfig, friendly_name: impl Into<String>) -> Self {
        let pool = Arc::new(MessagePool::new(config.pool_capacity));
        let shared = Arc::new(Shared::new(random_uid(), friendly_name.into()));
        Self {
            config,
            pool,
            shared,
            handle: None,
        }
    }

    /// Spawn the background networking loop
    pub fn start(&mut self) -> TransportResult<()> {
        if self.handle.is_some() {
            return Err(TransportError::AlreadyRunning);
        }

        self.shared.running.store(true, Ordering::SeqCst);
        let worker = Worker::new(self.config.clone(), self.pool.clone(), self.shared.clone());
        let handle = std::thread::Builder::new()
            .name("lanlink-transport".to_string())
            .spawn(move || worker.run());

        match handle {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(
                    "Transport started on port {} as uid {}",
                    self.config.port,
                    self.uid()
                );
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Stop the background loop, close every connection and recycle queued messages
    pub fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Transport thread panicked during shutdown");
            }
            tracing::info!("Transport stopped");
        }

        let inbox = std::mem::take(&mut *self.shared.inbox.lock());
        let outbox = std::mem::take(&mut *self.shared.outbox.lock());
        self.pool.recycle_all(inbox);
        self.pool.recycle_all(outbox);
        self.shared.scheduled.lock().clear();
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// The local identity
    pub fn uid(&self) -> i32 {
        self.shared.uid()
    }

    pub fn friendly_name(&self) -> String {
        self.shared.friendly_name.lock().clone()
    }

    /// Change the friendly name and announce it to every peer
    pub fn set_friendly_name(&self, name: impl Into<String>) -> TransportResult<()> {
        *self.shared.friendly_name.lock() = name.into();
        self.send_greeting()
    }

    /// The pool every message of this transport comes from
    pub fn pool(&self) -> &Arc<MessagePool> {
        &self.pool
    }

    /// Check out an empty message from the pool
    pub fn take_message(&self) -> Message {
        self.pool.take()
    }

    /// Return a message to the pool
    pub fn recycle(&self, msg: Message) -> PoolResult<()> {
        self.pool.recycle(msg)
    }

    /// Number of live connections
    pub fn peer_count(&self) -> usize {
        self.shared.peers.lock().len()
    }

    /// Snapshot of live connections
    pub fn peers(&self) -> Vec<PeerLink> {
        self.shared.peers.lock().clone()
    }

    pub fn is_connected_to(&self, ip: IpAddr) -> bool {
        self.shared.peers.lock().iter().any(|p| p.addr.ip() == ip)
    }

    /// Ask the background loop to connect to `addr`. Failed attempts are
    /// retried until one succeeds or the request is cancelled.
    pub fn connect_to(&self, addr: SocketAddr) {
        let mut pending = self.shared.pending.lock();
        if !pending.contains(&addr) {
            tracing::debug!("Queued connection to {}", addr);
            pending.push(addr);
        }
    }

    /// Stop trying to connect to `addr`
    pub fn cancel_pending(&self, addr: SocketAddr) {
        self.shared.pending.lock().retain(|a| *a != addr);
    }

    /// Connection requests that have not connected yet
    pub fn pending_connections(&self) -> Vec<SocketAddr> {
        self.shared.pending.lock().clone()
    }

    /// Close every connection on the next background iteration
    pub fn close_all(&self) {
        self.shared.close_all.store(true, Ordering::SeqCst);
    }

    /// Send a copy of `msg` to every peer
    ///
    /// The copy is stamped with the local uid and a broadcast recipient; `msg`
    /// itself is left untouched. Does nothing when no peer is connected.
    pub fn send(&self, msg: &Message) -> TransportResult<()> {
        self.enqueue(0, msg)
    }

    /// Send a copy of `msg` to the peer whose identity is `to_uid`
    pub fn send_to(&self, to_uid: i32, msg: &Message) -> TransportResult<()> {
        self.enqueue(to_uid, msg)
    }

    /// Broadcast a greeting carrying the current friendly name
    pub fn send_greeting(&self) -> TransportResult<()> {
        if self.peer_count() == 0 {
            return Ok(());
        }
        let name = self.friendly_name();
        let greeting = build_greeting(&self.pool, self.uid(), &name)?;
        self.shared.outbox.lock().push(greeting);
        Ok(())
    }

    /// Run `call` on the next application tick
    pub fn schedule<F: FnOnce() + Send + 'static>(&self, call: F) {
        self.shared.scheduled.lock().push(Scheduled::Call(Box::new(call)));
    }

    /// Application tick
    ///
    /// Runs scheduled work in submission order, then drains the inbox.
    /// Greetings are handled here; every other message is handed back as
    /// [`TransportEvent::Message`].
    pub fn update(&self) -> Vec<TransportEvent> {
        let mut events = Vec::new();

        let scheduled = std::mem::take(&mut *self.shared.scheduled.lock());
        for item in scheduled {
            match item {
                Scheduled::Event(event) => events.push(event),
                Scheduled::Call(call) => call(),
            }
        }

        let inbox = std::mem::take(&mut *self.shared.inbox.lock());
        for mut msg in inbox {
            if msg.message_type() != MessageType::Greeting {
                events.push(TransportEvent::Message(msg));
                continue;
            }

            let from = msg.from_uid();
            if from == self.uid() {
                self.resolve_uid_collision();
            } else {
                let name = msg.read_string().unwrap_or_else(|e| {
                    tracing::warn!("Malformed greeting from {}: {}", from, e);
                    String::new()
                });
                tracing::info!("Peer {} joined as '{}'", from, name);
                events.push(TransportEvent::PeerJoined { uid: from, name });
            }
            self.pool.recycle_all([msg]);
        }

        events
    }

    fn resolve_uid_collision(&self) {
        let old = self.uid();
        let mut new = random_uid();
        while new == old {
            new = random_uid();
        }
        self.shared.uid.store(new, Ordering::SeqCst);
        tracing::warn!("Identity {} already in use, switched to {}", old, new);
        if let Err(e) = self.send_greeting() {
            tracing::error!("Failed to send greeting: {}", e);
        }
    }

    fn enqueue(&self, to_uid: i32, msg: &Message) -> TransportResult<()> {
        if self.peer_count() == 0 {
            return Ok(());
        }
        let mut copy = self.pool.copy_of(msg)?;
        copy.set_from_uid(self.uid());
        copy.set_to_uid(to_uid);
        self.shared.outbox.lock().push(copy);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

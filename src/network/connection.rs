//! Connection handling for LanLink
//!
//! Each connection runs two resumable state machines over a non-blocking
//! stream:
//! - the reader accumulates a length prefix and then a frame body
//! - the writer drains the outgoing queue, prefix first, then body
//!
//! Both remember exactly how far they got, so a step that would block simply
//! resumes on the next tick.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use thiserror::Error;

use super::is_transient;
use crate::protocol::{
    Message, MessageError, MessagePool, HEADER_SIZE, LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE,
};

/// Connection errors; every variant is terminal for the connection
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Frame too large: {0} bytes (max: {1})")]
    Oversized(usize, usize),

    #[error("Frame too small: {0} bytes (min: {1})")]
    Undersized(usize, usize),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// A byte stream a connection can run over
pub trait PeerStream: Read + Write {
    /// Shut down both directions of the stream
    fn shutdown(&self) -> io::Result<()>;
}

impl PeerStream for TcpStream {
    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Length { filled: usize },
    Body { filled: usize, total: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Prefix { sent: usize },
    Body { sent: usize },
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Messages sent
    pub messages_sent: u64,
    /// Messages received
    pub messages_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

/// A connection to a remote peer
pub struct Connection<S: PeerStream = TcpStream> {
    stream: S,
    remote_addr: SocketAddr,
    /// Sender uid of the most recent frame, 0 until one arrives
    remote_uid: i32,
    pool: Arc<MessagePool>,
    outgoing: VecDeque<Message>,
    incoming: VecDeque<Message>,
    read_state: ReadState,
    length_buf: [u8; LENGTH_PREFIX_SIZE],
    body_buf: Box<[u8]>,
    write_state: WriteState,
    stats: ConnectionStats,
    closed: bool,
}

impl<S: PeerStream> Connection<S> {
    pub fn new(stream: S, remote_addr: SocketAddr, pool: Arc<MessagePool>) -> Self {
        Self {
            stream,
            remote_addr,
            remote_uid: 0,
            pool,
            outgoing: VecDeque::with_capacity(8),
            incoming: VecDeque::with_capacity(8),
            read_state: ReadState::Length { filled: 0 },
            length_buf: [0u8; LENGTH_PREFIX_SIZE],
            body_buf: vec![0u8; MAX_MESSAGE_SIZE].into_boxed_slice(),
            write_state: WriteState::Prefix { sent: 0 },
            stats: ConnectionStats::default(),
            closed: false,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn remote_uid(&self) -> i32 {
        self.remote_uid
    }

    #[cfg(test)]
    pub(crate) fn set_remote_uid(&mut self, uid: i32) {
        self.remote_uid = uid;
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Messages waiting to be written, the one in flight included
    pub fn pending_outgoing(&self) -> usize {
        self.outgoing.len()
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Queue a message for writing; the connection takes ownership
    pub fn send(&mut self, msg: Message) {
        self.outgoing.push_back(msg);
    }

    pub fn send_all<I: IntoIterator<Item = Message>>(&mut self, messages: I) {
        self.outgoing.extend(messages);
    }

    /// Hand over every decoded message, oldest first
    pub fn drain_incoming(&mut self) -> impl Iterator<Item = Message> + '_ {
        self.incoming.drain(..)
    }

    /// Advance the reader
    ///
    /// Makes one receive attempt for the length prefix and, once that is
    /// complete, one for the body. At most one frame is decoded per call.
    pub fn read_step(&mut self) -> ConnectionResult<()> {
        if let ReadState::Length { filled } = self.read_state {
            let n = match self.receive(ReadTarget::Length(filled))? {
                Some(n) => n,
                None => return Ok(()),
            };
            let filled = filled + n;
            if filled < LENGTH_PREFIX_SIZE {
                self.read_state = ReadState::Length { filled };
                return Ok(());
            }

            let total = u32::from_le_bytes(self.length_buf) as usize;
            if total > MAX_MESSAGE_SIZE {
                return Err(ConnectionError::Oversized(total, MAX_MESSAGE_SIZE));
            }
            if total < HEADER_SIZE {
                return Err(ConnectionError::Undersized(total, HEADER_SIZE));
            }
            self.read_state = ReadState::Body { filled: 0, total };
        }

        if let ReadState::Body { filled, total } = self.read_state {
            let n = match self.receive(ReadTarget::Body(filled, total))? {
                Some(n) => n,
                None => return Ok(()),
            };
            let filled = filled + n;
            if filled < total {
                self.read_state = ReadState::Body { filled, total };
                return Ok(());
            }

            let mut msg = self.pool.take();
            if let Err(e) = msg.load_frame(&self.body_buf[..total]) {
                self.pool.recycle_all([msg]);
                return Err(e.into());
            }
            self.remote_uid = msg.from_uid();
            self.incoming.push_back(msg);
            self.stats.messages_received += 1;
            self.read_state = ReadState::Length { filled: 0 };
        }

        Ok(())
    }

    /// Advance the writer
    ///
    /// Writes queued messages until the stream would block or the queue is
    /// empty. A message is recycled once its last byte has been written.
    pub fn write_step(&mut self) -> ConnectionResult<()> {
        while let Some(msg) = self.outgoing.front() {
            let body_len = msg.len();
            match self.write_state {
                WriteState::Prefix { sent } => {
                    let prefix = (body_len as u32).to_le_bytes();
                    let n = match transmit(&mut self.stream, &prefix[sent..])? {
                        Some(n) => n,
                        None => return Ok(()),
                    };
                    self.stats.bytes_sent += n as u64;
                    let sent = sent + n;
                    self.write_state = if sent == LENGTH_PREFIX_SIZE {
                        WriteState::Body { sent: 0 }
                    } else {
                        WriteState::Prefix { sent }
                    };
                }
                WriteState::Body { sent } => {
                    let n = match transmit(&mut self.stream, &msg.as_bytes()[sent..])? {
                        Some(n) => n,
                        None => return Ok(()),
                    };
                    self.stats.bytes_sent += n as u64;
                    let sent = sent + n;
                    if sent < body_len {
                        self.write_state = WriteState::Body { sent };
                        continue;
                    }

                    self.write_state = WriteState::Prefix { sent: 0 };
                    self.stats.messages_sent += 1;
                    if let Some(done) = self.outgoing.pop_front() {
                        self.pool.recycle_all([done]);
                    }
                }
            }
        }
        Ok(())
    }

    /// Shut the stream down and recycle every queued message
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.stream.shutdown() {
            tracing::debug!("Shutdown of {} failed: {}", self.remote_addr, e);
        }
        self.release_queues();
    }

    fn release_queues(&mut self) {
        self.pool.recycle_all(self.outgoing.drain(..));
        self.pool.recycle_all(self.incoming.drain(..));
    }

    fn receive(&mut self, target: ReadTarget) -> ConnectionResult<Option<usize>> {
        let buf = match target {
            ReadTarget::Length(filled) => &mut self.length_buf[filled..],
            ReadTarget::Body(filled, total) => &mut self.body_buf[filled..total],
        };
        match self.stream.read(buf) {
            Ok(0) => Err(ConnectionError::Closed),
            Ok(n) => {
                self.stats.bytes_received += n as u64;
                Ok(Some(n))
            }
            Err(e) if is_transient(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl<S: PeerStream> Drop for Connection<S> {
    fn drop(&mut self) {
        self.release_queues();
    }
}

impl<S: PeerStream> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.remote_addr)
            .field("remote_uid", &self.remote_uid)
            .field("outgoing", &self.outgoing.len())
            .field("incoming", &self.incoming.len())
            .field("closed", &self.closed)
            .finish()
    }
}

#[derive(Clone, Copy)]
enum ReadTarget {
    Length(usize),
    Body(usize, usize),
}

fn transmit<S: Write>(stream: &mut S, bytes: &[u8]) -> ConnectionResult<Option<usize>> {
    match stream.write(bytes) {
        Ok(0) => Err(io::Error::from(io::ErrorKind::WriteZero).into()),
        Ok(n) => Ok(Some(n)),
        Err(e) if is_transient(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

//! Message pool
//!
//! Reuses message buffers so the hot send/receive path does not allocate.

use parking_lot::Mutex;
use thiserror::Error;

use super::{Message, MessageResult};

/// Pool errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("Message was not checked out of a pool")]
    NotCheckedOut,

    #[error("Pool underflow: more messages recycled than taken")]
    Underflow,
}

pub type PoolResult<T> = Result<T, PoolError>;

struct PoolState {
    free: Vec<Message>,
    outstanding: usize,
}

/// Bounded store of reusable message buffers
///
/// `take` and `recycle` are safe to call from any thread. At most `capacity`
/// free buffers are retained; `take` allocates when the free list is empty.
pub struct MessagePool {
    capacity: usize,
    state: Mutex<PoolState>,
}

impl MessagePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(PoolState {
                free: Vec::with_capacity(capacity),
                outstanding: 0,
            }),
        }
    }

    /// Check out a cleared, unlocked message
    pub fn take(&self) -> Message {
        let mut msg = {
            let mut state = self.state.lock();
            state.outstanding += 1;
            state.free.pop()
        }
        .unwrap_or_else(Message::new);
        msg.set_locked(false);
        msg.clear();
        msg
    }

    /// Return a message to the pool
    pub fn recycle(&self, mut msg: Message) -> PoolResult<()> {
        if msg.is_locked() {
            return Err(PoolError::NotCheckedOut);
        }
        let mut state = self.state.lock();
        if state.outstanding == 0 {
            return Err(PoolError::Underflow);
        }
        state.outstanding -= 1;
        msg.clear();
        msg.set_locked(true);
        if state.free.len() < self.capacity {
            state.free.push(msg);
        }
        Ok(())
    }

    /// Recycle every message, logging any bookkeeping error
    pub fn recycle_all<I: IntoIterator<Item = Message>>(&self, messages: I) {
        for msg in messages {
            if let Err(e) = self.recycle(msg) {
                tracing::error!("Failed to recycle message: {}", e);
            }
        }
    }

    /// Check out a message holding a copy of `msg`, cursors included
    pub fn copy_of(&self, msg: &Message) -> MessageResult<Message> {
        msg.check_lock()?;
        let mut copy = self.take();
        if let Err(e) = copy.copy_from(msg) {
            self.recycle_all([copy]);
            return Err(e);
        }
        Ok(copy)
    }

    /// Messages taken and not yet recycled
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    /// Free buffers ready for reuse
    pub fn available(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new(super::DEFAULT_POOL_CAPACITY)
    }
}

impl std::fmt::Debug for MessagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MessagePool")
            .field("capacity", &self.capacity)
            .field("outstanding", &state.outstanding)
            .field("available", &state.free.len())
            .finish()
    }
}

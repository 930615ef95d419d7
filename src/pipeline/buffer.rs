//! Stage buffers: the exchange point between one producer stage and its
//! consumer bindings.
//!
//! A buffer holds two independent things:
//!
//! - a bounded FIFO of unread published values, drained by
//!   [`dequeue`](StageBuffer::dequeue), and
//! - a `current` slot holding the most recent publish, read by
//!   [`peek`](StageBuffer::peek) without touching the queue.
//!
//! Capacity 0 turns the queue into a rendezvous: `publish_enqueue` only
//! returns once a consumer has dequeued the value.
//!
//! Ring storage, counters and `current` live under one mutex. Wake signals
//! for refresh/release listeners are bounded(1) crossbeam channels, sent
//! after the guarded section is released so they coalesce instead of piling
//! up.

use crate::pipeline::error::{Closed, PipelineError, PipelineResult};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Values that can travel through a buffer.
///
/// `Default` backs dirty reads before the first publish and timed-out reads
/// without a stale value. Large payloads should be wrapped in `Arc`.
pub trait Payload: Clone + Default + Send + Sync + 'static {}

impl<T: Clone + Default + Send + Sync + 'static> Payload for T {}

/// One-shot wake signal handed out by listener registration.
pub type Signal = Receiver<()>;

struct BufferState<T> {
    queue: VecDeque<T>,
    current: Option<T>,
    total_enqueues: u64,
    total_dequeues: u64,
    total_overwrites: u64,
    closed: bool,
}

/// Point-in-time view of a buffer's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub name: String,
    pub capacity: usize,
    pub queue_length: usize,
    pub total_enqueues: u64,
    pub total_dequeues: u64,
    pub total_overwrites: u64,
    pub has_value: bool,
    pub closed: bool,
    pub writer: Option<String>,
}

/// Thread-safe single-writer, multi-reader exchange point.
pub struct StageBuffer<T> {
    name: String,
    capacity: usize,
    state: Mutex<BufferState<T>>,
    /// Signalled when the queue gains an item or `current` is set.
    readable: Condvar,
    /// Signalled when a queue slot frees up or a rendezvous completes.
    writable: Condvar,
    refresh: Mutex<Vec<Sender<()>>>,
    release: Mutex<Vec<Sender<()>>>,
    writer: Mutex<Option<String>>,
}

impl<T: Payload> StageBuffer<T> {
    /// Create a buffer. Capacity 0 makes `publish_enqueue` a rendezvous.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            state: Mutex::new(BufferState {
                queue: VecDeque::with_capacity(capacity.max(1)),
                current: None,
                total_enqueues: 0,
                total_dequeues: 0,
                total_overwrites: 0,
                closed: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
            refresh: Mutex::new(Vec::new()),
            release: Mutex::new(Vec::new()),
            writer: Mutex::new(None),
        }
    }

    /// Create a buffer from a signed capacity, as read from configuration.
    pub fn with_capacity(name: impl Into<String>, capacity: i64) -> PipelineResult<Self> {
        let name = name.into();
        let capacity = usize::try_from(capacity)
            .map_err(|_| PipelineError::InvalidCapacity { buffer: name.clone(), capacity })?;
        Ok(Self::new(name, capacity))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue slots actually available; a rendezvous buffer parks one value.
    fn slots(&self) -> usize {
        self.capacity.max(1)
    }

    fn lock(&self) -> MutexGuard<'_, BufferState<T>> {
        // A panicking evaluator never holds this lock, so poison only means a
        // reader died mid-clone; the state itself is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace `current` and, when unread values are queued, the newest one.
    /// Never blocks.
    pub fn publish_overwrite(&self, value: T) -> Result<(), Closed> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(Closed);
            }
            if let Some(newest) = state.queue.back_mut() {
                *newest = value.clone();
            }
            state.current = Some(value);
            state.total_overwrites += 1;
        }
        self.readable.notify_all();
        notify(&self.refresh);
        Ok(())
    }

    /// Append a value, blocking while the queue is full.
    ///
    /// On a capacity-0 buffer this does not return until a consumer has
    /// dequeued exactly this value. Concurrent producers are serialized
    /// because only one value can be parked at a time.
    pub fn publish_enqueue(&self, value: T) -> Result<(), Closed> {
        let ticket = {
            let mut state = self.lock();
            while !state.closed && state.queue.len() >= self.slots() {
                state = self
                    .writable
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            if state.closed {
                return Err(Closed);
            }
            state.queue.push_back(value.clone());
            state.current = Some(value);
            state.total_enqueues += 1;
            state.total_enqueues
        };
        self.readable.notify_all();
        notify(&self.refresh);

        if self.capacity == 0 {
            let mut state = self.lock();
            while !state.closed && state.total_dequeues < ticket {
                state = self
                    .writable
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            if state.total_dequeues < ticket {
                return Err(Closed);
            }
        }
        Ok(())
    }

    /// Pop the oldest unread value, blocking until one exists.
    pub fn dequeue(&self) -> Result<T, Closed> {
        let value = {
            let mut state = self.lock();
            while !state.closed && state.queue.is_empty() {
                state = self
                    .readable
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            self.pop_locked(&mut state)?
        };
        self.after_dequeue();
        Ok(value)
    }

    /// Bounded-wait dequeue. `Ok(None)` means the timeout elapsed.
    pub fn try_dequeue(&self, timeout: Duration) -> Result<Option<T>, Closed> {
        let value = {
            let state = self.lock();
            let (mut state, _) = self
                .readable
                .wait_timeout_while(state, timeout, |s| !s.closed && s.queue.is_empty())
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !state.closed && state.queue.is_empty() {
                return Ok(None);
            }
            self.pop_locked(&mut state)?
        };
        self.after_dequeue();
        Ok(Some(value))
    }

    fn pop_locked(&self, state: &mut BufferState<T>) -> Result<T, Closed> {
        if state.closed {
            return Err(Closed);
        }
        let value = state.queue.pop_front().ok_or(Closed)?;
        state.total_dequeues += 1;
        Ok(value)
    }

    fn after_dequeue(&self) {
        self.writable.notify_all();
        notify(&self.release);
    }

    /// Read `current`, blocking only until the first-ever publish.
    pub fn peek(&self) -> Result<T, Closed> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(Closed);
            }
            if let Some(value) = &state.current {
                return Ok(value.clone());
            }
            state = self
                .readable
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Bounded-wait peek. `Ok(None)` means nothing was published in time.
    pub fn try_peek(&self, timeout: Duration) -> Result<Option<T>, Closed> {
        let state = self.lock();
        let (state, _) = self
            .readable
            .wait_timeout_while(state, timeout, |s| !s.closed && s.current.is_none())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.closed {
            return Err(Closed);
        }
        Ok(state.current.clone())
    }

    /// Non-blocking read of `current`; `None` before the first publish.
    pub fn current(&self) -> Option<T> {
        self.lock().current.clone()
    }

    /// Register a wake signal fired after every publish.
    pub fn add_refresh_listener(&self) -> Signal {
        self.add_listener(&self.refresh)
    }

    /// Register a wake signal fired after every dequeue.
    pub fn add_release_listener(&self) -> Signal {
        self.add_listener(&self.release)
    }

    fn add_listener(&self, listeners: &Mutex<Vec<Sender<()>>>) -> Signal {
        let (tx, rx) = bounded(1);
        if !self.is_closed() {
            lock_listeners(listeners).push(tx);
        }
        rx
    }

    pub fn has_release_listeners(&self) -> bool {
        !lock_listeners(&self.release).is_empty()
    }

    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Record the single stage allowed to publish here.
    pub fn claim_writer(&self, stage: &str) -> PipelineResult<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        match writer.as_deref() {
            Some(existing) => Err(PipelineError::WriterAlreadyBound {
                buffer: self.name.clone(),
                writer: existing.to_string(),
            }),
            None => {
                *writer = Some(stage.to_string());
                Ok(())
            }
        }
    }

    /// Close the buffer and wake every blocked caller. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.readable.notify_all();
        self.writable.notify_all();
        // Dropping the senders disconnects every listener receiver.
        lock_listeners(&self.refresh).clear();
        lock_listeners(&self.release).clear();
        tracing::debug!("Buffer '{}' closed", self.name);
    }

    pub fn stats(&self) -> BufferStats {
        let writer = self.writer.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let state = self.lock();
        BufferStats {
            name: self.name.clone(),
            capacity: self.capacity,
            queue_length: state.queue.len(),
            total_enqueues: state.total_enqueues,
            total_dequeues: state.total_dequeues,
            total_overwrites: state.total_overwrites,
            has_value: state.current.is_some(),
            closed: state.closed,
            writer,
        }
    }
}

fn lock_listeners(listeners: &Mutex<Vec<Sender<()>>>) -> MutexGuard<'_, Vec<Sender<()>>> {
    listeners.lock().unwrap_or_else(|p| p.into_inner())
}

fn notify(listeners: &Mutex<Vec<Sender<()>>>) {
    lock_listeners(listeners)
        .retain(|tx| !matches!(tx.try_send(()), Err(TrySendError::Disconnected(_))));
}

/// Type-erased handle the engine keeps for every buffer it owns.
pub trait BufferControl: Send + Sync {
    fn name(&self) -> &str;
    fn close(&self);
    fn stats(&self) -> BufferStats;
}

impl<T: Payload> BufferControl for StageBuffer<T> {
    fn name(&self) -> &str {
        StageBuffer::name(self)
    }

    fn close(&self) {
        StageBuffer::close(self)
    }

    fn stats(&self) -> BufferStats {
        StageBuffer::stats(self)
    }
}

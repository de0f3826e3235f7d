//! # Parchan
//!
//! A FIFO async handoff channel with an optional buffer.
//!
//! ## Semantics
//!
//! - **Unbuffered** (`Capacity::Bounded(0)`): `push` completes only once a consumer has taken the value.
//! - **Buffered** (`Capacity::Bounded(n)`): the first `n` pushes complete without a consumer;
//!   further pushes park until a `pop` frees a slot.
//! - **Unbounded**: `push` never parks.
//!
//! ## Invariants
//!
//! - The buffer never holds more than `capacity` items.
//! - Values come out in the order they went in, across buffered and parked producers alike.
//! - A `pop` dropped while parked never swallows a value or the close error.
//! - Once closed, no push succeeds. The buffer still drains; after that `pop` yields
//!   the close error exactly once, then `Ok(None)` forever.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use futures::Stream;
use tokio::sync::oneshot;


/// Channel errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Capacity must be zero or positive.
    NegativeCapacity(i64),
    /// The channel was closed before the value could be delivered.
    Closed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NegativeCapacity(n) => write!(f, "channel capacity must not be negative, got {}", n),
            Self::Closed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Returned by [`Channel::try_push`], handing the value back to the caller.
pub enum TryPushError<T> {
    /// No consumer is waiting and the buffer is full.
    Full(T),
    /// The channel is closed.
    Closed(T),
}

impl<T> TryPushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(v) | Self::Closed(v) => v,
        }
    }
}

impl<T> fmt::Debug for TryPushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => write!(f, "Full(..)"),
            Self::Closed(_) => write!(f, "Closed(..)"),
        }
    }
}

impl<T> fmt::Display for TryPushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => write!(f, "channel full"),
            Self::Closed(_) => write!(f, "channel closed"),
        }
    }
}

impl<T> std::error::Error for TryPushError<T> {}

/// How many values a channel holds without a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    Bounded(usize),
    Unbounded,
}

impl Capacity {
    fn admits(&self, len: usize) -> bool {
        match self {
            Self::Bounded(n) => len < *n,
            Self::Unbounded => true,
        }
    }
}

impl TryFrom<i64> for Capacity {
    type Error = Error;

    fn try_from(n: i64) -> Result<Self> {
        if n < 0 {
            return Err(Error::NegativeCapacity(n));
        }
        Ok(Self::Bounded(n as usize))
    }
}

/// Terminal error type used when none is specified.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type Delivery<T, E> = std::result::Result<Option<T>, E>;

/// A producer parked on a full channel, holding its value until a slot frees.
struct Producer<T> {
    value: T,
    ack: oneshot::Sender<bool>,
}

struct State<T, E> {
    capacity: Capacity,
    buffer: VecDeque<T>,
    producers: VecDeque<Producer<T>>,
    consumers: VecDeque<oneshot::Sender<Delivery<T, E>>>,
    closed: bool,
    error: Option<E>,
}

/// A cloneable handle to a FIFO channel. All clones share one queue.
///
/// `E` is the error a closing party may leave behind for the next consumer.
pub struct Channel<T, E = BoxError> {
    state: Arc<Mutex<State<T, E>>>,
}

impl<T, E> Clone for Channel<T, E> {
    fn clone(&self) -> Self {
        Self { state: Arc::clone(&self.state) }
    }
}

impl<T, E> fmt::Debug for Channel<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Channel")
            .field("capacity", &state.capacity)
            .field("len", &state.buffer.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T, E> Channel<T, E> {
    pub fn new(capacity: Capacity) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                capacity,
                buffer: VecDeque::new(),
                producers: VecDeque::new(),
                consumers: VecDeque::new(),
                closed: false,
                error: None,
            })),
        }
    }

    /// Creates a channel from a signed capacity, rejecting negative values.
    pub fn with_capacity(capacity: i64) -> Result<Self> {
        Ok(Self::new(Capacity::try_from(capacity)?))
    }

    pub fn unbuffered() -> Self {
        Self::new(Capacity::Bounded(0))
    }

    pub fn bounded(capacity: usize) -> Self {
        Self::new(Capacity::Bounded(capacity))
    }

    pub fn unbounded() -> Self {
        Self::new(Capacity::Unbounded)
    }

    fn lock(&self) -> MutexGuard<'_, State<T, E>> {
        lock(&self.state)
    }

    /// Sends a value, parking until a consumer or a buffer slot takes it.
    ///
    /// Fails with `Error::Closed` if the channel is closed before or while parked.
    pub async fn push(&self, value: T) -> Result<()> {
        let ack = {
            let mut state = self.lock();
            if state.closed {
                return Err(Error::Closed);
            }
            let Some(value) = hand_off(&mut state, value) else {
                return Ok(());
            };
            if state.capacity.admits(state.buffer.len()) {
                state.buffer.push_back(value);
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.producers.push_back(Producer { value, ack: tx });
            rx
        };

        match ack.await {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(Error::Closed),
        }
    }

    /// Sends a value without parking.
    pub fn try_push(&self, value: T) -> std::result::Result<(), TryPushError<T>> {
        let mut state = self.lock();
        if state.closed {
            return Err(TryPushError::Closed(value));
        }
        let Some(value) = hand_off(&mut state, value) else {
            return Ok(());
        };
        if state.capacity.admits(state.buffer.len()) {
            state.buffer.push_back(value);
            return Ok(());
        }
        Err(TryPushError::Full(value))
    }

    /// Receives the next value.
    ///
    /// Returns `Ok(None)` once the channel is closed and drained. If it was
    /// closed with an error, the first such pop returns that error instead.
    pub async fn pop(&self) -> std::result::Result<Option<T>, E> {
        let mut waiting = {
            let mut state = self.lock();
            if let Some(value) = state.buffer.pop_front() {
                // the oldest parked producer moves into the freed slot
                if let Some(producer) = state.producers.pop_front() {
                    state.buffer.push_back(producer.value);
                    let _ = producer.ack.send(true);
                }
                return Ok(Some(value));
            }
            if let Some(producer) = state.producers.pop_front() {
                let _ = producer.ack.send(true);
                return Ok(Some(producer.value));
            }
            if state.closed {
                return match state.error.take() {
                    Some(e) => Err(e),
                    None => Ok(None),
                };
            }
            let (tx, rx) = oneshot::channel();
            state.consumers.push_back(tx);
            Waiting { state: Arc::clone(&self.state), rx, settled: false }
        };

        let delivery = (&mut waiting.rx).await;
        waiting.settled = true;
        delivery.unwrap_or(Ok(None))
    }

    /// Closes the channel. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        self.shutdown(None)
    }

    /// Closes the channel, leaving `error` for the next consumer.
    ///
    /// If consumers are parked, the first live one receives the error and the
    /// rest observe a clean end. Otherwise the error waits for the next `pop`.
    pub fn close_with_error(&self, error: E) -> bool {
        self.shutdown(Some(error))
    }

    fn shutdown(&self, error: Option<E>) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        state.error = error;

        while let Some(consumer) = state.consumers.pop_front() {
            let delivery = match state.error.take() {
                Some(e) => Err(e),
                None => Ok(None),
            };
            if let Err(Err(e)) = consumer.send(delivery) {
                // dead consumer, keep the error for a live one
                state.error = Some(e);
            }
        }

        for producer in state.producers.drain(..) {
            let _ = producer.ack.send(false);
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of buffered values, excluding parked producers.
    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> Capacity {
        self.lock().capacity
    }

    pub fn pending_consumers(&self) -> usize {
        self.lock().consumers.iter().filter(|c| !c.is_closed()).count()
    }

    pub fn pending_producers(&self) -> usize {
        self.lock().producers.len()
    }

    /// Iterates `pop()` until the channel is closed and drained.
    ///
    /// A close error is yielded as the final item.
    pub fn into_stream(self) -> impl Stream<Item = std::result::Result<T, E>> {
        futures::stream::unfold(Some(self), |channel| async move {
            let channel = channel?;
            match channel.pop().await {
                Ok(Some(value)) => Some((Ok(value), Some(channel))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

/// Gives `value` to the first live parked consumer, or hands it back.
fn hand_off<T, E>(state: &mut State<T, E>, mut value: T) -> Option<T> {
    while let Some(consumer) = state.consumers.pop_front() {
        match consumer.send(Ok(Some(value))) {
            Ok(()) => return None,
            Err(returned) => {
                let Ok(Some(v)) = returned else { return None };
                value = v;
            }
        }
    }
    Some(value)
}

/// Puts a value taken from a dropped consumer back at the head of the queue.
///
/// The value is older than anything buffered or parked. If the buffer is full
/// its newest item moves over to the front of the parked producers.
fn restore<T, E>(state: &mut State<T, E>, value: T) {
    let Some(value) = hand_off(state, value) else {
        return;
    };
    state.buffer.push_front(value);
    if state.capacity.admits(state.buffer.len() - 1) {
        return;
    }
    if let Some(value) = state.buffer.pop_back() {
        // nobody waits on this ack
        let (ack, _) = oneshot::channel();
        state.producers.push_front(Producer { value, ack });
    }
}

fn lock<T, E>(state: &Mutex<State<T, E>>) -> MutexGuard<'_, State<T, E>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A parked `pop`. Whatever reaches it after it is dropped goes back into the channel.
struct Waiting<T, E> {
    state: Arc<Mutex<State<T, E>>>,
    rx: oneshot::Receiver<Delivery<T, E>>,
    settled: bool,
}

impl<T, E> Drop for Waiting<T, E> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.rx.close();
        let Ok(delivery) = self.rx.try_recv() else {
            return;
        };
        let mut state = lock(&self.state);
        match delivery {
            Ok(Some(value)) => restore(&mut state, value),
            Ok(None) => {}
            Err(e) => {
                if state.error.is_none() {
                    state.error = Some(e);
                }
            }
        }
    }
}

//! Mutex-guarded FIFO of job ids.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use shigoto_core::backend::QueueTransport;
use uuid::Uuid;

use crate::lock;

/// In-memory [`QueueTransport`]. Clones share the same deque.
///
/// The bounded-wait pop is implemented by polling the deque on a short timer
/// until the deadline passes; there is no blocking-pop primitive to lean on
/// the way a Redis transport has `BRPOP`.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Mutex<VecDeque<Uuid>>>,
}

impl MemoryQueue {
    /// How often the pop re-checks the deque while waiting.
    const POLL_EVERY: Duration = Duration::from_millis(25);

    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ids waiting for delivery. Test helper.
    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    /// Whether the queue is drained. Test helper.
    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }
}

impl QueueTransport for MemoryQueue {
    type Error = Infallible;

    async fn push(&self, id: Uuid) -> Result<(), Self::Error> {
        lock(&self.inner).push_back(id);
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<Uuid>, Self::Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(id) = lock(&self.inner).pop_front() {
                return Ok(Some(id));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            futures_timer::Delay::new(Self::POLL_EVERY.min(deadline - now)).await;
        }
    }
}

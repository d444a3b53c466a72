use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::payload::{Batch, Payload};

/// Pending payloads plus the time of the last flush.
struct BufferState {
    pending: Vec<Payload>,
    last_flush: Instant,
}

/// Ordered buffer of payloads waiting to be flushed.
///
/// Every read and write goes through one mutex. Capturing a batch and
/// clearing the pending list happen in the same critical section, so a
/// payload can never end up in two batches. Nothing slow ever runs while
/// the lock is held.
pub struct BatchBuffer {
    state: Mutex<BufferState>,
    batch_size: usize,
}

impl BatchBuffer {
    /// Creates an empty buffer that fills up at `batch_size` payloads.
    ///
    /// The last-flush clock starts at construction time.
    pub fn new(batch_size: usize) -> Self {
        Self {
            state: Mutex::new(BufferState {
                pending: Vec::new(),
                last_flush: Instant::now(),
            }),
            batch_size: batch_size.max(1),
        }
    }

    /// Appends a payload.
    ///
    /// When the append brings the buffer to the threshold, the contents are
    /// captured and returned in the same lock acquisition; the caller is
    /// responsible for dispatching the returned batch.
    pub fn push(&self, payload: Payload) -> Option<Batch> {
        let mut state = self.state.lock();
        state.pending.push(payload);

        if state.pending.len() >= self.batch_size {
            Some(Self::capture(&mut state))
        } else {
            None
        }
    }

    /// Captures everything pending and resets the buffer.
    ///
    /// Returns `None` without touching the last-flush time when the buffer
    /// is empty.
    pub fn take(&self) -> Option<Batch> {
        let mut state = self.state.lock();
        if state.pending.is_empty() {
            return None;
        }
        Some(Self::capture(&mut state))
    }

    fn capture(state: &mut BufferState) -> Batch {
        let payloads = std::mem::take(&mut state.pending);
        state.last_flush = Instant::now();
        Batch::new(payloads)
    }

    /// Number of payloads currently pending.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    /// Time of the most recent flush (or construction).
    pub fn last_flush(&self) -> Instant {
        self.state.lock().last_flush
    }

    /// Time elapsed since the most recent flush.
    pub fn since_last_flush(&self) -> Duration {
        self.last_flush().elapsed()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

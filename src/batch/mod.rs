pub mod buffer;
pub mod dispatcher;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::metrics::Metrics;
use crate::payload::{Batch, Payload};

pub use self::buffer::BatchBuffer;
pub use self::dispatcher::{normalize_endpoint, Delivery, DispatchError, Dispatcher, RetryPolicy};

/// What caused a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The buffer reached the batch size on insert.
    Size,
    /// The interval timer found the buffer stale.
    Interval,
    /// An explicit `flush` call.
    Manual,
}

impl FlushTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Interval => "interval",
            Self::Manual => "manual",
        }
    }
}

/// Batching parameters.
#[derive(Debug, Clone, Copy)]
pub struct BatcherOptions {
    pub batch_size: usize,
    pub interval: Duration,
    pub max_in_flight: usize,
}

impl From<&Config> for BatcherOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            batch_size: cfg.batch_size,
            interval: cfg.batch_interval,
            max_in_flight: cfg.max_in_flight,
        }
    }
}

/// Receives delivery failures that should bring the process down.
pub type FatalReceiver = mpsc::UnboundedReceiver<DispatchError>;

/// Owns the buffer and wires both flush triggers to the dispatcher.
///
/// Flushing captures the batch synchronously and queues it on a bounded
/// channel; a single dispatch loop takes batches off the queue and starts
/// a delivery once one of `max_in_flight` permits is free. When the queue
/// is full, `add` and `flush` wait for room. A delivery that exhausts its
/// retries is forwarded to the [`FatalReceiver`] returned by
/// [`Batcher::new`].
pub struct Batcher {
    buffer: BatchBuffer,
    interval: Duration,
    queue: mpsc::Sender<Batch>,
    metrics: Arc<Metrics>,
}

impl Batcher {
    /// Creates the batcher and spawns its dispatch loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        opts: BatcherOptions,
        dispatcher: Dispatcher,
        metrics: Arc<Metrics>,
    ) -> (Self, FatalReceiver) {
        let max_in_flight = opts.max_in_flight.max(1);
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let (queue, rx) = mpsc::channel(max_in_flight);

        tokio::spawn(dispatch_loop(
            rx,
            Arc::new(dispatcher),
            Arc::new(Semaphore::new(max_in_flight)),
            fatal_tx,
        ));

        let batcher = Self {
            buffer: BatchBuffer::new(opts.batch_size),
            interval: opts.interval,
            queue,
            metrics,
        };

        (batcher, fatal_rx)
    }

    /// Buffers a payload, flushing when the batch size is reached.
    pub async fn add(&self, payload: Payload) {
        let captured = self.buffer.push(payload);
        let buffered = self.buffer.len();
        self.metrics.buffered_payloads.set(buffered as f64);
        debug!(buffered, "payload added to batch");

        if let Some(batch) = captured {
            self.enqueue(batch, FlushTrigger::Size).await;
        }
    }

    /// Flushes whatever is buffered. Returns false when there was nothing
    /// to send.
    pub async fn flush(&self) -> bool {
        self.flush_from(FlushTrigger::Manual).await
    }

    async fn flush_from(&self, trigger: FlushTrigger) -> bool {
        match self.buffer.take() {
            Some(batch) => {
                self.metrics.buffered_payloads.set(self.buffer.len() as f64);
                self.enqueue(batch, trigger).await;
                true
            }
            None => false,
        }
    }

    async fn enqueue(&self, batch: Batch, trigger: FlushTrigger) {
        info!(
            trigger = trigger.as_str(),
            batch_size = batch.len(),
            "flushing batch"
        );
        self.metrics
            .batches_flushed
            .with_label_values(&[trigger.as_str()])
            .inc();
        self.metrics.batch_size.observe(batch.len() as f64);

        if let Err(e) = self.queue.send(batch).await {
            self.metrics.batches_abandoned.inc();
            warn!(batch_size = e.0.len(), "dispatch loop stopped, dropping batch");
        }
    }

    /// Runs the interval flush trigger until `ctx` is cancelled.
    ///
    /// A tick only flushes when a full interval has passed since the last
    /// flush of any kind. Nothing is flushed on cancellation.
    pub async fn run_interval(&self, ctx: CancellationToken) {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    info!(buffered = self.buffer.len(), "interval flush trigger stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let since_last_flush = self.buffer.since_last_flush();
                    if since_last_flush >= self.interval {
                        info!(
                            interval = ?self.interval,
                            time_since_last_flush = ?since_last_flush,
                            "batch interval triggered",
                        );
                        self.flush_from(FlushTrigger::Interval).await;
                    }
                }
            }
        }
    }

    /// Payloads waiting for the next flush.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffer(&self) -> &BatchBuffer {
        &self.buffer
    }
}

/// Starts deliveries in queue order, at most one per free permit. Ends when
/// the batcher is dropped.
async fn dispatch_loop(
    mut rx: mpsc::Receiver<Batch>,
    dispatcher: Arc<Dispatcher>,
    permits: Arc<Semaphore>,
    fatal_tx: mpsc::UnboundedSender<DispatchError>,
) {
    while let Some(batch) = rx.recv().await {
        let permit = match Arc::clone(&permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                warn!(error = %e, "dispatch semaphore closed, dropping batch");
                return;
            }
        };

        let dispatcher = Arc::clone(&dispatcher);
        let fatal_tx = fatal_tx.clone();

        tokio::spawn(async move {
            let _permit = permit;

            if let Err(e) = dispatcher.deliver(&batch).await {
                if e.is_fatal() && fatal_tx.send(e).is_err() {
                    warn!("fatal delivery error dropped, runner no longer listening");
                }
            }
        });
    }

    debug!("dispatch loop stopped");
}

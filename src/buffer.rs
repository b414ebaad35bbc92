//! Buffer module for pending events and batch delivery.
//!
//! The dispatcher's worker owns one [`PendingBuffer`]. A flush splits the
//! buffer into batch-size chunks and hands each to the [`BatchSender`], which
//! encodes it, posts it under a shared deadline and classifies the outcome.
//! Recoverable failures stop the flush and leave the rest of the buffer for
//! the next one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::client::{ClientError, Transport};
use crate::event::{encode_batch, Event};
use crate::sink::SinkSlot;

/// Key carrying the queuing delay in milliseconds.
const QUEUE_TIME_KEY: &str = "qt";

/// An event waiting in the buffer, stamped with its intake time.
#[derive(Debug, Clone)]
pub(crate) struct QueuedEvent {
    pub(crate) event: Event,
    reported_at: Instant,
}

impl QueuedEvent {
    pub(crate) fn new(event: Event) -> Self {
        Self::reported_at(event, Instant::now())
    }

    pub(crate) fn reported_at(event: Event, reported_at: Instant) -> Self {
        Self { event, reported_at }
    }

    /// Record how long the event has been queued, unless it is under a
    /// millisecond or the event has nothing to send.
    fn annotate_queue_time(&mut self, now: Instant) {
        if !self.event.has_encodable_pairs() {
            return;
        }

        let qt = now.saturating_duration_since(self.reported_at).as_millis();
        if qt > 0 {
            self.event.set(QUEUE_TIME_KEY, qt.to_string());
        }
    }
}

/// What caused a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushTrigger {
    /// Buffer reached the batch size
    Size,

    /// Batch wait interval elapsed
    Timer,

    /// Final flush during shutdown
    Shutdown,
}

impl std::fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlushTrigger::Size => write!(f, "size"),
            FlushTrigger::Timer => write!(f, "timer"),
            FlushTrigger::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Statistics about dispatcher operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Total number of events taken into the buffer
    pub events_received: u64,

    /// Total number of events delivered in successful batches
    pub events_sent: u64,

    /// Total number of events handed to the error sink
    pub events_failed: u64,

    /// Total number of events dropped because their batch encoded to nothing
    pub events_dropped: u64,

    /// Number of batch requests the collector accepted
    pub batches_sent: u64,

    /// Number of batches given up on
    pub batches_failed: u64,

    /// Number of flushes cut short by a timeout or cancellation
    pub recoverable_failures: u64,

    /// Number of flush operations triggered by the batch size
    pub size_flushes: u64,

    /// Number of flush operations triggered by the timer
    pub time_flushes: u64,

    /// Number of flush operations performed while shutting down
    pub shutdown_flushes: u64,
}

/// Live counters behind [`DispatcherStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    events_received: AtomicU64,
    events_sent: AtomicU64,
    events_failed: AtomicU64,
    events_dropped: AtomicU64,
    batches_sent: AtomicU64,
    batches_failed: AtomicU64,
    recoverable_failures: AtomicU64,
    size_flushes: AtomicU64,
    time_flushes: AtomicU64,
    shutdown_flushes: AtomicU64,
}

fn bump(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

impl StatsCounters {
    pub(crate) fn record_received(&self) {
        bump(&self.events_received, 1);
    }

    pub(crate) fn record_flush(&self, trigger: FlushTrigger) {
        let counter = match trigger {
            FlushTrigger::Size => &self.size_flushes,
            FlushTrigger::Timer => &self.time_flushes,
            FlushTrigger::Shutdown => &self.shutdown_flushes,
        };
        bump(counter, 1);
    }

    pub(crate) fn snapshot(&self) -> DispatcherStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        DispatcherStats {
            events_received: load(&self.events_received),
            events_sent: load(&self.events_sent),
            events_failed: load(&self.events_failed),
            events_dropped: load(&self.events_dropped),
            batches_sent: load(&self.batches_sent),
            batches_failed: load(&self.batches_failed),
            recoverable_failures: load(&self.recoverable_failures),
            size_flushes: load(&self.size_flushes),
            time_flushes: load(&self.time_flushes),
            shutdown_flushes: load(&self.shutdown_flushes),
        }
    }
}

/// Ordered events awaiting delivery. Owned by the worker alone.
#[derive(Debug, Default)]
pub(crate) struct PendingBuffer {
    events: Vec<QueuedEvent>,
}

impl PendingBuffer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn push(&mut self, event: QueuedEvent) {
        self.events.push(event);
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Send the buffer and drop every event that was resolved.
    ///
    /// Returns the number of resolved events; whatever remains is retried on
    /// the next flush, still in acceptance order.
    pub(crate) async fn flush<T>(&mut self, sender: &BatchSender<'_, T>) -> usize
    where
        T: Transport + ?Sized,
    {
        if self.events.is_empty() {
            return 0;
        }

        let resolved = sender.send(&mut self.events).await;
        self.events.drain(..resolved);
        resolved
    }
}

/// Everything one flush needs to deliver batches.
pub(crate) struct BatchSender<'a, T: ?Sized> {
    pub(crate) transport: &'a T,
    pub(crate) endpoint: &'a str,
    pub(crate) batch_size: usize,
    pub(crate) send_timeout: Duration,
    pub(crate) sink: &'a SinkSlot,
    pub(crate) stats: &'a StatsCounters,
}

impl<T> BatchSender<'_, T>
where
    T: Transport + ?Sized,
{
    /// Send `events` in consecutive chunks of `batch_size`.
    ///
    /// All chunks share one deadline of `send_timeout`. Sending stops at the
    /// first recoverable failure. Returns how many events from the front of
    /// `events` were resolved: delivered, dropped, or handed to the sink.
    pub(crate) async fn send(&self, events: &mut [QueuedEvent]) -> usize {
        let deadline = Instant::now() + self.send_timeout;
        let total = events.len();
        let mut resolved = 0;

        for chunk in events.chunks_mut(self.batch_size.max(1)) {
            match self.send_batch(chunk, deadline).await {
                Ok(n) => resolved += n,
                Err(e) => {
                    bump(&self.stats.recoverable_failures, 1);
                    warn!(
                        error = %e,
                        resolved = resolved,
                        pending = total - resolved,
                        "Batch send interrupted, keeping events for next flush"
                    );
                    break;
                }
            }
        }

        resolved
    }

    /// Send one chunk. `Err` means the failure is recoverable and the chunk
    /// stays queued.
    async fn send_batch(
        &self,
        chunk: &mut [QueuedEvent],
        deadline: Instant,
    ) -> Result<usize, ClientError> {
        let now = Instant::now();
        if now >= deadline {
            return Err(ClientError::Cancelled);
        }

        for queued in chunk.iter_mut() {
            queued.annotate_queue_time(now);
        }

        let payload = match encode_batch(chunk.iter().map(|q| &q.event)) {
            Ok(payload) => payload,
            Err(e) => {
                self.fail(chunk, e.into());
                return Ok(chunk.len());
            }
        };

        if payload.is_empty() {
            debug!(batch_size = chunk.len(), "Dropping batch with nothing to encode");
            bump(&self.stats.events_dropped, chunk.len());
            return Ok(chunk.len());
        }

        debug!(
            batch_size = chunk.len(),
            bytes = payload.len(),
            url = %self.endpoint,
            "Sending event batch"
        );

        let response = match timeout_at(deadline, self.transport.send(self.endpoint, payload)).await {
            Err(_) => return Err(ClientError::Cancelled),
            Ok(Err(e)) if e.is_recoverable() => return Err(e),
            Ok(Err(e)) => {
                self.fail(chunk, e);
                return Ok(chunk.len());
            }
            Ok(Ok(response)) => response,
        };

        if !response.is_success() {
            self.fail(
                chunk,
                ClientError::Status {
                    code: response.status,
                    message: response.body,
                },
            );
            return Ok(chunk.len());
        }

        bump(&self.stats.batches_sent, 1);
        bump(&self.stats.events_sent, chunk.len());
        debug!(batch_size = chunk.len(), "Event batch delivered");

        Ok(chunk.len())
    }

    /// Give up on a chunk and pass its events to the error sink.
    fn fail(&self, chunk: &mut [QueuedEvent], error: ClientError) {
        warn!(
            batch_size = chunk.len(),
            error = %error,
            "Batch delivery failed permanently"
        );

        bump(&self.stats.batches_failed, 1);
        bump(&self.stats.events_failed, chunk.len());

        let events = chunk
            .iter_mut()
            .map(|q| std::mem::take(&mut q.event))
            .collect();
        self.sink.deliver(events, &error);
    }
}

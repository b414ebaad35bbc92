//! Dispatcher module: event intake, the background worker and shutdown.
//!
//! A [`Dispatcher`] accepts events from any number of tasks through
//! [`Dispatcher::report`]. A single worker, driven by [`Dispatcher::start`],
//! owns the pending buffer and flushes it when it reaches the batch size,
//! when the batch wait interval elapses, and once more on shutdown.
//!
//! # Example
//!
//! ```no_run
//! use event_dispatcher::{Config, Dispatcher, Event};
//!
//! #[tokio::main]
//! async fn main() {
//!     let dispatcher = Dispatcher::from_config(Config::default()).expect("Failed to create dispatcher");
//!
//!     let worker = dispatcher.clone();
//!     let handle = tokio::spawn(async move { worker.start().await });
//!
//!     dispatcher
//!         .report(Event::from([("t", "pageview"), ("dp", "/home")]))
//!         .await
//!         .ok();
//!
//!     dispatcher.shutdown().await.ok();
//!     handle.await.ok();
//! }
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::buffer::{BatchSender, DispatcherStats, FlushTrigger, PendingBuffer, QueuedEvent, StatsCounters};
use crate::client::{ClientError, HttpTransport, Transport};
use crate::config::{Config, DEFAULT_BATCH_SIZE, DEFAULT_BATCH_WAIT, DEFAULT_ENDPOINT, DEFAULT_SEND_TIMEOUT};
use crate::event::Event;
use crate::sink::{ErrorSink, SinkSlot};

/// Capacity of the intake channel. One slot keeps `report` in step with
/// the worker.
const INTAKE_CAPACITY: usize = 1;

/// Errors returned by dispatcher lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The dispatcher has been shut down
    Closed,

    /// `start` was called while a worker is already running
    AlreadyStarted,

    /// The intake slot is occupied (for non-blocking reports)
    Full,

    /// `shutdown_within` gave up before every event was resolved
    ShutdownTimeout { remaining: usize },
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Closed => write!(f, "dispatcher closed"),
            DispatchError::AlreadyStarted => write!(f, "dispatcher already started"),
            DispatchError::Full => write!(f, "dispatcher intake is full"),
            DispatchError::ShutdownTimeout { remaining } => {
                write!(f, "shutdown timed out with {} events in flight", remaining)
            }
        }
    }
}

impl std::error::Error for DispatchError {}

/// Settings in effect once the dispatcher has started.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Settings {
    endpoint: String,
    batch_wait: Duration,
    send_timeout: Duration,
    batch_size: usize,
}

impl Settings {
    fn resolve(config: &Config, transport_timeout: Option<Duration>) -> Self {
        let non_zero = |d: &Duration| !d.is_zero();

        Self {
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            batch_wait: config
                .batch_wait
                .filter(non_zero)
                .unwrap_or(DEFAULT_BATCH_WAIT),
            send_timeout: config
                .send_timeout
                .filter(non_zero)
                .or(transport_timeout.filter(non_zero))
                .unwrap_or(DEFAULT_SEND_TIMEOUT),
            batch_size: if config.batch_size == 0 {
                DEFAULT_BATCH_SIZE
            } else {
                config.batch_size
            },
        }
    }
}

/// State shared between the dispatcher handles and the worker.
struct Shared<T> {
    config: Config,
    settings: OnceLock<Settings>,
    transport: T,
    intake: mpsc::Sender<QueuedEvent>,
    receiver: Mutex<Option<mpsc::Receiver<QueuedEvent>>>,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
    in_flight: AtomicUsize,
    in_shutdown: AtomicUsize,
    drained: Notify,
    sink: SinkSlot,
    stats: StatsCounters,
}

impl<T> Shared<T> {
    fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn take_receiver(&self) -> Option<mpsc::Receiver<QueuedEvent>> {
        match self.receiver.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn restore_receiver(&self, receiver: mpsc::Receiver<QueuedEvent>) {
        match self.receiver.lock() {
            Ok(mut slot) => *slot = Some(receiver),
            Err(poisoned) => *poisoned.into_inner() = Some(receiver),
        }
    }

    /// Mark `n` events as resolved.
    fn release(&self, n: usize) {
        if n == 0 {
            return;
        }

        let previous = self.in_flight.fetch_sub(n, Ordering::AcqRel);
        debug_assert!(previous >= n, "in-flight counter underflow");

        if previous == n {
            self.drained.notify_waiters();
        }
    }
}

/// Batching event dispatcher.
///
/// Cloning is cheap; all clones share one intake, one worker and one
/// shutdown signal.
pub struct Dispatcher<T = HttpTransport> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Dispatcher<HttpTransport> {
    /// Create a dispatcher posting over HTTP.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the HTTP client cannot be built.
    pub fn from_config(config: Config) -> Result<Self, ClientError> {
        let transport = HttpTransport::new(&config)?;
        Ok(Self::new(config, transport))
    }
}

impl<T: Transport> Dispatcher<T> {
    /// Create a dispatcher delivering through `transport`.
    ///
    /// Nothing is sent until [`Dispatcher::start`] runs.
    pub fn new(config: Config, transport: T) -> Self {
        let (intake, receiver) = mpsc::channel(INTAKE_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                config,
                settings: OnceLock::new(),
                transport,
                intake,
                receiver: Mutex::new(Some(receiver)),
                shutdown,
                running: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                in_shutdown: AtomicUsize::new(0),
                drained: Notify::new(),
                sink: SinkSlot::default(),
                stats: StatsCounters::default(),
            }),
        }
    }

    /// Submit an event.
    ///
    /// Waits until the worker has room for it. Fails with
    /// `DispatchError::Closed` once shutdown has begun, including while
    /// waiting. An accepted event counts as in flight right away, so a
    /// following [`Dispatcher::shutdown`] waits for its delivery even if the
    /// worker has not picked it up yet.
    pub async fn report(&self, event: Event) -> Result<(), DispatchError> {
        if self.shared.is_closed() {
            return Err(DispatchError::Closed);
        }

        let admission = Admission::enter(&*self.shared);
        // Shutdown may have fired between the check and the increment.
        if self.shared.is_closed() {
            return Err(DispatchError::Closed);
        }

        let mut shutdown = self.shared.shutdown.subscribe();
        let queued = QueuedEvent::new(event);

        let result = tokio::select! {
            biased;
            sent = self.shared.intake.send(queued) => sent.map_err(|_| DispatchError::Closed),
            _ = wait_for_shutdown(&mut shutdown) => Err(DispatchError::Closed),
        };

        if result.is_ok() {
            admission.commit();
        }
        result
    }

    /// Submit an event without waiting.
    ///
    /// Returns `DispatchError::Full` if the worker has not taken the previous
    /// event yet. Safe to call from inside an [`ErrorSink`].
    pub fn try_report(&self, event: Event) -> Result<(), DispatchError> {
        if self.shared.is_closed() {
            return Err(DispatchError::Closed);
        }

        let admission = Admission::enter(&*self.shared);
        if self.shared.is_closed() {
            return Err(DispatchError::Closed);
        }

        self.shared
            .intake
            .try_send(QueuedEvent::new(event))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DispatchError::Full,
                mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
            })?;

        admission.commit();
        Ok(())
    }

    /// Run the worker until shutdown.
    ///
    /// Returns `Err(DispatchError::Closed)` once the final flush is done, or
    /// `Err(DispatchError::AlreadyStarted)` if another call is running.
    pub async fn start(&self) -> Result<(), DispatchError> {
        let shared = &*self.shared;

        if shared
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DispatchError::AlreadyStarted);
        }

        let mut run = RunGuard {
            shared,
            receiver: shared.take_receiver(),
        };

        let Some(receiver) = run.receiver.as_mut() else {
            // A previous run already drained and closed the intake.
            return Err(DispatchError::Closed);
        };

        let settings = shared
            .settings
            .get_or_init(|| Settings::resolve(&shared.config, shared.transport.timeout()));

        info!(
            endpoint = %settings.endpoint,
            batch_size = settings.batch_size,
            batch_wait_ms = settings.batch_wait.as_millis() as u64,
            send_timeout_ms = settings.send_timeout.as_millis() as u64,
            "Dispatcher started"
        );

        let mut worker = Worker {
            shared,
            settings,
            buffer: PendingBuffer::with_capacity(settings.batch_size),
        };

        worker.run(receiver).await;

        // The intake is closed for good; later starts return `Closed`.
        run.receiver = None;

        let stats = shared.stats.snapshot();
        info!(
            events_sent = stats.events_sent,
            events_failed = stats.events_failed,
            batches_sent = stats.batches_sent,
            "Dispatcher stopped"
        );

        Err(DispatchError::Closed)
    }

    /// Shut down and wait until every reported event is resolved.
    ///
    /// Fires the shutdown signal, then blocks until the worker has done its
    /// final flush and nothing is in flight. Events accepted before any
    /// worker ran keep this waiting until [`Dispatcher::start`] delivers
    /// them; with nothing accepted and no worker it returns at once. Events
    /// whose sends keep timing
    /// out are retried until they go through, so this can wait indefinitely
    /// on an unreachable collector; use [`Dispatcher::shutdown_within`] to
    /// bound the wait. Idempotent and safe to call concurrently.
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        let _marker = ShutdownMarker::enter(&self.shared.in_shutdown);

        self.signal_shutdown();
        self.wait_drained().await;

        Ok(())
    }

    /// Like [`Dispatcher::shutdown`], but give up after `limit`.
    ///
    /// On timeout the worker keeps draining in the background and
    /// `DispatchError::ShutdownTimeout` reports how many events were still
    /// in flight.
    pub async fn shutdown_within(&self, limit: Duration) -> Result<(), DispatchError> {
        let _marker = ShutdownMarker::enter(&self.shared.in_shutdown);

        self.signal_shutdown();

        match tokio::time::timeout(limit, self.wait_drained()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                let remaining = self.in_flight();
                warn!(remaining = remaining, "Shutdown timed out before drain completed");
                Err(DispatchError::ShutdownTimeout { remaining })
            }
        }
    }

    fn signal_shutdown(&self) {
        let was_closed = self.shared.shutdown.send_replace(true);
        if !was_closed {
            info!(in_flight = self.in_flight(), "Shutdown requested");
        }
    }

    async fn wait_drained(&self) {
        loop {
            // Register before checking so a wakeup between the two is not lost.
            let notified = self.shared.drained.notified();
            if !self.is_sending() {
                return;
            }
            notified.await;
        }
    }

    /// Register the sink that receives undeliverable batches.
    ///
    /// Only the first registration takes effect. Returns whether this call
    /// installed its sink.
    pub fn register_error_sink(&self, sink: impl ErrorSink + 'static) -> bool {
        self.shared.sink.register(Arc::new(sink))
    }

    /// Number of accepted events that are not resolved yet, whether still
    /// in the intake or in the worker's buffer.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Check if the worker is running or events are still in flight.
    pub fn is_sending(&self) -> bool {
        self.in_flight() > 0 || self.shared.running.load(Ordering::Acquire)
    }

    /// Check if a shutdown call is currently waiting for the drain.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.in_shutdown.load(Ordering::Acquire) > 0
    }

    /// Check if shutdown has been requested.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Get current dispatcher statistics.
    pub fn stats(&self) -> DispatcherStats {
        self.shared.stats.snapshot()
    }

    /// Get the configuration the dispatcher was created with.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }
}

/// Resolves once the shutdown signal has fired.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // The sender lives as long as the dispatcher, so this only errs on teardown.
    let _ = shutdown.wait_for(|closed| *closed).await;
}

/// An event counted as in flight from the moment `report` takes it.
///
/// Dropped without [`Admission::commit`], the count is given back.
struct Admission<'a, T> {
    shared: &'a Shared<T>,
    committed: bool,
}

impl<'a, T> Admission<'a, T> {
    fn enter(shared: &'a Shared<T>) -> Self {
        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            shared,
            committed: false,
        }
    }

    /// The event reached the intake; the worker releases it from here on.
    fn commit(mut self) {
        self.committed = true;
    }
}

impl<T> Drop for Admission<'_, T> {
    fn drop(&mut self) {
        if !self.committed {
            self.shared.release(1);
        }
    }
}

/// Counts a shutdown call for as long as it is in progress.
struct ShutdownMarker<'a>(&'a AtomicUsize);

impl<'a> ShutdownMarker<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for ShutdownMarker<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Clears the running flag when `start` returns or is dropped.
///
/// If the run was cut short, the receiver goes back so a later `start` can
/// pick up where it left off.
struct RunGuard<'a, T> {
    shared: &'a Shared<T>,
    receiver: Option<mpsc::Receiver<QueuedEvent>>,
}

impl<T> Drop for RunGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            self.shared.restore_receiver(receiver);
        }
        self.shared.running.store(false, Ordering::Release);
        self.shared.drained.notify_waiters();
    }
}

/// The background worker. Sole owner of the pending buffer.
struct Worker<'a, T> {
    shared: &'a Shared<T>,
    settings: &'a Settings,
    buffer: PendingBuffer,
}

impl<T: Transport> Worker<'_, T> {
    async fn run(&mut self, receiver: &mut mpsc::Receiver<QueuedEvent>) {
        let mut ticker = interval(self.settings.batch_wait);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first immediate tick
        ticker.tick().await;

        let mut shutdown = self.shared.shutdown.subscribe();

        loop {
            tokio::select! {
                maybe_event = receiver.recv() => {
                    match maybe_event {
                        Some(queued) => {
                            self.accept(queued);

                            if self.buffer.len() >= self.settings.batch_size {
                                self.flush(FlushTrigger::Size).await;
                            }
                        }
                        // Every sender is gone; nothing more can arrive.
                        None => break,
                    }
                }

                _ = ticker.tick() => {
                    if !self.buffer.is_empty() {
                        self.flush(FlushTrigger::Timer).await;
                    }
                }

                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        self.drain(receiver).await;
    }

    /// Close the intake, take whatever is still queued and flush until the
    /// buffer is empty.
    async fn drain(&mut self, receiver: &mut mpsc::Receiver<QueuedEvent>) {
        receiver.close();
        while let Some(queued) = receiver.recv().await {
            self.accept(queued);
        }

        let mut attempts = 0u32;
        while !self.buffer.is_empty() {
            if attempts > 0 {
                warn!(
                    remaining = self.buffer.len(),
                    attempts = attempts,
                    retry_in_ms = self.settings.send_timeout.as_millis() as u64,
                    "Final flush incomplete, retrying"
                );
                tokio::time::sleep(self.settings.send_timeout).await;
            }

            self.flush(FlushTrigger::Shutdown).await;
            attempts += 1;
        }
    }

    fn accept(&mut self, queued: QueuedEvent) {
        self.shared.stats.record_received();
        self.buffer.push(queued);
    }

    async fn flush(&mut self, trigger: FlushTrigger) {
        let shared = self.shared;
        let settings = self.settings;

        debug!(
            trigger = %trigger,
            buffered = self.buffer.len(),
            "Flushing buffer"
        );
        shared.stats.record_flush(trigger);

        let sender = BatchSender {
            transport: &shared.transport,
            endpoint: &settings.endpoint,
            batch_size: settings.batch_size,
            send_timeout: settings.send_timeout,
            sink: &shared.sink,
            stats: &shared.stats,
        };

        let resolved = self.buffer.flush(&sender).await;
        shared.release(resolved);
    }
}

impl<T> Drop for Worker<'_, T> {
    fn drop(&mut self) {
        // Only reachable with events left if `start` was cancelled mid-run.
        let lost = self.buffer.len();
        if lost > 0 {
            warn!(lost = lost, "Worker stopped with undelivered events");
            self.shared.release(lost);
        }
    }
}

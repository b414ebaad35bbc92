//! Event Dispatcher - batches events from stdin and posts them to a collector
//!
//! Reads newline-delimited JSON objects from standard input, one event per
//! line, and hands them to a background dispatcher that posts them in
//! batches.
//!
//! ## Features
//!
//! - Size-based and time-based batch flushing
//! - Failed batches logged through an error sink
//! - Graceful shutdown on end of input or SIGINT
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `DISPATCHER_ENDPOINT`: Collector URL (default: https://www.google-analytics.com/batch)
//! - `DISPATCHER_BATCH_WAIT_SECS`: Seconds between timer flushes (default: 15)
//! - `DISPATCHER_SEND_TIMEOUT_SECS`: Deadline for one flush (default: request timeout, else 5)
//! - `DISPATCHER_REQUEST_TIMEOUT_SECS`: HTTP request timeout (default: none)
//! - `DISPATCHER_BATCH_SIZE`: Events per request (default: 20)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use event_dispatcher::{ClientError, Config, Dispatcher, Event};

/// How long to wait for the final flush before giving up
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting event dispatcher...");

    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                endpoint = config.endpoint.as_deref().unwrap_or("default"),
                batch_size = config.batch_size,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let dispatcher = match Dispatcher::from_config(config) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!(error = %e, "Failed to create HTTP transport");
            std::process::exit(1);
        }
    };

    dispatcher.register_error_sink(|events: Vec<Event>, err: &ClientError| {
        warn!(events = events.len(), error = %err, "Batch could not be delivered");
    });

    // Spawn the worker - handles batching and sending events
    let worker = dispatcher.clone();
    let worker_handle = tokio::spawn(async move { worker.start().await });

    info!("Event dispatcher running. Reading events from stdin, press Ctrl+C to stop.");
    tokio::select! {
        result = read_events(BufReader::new(tokio::io::stdin()), &dispatcher) => match result {
            Ok(reported) => info!(reported = reported, "Input closed, stopping..."),
            Err(e) => error!(error = %e, "Failed to read input, stopping..."),
        },
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("Shutdown signal received, stopping..."),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        },
    }

    // Graceful shutdown
    info!("Initiating graceful shutdown...");
    match dispatcher.shutdown_within(SHUTDOWN_TIMEOUT).await {
        Ok(()) => info!("All events resolved"),
        Err(e) => warn!(error = %e, "Shutdown incomplete"),
    }

    match tokio::time::timeout(Duration::from_secs(1), worker_handle).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(error = %e, "Worker task panicked during shutdown"),
        Err(_) => warn!("Worker still draining, exiting anyway"),
    }

    let stats = dispatcher.stats();
    info!(
        events_received = stats.events_received,
        events_sent = stats.events_sent,
        events_failed = stats.events_failed,
        events_dropped = stats.events_dropped,
        batches_sent = stats.batches_sent,
        batches_failed = stats.batches_failed,
        "Event dispatcher stopped"
    );
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();
}

/// Report every event read from `input` until end of input or until the
/// dispatcher closes.
///
/// Returns the number of events reported.
async fn read_events<R, T>(input: R, dispatcher: &Dispatcher<T>) -> std::io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    T: event_dispatcher::Transport,
{
    let mut lines = input.lines();
    let mut reported: u64 = 0;

    while let Some(line) = lines.next_line().await? {
        let event = match parse_event_line(&line) {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                warn!(error = %e, "Skipping malformed event line");
                continue;
            }
            None => continue,
        };

        if dispatcher.report(event).await.is_err() {
            // Dispatcher closed, stop reading
            break;
        }
        reported += 1;
    }

    Ok(reported)
}

/// Parse one input line. Blank lines yield `None`.
fn parse_event_line(line: &str) -> Option<Result<Event, serde_json::Error>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    Some(serde_json::from_str(line))
}

//! Event Dispatcher Library
//!
//! This library batches measurement events in the background and posts them
//! to an HTTP collector:
//!
//! - **event**: Key/value events and their form encoding
//! - **dispatcher**: Intake, the batching worker and graceful shutdown
//! - **client**: Pluggable transport with an HTTP implementation
//! - **sink**: Error sink for batches that could not be delivered
//! - **config**: Environment-based configuration
//!
//! # Example
//!
//! ```no_run
//! use event_dispatcher::{ClientError, Config, Dispatcher, Event};
//!
//! #[tokio::main]
//! async fn main() {
//!     // Load configuration from environment
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     let dispatcher = Dispatcher::from_config(config).expect("Failed to create dispatcher");
//!     dispatcher.register_error_sink(|events: Vec<Event>, err: &ClientError| {
//!         eprintln!("{} events lost: {}", events.len(), err);
//!     });
//!
//!     // Run the worker in the background
//!     let worker = dispatcher.clone();
//!     tokio::spawn(async move { worker.start().await });
//!
//!     let event = Event::new()
//!         .with("v", "1")
//!         .with("t", "event")
//!         .with("ec", "video")
//!         .with("ea", "play");
//!     dispatcher.report(event).await.ok();
//!
//!     // Flush whatever is left
//!     dispatcher.shutdown().await.ok();
//! }
//! ```

// Module declarations
mod buffer;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod event;
pub mod sink;

#[cfg(test)]
mod testing;

// Re-export commonly used types at crate root for convenience
pub use buffer::DispatcherStats;
pub use client::{ClientError, HttpTransport, Transport, TransportResponse};
pub use config::{Config, ConfigError};
pub use dispatcher::{DispatchError, Dispatcher};
pub use event::{encode_batch, EncodeError, Event};
pub use sink::ErrorSink;

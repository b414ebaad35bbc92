//! Error sink for batches the dispatcher gave up on.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::client::ClientError;
use crate::event::Event;

/// Receives the events of a batch that could not be delivered.
///
/// Called on the dispatcher's worker task, once per failed batch, with the
/// events in the order they were reported. Implementations should return
/// quickly. To retry, re-submit with
/// [`Dispatcher::try_report`](crate::Dispatcher::try_report) or from a
/// spawned task with [`Dispatcher::report`](crate::Dispatcher::report);
/// awaiting `report` inline would wait on the worker that is running the
/// sink.
///
/// Closures with the matching signature implement the trait:
///
/// ```
/// use event_dispatcher::{ClientError, ErrorSink, Event};
///
/// fn takes_sink(_sink: impl ErrorSink) {}
///
/// takes_sink(|events: Vec<Event>, err: &ClientError| {
///     eprintln!("dropped {} events: {}", events.len(), err);
/// });
/// ```
pub trait ErrorSink: Send + Sync {
    /// Handle the events that failed and the corresponding error.
    fn handle(&self, events: Vec<Event>, error: &ClientError);
}

impl<F> ErrorSink for F
where
    F: Fn(Vec<Event>, &ClientError) + Send + Sync,
{
    fn handle(&self, events: Vec<Event>, error: &ClientError) {
        self(events, error)
    }
}

/// Holder for the registered sink. The first registration wins.
#[derive(Default)]
pub(crate) struct SinkSlot {
    sink: Mutex<Option<Arc<dyn ErrorSink>>>,
}

impl SinkSlot {
    /// Register `sink` unless one is already set. Returns whether it was stored.
    pub(crate) fn register(&self, sink: Arc<dyn ErrorSink>) -> bool {
        let mut slot = match self.sink.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if slot.is_some() {
            return false;
        }

        *slot = Some(sink);
        true
    }

    /// Hand a failed batch to the registered sink, if any.
    ///
    /// The lock is released before the sink runs, so a sink may register or
    /// report without deadlocking.
    pub(crate) fn deliver(&self, events: Vec<Event>, error: &ClientError) {
        let sink = match self.sink.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        match sink {
            Some(sink) => sink.handle(events, error),
            None => debug!(
                events = events.len(),
                error = %error,
                "No error sink registered, discarding failed batch"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_first_registration_wins() {
        let slot = SinkSlot::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let first_clone = first.clone();
        assert!(slot.register(Arc::new(move |events: Vec<Event>, _: &ClientError| {
            first_clone.fetch_add(events.len(), Ordering::SeqCst);
        })));

        let second_clone = second.clone();
        assert!(!slot.register(Arc::new(move |events: Vec<Event>, _: &ClientError| {
            second_clone.fetch_add(events.len(), Ordering::SeqCst);
        })));

        slot.deliver(vec![Event::new(), Event::new()], &ClientError::Timeout);

        assert_eq!(first.load(Ordering::SeqCst), 2);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_deliver_without_sink_is_noop() {
        let slot = SinkSlot::default();
        slot.deliver(vec![Event::new()], &ClientError::Cancelled);
    }

    #[test]
    fn test_sink_receives_error() {
        let slot = SinkSlot::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        slot.register(Arc::new(move |events: Vec<Event>, err: &ClientError| {
            seen_clone
                .lock()
                .unwrap()
                .push((events, err.to_string()));
        }));

        slot.deliver(
            vec![Event::from([("foo", "baz")])],
            &ClientError::Config("broken".to_string()),
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0[0].get("foo"), Some("baz"));
        assert!(seen[0].1.contains("broken"));
    }
}

//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::client::{ClientError, Transport, TransportResponse};

/// Transport that records payloads and replays scripted outcomes.
///
/// Once the script runs out every send answers `200 OK`.
#[derive(Default)]
pub(crate) struct MockTransport {
    script: Mutex<VecDeque<Result<TransportResponse, ClientError>>>,
    requests: Mutex<Vec<(String, String)>>,
    delay: Mutex<Option<Duration>>,
    timeout: Option<Duration>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_responses<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = Result<TransportResponse, ClientError>>,
    {
        Self {
            script: Mutex::new(responses.into_iter().collect()),
            ..Self::default()
        }
    }

    pub(crate) fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Delay every send by `delay` before it is recorded.
    pub(crate) fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Payloads of every send that reached the transport.
    pub(crate) fn payloads(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub(crate) fn endpoints(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(endpoint, _)| endpoint.clone())
            .collect()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, endpoint: &str, payload: String) -> Result<TransportResponse, ClientError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.requests
            .lock()
            .unwrap()
            .push((endpoint.to_string(), payload));

        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(TransportResponse::ok()))
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Split a payload into event lines with any `qt` pair removed.
pub(crate) fn lines_without_queue_time(payload: &str) -> Vec<String> {
    payload
        .lines()
        .map(|line| {
            line.split('&')
                .filter(|pair| !pair.starts_with("qt="))
                .collect::<Vec<_>>()
                .join("&")
        })
        .collect()
}

/// Poll `condition` every few milliseconds until it holds or `limit` passes.
pub(crate) async fn wait_until<F>(limit: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

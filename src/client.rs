//! Transport module for delivering encoded batches to the collector.
//!
//! The dispatcher talks to the collector through the [`Transport`] trait, so
//! tests and embedders can swap the wire layer. [`HttpTransport`] is the
//! production implementation, a pooled reqwest client posting form encoded
//! payloads.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::config::Config;
use crate::event::EncodeError;

/// Content type of batch payloads.
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Idle connections kept per host.
const POOL_MAX_IDLE_PER_HOST: usize = 10;

/// How long an idle pooled connection is kept around.
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

/// Response of one outbound exchange.
///
/// A transport returns this for every exchange that reached the collector,
/// whatever the status code; classifying the status is up to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status returned by the collector
    pub status: StatusCode,

    /// Response body, used to describe rejected batches. Holds the read
    /// error instead when the body could not be read.
    pub body: String,
}

impl TransportResponse {
    /// Create a response with the given status and body.
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// A `200 OK` response with an empty body.
    pub fn ok() -> Self {
        Self::new(StatusCode::OK, "")
    }

    /// Check if the status is in the 2xx range.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// One outbound exchange: payload in, response or failure out.
///
/// Implementations must map deadline and cancellation failures to
/// [`ClientError::Timeout`] or [`ClientError::Cancelled`]; the dispatcher
/// keeps those events queued and retries them on the next flush. Every other
/// error is treated as permanent.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `payload` to `endpoint`.
    async fn send(&self, endpoint: &str, payload: String) -> Result<TransportResponse, ClientError>;

    /// The request timeout this transport enforces on its own, if any.
    ///
    /// Used as the dispatcher's send timeout when none is configured.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, endpoint: &str, payload: String) -> Result<TransportResponse, ClientError> {
        (**self).send(endpoint, payload).await
    }

    fn timeout(&self) -> Option<Duration> {
        (**self).timeout()
    }
}

/// Errors that can occur while delivering a batch.
#[derive(Debug)]
pub enum ClientError {
    /// HTTP request failed
    Request(reqwest::Error),

    /// Request timed out
    Timeout,

    /// Request was abandoned because the send deadline passed
    Cancelled,

    /// Collector answered with a non-success status code
    Status {
        code: StatusCode,
        message: String,
    },

    /// Batch could not be encoded
    Encode(EncodeError),

    /// Client configuration error
    Config(String),
}

impl ClientError {
    /// Check if the failure is transient.
    ///
    /// Only timeouts and cancellations are recoverable; the affected events
    /// stay queued for the next flush.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ClientError::Timeout | ClientError::Cancelled)
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Request(e) => write!(f, "HTTP request failed: {}", e),
            ClientError::Timeout => write!(f, "Request timed out"),
            ClientError::Cancelled => write!(f, "Request cancelled: send deadline exceeded"),
            ClientError::Status { code, message } => write!(
                f,
                "collector api error: code: {} message: {}",
                code.as_u16(),
                message
            ),
            ClientError::Encode(e) => write!(f, "Failed to encode batch: {}", e),
            ClientError::Config(e) => write!(f, "Client configuration error: {}", e),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Request(e) => Some(e),
            ClientError::Encode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Request(err)
        }
    }
}

impl From<EncodeError> for ClientError {
    fn from(err: EncodeError) -> Self {
        ClientError::Encode(err)
    }
}

/// HTTP transport posting batches to the collector.
///
/// The underlying reqwest client is reused across sends for connection
/// pooling.
///
/// # Example
///
/// ```no_run
/// use event_dispatcher::client::{HttpTransport, Transport};
/// use event_dispatcher::config::Config;
///
/// #[tokio::main]
/// async fn main() {
///     let transport = HttpTransport::new(&Config::default()).expect("Failed to create transport");
///
///     let response = transport
///         .send("http://localhost:8000/collect", "t=pageview&dp=%2F".to_string())
///         .await;
///     println!("{:?}", response.map(|r| r.status));
/// }
/// ```
pub struct HttpTransport {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    /// Request timeout duration, if one is enforced
    timeout: Option<Duration>,
}

impl HttpTransport {
    /// Create a new transport from the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, ClientError> {
        Self::with_timeout(config.request_timeout)
    }

    /// Create a new transport with an explicit request timeout.
    ///
    /// `None` leaves requests unbounded at the HTTP layer; the dispatcher's
    /// send deadline still applies.
    pub fn with_timeout(timeout: Option<Duration>) -> Result<Self, ClientError> {
        let mut builder = Client::builder()
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS));

        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let client = builder
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, endpoint: &str, payload: String) -> Result<TransportResponse, ClientError> {
        debug!(url = %endpoint, bytes = payload.len(), "Posting batch");

        let response = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body.trim_end_matches('\n').to_string(),
            Err(e) => {
                debug!(status = %status, error = %e, "Failed to read response body");
                format!("failed to read response body: {}", e)
            }
        };

        Ok(TransportResponse { status, body })
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_client_error_display() {
        let err = ClientError::Timeout;
        assert_eq!(format!("{}", err), "Request timed out");

        let err = ClientError::Status {
            code: StatusCode::INTERNAL_SERVER_ERROR,
            message: "bad".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "collector api error: code: 500 message: bad"
        );

        let err = ClientError::Encode(EncodeError::InvalidKey("a&b".to_string()));
        assert!(format!("{}", err).contains("a&b"));
    }

    #[test]
    fn test_recoverable_error_detection() {
        assert!(ClientError::Timeout.is_recoverable());
        assert!(ClientError::Cancelled.is_recoverable());

        assert!(!ClientError::Status {
            code: StatusCode::SERVICE_UNAVAILABLE,
            message: String::new(),
        }
        .is_recoverable());
        assert!(!ClientError::Encode(EncodeError::InvalidKey("=".to_string())).is_recoverable());
        assert!(!ClientError::Config("config error".to_string()).is_recoverable());
    }

    #[test]
    fn test_error_source() {
        use std::error::Error;

        let err = ClientError::from(EncodeError::InvalidKey("=".to_string()));
        assert!(err.source().is_some());
        assert!(ClientError::Timeout.source().is_none());
    }

    #[test]
    fn test_transport_response() {
        let response = TransportResponse::ok();
        assert!(response.is_success());

        let response = TransportResponse::new(StatusCode::NO_CONTENT, "");
        assert!(response.is_success());

        let response = TransportResponse::new(StatusCode::BAD_REQUEST, "nope");
        assert!(!response.is_success());
        assert_eq!(response.body, "nope");
    }

    #[test]
    fn test_transport_creation() {
        let config = Config {
            request_timeout: Some(Duration::from_secs(7)),
            ..Config::default()
        };
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(transport.timeout(), Some(Duration::from_secs(7)));

        let transport = HttpTransport::with_timeout(None).unwrap();
        assert_eq!(transport.timeout(), None);
    }

    #[tokio::test]
    async fn test_connection_refused_is_permanent() {
        let transport = HttpTransport::with_timeout(Some(Duration::from_secs(2))).unwrap();

        // Port 1 is reserved and nothing listens on it in test environments.
        let result = transport
            .send("http://127.0.0.1:1/collect", "t=pageview".to_string())
            .await;

        let err = result.expect_err("Connection should be refused");
        assert!(matches!(err, ClientError::Request(_)));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_unreadable_body_is_described() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.ends_with(b"t=pageview") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }

            // Promise 100 bytes, send 5, then hang up.
            socket
                .write_all(b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 100\r\n\r\nshort")
                .await
                .unwrap();
        });

        let transport = HttpTransport::with_timeout(Some(Duration::from_secs(2))).unwrap();
        let response = transport
            .send(&format!("http://{}/batch", addr), "t=pageview".to_string())
            .await
            .unwrap();
        server.await.unwrap();

        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.body.starts_with("failed to read response body"));

        let err = ClientError::Status {
            code: response.status,
            message: response.body,
        };
        assert!(err.to_string().contains("failed to read response body"));
    }
}

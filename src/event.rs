//! Event module: telemetry records and their wire encoding.
//!
//! An [`Event`] is a flat mapping of string keys to string values. It knows
//! how to serialize itself into the collector's form encoding, and
//! [`encode_batch`] joins several events into a single request payload.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use url::form_urlencoded;

/// Separator between events in a batch payload.
const EVENT_SEPARATOR: char = '\n';

/// Characters a key may not contain, since keys are written unescaped.
const RESERVED_KEY_CHARS: [char; 4] = ['=', '&', '\n', '\r'];

/// A single telemetry event.
///
/// Keys are unique and kept in ascending order, so the encoded payload is
/// reproducible regardless of the order values were set in. Pairs with an
/// empty key or an empty value are ignored when encoding.
///
/// # Example
///
/// ```
/// use event_dispatcher::event::Event;
///
/// let mut event = Event::new();
/// event.set("t", "pageview");
/// event.set("dp", "/home");
///
/// assert_eq!(event.encode().unwrap(), "dp=%2Fhome&t=pageview");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event {
    fields: BTreeMap<String, String>,
}

impl Event {
    /// Create an empty event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key value pair, replacing any previous value for `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Builder-style variant of [`Event::set`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Get the value stored for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Remove `key`, returning its value if it was present.
    pub fn del(&mut self, key: &str) -> Option<String> {
        self.fields.remove(key)
    }

    /// Number of stored pairs, including ones that will not be encoded.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if the event holds no pairs at all.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate over all pairs in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Pairs that end up on the wire: non-empty key and non-empty value.
    fn encodable_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.iter().filter(|(k, v)| !k.is_empty() && !v.is_empty())
    }

    /// Check if encoding this event produces any output.
    pub fn has_encodable_pairs(&self) -> bool {
        self.encodable_pairs().next().is_some()
    }

    /// Encode the event as `key=value` pairs joined by `&`.
    ///
    /// Keys are sorted ascending and written as is; values are form
    /// urlencoded. An event without encodable pairs yields an empty string.
    ///
    /// # Errors
    ///
    /// Returns `EncodeError::InvalidKey` if a key contains `=`, `&`, or a
    /// line break, which would corrupt the payload.
    pub fn encode(&self) -> Result<String, EncodeError> {
        let mut out = String::new();
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Append the encoded event to `out`.
    fn encode_into(&self, out: &mut String) -> Result<(), EncodeError> {
        let mut first = true;

        for (key, value) in self.encodable_pairs() {
            if key.contains(RESERVED_KEY_CHARS) {
                return Err(EncodeError::InvalidKey(key.to_string()));
            }

            if !first {
                out.push('&');
            }
            first = false;

            out.push_str(key);
            out.push('=');
            out.extend(form_urlencoded::byte_serialize(value.as_bytes()));
        }

        Ok(())
    }
}

impl<K, V> FromIterator<(K, V)> for Event
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for Event
where
    K: Into<String>,
    V: Into<String>,
{
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (key, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_char(' ')?;
            }
            write!(f, "{}={:?}", key, value)?;
        }
        Ok(())
    }
}

/// Encode a sequence of events into one batch payload.
///
/// Individual payloads are joined by a newline, in the order given. Events
/// that encode to nothing are skipped, so they never produce blank lines.
///
/// # Example
///
/// ```
/// use event_dispatcher::event::{encode_batch, Event};
///
/// let events = [
///     Event::from([("foo", "baz"), ("alpha", "beta")]),
///     Event::new(),
///     Event::from([("fooz", "&azz"), ("delta", "$amma")]),
/// ];
///
/// let payload = encode_batch(&events).unwrap();
/// assert_eq!(payload, "alpha=beta&foo=baz\ndelta=%24amma&fooz=%26azz");
/// ```
pub fn encode_batch<'a, I>(events: I) -> Result<String, EncodeError>
where
    I: IntoIterator<Item = &'a Event>,
{
    let mut out = String::new();

    for event in events {
        if !event.has_encodable_pairs() {
            continue;
        }
        if !out.is_empty() {
            out.push(EVENT_SEPARATOR);
        }
        event.encode_into(&mut out)?;
    }

    Ok(out)
}

/// Errors that can occur while encoding events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// A key contains a character that cannot appear unescaped on the wire
    InvalidKey(String),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeError::InvalidKey(key) => write!(f, "invalid event key {:?}", key),
        }
    }
}

impl std::error::Error for EncodeError {}

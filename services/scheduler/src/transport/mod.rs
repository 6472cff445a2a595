//! Call/event transport to the resource manager.
//!
//! A [`Transport`] sends single calls and opens the long-lived subscription
//! stream. Connection metadata needed between calls (the stream id) is kept
//! inside the transport so callers never see it.

mod http;
mod mock;
mod recordio;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use drover_proto::{Call, Event, ProtoError};
use futures_util::Stream;
use thiserror::Error;

pub use http::{HttpTransport, STREAM_ID_HEADER};
pub use mock::MockTransport;
pub use recordio::{encode_record, RecordIoDecoder};

/// Stream of decoded events from a subscription.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event, TransportError>> + Send>>;

/// Errors from the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{call} returned {status}: {body}")]
    UnexpectedStatus {
        call: &'static str,
        status: u16,
        body: String,
    },

    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error("malformed record: {0}")]
    Framing(String),

    #[error("subscription stream closed")]
    Closed,
}

impl TransportError {
    /// Returns true for a single undecodable event; the stream stays usable.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Proto(ProtoError::Decode(_)))
    }
}

/// Raw response to a call.
#[derive(Debug, Clone)]
pub struct CallResponse {
    pub status: u16,
    pub body: Bytes,
}

impl CallResponse {
    /// Fail unless the response carries the expected status code.
    pub fn expect(self, call: &'static str, expected: u16) -> Result<Self, TransportError> {
        if self.status == expected {
            return Ok(self);
        }
        Err(TransportError::UnexpectedStatus {
            call,
            status: self.status,
            body: String::from_utf8_lossy(&self.body).into_owned(),
        })
    }
}

/// Transport to the resource manager's scheduler endpoint.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a single call and return the raw response.
    async fn send(&self, call: &Call) -> Result<CallResponse, TransportError>;

    /// Send SUBSCRIBE and return the event stream it opens.
    async fn subscribe(&self, call: &Call) -> Result<EventStream, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expect_status() {
        let ok = CallResponse {
            status: 202,
            body: Bytes::new(),
        };
        assert!(ok.expect("KILL", 202).is_ok());

        let bad = CallResponse {
            status: 400,
            body: Bytes::from_static(b"bad request"),
        };
        let err = bad.expect("KILL", 202).unwrap_err();
        assert_eq!(err.to_string(), "KILL returned 400: bad request");
        assert!(!err.is_decode());
    }
}

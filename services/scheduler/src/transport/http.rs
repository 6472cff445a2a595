//! HTTP transport for the resource manager's scheduler API.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use drover_proto::{Call, CallKind, Event};
use futures_util::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tracing::{debug, error, info};

use super::recordio::RecordIoDecoder;
use super::{CallResponse, EventStream, Transport, TransportError};

/// Header carrying the subscription's stream id.
pub const STREAM_ID_HEADER: &str = "Mesos-Stream-Id";

const SCHEDULER_PATH: &str = "/api/v1/scheduler";

/// Transport over HTTP with JSON bodies and a RecordIO event stream.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    stream_id: RwLock<Option<String>>,
    call_timeout: Duration,
}

impl HttpTransport {
    /// Create a transport for the resource manager at `base_url`.
    pub fn new(base_url: &str) -> Result<Self, TransportError> {
        // No overall request timeout: the subscription response never ends.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), SCHEDULER_PATH),
            stream_id: RwLock::new(None),
            call_timeout: Duration::from_secs(30),
        })
    }

    /// Scheduler endpoint URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Stream id of the current subscription, if any.
    pub fn stream_id(&self) -> Option<String> {
        self.stream_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn request(&self, call: &Call) -> Result<reqwest::RequestBuilder, TransportError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .body(call.to_json()?);

        // SUBSCRIBE opens a new stream and must not name the old one.
        if !matches!(call.kind, CallKind::Subscribe { .. }) {
            if let Some(id) = self.stream_id() {
                request = request.header(STREAM_ID_HEADER, id);
            }
        }

        Ok(request)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, call: &Call) -> Result<CallResponse, TransportError> {
        debug!(call = call.name(), "Sending call");

        let response = self
            .request(call)?
            .timeout(self.call_timeout)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.bytes().await?;

        Ok(CallResponse { status, body })
    }

    async fn subscribe(&self, call: &Call) -> Result<EventStream, TransportError> {
        info!(endpoint = %self.endpoint, "Opening subscription");
        self.stream_id
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let response = self.request(call)?.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            error!(status, body = %body, "Subscription rejected");
            return Err(TransportError::UnexpectedStatus {
                call: call.name(),
                status,
                body,
            });
        }

        let stream_id = response
            .headers()
            .get(STREAM_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        debug!(stream_id = ?stream_id, "Subscription opened");
        *self.stream_id.write().unwrap_or_else(PoisonError::into_inner) = stream_id;

        Ok(decode_events(response.bytes_stream()))
    }
}

/// Turn a chunked byte stream into decoded events.
///
/// A single undecodable event is yielded as an error and decoding continues.
/// Framing and connection errors are yielded once and end the stream.
pub(crate) fn decode_events<S>(body: S) -> EventStream
where
    S: Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
{
    let state = (Box::pin(body), RecordIoDecoder::new(), false);

    Box::pin(futures_util::stream::unfold(
        state,
        |(mut body, mut decoder, done)| async move {
            if done {
                return None;
            }

            loop {
                match decoder.next_record() {
                    Ok(Some(record)) => {
                        let event = Event::from_json(&record).map_err(TransportError::from);
                        return Some((event, (body, decoder, false)));
                    }
                    Ok(None) => {}
                    Err(e) => return Some((Err(e), (body, decoder, true))),
                }

                match body.next().await {
                    Some(Ok(chunk)) => decoder.push(&chunk),
                    Some(Err(e)) => {
                        return Some((Err(TransportError::Http(e)), (body, decoder, true)))
                    }
                    None => return None,
                }
            }
        },
    ))
}

//! HTTP transport against a stub resource manager.

use bytes::{Bytes, BytesMut};
use drover_proto::{Call, Event, FrameworkId, FrameworkInfo, OfferId};
use drover_scheduler::transport::{encode_record, TransportError, STREAM_ID_HEADER};
use drover_scheduler::{HttpTransport, Transport};
use futures_util::StreamExt;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn record_body(records: &[Bytes]) -> Vec<u8> {
    let mut body = BytesMut::new();
    for record in records {
        body.extend_from_slice(record);
    }
    body.to_vec()
}

fn event_record(event: &Event) -> Bytes {
    encode_record(&event.to_json().unwrap())
}

fn framework_id() -> FrameworkId {
    FrameworkId::parse("F-wire-1").unwrap()
}

#[tokio::test]
async fn test_subscribe_streams_events_and_pins_stream_id() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/scheduler"))
        .and(body_partial_json(json!({"type": "SUBSCRIBE"})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(STREAM_ID_HEADER, "stream-42")
                .set_body_bytes(record_body(&[
                    event_record(&Event::subscribed(framework_id())),
                    event_record(&Event::Heartbeat),
                ])),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/v1/scheduler"))
        .and(header(STREAM_ID_HEADER, "stream-42"))
        .and(body_partial_json(json!({"type": "DECLINE"})))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let transport = HttpTransport::new(&server.uri()).unwrap();
    assert_eq!(transport.endpoint(), format!("{}/api/v1/scheduler", server.uri()));

    let mut events = transport
        .subscribe(&Call::subscribe(FrameworkInfo::default()))
        .await
        .unwrap();
    assert_eq!(transport.stream_id().as_deref(), Some("stream-42"));

    match events.next().await.unwrap().unwrap() {
        Event::Subscribed { subscribed } => assert_eq!(subscribed.framework_id, framework_id()),
        other => panic!("expected SUBSCRIBED, got {}", other.name()),
    }
    assert!(matches!(events.next().await.unwrap().unwrap(), Event::Heartbeat));
    assert!(events.next().await.is_none());

    let decline = Call::decline(
        Some(framework_id()),
        vec![OfferId::parse("O1").unwrap()],
        None,
    );
    let response = transport.send(&decline).await.unwrap();
    assert_eq!(response.status, 202);
    response.expect("DECLINE", 202).unwrap();
}

#[tokio::test]
async fn test_resubscribe_omits_previous_stream_id() {
    let server = MockServer::start().await;

    // A resource manager rejects a SUBSCRIBE that names an existing stream.
    Mock::given(method("POST"))
        .and(path("/api/v1/scheduler"))
        .and(header_exists(STREAM_ID_HEADER))
        .and(body_partial_json(json!({"type": "SUBSCRIBE"})))
        .respond_with(ResponseTemplate::new(400).set_body_string("stream id on subscribe"))
        .with_priority(1)
        .expect(0)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/v1/scheduler"))
        .and(body_partial_json(json!({"type": "SUBSCRIBE"})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(STREAM_ID_HEADER, "stream-7")
                .set_body_bytes(record_body(&[event_record(&Event::subscribed(
                    framework_id(),
                ))])),
        )
        .expect(2)
        .mount(&server)
        .await;

    let transport = HttpTransport::new(&server.uri()).unwrap();
    let subscribe = Call::subscribe(FrameworkInfo::default());

    transport.subscribe(&subscribe).await.unwrap();
    assert_eq!(transport.stream_id().as_deref(), Some("stream-7"));

    let mut events = transport.subscribe(&subscribe).await.unwrap();
    assert!(matches!(
        events.next().await.unwrap().unwrap(),
        Event::Subscribed { .. }
    ));
    assert_eq!(transport.stream_id().as_deref(), Some("stream-7"));

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    assert!(requests
        .iter()
        .all(|r| !r.headers.contains_key(STREAM_ID_HEADER)));
}

#[tokio::test]
async fn test_subscribe_rejected() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/scheduler"))
        .respond_with(ResponseTemplate::new(503).set_body_string("no leading master"))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(&server.uri()).unwrap();
    let result = transport
        .subscribe(&Call::subscribe(FrameworkInfo::default()))
        .await;

    match result {
        Err(TransportError::UnexpectedStatus { call, status, body }) => {
            assert_eq!(call, "SUBSCRIBE");
            assert_eq!(status, 503);
            assert_eq!(body, "no leading master");
        }
        Err(other) => panic!("expected UnexpectedStatus, got {other}"),
        Ok(_) => panic!("subscription should be rejected"),
    }
    assert!(transport.stream_id().is_none());
}

#[tokio::test]
async fn test_bad_record_is_skipped() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/scheduler"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(record_body(&[
            encode_record(br#"{"type": "OFFERS", "offers": 7}"#),
            event_record(&Event::rescind(OfferId::parse("O9").unwrap())),
        ])))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(&server.uri()).unwrap();
    let mut events = transport
        .subscribe(&Call::subscribe(FrameworkInfo::default()))
        .await
        .unwrap();

    let first = events.next().await.unwrap();
    assert!(matches!(&first, Err(e) if e.is_decode()));

    match events.next().await.unwrap().unwrap() {
        Event::Rescind { rescind } => assert_eq!(rescind.offer_id.as_str(), "O9"),
        other => panic!("expected RESCIND, got {}", other.name()),
    }
}

#[tokio::test]
async fn test_unexpected_status_on_call() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/scheduler"))
        .and(body_partial_json(json!({"type": "KILL"})))
        .respond_with(ResponseTemplate::new(400).set_body_string("unknown task"))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(&server.uri()).unwrap();
    let kill = Call::kill(
        Some(framework_id()),
        drover_proto::TaskId::parse("task-1").unwrap(),
        None,
    );

    let err = transport
        .send(&kill)
        .await
        .unwrap()
        .expect("KILL", 202)
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::UnexpectedStatus { status: 400, ref body, .. } if body == "unknown task"
    ));
}

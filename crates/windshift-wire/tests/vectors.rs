//! Wire-format stability vectors: the JSON shape of frames is a protocol
//! surface, so changes here are breaking.
use bytes::Bytes;
use windshift_wire::{ErrorCode, Frame, Message, FLAG_NONE};

#[test]
fn request_frames_have_stable_shapes() {
    let frame = Message::Subscribe {
        stream: "events".to_string(),
        consumer: "worker".to_string(),
    }
    .encode()
    .expect("encode");
    let value: serde_json::Value = serde_json::from_slice(&frame.payload).expect("json");
    assert_eq!(value["type"], "subscribe");
    assert_eq!(value["stream"], "events");
    assert_eq!(value["consumer"], "worker");

    let frame = Message::Reject {
        ids: vec![4],
        delay_ms: Some(1500),
        permanent: false,
    }
    .encode()
    .expect("encode");
    let value: serde_json::Value = serde_json::from_slice(&frame.payload).expect("json");
    assert_eq!(value["type"], "reject");
    assert_eq!(value["ids"][0], 4);
    assert_eq!(value["delay_ms"], 1500);
    assert_eq!(value["permanent"], false);
}

#[test]
fn golden_event_frame_decodes() {
    let json = br#"{
        "type": "event",
        "event": {
            "id": 12,
            "subject": "orders.created",
            "stream_sequence": 40,
            "delivery_attempt": 2,
            "published_at": "2024-03-01T10:30:00.000000001Z",
            "idempotency_key": "op-7",
            "data": {
                "type_url": "type.googleapis.com/orders.v1.OrderCreated",
                "payload": [1, 2, 3]
            }
        }
    }"#;
    let frame = Frame::new(FLAG_NONE, Bytes::copy_from_slice(json)).expect("frame");
    let message = Message::decode(frame).expect("decode");
    match message {
        Message::Event { event } => {
            assert_eq!(event.id, 12);
            assert_eq!(event.subject, "orders.created");
            assert_eq!(event.stream_sequence, 40);
            assert_eq!(event.delivery_attempt, 2);
            assert_eq!(event.idempotency_key.as_deref(), Some("op-7"));
            assert_eq!(event.data.payload, vec![1, 2, 3]);
        }
        other => panic!("expected Event, got {other:?}"),
    }
}

#[test]
fn error_codes_use_snake_case() {
    let frame = Message::Error {
        code: ErrorCode::FailedPrecondition,
        message: "already acknowledged".to_string(),
    }
    .encode()
    .expect("encode");
    let value: serde_json::Value = serde_json::from_slice(&frame.payload).expect("json");
    assert_eq!(value["code"], "failed_precondition");
}

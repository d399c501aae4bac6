// Unary request handlers: decode, invoke the event bus, map errors to wire
// codes. Each handler answers with exactly one frame.
use std::time::Duration;

use windshift_broker::{RetentionLimits, StorageKind, StreamConfig, StreamSource};
use windshift_events::{ConsumerSpec, Error, EventData, Events, PublishConfig, StreamPointer};
use windshift_wire::{self as wire, ErrorCode, Message};

use crate::config::ServiceConfig;

pub(crate) async fn handle_request(
    events: &Events,
    config: &ServiceConfig,
    request: Message,
) -> Message {
    match request {
        Message::EnsureStream {
            name,
            source,
            retention,
            storage,
            dedup_window_ms,
        } => {
            let stream_config = stream_config(name, source, retention, storage, dedup_window_ms);
            match events.ensure_stream(stream_config).await {
                Ok(last_sequence) => Message::StreamEnsured { last_sequence },
                Err(err) => error_message(&err),
            }
        }
        Message::EnsureConsumer {
            stream,
            name,
            subjects,
            timeout_ms,
            max_delivery_attempts,
            pointer,
        } => {
            let spec = ConsumerSpec {
                stream,
                name,
                subjects,
                timeout: timeout_ms.map(Duration::from_millis),
                max_delivery_attempts,
                pointer: pointer.map(stream_pointer),
            };
            match events.ensure_consumer(spec).await {
                Ok(consumer) => Message::ConsumerEnsured { id: consumer.id },
                Err(err) => error_message(&err),
            }
        }
        Message::PublishEvent {
            subject,
            data,
            timestamp,
            idempotency_key,
            expected_last_id,
        } => {
            let publish = events.publish(PublishConfig {
                subject,
                data: EventData {
                    type_url: data.type_url,
                    payload: data.payload.into(),
                },
                published_time: timestamp,
                idempotency_key,
                expected_last_sequence: expected_last_id,
                trace_parent: None,
                trace_state: None,
            });
            // The broker answer stands in for the caller deadline here.
            let deadline = Duration::from_millis(config.publish_timeout_ms);
            match tokio::time::timeout(deadline, publish).await {
                Ok(Ok(id)) => Message::EventPublished { id },
                Ok(Err(err)) => error_message(&err),
                Err(_) => error_message(&Error::PublishTimeout),
            }
        }
        other => Message::Error {
            code: ErrorCode::FailedPrecondition,
            message: format!("unexpected request frame: {other:?}"),
        },
    }
}

fn stream_config(
    name: String,
    source: wire::StreamSource,
    retention: wire::Retention,
    storage: wire::StorageKind,
    dedup_window_ms: Option<u64>,
) -> StreamConfig {
    let mut config = StreamConfig::new(
        name,
        match source {
            wire::StreamSource::Subjects { subjects } => StreamSource::Subjects(subjects),
            wire::StreamSource::Mirror { stream } => StreamSource::Mirror(stream),
            wire::StreamSource::Aggregate { streams } => StreamSource::Aggregate(streams),
        },
    );
    config.retention = RetentionLimits {
        max_age: retention.max_age_ms.map(Duration::from_millis),
        max_msgs: retention.max_msgs,
        max_bytes: retention.max_bytes,
        max_msgs_per_subject: retention.max_msgs_per_subject,
        max_msg_size: retention.max_msg_size.map(|size| size as usize),
    };
    config.storage = match storage {
        wire::StorageKind::Memory => StorageKind::Memory,
        wire::StorageKind::File => StorageKind::File,
    };
    if let Some(window) = dedup_window_ms {
        config.dedup_window = Duration::from_millis(window);
    }
    config
}

fn stream_pointer(pointer: wire::StreamPointer) -> StreamPointer {
    StreamPointer {
        sequence: pointer.sequence,
        time: pointer.time,
        first: pointer.first,
    }
}

pub(crate) fn error_message(err: &Error) -> Message {
    let code = if err.is_validation() {
        ErrorCode::InvalidArgument
    } else if err.is_not_found() {
        ErrorCode::NotFound
    } else if err.is_precondition() {
        ErrorCode::FailedPrecondition
    } else if matches!(err, Error::PublishTimeout) {
        ErrorCode::DeadlineExceeded
    } else {
        ErrorCode::Internal
    };
    Message::Error {
        code,
        message: err.to_string(),
    }
}

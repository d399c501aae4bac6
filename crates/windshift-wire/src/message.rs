// Typed messages exchanged between clients and the windshift service.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Frame, Result, FLAG_NONE};

/// Source a stream ingests messages from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamSource {
    /// Capture every message published to a matching subject.
    Subjects { subjects: Vec<String> },
    /// Copy of a single other stream.
    Mirror { stream: String },
    /// Combined copy of several other streams.
    Aggregate { streams: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Memory,
    File,
}

impl Default for StorageKind {
    fn default() -> Self {
        StorageKind::Memory
    }
}

/// Retention limits for a stream. Unset fields are unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retention {
    #[serde(default)]
    pub max_age_ms: Option<u64>,
    #[serde(default)]
    pub max_msgs: Option<u64>,
    #[serde(default)]
    pub max_bytes: Option<u64>,
    #[serde(default)]
    pub max_msgs_per_subject: Option<u64>,
    #[serde(default)]
    pub max_msg_size: Option<u32>,
}

/// Where a new consumer starts reading.
///
/// Multiple fields may be set; time wins over sequence, sequence over first,
/// and an empty pointer means new messages only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamPointer {
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub first: bool,
}

/// Payload wrapper: a type URL plus the encoded bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventData {
    pub type_url: String,
    pub payload: Vec<u8>,
}

/// A delivered event as it appears on the session stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    /// Identifier used for acks, rejects and pings.
    pub id: u64,
    pub subject: String,
    pub stream_sequence: u64,
    pub delivery_attempt: u64,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub data: EventData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    DeadlineExceeded,
    Canceled,
    Unavailable,
    Internal,
}

/// Every request and response exchanged on a windshift stream.
///
/// ```
/// use windshift_wire::Message;
///
/// let frame = Message::Ack { ids: vec![1, 2] }.encode().expect("encode");
/// let decoded = Message::decode(frame).expect("decode");
/// assert!(matches!(decoded, Message::Ack { .. }));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    // Requests.
    EnsureStream {
        name: String,
        source: StreamSource,
        #[serde(default)]
        retention: Retention,
        #[serde(default)]
        storage: StorageKind,
        #[serde(default)]
        dedup_window_ms: Option<u64>,
    },
    EnsureConsumer {
        stream: String,
        #[serde(default)]
        name: Option<String>,
        subjects: Vec<String>,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        max_delivery_attempts: u64,
        #[serde(default)]
        pointer: Option<StreamPointer>,
    },
    PublishEvent {
        subject: String,
        data: EventData,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default)]
        idempotency_key: Option<String>,
        #[serde(default)]
        expected_last_id: Option<u64>,
    },
    Subscribe {
        stream: String,
        consumer: String,
    },
    Ack {
        ids: Vec<u64>,
    },
    Reject {
        ids: Vec<u64>,
        #[serde(default)]
        delay_ms: Option<u64>,
        #[serde(default)]
        permanent: bool,
    },
    Ping {
        ids: Vec<u64>,
    },

    // Responses.
    StreamEnsured {
        last_sequence: u64,
    },
    ConsumerEnsured {
        id: String,
    },
    EventPublished {
        id: u64,
    },
    Subscribed {
        consumer: String,
        processing_deadline_ms: u64,
    },
    Event {
        event: EventFrame,
    },
    AckConfirmation {
        ids: Vec<u64>,
        invalid_ids: Vec<u64>,
    },
    RejectConfirmation {
        ids: Vec<u64>,
        invalid_ids: Vec<u64>,
    },
    PingConfirmation {
        ids: Vec<u64>,
        invalid_ids: Vec<u64>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl Message {
    pub fn encode(&self) -> Result<Frame> {
        let payload = serde_json::to_vec(self)?;
        Frame::new(FLAG_NONE, payload.into())
    }

    pub fn decode(frame: Frame) -> Result<Self> {
        Ok(serde_json::from_slice(&frame.payload)?)
    }
}

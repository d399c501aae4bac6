// Stream configuration, the in-memory log and the publish path.
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::Notify;

use crate::{BrokerError, Result};

/// Header keyed dedup identifier, shared with the publish surface.
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";

const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(120);

/// Message headers as stored on the log.
pub type HeaderMap = BTreeMap<String, String>;

/// Source a stream ingests messages from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSource {
    Subjects(Vec<String>),
    Mirror(String),
    Aggregate(Vec<String>),
}

impl StreamSource {
    /// Short name of the source type, for errors and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamSource::Subjects(_) => "subjects",
            StreamSource::Mirror(_) => "mirror",
            StreamSource::Aggregate(_) => "aggregate",
        }
    }

    pub(crate) fn source_streams(&self) -> &[String] {
        match self {
            StreamSource::Subjects(_) => &[],
            StreamSource::Mirror(stream) => std::slice::from_ref(stream),
            StreamSource::Aggregate(streams) => streams,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageKind {
    #[default]
    Memory,
    File,
}

/// Retention limits. Unset fields are unlimited.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionLimits {
    pub max_age: Option<Duration>,
    pub max_msgs: Option<u64>,
    pub max_bytes: Option<u64>,
    pub max_msgs_per_subject: Option<u64>,
    pub max_msg_size: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub name: String,
    pub source: StreamSource,
    pub retention: RetentionLimits,
    pub storage: StorageKind,
    pub dedup_window: Duration,
}

impl StreamConfig {
    pub fn new(name: impl Into<String>, source: StreamSource) -> Self {
        Self {
            name: name.into(),
            source,
            retention: RetentionLimits::default(),
            storage: StorageKind::default(),
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub config: StreamConfig,
    pub last_sequence: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub expected_last_subject_sequence: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,
    pub duplicate: bool,
}

/// Stream names are 1-255 characters from `[A-Za-z0-9_-]`.
pub fn validate_stream_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 255
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(BrokerError::InvalidStreamName(name.to_string()));
    }
    Ok(())
}

#[derive(Debug)]
pub(crate) struct StoredMessage {
    pub(crate) sequence: u64,
    pub(crate) subject: String,
    pub(crate) headers: HeaderMap,
    pub(crate) payload: Bytes,
    pub(crate) timestamp: SystemTime,
    stored_at: Instant,
}

#[derive(Debug)]
pub(crate) struct StreamLog {
    pub(crate) messages: BTreeMap<u64, Arc<StoredMessage>>,
    pub(crate) next_sequence: u64,
    bytes: usize,
    last_sequence_per_subject: HashMap<String, u64>,
    per_subject_counts: HashMap<String, u64>,
    dedup: HashMap<String, (u64, Instant)>,
}

impl StreamLog {
    fn new() -> Self {
        Self {
            messages: BTreeMap::new(),
            next_sequence: 1,
            bytes: 0,
            last_sequence_per_subject: HashMap::new(),
            per_subject_counts: HashMap::new(),
            dedup: HashMap::new(),
        }
    }

    pub(crate) fn first_sequence(&self) -> u64 {
        self.messages
            .keys()
            .next()
            .copied()
            .unwrap_or(self.next_sequence)
    }

    fn remove(&mut self, sequence: u64) {
        if let Some(message) = self.messages.remove(&sequence) {
            self.bytes = self.bytes.saturating_sub(message.payload.len());
            if let Some(count) = self.per_subject_counts.get_mut(&message.subject) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct StreamState {
    pub(crate) config: Mutex<StreamConfig>,
    pub(crate) log: Mutex<StreamLog>,
    pub(crate) consumers: Mutex<HashMap<String, Arc<crate::consumer::ConsumerState>>>,
    // Wakes pull consumers waiting for new messages.
    pub(crate) notify: Notify,
}

impl StreamState {
    pub(crate) fn new(config: StreamConfig) -> Self {
        Self {
            config: Mutex::new(config),
            log: Mutex::new(StreamLog::new()),
            consumers: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    pub(crate) fn info(&self) -> StreamInfo {
        let config = self.config.lock().expect("config lock").clone();
        let log = self.log.lock().expect("log lock");
        StreamInfo {
            config,
            last_sequence: log.next_sequence - 1,
        }
    }

    /// Append on the publish path: dedup window, optimistic concurrency and
    /// retention all apply.
    pub(crate) fn append(
        &self,
        subject: &str,
        headers: HeaderMap,
        payload: Bytes,
        options: &PublishOptions,
    ) -> Result<PublishAck> {
        let (name, retention, dedup_window) = {
            let config = self.config.lock().expect("config lock");
            (
                config.name.clone(),
                config.retention,
                config.dedup_window,
            )
        };
        let ack = {
            let mut log = self.log.lock().expect("log lock");

            // Drop dedup entries that have aged out of the window.
            log.dedup
                .retain(|_, entry| entry.1.elapsed() <= dedup_window);

            if let Some(msg_id) = headers.get(MSG_ID_HEADER) {
                if let Some(&(sequence, _)) = log.dedup.get(msg_id) {
                    return Ok(PublishAck {
                        stream: name,
                        sequence,
                        duplicate: true,
                    });
                }
            }

            if let Some(expected) = options.expected_last_subject_sequence {
                let current = log
                    .last_sequence_per_subject
                    .get(subject)
                    .copied()
                    .unwrap_or(0);
                if current != expected {
                    return Err(BrokerError::WrongLastSequence {
                        subject: subject.to_string(),
                        expected,
                        current,
                    });
                }
            }

            if let Some(limit) = retention.max_msg_size {
                if payload.len() > limit {
                    return Err(BrokerError::MessageTooLarge {
                        size: payload.len(),
                        limit,
                    });
                }
            }

            let msg_id = headers.get(MSG_ID_HEADER).cloned();
            let sequence = store(&mut log, subject, headers, payload, &retention);
            if let Some(msg_id) = msg_id {
                log.dedup.insert(msg_id, (sequence, Instant::now()));
            }
            PublishAck {
                stream: name,
                sequence,
                duplicate: false,
            }
        };
        metrics::counter!("windshift_broker_messages_stored_total").increment(1);
        self.notify.notify_waiters();
        Ok(ack)
    }

    /// Append a copy sourced from another stream. Dedup and optimistic checks
    /// do not apply to sourced messages.
    pub(crate) fn append_sourced(&self, subject: &str, headers: HeaderMap, payload: Bytes) {
        let retention = self.config.lock().expect("config lock").retention;
        {
            let mut log = self.log.lock().expect("log lock");
            store(&mut log, subject, headers, payload, &retention);
        }
        self.notify.notify_waiters();
    }
}

fn store(
    log: &mut StreamLog,
    subject: &str,
    headers: HeaderMap,
    payload: Bytes,
    retention: &RetentionLimits,
) -> u64 {
    let sequence = log.next_sequence;
    log.next_sequence += 1;
    log.bytes += payload.len();
    log.last_sequence_per_subject
        .insert(subject.to_string(), sequence);
    *log.per_subject_counts
        .entry(subject.to_string())
        .or_insert(0) += 1;
    log.messages.insert(
        sequence,
        Arc::new(StoredMessage {
            sequence,
            subject: subject.to_string(),
            headers,
            payload,
            timestamp: SystemTime::now(),
            stored_at: Instant::now(),
        }),
    );
    enforce_retention(log, subject, retention);
    sequence
}

fn enforce_retention(log: &mut StreamLog, subject: &str, retention: &RetentionLimits) {
    if let Some(max_age) = retention.max_age {
        loop {
            let Some((&sequence, message)) = log.messages.iter().next() else {
                break;
            };
            if message.stored_at.elapsed() <= max_age {
                break;
            }
            log.remove(sequence);
        }
    }
    if let Some(max_msgs) = retention.max_msgs {
        while log.messages.len() as u64 > max_msgs {
            let sequence = log.first_sequence();
            log.remove(sequence);
        }
    }
    if let Some(max_bytes) = retention.max_bytes {
        while log.bytes as u64 > max_bytes && !log.messages.is_empty() {
            let sequence = log.first_sequence();
            log.remove(sequence);
        }
    }
    if let Some(max_per_subject) = retention.max_msgs_per_subject {
        while log
            .per_subject_counts
            .get(subject)
            .copied()
            .unwrap_or(0)
            > max_per_subject
        {
            let oldest = log
                .messages
                .iter()
                .find(|(_, message)| message.subject == subject)
                .map(|(&sequence, _)| sequence);
            match oldest {
                Some(sequence) => log.remove(sequence),
                None => break,
            }
        }
    }
}

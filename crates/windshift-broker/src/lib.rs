// In-process subject-addressed log with per-consumer cursors, explicit acks,
// redelivery and a dedup window. Stands in for a durable JetStream-style
// broker so the event-bus core stays self-contained and testable.
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod subject;

mod consumer;
mod stream;

pub use consumer::{
    ConsumerConfig, ConsumerInfo, DeliverPolicy, PullSubscription, PulledMessage,
};
pub use stream::{
    validate_stream_name, HeaderMap, PublishAck, PublishOptions, RetentionLimits, StorageKind,
    StreamConfig, StreamInfo, StreamSource, MSG_ID_HEADER,
};

use stream::StreamState;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("stream not found: {0}")]
    StreamNotFound(String),
    #[error("consumer not found: {stream}/{consumer}")]
    ConsumerNotFound { stream: String, consumer: String },
    #[error("invalid stream name: {0:?}")]
    InvalidStreamName(String),
    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),
    #[error("stream source cannot change from {existing} to {requested}")]
    SourceTypeMismatch {
        existing: &'static str,
        requested: &'static str,
    },
    #[error("mirror and aggregate sources are immutable")]
    SourceImmutable,
    #[error("subjects overlap with stream {stream}: {subject}")]
    OverlappingSubjects { stream: String, subject: String },
    #[error("no stream matches subject {0}")]
    NoMatchingStream(String),
    #[error("consumer must filter at least one subject")]
    EmptyFilter,
    #[error("filter subject {filter} is not covered by stream {stream}")]
    FilterNotCovered { stream: String, filter: String },
    #[error("wrong last sequence for subject {subject}: expected {expected}, current {current}")]
    WrongLastSequence {
        subject: String,
        expected: u64,
        current: u64,
    },
    #[error("message size {size} exceeds limit {limit}")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("message is not awaiting acknowledgement")]
    NotPending,
    #[error("subscription closed")]
    SubscriptionClosed,
}

/// In-process broker holding every stream.
///
/// ```
/// use bytes::Bytes;
/// use windshift_broker::{Broker, HeaderMap, PublishOptions, StreamConfig, StreamSource};
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let broker = Broker::new();
///     broker
///         .create_stream(StreamConfig::new(
///             "orders",
///             StreamSource::Subjects(vec!["orders.>".to_string()]),
///         ))
///         .await
///         .expect("stream");
///     let ack = broker
///         .publish(
///             "orders.created",
///             HeaderMap::new(),
///             Bytes::from_static(b"{}"),
///             PublishOptions::default(),
///         )
///         .await
///         .expect("publish");
///     assert_eq!(ack.sequence, 1);
/// });
/// ```
#[derive(Debug, Default)]
pub struct Broker {
    streams: RwLock<HashMap<String, Arc<StreamState>>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_stream(&self, config: StreamConfig) -> Result<StreamInfo> {
        validate_stream_name(&config.name)?;
        self.validate_source(&config).await?;

        let mut streams = self.streams.write().await;
        self.check_overlap(&streams, &config)?;
        let state = Arc::new(StreamState::new(config.clone()));
        streams.insert(config.name.clone(), Arc::clone(&state));
        tracing::debug!(stream = %config.name, source = config.source.kind(), "created stream");
        Ok(state.info())
    }

    pub async fn update_stream(&self, config: StreamConfig) -> Result<StreamInfo> {
        validate_stream_name(&config.name)?;
        self.validate_source(&config).await?;

        let streams = self.streams.read().await;
        let state = streams
            .get(&config.name)
            .cloned()
            .ok_or_else(|| BrokerError::StreamNotFound(config.name.clone()))?;
        // Check overlap before taking this stream's config lock; only ever
        // one config lock is held at a time.
        if matches!(config.source, StreamSource::Subjects(_)) {
            self.check_overlap(&streams, &config)?;
        }
        {
            let mut current = state.config.lock().expect("config lock");
            if current.source.kind() != config.source.kind() {
                return Err(BrokerError::SourceTypeMismatch {
                    existing: current.source.kind(),
                    requested: config.source.kind(),
                });
            }
            match (&current.source, &config.source) {
                (StreamSource::Subjects(_), StreamSource::Subjects(_)) => {
                    current.source = config.source.clone();
                }
                (existing, requested) if existing != requested => {
                    return Err(BrokerError::SourceImmutable);
                }
                _ => {}
            }
            current.retention = config.retention;
            current.dedup_window = config.dedup_window;
        }
        tracing::debug!(stream = %config.name, "updated stream");
        Ok(state.info())
    }

    pub async fn stream_info(&self, name: &str) -> Result<StreamInfo> {
        let streams = self.streams.read().await;
        streams
            .get(name)
            .map(|state| state.info())
            .ok_or_else(|| BrokerError::StreamNotFound(name.to_string()))
    }

    /// Publish to the single stream whose subject set covers `subject`.
    /// Mirrors and aggregates of that stream receive copies.
    pub async fn publish(
        &self,
        subject: &str,
        headers: HeaderMap,
        payload: bytes::Bytes,
        options: PublishOptions,
    ) -> Result<PublishAck> {
        subject::validate_literal(subject)?;

        let streams = self.streams.read().await;
        let target = streams
            .values()
            .find(|state| {
                let config = state.config.lock().expect("config lock");
                match &config.source {
                    StreamSource::Subjects(subjects) => subjects
                        .iter()
                        .any(|pattern| subject::matches(pattern, subject)),
                    _ => false,
                }
            })
            .cloned()
            .ok_or_else(|| BrokerError::NoMatchingStream(subject.to_string()))?;

        let ack = target.append(subject, headers.clone(), payload.clone(), &options)?;
        if !ack.duplicate {
            // One-hop source propagation into mirrors and aggregates.
            for state in streams.values() {
                let sourced = {
                    let config = state.config.lock().expect("config lock");
                    config
                        .source
                        .source_streams()
                        .iter()
                        .any(|source| source == &ack.stream)
                };
                if sourced {
                    state.append_sourced(subject, headers.clone(), payload.clone());
                }
            }
        }
        Ok(ack)
    }

    /// Create a consumer, or merge mutable fields if one with the same name
    /// already exists.
    pub async fn add_consumer(&self, stream: &str, config: ConsumerConfig) -> Result<ConsumerInfo> {
        let state = self.get_stream(stream).await?;
        self.validate_filters(&state, &config)?;

        let mut consumers = state.consumers.lock().expect("consumers lock");
        if let Some(existing) = consumers.get(&config.name) {
            existing.update(&config);
            return Ok(existing.info());
        }
        let cursor = consumer::initial_cursor(&state, config.deliver_policy);
        let consumer = Arc::new(consumer::ConsumerState::new(config.clone(), cursor));
        consumers.insert(config.name.clone(), Arc::clone(&consumer));
        tracing::debug!(
            stream,
            consumer = %config.name,
            durable = config.durable,
            "created consumer"
        );
        Ok(consumer.info())
    }

    /// Merge mutable fields into an existing consumer. The start pointer and
    /// cursor are never touched.
    pub async fn update_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerInfo> {
        let state = self.get_stream(stream).await?;
        self.validate_filters(&state, &config)?;

        let consumers = state.consumers.lock().expect("consumers lock");
        let consumer = consumers
            .get(&config.name)
            .ok_or_else(|| BrokerError::ConsumerNotFound {
                stream: stream.to_string(),
                consumer: config.name.clone(),
            })?;
        consumer.update(&config);
        tracing::debug!(stream, consumer = %config.name, "updated consumer");
        Ok(consumer.info())
    }

    pub async fn consumer_info(&self, stream: &str, name: &str) -> Result<ConsumerInfo> {
        let state = self.get_stream(stream).await?;
        let consumers = state.consumers.lock().expect("consumers lock");
        consumers
            .get(name)
            .map(|consumer| consumer.info())
            .ok_or_else(|| BrokerError::ConsumerNotFound {
                stream: stream.to_string(),
                consumer: name.to_string(),
            })
    }

    pub async fn pull_subscribe(&self, stream: &str, consumer: &str) -> Result<PullSubscription> {
        let state = self.get_stream(stream).await?;
        let consumer_state = {
            let consumers = state.consumers.lock().expect("consumers lock");
            consumers
                .get(consumer)
                .cloned()
                .ok_or_else(|| BrokerError::ConsumerNotFound {
                    stream: stream.to_string(),
                    consumer: consumer.to_string(),
                })?
        };
        Ok(PullSubscription::new(state, consumer_state))
    }

    async fn get_stream(&self, name: &str) -> Result<Arc<StreamState>> {
        let streams = self.streams.read().await;
        streams
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::StreamNotFound(name.to_string()))
    }

    async fn validate_source(&self, config: &StreamConfig) -> Result<()> {
        match &config.source {
            StreamSource::Subjects(subjects) => {
                if subjects.is_empty() {
                    return Err(BrokerError::EmptyFilter);
                }
                for pattern in subjects {
                    subject::validate_pattern(pattern)?;
                }
            }
            source => {
                let names = source.source_streams();
                if names.is_empty() {
                    return Err(BrokerError::EmptyFilter);
                }
                let streams = self.streams.read().await;
                for name in names {
                    if name != &config.name && !streams.contains_key(name) {
                        return Err(BrokerError::StreamNotFound(name.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_overlap(
        &self,
        streams: &HashMap<String, Arc<StreamState>>,
        config: &StreamConfig,
    ) -> Result<()> {
        let StreamSource::Subjects(subjects) = &config.source else {
            return Ok(());
        };
        for (name, state) in streams {
            if name == &config.name {
                continue;
            }
            let other = state.config.lock().expect("config lock");
            let StreamSource::Subjects(existing) = &other.source else {
                continue;
            };
            for pattern in subjects {
                for other_pattern in existing {
                    if subject::overlaps(pattern, other_pattern) {
                        return Err(BrokerError::OverlappingSubjects {
                            stream: name.clone(),
                            subject: pattern.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_filters(
        &self,
        state: &StreamState,
        config: &ConsumerConfig,
    ) -> Result<()> {
        let filters = config.filters();
        if filters.is_empty() {
            return Err(BrokerError::EmptyFilter);
        }
        let stream_config = state.config.lock().expect("config lock");
        for filter in &filters {
            subject::validate_pattern(filter)?;
            if let StreamSource::Subjects(subjects) = &stream_config.source {
                let covered = subjects
                    .iter()
                    .any(|pattern| subject::covers(pattern, filter));
                if !covered {
                    return Err(BrokerError::FilterNotCovered {
                        stream: stream_config.name.clone(),
                        filter: filter.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn subjects(patterns: &[&str]) -> StreamSource {
        StreamSource::Subjects(patterns.iter().map(|s| s.to_string()).collect())
    }

    async fn broker_with_stream(name: &str, patterns: &[&str]) -> Broker {
        let broker = Broker::new();
        broker
            .create_stream(StreamConfig::new(name, subjects(patterns)))
            .await
            .expect("stream");
        broker
    }

    fn consumer_config(name: &str, filter: &str) -> ConsumerConfig {
        ConsumerConfig {
            name: name.to_string(),
            filter_subject: Some(filter.to_string()),
            deliver_policy: DeliverPolicy::All,
            ..ConsumerConfig::default()
        }
    }

    async fn publish(broker: &Broker, subject: &str, payload: &'static [u8]) -> PublishAck {
        broker
            .publish(
                subject,
                HeaderMap::new(),
                Bytes::from_static(payload),
                PublishOptions::default(),
            )
            .await
            .expect("publish")
    }

    #[tokio::test]
    async fn publish_assigns_monotonic_sequences() {
        let broker = broker_with_stream("orders", &["orders.>"]).await;
        assert_eq!(publish(&broker, "orders.created", b"a").await.sequence, 1);
        assert_eq!(publish(&broker, "orders.shipped", b"b").await.sequence, 2);
        let info = broker.stream_info("orders").await.expect("info");
        assert_eq!(info.last_sequence, 2);
    }

    #[tokio::test]
    async fn publish_requires_matching_stream() {
        let broker = broker_with_stream("orders", &["orders.>"]).await;
        let err = broker
            .publish(
                "billing.created",
                HeaderMap::new(),
                Bytes::from_static(b"a"),
                PublishOptions::default(),
            )
            .await
            .expect_err("no stream");
        assert!(matches!(err, BrokerError::NoMatchingStream(_)));
    }

    #[tokio::test]
    async fn duplicate_msg_id_returns_original_sequence() {
        let broker = broker_with_stream("orders", &["orders.>"]).await;
        let mut headers = HeaderMap::new();
        headers.insert(MSG_ID_HEADER.to_string(), "abc".to_string());
        let first = broker
            .publish(
                "orders.created",
                headers.clone(),
                Bytes::from_static(b"a"),
                PublishOptions::default(),
            )
            .await
            .expect("publish");
        let second = broker
            .publish(
                "orders.created",
                headers,
                Bytes::from_static(b"a"),
                PublishOptions::default(),
            )
            .await
            .expect("publish");
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.sequence, second.sequence);
        // Exactly one copy was stored.
        assert_eq!(
            broker.stream_info("orders").await.expect("info").last_sequence,
            first.sequence
        );
    }

    #[tokio::test]
    async fn expected_last_sequence_is_per_subject() {
        let broker = broker_with_stream("orders", &["orders.>"]).await;
        publish(&broker, "orders.created", b"a").await;
        publish(&broker, "orders.shipped", b"b").await;

        // Last sequence for orders.created is still 1.
        let ok = broker
            .publish(
                "orders.created",
                HeaderMap::new(),
                Bytes::from_static(b"c"),
                PublishOptions {
                    expected_last_subject_sequence: Some(1),
                },
            )
            .await
            .expect("publish");
        assert_eq!(ok.sequence, 3);

        let err = broker
            .publish(
                "orders.created",
                HeaderMap::new(),
                Bytes::from_static(b"d"),
                PublishOptions {
                    expected_last_subject_sequence: Some(1),
                },
            )
            .await
            .expect_err("stale expectation");
        assert!(matches!(
            err,
            BrokerError::WrongLastSequence {
                expected: 1,
                current: 3,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn overlapping_stream_subjects_are_rejected() {
        let broker = broker_with_stream("orders", &["orders.>"]).await;
        let err = broker
            .create_stream(StreamConfig::new("shadow", subjects(&["orders.created"])))
            .await
            .expect_err("overlap");
        assert!(matches!(err, BrokerError::OverlappingSubjects { .. }));
    }

    #[tokio::test]
    async fn fetch_delivers_matching_messages_in_order() {
        let broker = broker_with_stream("orders", &["orders.>"]).await;
        broker
            .add_consumer("orders", consumer_config("all", "orders.>"))
            .await
            .expect("consumer");
        publish(&broker, "orders.created", b"one").await;
        publish(&broker, "orders.shipped", b"two").await;

        let sub = broker.pull_subscribe("orders", "all").await.expect("sub");
        let batch = sub.fetch(10, Duration::from_secs(1)).await.expect("fetch");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].subject(), "orders.created");
        assert_eq!(batch[0].consumer_sequence(), 1);
        assert_eq!(batch[0].delivery_attempt(), 1);
        assert_eq!(batch[1].subject(), "orders.shipped");
        assert_eq!(batch[1].consumer_sequence(), 2);
    }

    #[tokio::test]
    async fn filters_limit_deliveries() {
        let broker = broker_with_stream("orders", &["orders.>"]).await;
        broker
            .add_consumer("orders", consumer_config("created", "orders.created"))
            .await
            .expect("consumer");
        publish(&broker, "orders.created", b"one").await;
        publish(&broker, "orders.shipped", b"two").await;

        let sub = broker
            .pull_subscribe("orders", "created")
            .await
            .expect("sub");
        let batch = sub.fetch(10, Duration::from_millis(50)).await.expect("fetch");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].subject(), "orders.created");
    }

    #[tokio::test]
    async fn nak_redelivers_with_incremented_attempt() {
        let broker = broker_with_stream("orders", &["orders.>"]).await;
        broker
            .add_consumer("orders", consumer_config("all", "orders.>"))
            .await
            .expect("consumer");
        publish(&broker, "orders.created", b"one").await;

        let sub = broker.pull_subscribe("orders", "all").await.expect("sub");
        let batch = sub.fetch(1, Duration::from_secs(1)).await.expect("fetch");
        batch[0].nak(None).await.expect("nak");

        let redelivered = sub.fetch(1, Duration::from_secs(1)).await.expect("fetch");
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].delivery_attempt(), 2);
        // Each delivery attempt carries a fresh consumer sequence.
        assert_eq!(redelivered[0].consumer_sequence(), 2);
        // The original delivery is no longer ackable.
        let err = batch[0].ack().await.expect_err("stale ack");
        assert!(matches!(err, BrokerError::NotPending));
    }

    #[tokio::test]
    async fn term_stops_redelivery() {
        let broker = broker_with_stream("orders", &["orders.>"]).await;
        broker
            .add_consumer("orders", consumer_config("all", "orders.>"))
            .await
            .expect("consumer");
        publish(&broker, "orders.created", b"one").await;

        let sub = broker.pull_subscribe("orders", "all").await.expect("sub");
        let batch = sub.fetch(1, Duration::from_secs(1)).await.expect("fetch");
        batch[0].term().await.expect("term");
        let empty = sub.fetch(1, Duration::from_millis(50)).await.expect("fetch");
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn ack_wait_expiry_redelivers() {
        let broker = broker_with_stream("orders", &["orders.>"]).await;
        broker
            .add_consumer(
                "orders",
                ConsumerConfig {
                    ack_wait: Duration::from_millis(100),
                    ..consumer_config("all", "orders.>")
                },
            )
            .await
            .expect("consumer");
        publish(&broker, "orders.created", b"one").await;

        let sub = broker.pull_subscribe("orders", "all").await.expect("sub");
        let batch = sub.fetch(1, Duration::from_secs(1)).await.expect("fetch");
        assert_eq!(batch[0].delivery_attempt(), 1);

        let redelivered = sub.fetch(1, Duration::from_secs(1)).await.expect("fetch");
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].delivery_attempt(), 2);
    }

    #[tokio::test]
    async fn in_progress_extends_the_deadline() {
        let broker = broker_with_stream("orders", &["orders.>"]).await;
        broker
            .add_consumer(
                "orders",
                ConsumerConfig {
                    ack_wait: Duration::from_millis(200),
                    ..consumer_config("all", "orders.>")
                },
            )
            .await
            .expect("consumer");
        publish(&broker, "orders.created", b"one").await;

        let sub = broker.pull_subscribe("orders", "all").await.expect("sub");
        let batch = sub.fetch(1, Duration::from_secs(1)).await.expect("fetch");
        tokio::time::sleep(Duration::from_millis(150)).await;
        batch[0].in_progress().await.expect("extend");
        tokio::time::sleep(Duration::from_millis(150)).await;
        // Total wait exceeds ack-wait, but the extension keeps the ack valid.
        batch[0].ack().await.expect("ack");
        let empty = sub.fetch(1, Duration::from_millis(50)).await.expect("fetch");
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn max_deliver_drops_exhausted_messages() {
        let broker = broker_with_stream("orders", &["orders.>"]).await;
        broker
            .add_consumer(
                "orders",
                ConsumerConfig {
                    max_deliver: 2,
                    ..consumer_config("all", "orders.>")
                },
            )
            .await
            .expect("consumer");
        publish(&broker, "orders.created", b"one").await;

        let sub = broker.pull_subscribe("orders", "all").await.expect("sub");
        for _ in 0..2 {
            let batch = sub.fetch(1, Duration::from_secs(1)).await.expect("fetch");
            assert_eq!(batch.len(), 1);
            batch[0].nak(None).await.expect("nak");
        }
        let empty = sub.fetch(1, Duration::from_millis(50)).await.expect("fetch");
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn deliver_policy_new_skips_existing_messages() {
        let broker = broker_with_stream("orders", &["orders.>"]).await;
        publish(&broker, "orders.created", b"old").await;
        broker
            .add_consumer(
                "orders",
                ConsumerConfig {
                    deliver_policy: DeliverPolicy::New,
                    ..consumer_config("new", "orders.>")
                },
            )
            .await
            .expect("consumer");

        let sub = broker.pull_subscribe("orders", "new").await.expect("sub");
        let empty = sub.fetch(1, Duration::from_millis(50)).await.expect("fetch");
        assert!(empty.is_empty());

        publish(&broker, "orders.created", b"fresh").await;
        let batch = sub.fetch(1, Duration::from_secs(1)).await.expect("fetch");
        assert_eq!(batch[0].payload().as_ref(), b"fresh");
    }

    #[tokio::test]
    async fn deliver_policy_by_start_sequence() {
        let broker = broker_with_stream("orders", &["orders.>"]).await;
        publish(&broker, "orders.created", b"one").await;
        publish(&broker, "orders.created", b"two").await;
        broker
            .add_consumer(
                "orders",
                ConsumerConfig {
                    deliver_policy: DeliverPolicy::ByStartSequence(2),
                    ..consumer_config("from-two", "orders.>")
                },
            )
            .await
            .expect("consumer");

        let sub = broker
            .pull_subscribe("orders", "from-two")
            .await
            .expect("sub");
        let batch = sub.fetch(10, Duration::from_secs(1)).await.expect("fetch");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].stream_sequence(), 2);
    }

    #[tokio::test]
    async fn update_consumer_preserves_cursor() {
        let broker = broker_with_stream("orders", &["orders.>"]).await;
        broker
            .add_consumer("orders", consumer_config("c", "orders.created"))
            .await
            .expect("consumer");
        publish(&broker, "orders.created", b"one").await;

        {
            let sub = broker.pull_subscribe("orders", "c").await.expect("sub");
            let batch = sub.fetch(1, Duration::from_secs(1)).await.expect("fetch");
            batch[0].ack().await.expect("ack");
        }

        // Reconfigure the filter; the cursor must not rewind.
        broker
            .update_consumer("orders", consumer_config("c", "orders.>"))
            .await
            .expect("update");
        publish(&broker, "orders.shipped", b"two").await;

        let sub = broker.pull_subscribe("orders", "c").await.expect("sub");
        let batch = sub.fetch(10, Duration::from_secs(1)).await.expect("fetch");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].subject(), "orders.shipped");
    }

    #[tokio::test]
    async fn filters_must_be_covered_by_the_stream() {
        let broker = broker_with_stream("orders", &["orders.>"]).await;
        let err = broker
            .add_consumer("orders", consumer_config("bad", "billing.>"))
            .await
            .expect_err("uncovered filter");
        assert!(matches!(err, BrokerError::FilterNotCovered { .. }));
    }

    #[tokio::test]
    async fn mirror_receives_copies() {
        let broker = broker_with_stream("orders", &["orders.>"]).await;
        broker
            .create_stream(StreamConfig::new(
                "orders-mirror",
                StreamSource::Mirror("orders".to_string()),
            ))
            .await
            .expect("mirror");
        publish(&broker, "orders.created", b"one").await;
        let info = broker.stream_info("orders-mirror").await.expect("info");
        assert_eq!(info.last_sequence, 1);
    }

    #[tokio::test]
    async fn retention_caps_messages() {
        let broker = Broker::new();
        broker
            .create_stream(StreamConfig {
                retention: RetentionLimits {
                    max_msgs: Some(2),
                    ..RetentionLimits::default()
                },
                ..StreamConfig::new("orders", subjects(&["orders.>"]))
            })
            .await
            .expect("stream");
        broker
            .add_consumer("orders", consumer_config("all", "orders.>"))
            .await
            .expect("consumer");
        for payload in [b"one" as &[u8], b"two", b"three"] {
            broker
                .publish(
                    "orders.created",
                    HeaderMap::new(),
                    Bytes::copy_from_slice(payload),
                    PublishOptions::default(),
                )
                .await
                .expect("publish");
        }

        let sub = broker.pull_subscribe("orders", "all").await.expect("sub");
        let batch = sub.fetch(10, Duration::from_secs(1)).await.expect("fetch");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].stream_sequence(), 2);
        assert_eq!(batch[1].stream_sequence(), 3);
    }

    #[tokio::test]
    async fn unsubscribe_releases_in_flight_deliveries() {
        let broker = broker_with_stream("orders", &["orders.>"]).await;
        broker
            .add_consumer("orders", consumer_config("all", "orders.>"))
            .await
            .expect("consumer");
        publish(&broker, "orders.created", b"one").await;

        let sub = broker.pull_subscribe("orders", "all").await.expect("sub");
        let batch = sub.fetch(1, Duration::from_secs(1)).await.expect("fetch");
        assert_eq!(batch.len(), 1);
        drop(batch);
        drop(sub);

        // A new session sees the message again without waiting for ack-wait.
        let sub = broker.pull_subscribe("orders", "all").await.expect("sub");
        let batch = sub.fetch(1, Duration::from_secs(1)).await.expect("fetch");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].delivery_attempt(), 2);
    }

    #[tokio::test]
    async fn source_type_changes_are_rejected() {
        let broker = broker_with_stream("orders", &["orders.>"]).await;
        broker
            .create_stream(StreamConfig::new("billing", subjects(&["billing.>"])))
            .await
            .expect("stream");
        let err = broker
            .update_stream(StreamConfig::new(
                "orders",
                StreamSource::Mirror("billing".to_string()),
            ))
            .await
            .expect_err("source change");
        assert!(matches!(err, BrokerError::SourceTypeMismatch { .. }));
    }
}

// Consumer reconciliation: ephemeral vs durable, filter selection and start
// pointer resolution.
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use windshift_broker::{
    subject, validate_stream_name, BrokerError, ConsumerConfig, DeliverPolicy,
};

use crate::{Error, Events, Result};

const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);
const EPHEMERAL_INACTIVITY: Duration = Duration::from_secs(60 * 60);
const DURABLE_INACTIVITY: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Where a new consumer starts reading. Ignored on updates.
///
/// Several fields may be set at once; time wins over sequence, sequence over
/// first, and an empty pointer reads new messages only.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamPointer {
    pub sequence: u64,
    pub time: Option<DateTime<Utc>>,
    pub first: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ConsumerSpec {
    pub stream: String,
    /// `None` creates an ephemeral consumer with a generated id.
    pub name: Option<String>,
    pub subjects: Vec<String>,
    /// Processing deadline before redelivery; defaults to 30 seconds.
    pub timeout: Option<Duration>,
    /// 0 means unlimited attempts.
    pub max_delivery_attempts: u64,
    pub pointer: Option<StreamPointer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consumer {
    pub id: String,
}

impl Events {
    /// Reconcile a consumer. Ephemeral consumers get a generated id and a
    /// one-hour inactivity TTL; durable consumers keep their cursor and start
    /// pointer across updates and live for thirty days of inactivity.
    pub async fn ensure_consumer(&self, spec: ConsumerSpec) -> Result<Consumer> {
        if spec.stream.is_empty() {
            return Err(Error::Validation("stream must be specified".to_string()));
        }
        validate_stream_name(&spec.stream)?;
        if let Some(name) = &spec.name {
            if name.is_empty() {
                return Err(Error::Validation(
                    "consumer name must not be empty".to_string(),
                ));
            }
        }
        if spec.subjects.is_empty() {
            return Err(Error::Validation(
                "at least one subject must be specified".to_string(),
            ));
        }
        for pattern in &spec.subjects {
            subject::validate_pattern(pattern)?;
        }

        match spec.name.clone() {
            None => {
                let id = Uuid::new_v4().to_string();
                tracing::info!(stream = %spec.stream, consumer = %id, "creating ephemeral consumer");
                let config = consumer_settings(&spec, id.clone(), false);
                self.broker.add_consumer(&spec.stream, config).await?;
                Ok(Consumer { id })
            }
            Some(name) => match self.broker.consumer_info(&spec.stream, &name).await {
                Err(BrokerError::ConsumerNotFound { .. }) => {
                    tracing::info!(stream = %spec.stream, consumer = %name, "creating durable consumer");
                    let config = consumer_settings(&spec, name.clone(), true);
                    self.broker.add_consumer(&spec.stream, config).await?;
                    Ok(Consumer { id: name })
                }
                Ok(_) => {
                    // The start pointer may only be set on create; updates
                    // merge the mutable fields and keep the cursor.
                    tracing::info!(stream = %spec.stream, consumer = %name, "updating durable consumer");
                    let config = consumer_settings(&spec, name.clone(), true);
                    self.broker.update_consumer(&spec.stream, config).await?;
                    Ok(Consumer { id: name })
                }
                Err(err) => Err(err.into()),
            },
        }
    }
}

fn consumer_settings(spec: &ConsumerSpec, name: String, durable: bool) -> ConsumerConfig {
    let mut config = ConsumerConfig {
        name,
        durable,
        ack_wait: spec.timeout.unwrap_or(DEFAULT_ACK_WAIT),
        max_deliver: spec.max_delivery_attempts,
        deliver_policy: deliver_policy(spec.pointer.as_ref()),
        inactive_threshold: if durable {
            DURABLE_INACTIVITY
        } else {
            EPHEMERAL_INACTIVITY
        },
        ..ConsumerConfig::default()
    };
    // A single subject uses the single-filter field; several subjects use the
    // multi-filter field and leave the single one empty.
    if spec.subjects.len() == 1 {
        config.filter_subject = Some(spec.subjects[0].clone());
    } else {
        config.filter_subjects = spec.subjects.clone();
    }
    config
}

fn deliver_policy(pointer: Option<&StreamPointer>) -> DeliverPolicy {
    let Some(pointer) = pointer else {
        return DeliverPolicy::New;
    };
    // Time beats sequence beats first.
    if let Some(time) = pointer.time {
        DeliverPolicy::ByStartTime(SystemTime::from(time))
    } else if pointer.sequence > 0 {
        DeliverPolicy::ByStartSequence(pointer.sequence)
    } else if pointer.first {
        DeliverPolicy::All
    } else {
        DeliverPolicy::New
    }
}

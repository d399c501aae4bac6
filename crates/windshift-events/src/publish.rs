// The publish path: header projection, idempotency and optimistic
// concurrency. Publishing never retries; the broker's answer is final.
use chrono::{DateTime, SecondsFormat, Utc};

use windshift_broker::{HeaderMap, PublishOptions, MSG_ID_HEADER};
use windshift_wire::headers::{
    DATA_TYPE, PUBLISHED_TIME, TRACE_PARENT, TRACE_STATE, TYPE_URL_PREFIX,
};

use crate::event::EventData;
use crate::{Error, Events, Result};

#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub subject: String,
    pub data: EventData,
    /// Producer timestamp; the current time when unset.
    pub published_time: Option<DateTime<Utc>>,
    /// Duplicates within the stream's dedup window collapse to one message.
    pub idempotency_key: Option<String>,
    /// Optimistic concurrency: the publish succeeds only when this matches
    /// the stream's last sequence for exactly this subject.
    pub expected_last_sequence: Option<u64>,
    /// W3C trace context to carry on the message.
    pub trace_parent: Option<String>,
    pub trace_state: Option<String>,
}

impl Events {
    /// Publish one event and return its assigned stream sequence.
    pub async fn publish(&self, config: PublishConfig) -> Result<u64> {
        if config.data.type_url.is_empty() {
            return Err(Error::Validation("event data must be specified".to_string()));
        }
        windshift_broker::subject::validate_literal(&config.subject)?;

        let mut headers = HeaderMap::new();
        let published = config.published_time.unwrap_or_else(Utc::now);
        headers.insert(
            PUBLISHED_TIME.to_string(),
            published.to_rfc3339_opts(SecondsFormat::Nanos, true),
        );
        let data_type = config
            .data
            .type_url
            .strip_prefix(TYPE_URL_PREFIX)
            .unwrap_or(&config.data.type_url);
        headers.insert(DATA_TYPE.to_string(), data_type.to_string());
        if let Some(key) = &config.idempotency_key {
            headers.insert(MSG_ID_HEADER.to_string(), key.clone());
        }
        if let Some(parent) = &config.trace_parent {
            headers.insert(TRACE_PARENT.to_string(), parent.clone());
        }
        if let Some(state) = &config.trace_state {
            headers.insert(TRACE_STATE.to_string(), state.clone());
        }

        let options = PublishOptions {
            expected_last_subject_sequence: config.expected_last_sequence,
        };
        let ack = self
            .broker
            .publish(&config.subject, headers, config.data.payload, options)
            .await?;

        tracing::debug!(
            subject = %config.subject,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            "published event"
        );
        metrics::counter!("windshift_events_published_total").increment(1);
        Ok(ack.sequence)
    }
}

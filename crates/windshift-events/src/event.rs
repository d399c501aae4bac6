// Event model: hydration from broker messages and acknowledgement operations.
use bytes::Bytes;
use chrono::{DateTime, Utc};

use windshift_broker::{PulledMessage, MSG_ID_HEADER};
use windshift_wire::headers::{DATA_TYPE, PUBLISHED_TIME, TRACE_PARENT, TRACE_STATE, TYPE_URL_PREFIX};

use crate::flowcontrol::{FlowControl, ProcessCallback, ProcessType};
use crate::{Error, Result};

/// Metadata extracted from a delivered message's headers.
#[derive(Debug, Clone, PartialEq)]
pub struct EventHeaders {
    /// Producer-stamped publication time; falls back to the broker's storage
    /// timestamp when the header is missing or unparseable.
    pub published_at: DateTime<Utc>,
    pub idempotency_key: Option<String>,
    pub trace_parent: Option<String>,
    pub trace_state: Option<String>,
}

/// Payload wrapper carrying the fully-qualified type URL and the raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventData {
    pub type_url: String,
    pub payload: Bytes,
}

/// A single delivery handed to a subscriber.
///
/// Must be terminally processed exactly once with [`Event::ack`],
/// [`Event::reject`], [`Event::reject_with_delay`] or
/// [`Event::reject_permanently`]; otherwise the broker redelivers after the
/// consumer's ack-wait. [`Event::ping`] extends the deadline.
pub struct Event {
    message: PulledMessage,
    on_process: ProcessCallback,
    // Receive span; lives until the event reaches a terminal outcome.
    span: tracing::Span,

    pub subject: String,
    pub consumer_sequence: u64,
    pub stream_sequence: u64,
    pub delivery_attempt: u64,
    pub headers: EventHeaders,
    pub data: EventData,
}

impl Event {
    /// Build an event from a pulled message, registering it with the flow
    /// controller. A missing payload type marks the message as poisoned and
    /// hands it back so the pump can terminate it.
    pub(crate) fn hydrate(
        message: PulledMessage,
        flow: &FlowControl,
    ) -> std::result::Result<Event, (PulledMessage, Error)> {
        let data_type = message
            .headers()
            .get(DATA_TYPE)
            .filter(|value| !value.is_empty())
            .cloned();
        let Some(data_type) = data_type else {
            return Err((
                message,
                Error::Validation("message is missing its payload type".to_string()),
            ));
        };

        let published_at = message
            .headers()
            .get(PUBLISHED_TIME)
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
            .unwrap_or_else(|| DateTime::<Utc>::from(message.published()));
        let idempotency_key = message.headers().get(MSG_ID_HEADER).cloned();
        let trace_parent = message.headers().get(TRACE_PARENT).cloned();
        let trace_state = message.headers().get(TRACE_STATE).cloned();

        let span = tracing::info_span!(
            "event.receive",
            subject = %message.subject(),
            stream_sequence = message.stream_sequence(),
            delivery_attempt = message.delivery_attempt(),
            trace_parent = trace_parent.as_deref().unwrap_or_default(),
            trace_state = trace_state.as_deref().unwrap_or_default(),
        );

        let on_process = flow.received(message.consumer_sequence());
        Ok(Event {
            subject: message.subject().to_string(),
            consumer_sequence: message.consumer_sequence(),
            stream_sequence: message.stream_sequence(),
            delivery_attempt: message.delivery_attempt(),
            headers: EventHeaders {
                published_at,
                idempotency_key,
                trace_parent,
                trace_state,
            },
            data: EventData {
                type_url: format!("{TYPE_URL_PREFIX}{data_type}"),
                payload: message.payload().clone(),
            },
            message,
            on_process,
            span,
        })
    }

    /// Acknowledge; the broker will not redeliver.
    pub async fn ack(&self) -> Result<()> {
        self.span
            .in_scope(|| tracing::debug!(stream_sequence = self.stream_sequence, "acknowledging event"));
        self.message.ack().await?;
        self.on_process.process(ProcessType::Ack);
        Ok(())
    }

    /// Reject for immediate redelivery.
    pub async fn reject(&self) -> Result<()> {
        self.span
            .in_scope(|| tracing::debug!(stream_sequence = self.stream_sequence, "rejecting event"));
        self.message.nak(None).await?;
        self.on_process.process(ProcessType::Reject);
        Ok(())
    }

    /// Reject; the broker redelivers after `delay`.
    pub async fn reject_with_delay(&self, delay: std::time::Duration) -> Result<()> {
        self.span.in_scope(|| {
            tracing::debug!(
                stream_sequence = self.stream_sequence,
                delay_ms = delay.as_millis() as u64,
                "rejecting event with delay"
            )
        });
        self.message.nak(Some(delay)).await?;
        self.on_process.process(ProcessType::Reject);
        Ok(())
    }

    /// Reject permanently; the broker will never redeliver.
    pub async fn reject_permanently(&self) -> Result<()> {
        self.span.in_scope(|| {
            tracing::debug!(stream_sequence = self.stream_sequence, "permanently rejecting event")
        });
        self.message.term().await?;
        self.on_process.process(ProcessType::PermanentReject);
        Ok(())
    }

    /// Extend the processing deadline.
    pub async fn ping(&self) -> Result<()> {
        self.span
            .in_scope(|| tracing::debug!(stream_sequence = self.stream_sequence, "pinging event"));
        self.message.in_progress().await?;
        self.on_process.process(ProcessType::Ping);
        Ok(())
    }

    /// Record that the processing deadline passed without a terminal outcome.
    /// The broker redelivers on its own; this only releases the flow slot.
    pub fn expire(&self) {
        self.span
            .in_scope(|| tracing::debug!(stream_sequence = self.stream_sequence, "event expired"));
        self.on_process.process(ProcessType::Expire);
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("subject", &self.subject)
            .field("consumer_sequence", &self.consumer_sequence)
            .field("stream_sequence", &self.stream_sequence)
            .field("delivery_attempt", &self.delivery_attempt)
            .field("type_url", &self.data.type_url)
            .finish()
    }
}

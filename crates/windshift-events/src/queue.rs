// Subscription queues: a pull loop sized by the flow controller feeds events
// into a capacity-one channel, so backpressure from the subscriber reaches
// the broker directly.
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use windshift_broker::{BrokerError, PullSubscription};

use crate::event::Event;
use crate::flowcontrol::FlowControl;
use crate::{Error, Events, Result};

pub const DEFAULT_MAX_PENDING_EVENTS: usize = 50;

// Bounds shutdown latency; the broker's pull API returns empty on expiry.
const FETCH_EXPIRES: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub stream: String,
    pub consumer: String,
    /// Cap on in-flight deliveries; 0 selects the default of 50.
    pub max_pending_events: usize,
}

/// A flow-controlled stream of events for one consumer.
#[derive(Debug)]
pub struct Queue {
    events: mpsc::Receiver<Event>,
    cancel: watch::Sender<bool>,
    /// The consumer's ack-wait: how long a delivery may be processed before
    /// the broker redelivers it.
    pub processing_deadline: Duration,
}

impl Queue {
    /// Next event, or `None` once the queue has shut down.
    pub async fn next(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    pub fn close(&self) {
        let _ = self.cancel.send(true);
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

impl Events {
    /// Open a queue for an existing consumer.
    pub async fn subscribe(&self, config: QueueConfig) -> Result<Queue> {
        if config.stream.is_empty() {
            return Err(Error::Validation("stream must be specified".to_string()));
        }
        if config.consumer.is_empty() {
            return Err(Error::Validation("consumer must be specified".to_string()));
        }
        let max_pending = if config.max_pending_events == 0 {
            DEFAULT_MAX_PENDING_EVENTS
        } else {
            config.max_pending_events
        };

        let info = self
            .broker
            .consumer_info(&config.stream, &config.consumer)
            .await?;
        let subscription = self
            .broker
            .pull_subscribe(&config.stream, &config.consumer)
            .await?;
        let ack_wait = info.config.ack_wait;

        tracing::debug!(stream = %config.stream, consumer = %config.consumer, "created queue");

        let (event_tx, event_rx) = mpsc::channel(1);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        tokio::spawn(pump(subscription, event_tx, cancel_rx, ack_wait, max_pending));

        Ok(Queue {
            events: event_rx,
            cancel: cancel_tx,
            processing_deadline: ack_wait,
        })
    }
}

async fn pump(
    subscription: PullSubscription,
    events: mpsc::Sender<Event>,
    mut cancel: watch::Receiver<bool>,
    ack_wait: Duration,
    max_pending: usize,
) {
    let flow = FlowControl::new(ack_wait, max_pending);
    loop {
        if *cancel.borrow() {
            break;
        }

        let batch_size = tokio::select! {
            size = flow.batch_size() => size,
            _ = cancel.changed() => break,
        };

        let batch = tokio::select! {
            result = subscription.fetch(batch_size, FETCH_EXPIRES) => match result {
                Ok(batch) => batch,
                Err(BrokerError::SubscriptionClosed) => break,
                Err(err) => {
                    tracing::error!(error = %err, "failed to fetch messages");
                    continue;
                }
            },
            _ = cancel.changed() => break,
        };

        for message in batch {
            if message.delivered_at().elapsed() >= ack_wait {
                // Spent its whole deadline buffered; the broker redelivers.
                tracing::debug!(
                    stream_sequence = message.stream_sequence(),
                    "dropping locally expired delivery"
                );
                continue;
            }

            let event = match Event::hydrate(message, &flow) {
                Ok(event) => event,
                Err((message, err)) => {
                    // Poisoned envelope: terminate so it cannot wedge the
                    // consumer through endless redelivery.
                    tracing::error!(
                        error = %err,
                        subject = message.subject(),
                        stream_sequence = message.stream_sequence(),
                        "failed to hydrate event, terminating message"
                    );
                    if let Err(term_err) = message.term().await {
                        tracing::warn!(error = %term_err, "failed to terminate message");
                    }
                    continue;
                }
            };
            metrics::counter!("windshift_events_delivered_total").increment(1);

            tokio::select! {
                sent = events.send(event) => {
                    if sent.is_err() {
                        // Subscriber went away.
                        subscription.unsubscribe();
                        return;
                    }
                }
                _ = cancel.changed() => {
                    subscription.unsubscribe();
                    return;
                }
            }
        }
    }
    subscription.unsubscribe();
}

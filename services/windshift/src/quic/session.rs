//! Bidirectional session dispatcher: one client stream bound to one consumer.
//!
//! ## High-level flow
//! The first frame on the stream was a `Subscribe`; this module owns the
//! stream from then on. Three cooperating tasks make up a session:
//! - the inbound handler (this task) applying `Ack`/`Reject`/`Ping` frames
//!   against the in-flight registry,
//! - the event forwarder, which drains the delivery queue, registers each
//!   event in-flight and sweeps expired deadlines,
//! - the outbound writer, a single task draining one queue so frames stay
//!   strictly FIFO: confirmations can never overtake the events that were
//!   handed to the writer before them.
//!
//! ## Id validity
//! An id is valid exactly while it sits in the in-flight registry. Re-acking,
//! re-rejecting or pinging a removed id lands in `invalid_ids`; it never
//! errors the stream, and a batch of N ids always produces one confirmation
//! whose partitions sum to N. When the deadline sweeper and a control frame
//! race for the same id, whoever removes the registry entry first wins and
//! the loser becomes a no-op.
use anyhow::Result;
use bytes::BytesMut;
use quinn::{RecvStream, SendStream};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

use windshift_events::{Event, Events, Queue, QueueConfig};
use windshift_wire::{ErrorCode, EventData, EventFrame, Message};

use super::codec::{read_message_limited, write_message};
use crate::config::ServiceConfig;

// Outbound queue depth; the writer drains strictly in order.
const OUTBOUND_DEPTH: usize = 64;

struct InFlight {
    event: Arc<Event>,
    deadline: Instant,
}

type Registry = Arc<Mutex<HashMap<u64, InFlight>>>;

pub(crate) async fn run(
    events: &Events,
    config: &ServiceConfig,
    mut send: SendStream,
    mut recv: RecvStream,
    stream: String,
    consumer: String,
) -> Result<()> {
    // AwaitingSubscribe -> Active: validate the stream and consumer by
    // binding the delivery queue.
    let queue = match events
        .subscribe(QueueConfig {
            stream: stream.clone(),
            consumer: consumer.clone(),
            max_pending_events: config.max_pending_events,
        })
        .await
    {
        Ok(queue) => queue,
        Err(err) => {
            write_message(&mut send, &super::handlers::error_message(&err)).await?;
            let _ = send.finish();
            return Ok(());
        }
    };
    let ack_wait = queue.processing_deadline;
    tracing::debug!(stream = %stream, consumer = %consumer, "session subscribed");
    metrics::counter!("windshift_sessions_total").increment(1);

    let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
    let (out_tx, out_rx) = mpsc::channel::<Message>(OUTBOUND_DEPTH);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let writer = tokio::spawn(write_outbound(send, out_rx));

    let _ = out_tx
        .send(Message::Subscribed {
            consumer: consumer.clone(),
            processing_deadline_ms: ack_wait.as_millis() as u64,
        })
        .await;

    let forwarder = tokio::spawn(forward_events(
        queue,
        Arc::clone(&registry),
        out_tx.clone(),
        cancel_rx,
        ack_wait,
    ));

    // Active: handle inbound control frames until the client half-closes.
    let mut scratch = BytesMut::with_capacity(4 * 1024);
    loop {
        match read_message_limited(&mut recv, config.max_frame_bytes, &mut scratch).await {
            Ok(Some(Message::Ack { ids })) => {
                let (ids, invalid_ids) = ack_batch(&registry, &ids).await;
                if out_tx
                    .send(Message::AckConfirmation { ids, invalid_ids })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(Some(Message::Reject {
                ids,
                delay_ms,
                permanent,
            })) => {
                let delay = delay_ms.map(Duration::from_millis);
                let (ids, invalid_ids) = reject_batch(&registry, &ids, delay, permanent).await;
                if out_tx
                    .send(Message::RejectConfirmation { ids, invalid_ids })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(Some(Message::Ping { ids })) => {
                let (ids, invalid_ids) = ping_batch(&registry, &ids, ack_wait).await;
                if out_tx
                    .send(Message::PingConfirmation { ids, invalid_ids })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(Some(other)) => {
                tracing::debug!(?other, "unexpected frame on active session");
                if out_tx
                    .send(Message::Error {
                        code: ErrorCode::FailedPrecondition,
                        message: "unexpected frame on event session".to_string(),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            // Client half-closed: stop inbound and drain queued outbound.
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(error = %err, "session inbound failed");
                break;
            }
        }
    }

    // Draining -> Closed: stop the forwarder, let the writer flush whatever
    // is already queued, then drop the registry without further broker calls.
    let _ = cancel_tx.send(true);
    let _ = forwarder.await;
    drop(out_tx);
    let _ = writer.await;
    registry.lock().expect("registry lock").clear();
    tracing::debug!(stream = %stream, consumer = %consumer, "session closed");
    Ok(())
}

async fn write_outbound(mut send: SendStream, mut out_rx: mpsc::Receiver<Message>) {
    while let Some(message) = out_rx.recv().await {
        if let Err(err) = write_message(&mut send, &message).await {
            tracing::debug!(error = %err, "session write failed");
            break;
        }
    }
    let _ = send.finish();
}

async fn forward_events(
    mut queue: Queue,
    registry: Registry,
    out_tx: mpsc::Sender<Message>,
    mut cancel: watch::Receiver<bool>,
    ack_wait: Duration,
) {
    let mut sweep = tokio::time::interval(sweep_interval(ack_wait));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            next = queue.next() => {
                let Some(event) = next else { break };
                let frame = event_frame(&event);
                // Register before the frame can reach the client, so an ack
                // for a delivered event always finds its entry.
                {
                    let mut registry = registry.lock().expect("registry lock");
                    registry.insert(
                        event.consumer_sequence,
                        InFlight {
                            event: Arc::new(event),
                            deadline: Instant::now() + ack_wait,
                        },
                    );
                }
                metrics::counter!("windshift_session_events_total").increment(1);
                if out_tx.send(Message::Event { event: frame }).await.is_err() {
                    break;
                }
            }
            _ = sweep.tick() => sweep_expired(&registry),
            _ = cancel.changed() => break,
        }
    }
    queue.close();
}

fn sweep_interval(ack_wait: Duration) -> Duration {
    (ack_wait / 4).clamp(Duration::from_millis(50), Duration::from_secs(5))
}

// Remove entries past their deadline and release their flow slots. The
// broker redelivers on its own once ack-wait passes.
fn sweep_expired(registry: &Registry) {
    let now = Instant::now();
    let expired: Vec<Arc<Event>> = {
        let mut registry = registry.lock().expect("registry lock");
        let ids: Vec<u64> = registry
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(&id, _)| id)
            .collect();
        ids.iter()
            .filter_map(|id| registry.remove(id))
            .map(|entry| entry.event)
            .collect()
    };
    for event in expired {
        event.expire();
    }
}

async fn ack_batch(registry: &Registry, ids: &[u64]) -> (Vec<u64>, Vec<u64>) {
    let mut valid = Vec::new();
    let mut invalid = Vec::new();
    for &id in ids {
        let entry = registry.lock().expect("registry lock").remove(&id);
        match entry {
            Some(entry) => match entry.event.ack().await {
                Ok(()) => valid.push(id),
                Err(err) => {
                    tracing::debug!(id, error = %err, "broker ack failed");
                    invalid.push(id);
                }
            },
            None => invalid.push(id),
        }
    }
    (valid, invalid)
}

async fn reject_batch(
    registry: &Registry,
    ids: &[u64],
    delay: Option<Duration>,
    permanent: bool,
) -> (Vec<u64>, Vec<u64>) {
    let mut valid = Vec::new();
    let mut invalid = Vec::new();
    for &id in ids {
        let entry = registry.lock().expect("registry lock").remove(&id);
        match entry {
            Some(entry) => {
                let result = if permanent {
                    entry.event.reject_permanently().await
                } else if let Some(delay) = delay {
                    entry.event.reject_with_delay(delay).await
                } else {
                    entry.event.reject().await
                };
                match result {
                    Ok(()) => valid.push(id),
                    Err(err) => {
                        tracing::debug!(id, error = %err, "broker reject failed");
                        invalid.push(id);
                    }
                }
            }
            None => invalid.push(id),
        }
    }
    (valid, invalid)
}

async fn ping_batch(registry: &Registry, ids: &[u64], ack_wait: Duration) -> (Vec<u64>, Vec<u64>) {
    let mut valid = Vec::new();
    let mut invalid = Vec::new();
    for &id in ids {
        let event = {
            let registry = registry.lock().expect("registry lock");
            registry.get(&id).map(|entry| Arc::clone(&entry.event))
        };
        match event {
            Some(event) => match event.ping().await {
                Ok(()) => {
                    // Pinged deliveries stay in flight with a fresh deadline.
                    let mut registry = registry.lock().expect("registry lock");
                    if let Some(entry) = registry.get_mut(&id) {
                        entry.deadline = Instant::now() + ack_wait;
                    }
                    valid.push(id);
                }
                Err(err) => {
                    // The broker no longer knows this delivery; drop it here
                    // as well.
                    tracing::debug!(id, error = %err, "broker ping failed");
                    registry.lock().expect("registry lock").remove(&id);
                    invalid.push(id);
                }
            },
            None => invalid.push(id),
        }
    }
    (valid, invalid)
}

fn event_frame(event: &Event) -> EventFrame {
    EventFrame {
        id: event.consumer_sequence,
        subject: event.subject.clone(),
        stream_sequence: event.stream_sequence,
        delivery_attempt: event.delivery_attempt,
        published_at: event.headers.published_at,
        idempotency_key: event.headers.idempotency_key.clone(),
        data: EventData {
            type_url: event.data.type_url.clone(),
            payload: event.data.payload.to_vec(),
        },
    }
}

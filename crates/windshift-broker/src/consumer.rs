// Consumer cursors, pull subscriptions and per-message acknowledgement.
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::Notify;

use crate::stream::{HeaderMap, StoredMessage, StreamState};
use crate::{subject, BrokerError, Result};

pub(crate) const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Where a newly created consumer starts reading. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverPolicy {
    All,
    New,
    ByStartSequence(u64),
    ByStartTime(SystemTime),
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub name: String,
    pub durable: bool,
    /// Redelivery timeout for an unacknowledged delivery.
    pub ack_wait: Duration,
    /// Maximum delivery attempts; 0 means unlimited.
    pub max_deliver: u64,
    pub filter_subject: Option<String>,
    pub filter_subjects: Vec<String>,
    pub deliver_policy: DeliverPolicy,
    pub inactive_threshold: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            durable: false,
            ack_wait: DEFAULT_ACK_WAIT,
            max_deliver: 0,
            filter_subject: None,
            filter_subjects: Vec::new(),
            deliver_policy: DeliverPolicy::New,
            inactive_threshold: Duration::from_secs(60 * 60),
        }
    }
}

impl ConsumerConfig {
    /// Effective filter set; the single-subject field wins when present.
    pub fn filters(&self) -> Vec<String> {
        match &self.filter_subject {
            Some(filter) => vec![filter.clone()],
            None => self.filter_subjects.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerInfo {
    pub config: ConsumerConfig,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    /// Waiting for (re)delivery once `at` has passed.
    Available { at: Instant },
    /// Delivered and awaiting acknowledgement.
    InFlight {
        consumer_sequence: u64,
        deadline: Instant,
    },
}

#[derive(Debug)]
struct Pending {
    deliveries: u64,
    phase: Phase,
}

#[derive(Debug)]
struct DeliveryState {
    /// Next stream sequence to examine for fresh messages.
    cursor: u64,
    /// Per-consumer delivery counter; each delivery attempt gets a fresh one.
    next_consumer_sequence: u64,
    /// Keyed by stream sequence.
    pending: HashMap<u64, Pending>,
}

#[derive(Debug)]
pub(crate) struct ConsumerState {
    pub(crate) config: Mutex<ConsumerConfig>,
    delivery: Mutex<DeliveryState>,
    // Wakes fetchers when a nak or unsubscribe makes work deliverable.
    notify: Notify,
}

impl ConsumerState {
    pub(crate) fn new(config: ConsumerConfig, initial_cursor: u64) -> Self {
        Self {
            config: Mutex::new(config),
            delivery: Mutex::new(DeliveryState {
                cursor: initial_cursor,
                next_consumer_sequence: 1,
                pending: HashMap::new(),
            }),
            notify: Notify::new(),
        }
    }

    pub(crate) fn info(&self) -> ConsumerInfo {
        ConsumerInfo {
            config: self.config.lock().expect("config lock").clone(),
        }
    }

    /// Merge the mutable subset of `config`. The deliver policy and cursor are
    /// preserved so reconciliation never rewinds a consumer.
    pub(crate) fn update(&self, config: &ConsumerConfig) {
        let mut current = self.config.lock().expect("config lock");
        current.ack_wait = config.ack_wait;
        current.max_deliver = config.max_deliver;
        current.filter_subject = config.filter_subject.clone();
        current.filter_subjects = config.filter_subjects.clone();
        current.inactive_threshold = config.inactive_threshold;
    }

    fn finish(&self, stream_sequence: u64, consumer_sequence: u64) -> Result<()> {
        let mut delivery = self.delivery.lock().expect("delivery lock");
        if !in_flight_matches(&delivery, stream_sequence, consumer_sequence) {
            return Err(BrokerError::NotPending);
        }
        delivery.pending.remove(&stream_sequence);
        Ok(())
    }

    fn redeliver_after(
        &self,
        stream_sequence: u64,
        consumer_sequence: u64,
        delay: Duration,
    ) -> Result<()> {
        let mut delivery = self.delivery.lock().expect("delivery lock");
        if !in_flight_matches(&delivery, stream_sequence, consumer_sequence) {
            return Err(BrokerError::NotPending);
        }
        let entry = delivery
            .pending
            .get_mut(&stream_sequence)
            .expect("pending entry");
        entry.phase = Phase::Available {
            at: Instant::now() + delay,
        };
        drop(delivery);
        self.notify.notify_waiters();
        Ok(())
    }

    fn extend(&self, stream_sequence: u64, consumer_sequence: u64) -> Result<()> {
        let ack_wait = self.config.lock().expect("config lock").ack_wait;
        let mut delivery = self.delivery.lock().expect("delivery lock");
        if !in_flight_matches(&delivery, stream_sequence, consumer_sequence) {
            return Err(BrokerError::NotPending);
        }
        let entry = delivery
            .pending
            .get_mut(&stream_sequence)
            .expect("pending entry");
        entry.phase = Phase::InFlight {
            consumer_sequence,
            deadline: Instant::now() + ack_wait,
        };
        Ok(())
    }

    /// Make every in-flight delivery available again, as happens when the
    /// session holding them goes away.
    fn release_in_flight(&self) {
        let now = Instant::now();
        let mut delivery = self.delivery.lock().expect("delivery lock");
        for entry in delivery.pending.values_mut() {
            if matches!(entry.phase, Phase::InFlight { .. }) {
                entry.phase = Phase::Available { at: now };
            }
        }
        drop(delivery);
        self.notify.notify_waiters();
    }
}

fn in_flight_matches(delivery: &DeliveryState, stream_sequence: u64, consumer_sequence: u64) -> bool {
    matches!(
        delivery.pending.get(&stream_sequence),
        Some(Pending {
            phase: Phase::InFlight {
                consumer_sequence: current,
                ..
            },
            ..
        }) if *current == consumer_sequence
    )
}

/// Compute the initial cursor for a deliver policy against the current log.
pub(crate) fn initial_cursor(stream: &StreamState, policy: DeliverPolicy) -> u64 {
    let log = stream.log.lock().expect("log lock");
    match policy {
        DeliverPolicy::All => log.first_sequence(),
        DeliverPolicy::New => log.next_sequence,
        DeliverPolicy::ByStartSequence(sequence) => sequence,
        DeliverPolicy::ByStartTime(time) => log
            .messages
            .iter()
            .find(|(_, message)| message.timestamp >= time)
            .map(|(&sequence, _)| sequence)
            .unwrap_or(log.next_sequence),
    }
}

/// A pull subscription bound to one consumer.
///
/// Fetches return deliverable messages in stream-sequence order; redeliveries
/// come before fresh messages.
pub struct PullSubscription {
    stream: Arc<StreamState>,
    consumer: Arc<ConsumerState>,
    closed: AtomicBool,
}

impl PullSubscription {
    pub(crate) fn new(stream: Arc<StreamState>, consumer: Arc<ConsumerState>) -> Self {
        Self {
            stream,
            consumer,
            closed: AtomicBool::new(false),
        }
    }

    /// Fetch up to `batch` messages, waiting up to `expires` when none are
    /// deliverable. An empty result means the wait expired.
    pub async fn fetch(&self, batch: usize, expires: Duration) -> Result<Vec<PulledMessage>> {
        let deadline = Instant::now() + expires;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(BrokerError::SubscriptionClosed);
            }
            let (messages, next_due) = self.collect(batch);
            if !messages.is_empty() {
                return Ok(messages);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let mut wait = deadline - now;
            if let Some(due) = next_due {
                wait = wait.min(due.saturating_duration_since(now));
            }
            // Cap the park time so close and missed wakeups stay bounded.
            wait = wait.clamp(Duration::from_millis(1), Duration::from_millis(100));
            tokio::select! {
                _ = self.stream.notify.notified() => {}
                _ = self.consumer.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn collect(&self, batch: usize) -> (Vec<PulledMessage>, Option<Instant>) {
        let now = Instant::now();
        let (ack_wait, max_deliver, filters) = {
            let config = self.consumer.config.lock().expect("config lock");
            (config.ack_wait, config.max_deliver, config.filters())
        };
        let mut delivery = self.consumer.delivery.lock().expect("delivery lock");
        let log = self.stream.log.lock().expect("log lock");
        let mut out = Vec::new();

        // Expired in-flight deliveries become available again.
        for entry in delivery.pending.values_mut() {
            if let Phase::InFlight { deadline, .. } = entry.phase {
                if deadline <= now {
                    entry.phase = Phase::Available { at: now };
                }
            }
        }

        // Redeliveries first, oldest stream sequence first.
        let mut due: Vec<u64> = delivery
            .pending
            .iter()
            .filter_map(|(&sequence, entry)| match entry.phase {
                Phase::Available { at } if at <= now => Some(sequence),
                _ => None,
            })
            .collect();
        due.sort_unstable();
        let mut exhausted = Vec::new();
        for sequence in due {
            if out.len() >= batch {
                break;
            }
            let Some(message) = log.messages.get(&sequence) else {
                // Aged out of the stream; nothing left to deliver.
                exhausted.push(sequence);
                continue;
            };
            let consumer_sequence = delivery.next_consumer_sequence;
            let entry = delivery.pending.get_mut(&sequence).expect("pending entry");
            if max_deliver > 0 && entry.deliveries >= max_deliver {
                exhausted.push(sequence);
                continue;
            }
            entry.deliveries += 1;
            let attempt = entry.deliveries;
            entry.phase = Phase::InFlight {
                consumer_sequence,
                deadline: now + ack_wait,
            };
            delivery.next_consumer_sequence += 1;
            out.push(PulledMessage {
                consumer: Arc::clone(&self.consumer),
                message: Arc::clone(message),
                consumer_sequence,
                delivery_attempt: attempt,
                delivered_at: now,
            });
        }
        for sequence in exhausted {
            delivery.pending.remove(&sequence);
        }

        // Then fresh messages past the cursor that match a filter.
        while out.len() < batch {
            let Some((&sequence, message)) = log.messages.range(delivery.cursor..).next() else {
                break;
            };
            delivery.cursor = sequence + 1;
            if !filters
                .iter()
                .any(|filter| subject::matches(filter, &message.subject))
            {
                continue;
            }
            let consumer_sequence = delivery.next_consumer_sequence;
            delivery.next_consumer_sequence += 1;
            delivery.pending.insert(
                sequence,
                Pending {
                    deliveries: 1,
                    phase: Phase::InFlight {
                        consumer_sequence,
                        deadline: now + ack_wait,
                    },
                },
            );
            out.push(PulledMessage {
                consumer: Arc::clone(&self.consumer),
                message: Arc::clone(message),
                consumer_sequence,
                delivery_attempt: 1,
                delivered_at: now,
            });
        }

        // Earliest future transition, so fetch can sleep precisely.
        let mut next_due = None;
        for entry in delivery.pending.values() {
            let at = match entry.phase {
                Phase::Available { at } => at,
                Phase::InFlight { deadline, .. } => deadline,
            };
            if at > now {
                next_due = Some(next_due.map_or(at, |due: Instant| due.min(at)));
            }
        }
        (out, next_due)
    }

    /// Tear the subscription down. In-flight deliveries become available for
    /// redelivery immediately.
    pub fn unsubscribe(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.consumer.release_in_flight();
    }
}

impl Drop for PullSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// A single delivery handed out by [`PullSubscription::fetch`].
pub struct PulledMessage {
    consumer: Arc<ConsumerState>,
    message: Arc<StoredMessage>,
    consumer_sequence: u64,
    delivery_attempt: u64,
    delivered_at: Instant,
}

impl PulledMessage {
    pub fn subject(&self) -> &str {
        &self.message.subject
    }

    pub fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.message.headers
    }

    pub fn stream_sequence(&self) -> u64 {
        self.message.sequence
    }

    pub fn consumer_sequence(&self) -> u64 {
        self.consumer_sequence
    }

    pub fn delivery_attempt(&self) -> u64 {
        self.delivery_attempt
    }

    /// Broker-side timestamp assigned when the message was stored.
    pub fn published(&self) -> SystemTime {
        self.message.timestamp
    }

    pub fn delivered_at(&self) -> Instant {
        self.delivered_at
    }

    /// Acknowledge; the delivery is terminally done.
    pub async fn ack(&self) -> Result<()> {
        self.consumer
            .finish(self.message.sequence, self.consumer_sequence)
    }

    /// Negative acknowledgement; redeliver after `delay` (immediately when
    /// `None`).
    pub async fn nak(&self, delay: Option<Duration>) -> Result<()> {
        self.consumer.redeliver_after(
            self.message.sequence,
            self.consumer_sequence,
            delay.unwrap_or(Duration::ZERO),
        )
    }

    /// Terminate; never redeliver.
    pub async fn term(&self) -> Result<()> {
        self.consumer
            .finish(self.message.sequence, self.consumer_sequence)
    }

    /// Extend the acknowledgement deadline by one ack-wait.
    pub async fn in_progress(&self) -> Result<()> {
        self.consumer
            .extend(self.message.sequence, self.consumer_sequence)
    }
}

impl std::fmt::Debug for PulledMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PulledMessage")
            .field("subject", &self.message.subject)
            .field("stream_sequence", &self.message.sequence)
            .field("consumer_sequence", &self.consumer_sequence)
            .field("delivery_attempt", &self.delivery_attempt)
            .finish()
    }
}

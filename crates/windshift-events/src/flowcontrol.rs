//! Adaptive flow control for one delivery queue.
//!
//! Keeps the amount of in-flight work sized to the consumer's ack-wait and
//! the observed processing rate: pull fetches are expensive per call, but
//! oversubscribing wastes ack-wait budget on buffered deliveries that expire
//! before the subscriber sees them. Batch sizing follows an exponentially
//! weighted mean of processing latency, adapted once per window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

const EWMA_ALPHA: f64 = 0.2;
const GROWTH_FACTOR: f64 = 1.5;
const SHRINK_FACTOR: f64 = 0.5;
// How long batch_size may park per turn when every slot is taken.
const SLOT_WAIT: Duration = Duration::from_millis(1);

/// Terminal (or liveness) outcome observed for an in-flight delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessType {
    Ack,
    Reject,
    PermanentReject,
    Ping,
    Expire,
}

/// Counters accumulated since the controller was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowStats {
    pub acks: u64,
    pub rejects: u64,
    pub permanent_rejects: u64,
    pub pings: u64,
    pub expirations: u64,
}

#[derive(Debug)]
struct State {
    // Received-at timestamp per in-flight consumer sequence; pings refresh it.
    in_flight: HashMap<u64, Instant>,
    batch: f64,
    ewma_latency_secs: Option<f64>,
    window_started: Instant,
    window_completions: u64,
    window_rejections: u64,
    totals: FlowStats,
}

#[derive(Debug)]
struct Shared {
    max_pending: usize,
    ack_wait: Duration,
    window: Duration,
    state: Mutex<State>,
    // Signalled whenever a slot frees up.
    slots: Notify,
}

/// Per-queue credit model bounding in-flight deliveries to `max_pending`.
#[derive(Debug, Clone)]
pub struct FlowControl {
    shared: Arc<Shared>,
}

impl FlowControl {
    pub fn new(ack_wait: Duration, max_pending: usize) -> Self {
        let max_pending = max_pending.max(1);
        let window = (ack_wait / 2).clamp(Duration::from_millis(100), Duration::from_secs(30));
        Self {
            shared: Arc::new(Shared {
                max_pending,
                ack_wait,
                window,
                state: Mutex::new(State {
                    in_flight: HashMap::new(),
                    batch: max_pending as f64,
                    ewma_latency_secs: None,
                    window_started: Instant::now(),
                    window_completions: 0,
                    window_rejections: 0,
                    totals: FlowStats::default(),
                }),
                slots: Notify::new(),
            }),
        }
    }

    /// Register a delivery and get the callback to invoke on its outcome.
    pub fn received(&self, sequence: u64) -> ProcessCallback {
        let mut state = self.shared.state.lock().expect("state lock");
        state.in_flight.insert(sequence, Instant::now());
        ProcessCallback {
            shared: Arc::clone(&self.shared),
            sequence,
        }
    }

    /// Next fetch size, in `[1, max_pending - in_flight]`.
    ///
    /// When every slot is taken this parks in bounded slices until one frees
    /// up, so the pump neither spins nor overshoots the cap.
    pub async fn batch_size(&self) -> usize {
        loop {
            {
                let state = self.shared.state.lock().expect("state lock");
                let available = self.shared.max_pending.saturating_sub(state.in_flight.len());
                if available > 0 {
                    let batch = state.batch.round() as usize;
                    return batch.clamp(1, available);
                }
            }
            let _ = tokio::time::timeout(SLOT_WAIT, self.shared.slots.notified()).await;
        }
    }

    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().expect("state lock").in_flight.len()
    }

    pub fn stats(&self) -> FlowStats {
        self.shared.state.lock().expect("state lock").totals
    }

    #[cfg(test)]
    fn current_batch(&self) -> usize {
        self.shared.state.lock().expect("state lock").batch.round() as usize
    }
}

/// Handle tied to one registered delivery.
#[derive(Debug, Clone)]
pub struct ProcessCallback {
    shared: Arc<Shared>,
    sequence: u64,
}

impl ProcessCallback {
    pub fn process(&self, kind: ProcessType) {
        let now = Instant::now();
        let mut state = self.shared.state.lock().expect("state lock");
        match kind {
            ProcessType::Ping => {
                state.totals.pings += 1;
                // Liveness: restart the latency clock, keep the slot.
                if let Some(received_at) = state.in_flight.get_mut(&self.sequence) {
                    *received_at = now;
                }
            }
            _ => {
                if let Some(received_at) = state.in_flight.remove(&self.sequence) {
                    let latency = now.duration_since(received_at).as_secs_f64();
                    state.ewma_latency_secs = Some(match state.ewma_latency_secs {
                        Some(previous) => previous + EWMA_ALPHA * (latency - previous),
                        None => latency,
                    });
                    state.window_completions += 1;
                    match kind {
                        ProcessType::Ack => state.totals.acks += 1,
                        ProcessType::Reject => {
                            state.totals.rejects += 1;
                            state.window_rejections += 1;
                        }
                        ProcessType::PermanentReject => {
                            state.totals.permanent_rejects += 1;
                            state.window_rejections += 1;
                        }
                        ProcessType::Expire => {
                            state.totals.expirations += 1;
                            state.window_rejections += 1;
                        }
                        ProcessType::Ping => unreachable!("handled above"),
                    }
                    self.shared.slots.notify_waiters();
                }
            }
        }
        adapt_batch(&self.shared, &mut state, now);
    }
}

fn adapt_batch(shared: &Shared, state: &mut State, now: Instant) {
    if now.duration_since(state.window_started) < shared.window {
        return;
    }
    if state.window_completions > 0 {
        let rejection_rate = state.window_rejections as f64 / state.window_completions as f64;
        let latency = state.ewma_latency_secs.unwrap_or(0.0);
        // Healthy when the subscriber finishes well inside half the ack-wait.
        let target = shared.ack_wait.as_secs_f64() / 2.0;
        if latency < target * 0.5 && rejection_rate < 0.05 {
            state.batch = (state.batch * GROWTH_FACTOR).min(shared.max_pending as f64);
        } else {
            state.batch = (state.batch * SHRINK_FACTOR).max(1.0);
        }
    }
    state.window_started = now;
    state.window_completions = 0;
    state.window_rejections = 0;
}

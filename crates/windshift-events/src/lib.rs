//! Event-bus core: stream and consumer reconciliation, publishing with
//! idempotency and optimistic concurrency, and flow-controlled delivery
//! queues on top of the broker.

pub mod flowcontrol;

mod consumers;
mod errors;
mod event;
mod publish;
mod queue;
mod streams;

use std::sync::Arc;

use windshift_broker::Broker;

pub use consumers::{Consumer, ConsumerSpec, StreamPointer};
pub use errors::{Error, Result};
pub use event::{Event, EventData, EventHeaders};
pub use publish::PublishConfig;
pub use queue::{Queue, QueueConfig, DEFAULT_MAX_PENDING_EVENTS};

/// Typed event-bus operations over one broker.
///
/// Cheap to clone; every clone shares the same broker handle.
#[derive(Clone)]
pub struct Events {
    broker: Arc<Broker>,
}

impl Events {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }
}

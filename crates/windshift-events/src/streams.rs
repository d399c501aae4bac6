// Stream reconciliation.
use windshift_broker::{validate_stream_name, BrokerError, StreamConfig};

use crate::{Events, Result};

impl Events {
    /// Idempotently create or update a stream and return its current last
    /// sequence, usable as a start pointer for later consumers.
    ///
    /// The source type (subjects vs mirror vs aggregate) is immutable;
    /// subjects, retention and the dedup window reconcile on update.
    pub async fn ensure_stream(&self, config: StreamConfig) -> Result<u64> {
        validate_stream_name(&config.name)?;

        match self.broker.stream_info(&config.name).await {
            Ok(_) => {
                tracing::info!(stream = %config.name, "updating stream");
                let info = self.broker.update_stream(config).await?;
                Ok(info.last_sequence)
            }
            Err(BrokerError::StreamNotFound(_)) => {
                tracing::info!(stream = %config.name, source = config.source.kind(), "creating stream");
                let info = self.broker.create_stream(config).await?;
                Ok(info.last_sequence)
            }
            Err(err) => Err(err.into()),
        }
    }
}

use windshift_broker::BrokerError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("validation: {0}")]
    Validation(String),
    #[error("publish timed out")]
    PublishTimeout,
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl Error {
    /// Errors the caller can fix by changing the request.
    pub fn is_validation(&self) -> bool {
        match self {
            Error::Validation(_) => true,
            Error::Broker(err) => matches!(
                err,
                BrokerError::InvalidStreamName(_)
                    | BrokerError::InvalidSubject(_)
                    | BrokerError::EmptyFilter
                    | BrokerError::FilterNotCovered { .. }
                    | BrokerError::SourceTypeMismatch { .. }
                    | BrokerError::SourceImmutable
                    | BrokerError::OverlappingSubjects { .. }
                    | BrokerError::NoMatchingStream(_)
                    | BrokerError::MessageTooLarge { .. }
            ),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Broker(BrokerError::StreamNotFound(_) | BrokerError::ConsumerNotFound { .. })
        )
    }

    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::Broker(BrokerError::WrongLastSequence { .. } | BrokerError::NotPending)
        )
    }
}

//! Error taxonomy for delivery processing
//!
//! | Variant         | Raised when                                   | Retried |
//! |-----------------|-----------------------------------------------|---------|
//! | `Validation`    | bad recipient identifier, missing content     | no      |
//! | `Transient`     | timeout, 5xx from the channel, connectivity   | yes     |
//! | `CircuitOpen`   | queue admission while the breaker is open     | n/a     |
//! | `Configuration` | missing template or language mapping          | no      |
//! | `Storage`       | the delivery store failed                     | yes     |

use crate::collaborators::{CollaboratorError, SendError};
use crate::queue::{JobFailure, QueueError, QueueName};
use crate::storage::StorageError;

pub type DeliveryResult<T> = Result<T, DeliveryError>;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("circuit breaker is open for queue {queue}")]
    CircuitOpen { queue: QueueName },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl DeliveryError {
    /// Whether the queue should try the job again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Transient(_) | DeliveryError::Storage(_))
    }

    /// Short machine-readable name used in batch reports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryError::Validation(_) => "validation",
            DeliveryError::Transient(_) => "transient",
            DeliveryError::CircuitOpen { .. } => "circuit_open",
            DeliveryError::Configuration(_) => "configuration",
            DeliveryError::Queue(_) => "queue",
            DeliveryError::Storage(_) => "storage",
        }
    }
}

impl From<QueueError> for DeliveryError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::CircuitOpen { queue } => DeliveryError::CircuitOpen { queue },
            other => DeliveryError::Queue(other.to_string()),
        }
    }
}

impl From<CollaboratorError> for DeliveryError {
    fn from(err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::Unavailable(msg) => DeliveryError::Transient(msg),
            CollaboratorError::Rejected(msg) => DeliveryError::Validation(msg),
        }
    }
}

impl From<SendError> for DeliveryError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::Unavailable(_) => DeliveryError::Transient(err.to_string()),
            SendError::Rejected { .. } | SendError::InvalidRecipient(_) => {
                DeliveryError::Validation(err.to_string())
            }
        }
    }
}

impl From<DeliveryError> for JobFailure {
    fn from(err: DeliveryError) -> Self {
        JobFailure {
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

/// A per-subscriber failure captured during a batch run.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct BatchError {
    pub advisor_id: String,
    pub kind: String,
    pub message: String,
}

impl BatchError {
    pub fn new(advisor_id: impl Into<String>, err: &DeliveryError) -> Self {
        Self {
            advisor_id: advisor_id.into(),
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

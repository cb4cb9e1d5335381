//! Error types for scheduled jobs and slice requests.

use std::time::Duration;

use crate::bridge::protocol::{CorrelationId, FailureKind};
use crate::bridge::transport::TransportError;
use crate::health::Health;
use crate::slice::SliceShape;

/// Why a scheduled job produced no result.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("session {0} is already registered")]
    DuplicateSession(CorrelationId),

    #[error("failed to dispatch job {correlation_id}: {source}")]
    DispatchFailed {
        correlation_id: CorrelationId,
        #[source]
        source: TransportError,
    },

    #[error("job {correlation_id} failed ({kind}): {message}")]
    WorkerFailure {
        correlation_id: CorrelationId,
        kind: FailureKind,
        message: String,
    },

    #[error("job {correlation_id} timed out after {timeout:?}")]
    Timeout {
        correlation_id: CorrelationId,
        timeout: Duration,
    },

    /// Result stream closed before every fragment arrived.
    #[error("job {correlation_id} ended with {received} of {expected} fragments")]
    Incomplete {
        correlation_id: CorrelationId,
        received: usize,
        expected: usize,
    },
}

impl JobError {
    pub fn correlation_id(&self) -> &CorrelationId {
        match self {
            Self::DuplicateSession(id) => id,
            Self::DispatchFailed { correlation_id, .. }
            | Self::WorkerFailure { correlation_id, .. }
            | Self::Timeout { correlation_id, .. }
            | Self::Incomplete { correlation_id, .. } => correlation_id,
        }
    }

    /// Resubmitting the same query may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DispatchFailed { .. } | Self::Timeout { .. })
    }
}

/// Why a slice request produced no response.
#[derive(Debug, thiserror::Error)]
pub enum SliceError {
    #[error("service is not accepting jobs ({0:?})")]
    NotReady(Health),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("failed to encode slice query: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode fragment {index}: {source}")]
    Decode {
        index: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("fragment {index} has slice shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        index: usize,
        expected: SliceShape,
        actual: SliceShape,
    },
}

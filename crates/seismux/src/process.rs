//! In-memory representation of one submitted job.

use tokio_util::bytes::Bytes;

use crate::bridge::protocol::{CorrelationId, Envelope, RoutingToken};

/// One client job: identity, reply address and the immutable request bytes.
#[derive(Debug, Clone)]
pub struct Process {
    correlation_id: CorrelationId,
    routing_token: RoutingToken,
    payload: Bytes,
}

impl Process {
    /// New process with a fresh correlation id and routing token.
    pub fn new(payload: Bytes) -> Self {
        Self::with_identity(CorrelationId::new(), RoutingToken::new(), payload)
    }

    pub fn with_identity(
        correlation_id: CorrelationId,
        routing_token: RoutingToken,
        payload: Bytes,
    ) -> Self {
        Self {
            correlation_id,
            routing_token,
            payload,
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn routing_token(&self) -> &RoutingToken {
        &self.routing_token
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Job envelope for the outbound transport.
    pub fn to_envelope(&self) -> Envelope {
        Envelope::job(
            self.routing_token.clone(),
            self.correlation_id.clone(),
            self.payload.clone(),
        )
    }
}

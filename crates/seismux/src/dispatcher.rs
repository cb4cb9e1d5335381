//! Dispatcher - registers a job's session and sends it downstream.

use std::sync::Arc;

use tokio_util::bytes::Bytes;

use crate::bridge::transport::MessageSink;
use crate::error::JobError;
use crate::process::Process;
use crate::session::{SessionIo, SessionTable};

pub struct Dispatcher {
    sessions: Arc<SessionTable>,
    sink: Arc<dyn MessageSink>,
}

impl Dispatcher {
    pub fn new(sessions: Arc<SessionTable>, sink: Arc<dyn MessageSink>) -> Self {
        Self { sessions, sink }
    }

    /// Schedule a job under a fresh identity.
    pub async fn schedule(&self, payload: Bytes) -> Result<SessionIo, JobError> {
        self.dispatch(Process::new(payload)).await
    }

    /// Register the process's session, then send its job envelope.
    ///
    /// The session exists before the first byte leaves, so no reply can
    /// arrive for an unregistered id. A failed send rolls the
    /// registration back.
    pub async fn dispatch(&self, process: Process) -> Result<SessionIo, JobError> {
        let correlation_id = process.correlation_id().clone();
        let io = self
            .sessions
            .register(&correlation_id, process.routing_token().clone())?;

        if let Err(source) = self.sink.send(process.to_envelope().into_multipart()).await {
            tracing::warn!(%correlation_id, error = %source, "Job dispatch failed, rolling back session");
            drop(io);
            return Err(JobError::DispatchFailed {
                correlation_id,
                source,
            });
        }

        tracing::debug!(
            target: "seismux::job",
            %correlation_id,
            payload_bytes = process.payload().len(),
            "Job dispatched"
        );
        Ok(io)
    }
}

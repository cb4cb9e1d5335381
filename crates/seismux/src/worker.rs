//! Worker side of the job protocol.
//!
//! Pulls jobs, hands each query to a [`SliceHandler`], and streams the
//! result back as `m` fragments addressed to the job's routing token.
//! Failures go to the failure endpoint instead.
//!
//! Send policy:
//! - host unreachable: wait `retry_backoff`, resend the same message
//! - anything else: the worker stops with an error

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::protocol::{
    CorrelationId, Envelope, EnvelopeError, FailureKind, FailureNotice, Fragment,
    MAX_FRAGMENT_COUNT, Message, MessageKind, Multipart, RoutingToken,
};
use crate::bridge::transport::{MessageSink, MessageSource, TransportError};
use crate::slice::{SliceLayout, SliceQuery, SliceResponse, SliceShape, SliceTile};

/// Computes the slice for one query.
#[async_trait::async_trait]
pub trait SliceHandler: Send + Sync + 'static {
    async fn handle(&self, query: SliceQuery) -> Result<SliceResponse, FailureNotice>;
}

/// Handler that answers every valid query with the same slice.
pub struct CannedSlice {
    response: SliceResponse,
}

impl CannedSlice {
    pub fn new(response: SliceResponse) -> Self {
        Self { response }
    }

    /// 30 tiles of 2500 samples over a 201x720 slice.
    pub fn reference() -> Self {
        let tiles = (0..30u64)
            .map(|tile| SliceTile {
                layout: SliceLayout {
                    chunk_size: 1,
                    iterations: 0,
                },
                v: (0..2500u64)
                    .map(|i| ((tile * 7919 + i * 104_729) % 10_007) as f32 / 10_007.0)
                    .collect(),
            })
            .collect();
        Self::new(SliceResponse {
            slice_shape: Some(SliceShape {
                dim0: 201,
                dim1: 720,
            }),
            tiles,
        })
    }
}

impl Default for CannedSlice {
    fn default() -> Self {
        Self::reference()
    }
}

#[async_trait::async_trait]
impl SliceHandler for CannedSlice {
    async fn handle(&self, query: SliceQuery) -> Result<SliceResponse, FailureNotice> {
        if query.guid.is_empty() {
            return Err(FailureNotice::new(FailureKind::NotFound, "no cube with empty guid"));
        }
        if query.dim > 2 {
            return Err(FailureNotice::new(
                FailureKind::BadRequest,
                format!("dimension {} out of range (0-2)", query.dim),
            ));
        }
        Ok(self.response.clone())
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of fragments each result is split into.
    pub fragments: u32,
    pub retry_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            fragments: 100,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

impl WorkerConfig {
    pub fn with_fragments(mut self, fragments: u32) -> Self {
        self.fragments = fragments;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

/// Where a worker sends its replies.
#[derive(Clone)]
pub struct ReplySinks {
    pub results: Arc<dyn MessageSink>,
    pub failures: Arc<dyn MessageSink>,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("job source failed: {0}")]
    Receive(#[source] io::Error),

    /// Cannot be answered: there is no usable correlation id to reply to.
    #[error("undecodable job envelope: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("unexpected {0} envelope on job source")]
    UnexpectedKind(MessageKind),

    #[error("failed to encode fragment: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to send reply for job {correlation_id}: {source}")]
    Send {
        correlation_id: CorrelationId,
        #[source]
        source: TransportError,
    },
}

/// Serve jobs until the job source closes or a fatal error occurs.
pub async fn run_worker<S, H>(
    mut jobs: S,
    replies: ReplySinks,
    handler: Arc<H>,
    config: WorkerConfig,
) -> Result<(), WorkerError>
where
    S: MessageSource,
    H: SliceHandler,
{
    tracing::info!(fragments = config.fragments, "Worker ready");
    loop {
        let message = match jobs.recv().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(WorkerError::Receive(e)),
            None => {
                tracing::info!("Job source closed, worker exiting");
                return Ok(());
            }
        };
        handle_job(message, &replies, handler.as_ref(), &config).await?;
    }
}

async fn handle_job<H: SliceHandler>(
    message: Multipart,
    replies: &ReplySinks,
    handler: &H,
    config: &WorkerConfig,
) -> Result<(), WorkerError> {
    let envelope = Envelope::try_from(message)?;
    let Envelope {
        routing_token,
        correlation_id,
        message,
    } = envelope;
    let kind = message.kind();
    let Message::Job { payload } = message else {
        return Err(WorkerError::UnexpectedKind(kind));
    };
    tracing::debug!(%correlation_id, payload_bytes = payload.len(), "Job received");

    let outcome = match SliceQuery::from_payload(&payload) {
        Ok(query) => handler.handle(query).await,
        Err(e) => Err(FailureNotice::new(
            FailureKind::BadRequest,
            format!("unreadable slice query: {}", e),
        )),
    };

    match outcome {
        Ok(response) => {
            let count = config.fragments.clamp(1, MAX_FRAGMENT_COUNT);
            for (index, part) in response.split(count as usize).into_iter().enumerate() {
                let fragment = Fragment::new(index as u32, count, serde_json::to_vec(&part)?)?;
                let envelope =
                    Envelope::fragment(routing_token.clone(), correlation_id.clone(), fragment);
                send_with_retry(
                    replies.results.as_ref(),
                    envelope.into_multipart(),
                    config.retry_backoff,
                    &correlation_id,
                )
                .await?;
            }
            tracing::debug!(%correlation_id, m = count, "Result sent");
        }
        Err(notice) => {
            tracing::info!(%correlation_id, kind = %notice.kind, reason = %notice.message, "Job failed");
            send_failure(replies, routing_token, correlation_id, notice, config).await?;
        }
    }
    Ok(())
}

async fn send_failure(
    replies: &ReplySinks,
    routing_token: RoutingToken,
    correlation_id: CorrelationId,
    notice: FailureNotice,
    config: &WorkerConfig,
) -> Result<(), WorkerError> {
    let envelope = Envelope::failure(routing_token, correlation_id.clone(), notice);
    send_with_retry(
        replies.failures.as_ref(),
        envelope.into_multipart(),
        config.retry_backoff,
        &correlation_id,
    )
    .await
}

/// Send one message, retrying only while the host is unreachable.
pub async fn send_with_retry(
    sink: &dyn MessageSink,
    message: Multipart,
    backoff: Duration,
    correlation_id: &CorrelationId,
) -> Result<(), WorkerError> {
    loop {
        match sink.send(message.clone()).await {
            Ok(()) => return Ok(()),
            Err(TransportError::HostUnreachable(reason)) => {
                tracing::warn!(%correlation_id, %reason, "Reply host unreachable, retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(source) => {
                tracing::error!(%correlation_id, error = %source, "Reply send failed");
                return Err(WorkerError::Send {
                    correlation_id: correlation_id.clone(),
                    source,
                });
            }
        }
    }
}

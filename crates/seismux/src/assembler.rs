//! Result assembler - drains one session into an ordered result.

use std::time::Duration;

use tokio_util::bytes::{Bytes, BytesMut};

use crate::bridge::protocol::{CorrelationId, FailureNotice, Fragment};
use crate::error::JobError;
use crate::session::SessionIo;

/// Fragments of one job in sequence order.
#[derive(Debug, Clone)]
pub struct Assembled {
    correlation_id: CorrelationId,
    fragments: Vec<Bytes>,
}

impl Assembled {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn fragments(&self) -> &[Bytes] {
        &self.fragments
    }

    pub fn into_fragments(self) -> Vec<Bytes> {
        self.fragments
    }

    /// All fragment payloads joined in sequence order.
    pub fn concat(&self) -> Bytes {
        let len = self.fragments.iter().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(len);
        for fragment in &self.fragments {
            out.extend_from_slice(fragment);
        }
        out.freeze()
    }
}

/// Reassembly buffer sized by the first fragment's `m`.
struct Slots {
    slots: Vec<Option<Bytes>>,
    filled: usize,
}

impl Slots {
    fn place(&mut self, fragment: Fragment, correlation_id: &CorrelationId) {
        if self.slots.is_empty() {
            self.slots.resize(fragment.count as usize, None);
        } else if fragment.count as usize != self.slots.len() {
            tracing::warn!(%correlation_id, n = fragment.index, m = fragment.count, "Ignoring fragment with inconsistent count");
            return;
        }
        let Some(slot) = self.slots.get_mut(fragment.index as usize) else {
            tracing::warn!(%correlation_id, n = fragment.index, m = fragment.count, "Ignoring out-of-range fragment");
            return;
        };
        if slot.is_some() {
            tracing::debug!(%correlation_id, n = fragment.index, "Ignoring duplicate fragment");
            return;
        }
        *slot = Some(fragment.payload);
        self.filled += 1;
    }

    fn is_complete(&self) -> bool {
        !self.slots.is_empty() && self.filled == self.slots.len()
    }
}

fn worker_failure(correlation_id: CorrelationId, notice: FailureNotice) -> JobError {
    JobError::WorkerFailure {
        correlation_id,
        kind: notice.kind,
        message: notice.message,
    }
}

/// Wait for a job's outcome.
///
/// A failure notice wins over any fragments already queued. The session is
/// released when `io` drops on return, whichever way this ends.
pub async fn assemble(io: SessionIo, timeout: Duration) -> Result<Assembled, JobError> {
    let SessionIo {
        mut results,
        mut failures,
        guard,
    } = io;
    let correlation_id = guard.correlation_id().clone();

    let mut slots = Slots {
        slots: Vec::new(),
        filled: 0,
    };
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut failures_open = true;

    loop {
        tokio::select! {
            biased;

            failure = failures.recv(), if failures_open => match failure {
                Some(notice) => return Err(worker_failure(correlation_id, notice)),
                None => failures_open = false,
            },

            fragment = results.recv() => match fragment {
                Some(fragment) => {
                    slots.place(fragment, &correlation_id);
                    if slots.is_complete() {
                        break;
                    }
                }
                None => break,
            },

            _ = &mut deadline => {
                tracing::warn!(
                    target: "seismux::job",
                    %correlation_id,
                    received = slots.filled,
                    expected = slots.slots.len(),
                    "Job timed out"
                );
                return Err(JobError::Timeout { correlation_id, timeout });
            }
        }
    }

    // A failure routed just before the channels closed still takes precedence.
    if let Ok(notice) = failures.try_recv() {
        return Err(worker_failure(correlation_id, notice));
    }

    if !slots.is_complete() {
        return Err(JobError::Incomplete {
            correlation_id,
            received: slots.filled,
            expected: slots.slots.len(),
        });
    }

    drop(guard);
    Ok(Assembled {
        correlation_id,
        fragments: slots.slots.into_iter().flatten().collect(),
    })
}

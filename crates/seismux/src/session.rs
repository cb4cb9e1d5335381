//! Session table - registry of in-flight jobs.
//!
//! Maps a correlation id to the channels its waiting request drains.
//! The result router is the only writer; dropping an entry closes both
//! channels, which is how the assembler learns a job is finished.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;

use crate::bridge::protocol::{CorrelationId, FailureNotice, Fragment, RoutingToken};
use crate::error::JobError;

/// Outcome of routing one inbound message to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// No session for the id (never existed, or already released).
    UnknownSession,
    /// Session exists but was dispatched with a different routing token.
    Misrouted,
    /// Session exists but its reader is gone.
    Abandoned,
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

struct SessionEntry {
    routing_token: RoutingToken,
    results: mpsc::UnboundedSender<Fragment>,
    failures: mpsc::UnboundedSender<FailureNotice>,
}

/// Reader side of one session. Releases the session when dropped.
pub struct SessionIo {
    pub results: mpsc::UnboundedReceiver<Fragment>,
    pub failures: mpsc::UnboundedReceiver<FailureNotice>,
    pub guard: SessionGuard,
}

impl SessionIo {
    pub fn correlation_id(&self) -> &CorrelationId {
        self.guard.correlation_id()
    }
}

/// Releases a session on drop.
///
/// When an HTTP client disconnects, axum drops the handler future, which
/// drops this guard, so the table cannot leak entries.
pub struct SessionGuard {
    correlation_id: CorrelationId,
    table: Arc<SessionTable>,
}

impl SessionGuard {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.table.release(&self.correlation_id);
    }
}

/// Session table with lock-free concurrent access.
#[derive(Default)]
pub struct SessionTable {
    sessions: DashMap<CorrelationId, SessionEntry>,
}

impl SessionTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new session. Fails if the id is already live.
    pub fn register(
        self: &Arc<Self>,
        correlation_id: &CorrelationId,
        routing_token: RoutingToken,
    ) -> Result<SessionIo, JobError> {
        match self.sessions.entry(correlation_id.clone()) {
            Entry::Occupied(_) => {
                tracing::error!(%correlation_id, "Duplicate session registration rejected");
                Err(JobError::DuplicateSession(correlation_id.clone()))
            }
            Entry::Vacant(slot) => {
                let (results_tx, results) = mpsc::unbounded_channel();
                let (failures_tx, failures) = mpsc::unbounded_channel();
                slot.insert(SessionEntry {
                    routing_token,
                    results: results_tx,
                    failures: failures_tx,
                });
                tracing::trace!(%correlation_id, "Session registered");
                Ok(SessionIo {
                    results,
                    failures,
                    guard: SessionGuard {
                        correlation_id: correlation_id.clone(),
                        table: Arc::clone(self),
                    },
                })
            }
        }
    }

    pub fn route_fragment(
        &self,
        correlation_id: &CorrelationId,
        routing_token: &RoutingToken,
        fragment: Fragment,
    ) -> Delivery {
        let Some(entry) = self.sessions.get(correlation_id) else {
            return Delivery::UnknownSession;
        };
        if &entry.routing_token != routing_token {
            return Delivery::Misrouted;
        }
        match entry.results.send(fragment) {
            Ok(()) => Delivery::Delivered,
            Err(_) => Delivery::Abandoned,
        }
    }

    pub fn route_failure(
        &self,
        correlation_id: &CorrelationId,
        routing_token: &RoutingToken,
        failure: FailureNotice,
    ) -> Delivery {
        let Some(entry) = self.sessions.get(correlation_id) else {
            return Delivery::UnknownSession;
        };
        if &entry.routing_token != routing_token {
            return Delivery::Misrouted;
        }
        match entry.failures.send(failure) {
            Ok(()) => Delivery::Delivered,
            Err(_) => Delivery::Abandoned,
        }
    }

    /// Remove a session, closing both of its channels. Idempotent.
    pub fn release(&self, correlation_id: &CorrelationId) -> bool {
        let released = self.sessions.remove(correlation_id).is_some();
        if released {
            tracing::trace!(%correlation_id, "Session released");
        }
        released
    }

    /// Remove every session, closing all of their channels. Returns how many
    /// were live.
    pub fn release_all(&self) -> usize {
        let mut released = 0;
        self.sessions.retain(|correlation_id, _| {
            tracing::trace!(%correlation_id, "Session released");
            released += 1;
            false
        });
        released
    }

    pub fn contains(&self, correlation_id: &CorrelationId) -> bool {
        self.sessions.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

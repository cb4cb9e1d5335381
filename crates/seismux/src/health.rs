//! Health status types for the seismux service.

use serde::{Deserialize, Serialize};

/// Health status of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// Accepting slice requests
    Ready,
    /// Shutdown requested, in-flight jobs finishing
    Draining,
    /// Result router stopped; no reply can be delivered
    Defunct,
}

impl Health {
    pub fn accepts_jobs(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

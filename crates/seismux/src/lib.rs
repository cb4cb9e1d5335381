//! seismux: session scheduler and partial-result router for seismic slice queries.

mod health;
mod process;
mod version;

pub mod assembler;
pub mod bridge;
pub mod dispatcher;
pub mod error;
pub mod router;
pub mod service;
pub mod session;
pub mod slice;
pub mod transport;
pub mod worker;

pub use assembler::{Assembled, assemble};
pub use dispatcher::Dispatcher;
pub use error::{JobError, SliceError};
pub use health::Health;
pub use process::Process;
pub use router::{ResultRouter, RouterMetrics, RouterMetricsSnapshot};
pub use service::{HealthSnapshot, ServiceConfig, SliceRequest, SliceService};
pub use session::{Delivery, SessionGuard, SessionIo, SessionTable};
pub use slice::{FragmentShape, SliceQuery, SliceResponse};
pub use version::{SEISMUX_VERSION, VersionInfo};
pub use worker::{CannedSlice, ReplySinks, SliceHandler, WorkerConfig, WorkerError, run_worker};

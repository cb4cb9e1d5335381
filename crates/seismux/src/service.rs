//! SliceService: Transport-agnostic slice request handling.
//!
//! This service owns:
//! - The session table, dispatcher and result router
//! - Health tracking
//! - Shutdown coordination (bidirectional)
//!
//! Transports (HTTP today) delegate to this service for slice requests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock, watch};

use crate::assembler;
use crate::bridge::transport::{MessageSink, MessageSource};
use crate::dispatcher::Dispatcher;
use crate::error::SliceError;
use crate::health::Health;
use crate::router::{ResultRouter, RouterMetrics, RouterMetricsSnapshot};
use crate::session::SessionTable;
use crate::slice::{FragmentShape, SliceQuery, SliceResponse};
use crate::version::VersionInfo;

/// Default time a request waits for its job to finish.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Storage account URL handed to workers with every job.
    pub storage_endpoint: String,
    pub request_timeout: Duration,
    pub fragment_shape: FragmentShape,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            storage_endpoint: String::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            fragment_shape: FragmentShape::default(),
        }
    }
}

impl ServiceConfig {
    pub fn with_storage_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.storage_endpoint = endpoint.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_fragment_shape(mut self, shape: FragmentShape) -> Self {
        self.fragment_shape = shape;
        self
    }
}

/// One slice request as received from a transport.
#[derive(Debug, Clone)]
pub struct SliceRequest {
    pub guid: String,
    pub dim: u32,
    pub lineno: u32,
    /// Authorization header value, forwarded opaquely.
    pub token: String,
}

/// Snapshot of service health for transports to query.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub state: Health,
    pub sessions_in_flight: usize,
    pub router: RouterMetricsSnapshot,
    pub version: VersionInfo,
}

impl HealthSnapshot {
    pub fn is_ready(&self) -> bool {
        self.state == Health::Ready
    }
}

pub struct SliceService {
    config: ServiceConfig,

    sessions: Arc<SessionTable>,
    dispatcher: Dispatcher,
    router: Mutex<Option<ResultRouter>>,
    metrics: Arc<RouterMetrics>,

    health: RwLock<Health>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    version: VersionInfo,
}

impl SliceService {
    /// Start routing replies from `source` and accept jobs for `sink`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start<S>(config: ServiceConfig, sink: Arc<dyn MessageSink>, source: S) -> Self
    where
        S: MessageSource + 'static,
    {
        let sessions = SessionTable::new();
        let router = ResultRouter::start(source, Arc::clone(&sessions));
        let metrics = router.metrics_handle();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            dispatcher: Dispatcher::new(Arc::clone(&sessions), sink),
            sessions,
            router: Mutex::new(Some(router)),
            metrics,
            health: RwLock::new(Health::Ready),
            shutdown_tx,
            shutdown_rx,
            version: VersionInfo::new(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    /// Stored state, downgraded to `Defunct` once the router has exited.
    async fn state(&self) -> Health {
        let state = *self.health.read().await;
        if state != Health::Ready {
            return state;
        }
        let router_running = self
            .router
            .lock()
            .await
            .as_ref()
            .is_some_and(ResultRouter::is_running);
        if router_running { state } else { Health::Defunct }
    }

    pub async fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            state: self.state().await,
            sessions_in_flight: self.sessions.len(),
            router: self.metrics.snapshot(),
            version: self.version.clone(),
        }
    }

    pub async fn set_health(&self, health: Health) {
        *self.health.write().await = health;
    }

    /// Run one slice request end to end: schedule, await, decode.
    pub async fn fetch_slice(&self, request: SliceRequest) -> Result<SliceResponse, SliceError> {
        let state = self.state().await;
        if !state.accepts_jobs() {
            return Err(SliceError::NotReady(state));
        }

        let query = SliceQuery {
            guid: request.guid,
            dim: request.dim,
            lineno: request.lineno,
            token: request.token,
            storage_endpoint: self.config.storage_endpoint.clone(),
            shape: self.config.fragment_shape,
        };
        let payload = query.to_payload().map_err(SliceError::Encode)?;

        let started = Instant::now();
        let io = self.dispatcher.schedule(payload).await?;
        let correlation_id = io.correlation_id().clone();
        tracing::info!(
            target: "seismux::job",
            %correlation_id,
            guid = %query.guid,
            dim = query.dim,
            lineno = query.lineno,
            "Slice job scheduled"
        );

        let assembled = assembler::assemble(io, self.config.request_timeout).await?;
        let response = SliceResponse::from_fragments(assembled.fragments())?;

        tracing::info!(
            target: "seismux::job",
            %correlation_id,
            fragments = assembled.fragments().len(),
            tiles = response.tiles.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Slice job completed"
        );
        Ok(response)
    }

    /// Stop admitting jobs and ask the transport to shut down.
    pub async fn trigger_shutdown(&self) {
        self.set_health(Health::Draining).await;
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Stop accepting jobs and stop the result router.
    ///
    /// Requests still waiting end with an incomplete result.
    pub async fn shutdown(&self) {
        self.set_health(Health::Draining).await;
        if let Some(router) = self.router.lock().await.take() {
            router.stop().await;
        }
        // No reply can be routed any more; waiting assemblers see their
        // channels close.
        let abandoned = self.sessions.release_all();
        if abandoned > 0 {
            tracing::warn!(abandoned, "Released sessions still in flight at shutdown");
        }
    }
}

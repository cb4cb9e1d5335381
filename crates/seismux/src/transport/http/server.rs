//! HTTP server implementation.

use std::fmt;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::health::Health;
use crate::service::SliceService;

use super::routes::routes;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on, `host:port`.
    pub listen: String,
    /// If true, ignore SIGTERM and wait for explicit /shutdown or SIGINT.
    /// Used in Kubernetes to allow graceful draining.
    pub await_explicit_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            await_explicit_shutdown: false,
        }
    }
}

impl ServerConfig {
    pub fn with_listen(mut self, listen: impl Into<String>) -> Self {
        self.listen = listen.into();
        self
    }

    pub fn with_await_explicit_shutdown(mut self, enabled: bool) -> Self {
        self.await_explicit_shutdown = enabled;
        self
    }
}

/// What ended the serve loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownCause {
    Interrupt,
    Terminate,
    Requested,
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Requested => "POST /shutdown",
        })
    }
}

/// Serve slice requests until a shutdown signal, then drain and stop the
/// service.
pub async fn serve(config: ServerConfig, service: Arc<SliceService>) -> anyhow::Result<()> {
    let shutdown_rx = service.shutdown_rx();
    let app = routes(Arc::clone(&service));

    let listener = TcpListener::bind(config.listen.as_str()).await?;
    let actual_addr = listener.local_addr()?;

    info!("Starting seismux server on {}", actual_addr);

    let drain = {
        let service = Arc::clone(&service);
        async move {
            let cause = shutdown_signal(config.await_explicit_shutdown, shutdown_rx).await;
            info!(%cause, "Draining in-flight slice requests");
            service.set_health(Health::Draining).await;
        }
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(drain)
        .await?;

    info!("Server shutdown complete");

    service.shutdown().await;

    Ok(())
}

async fn shutdown_signal(
    await_explicit_shutdown: bool,
    mut shutdown_rx: watch::Receiver<bool>,
) -> ShutdownCause {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    let requested = async {
        // A closed channel means nobody can request shutdown any more.
        if shutdown_rx.wait_for(|requested| *requested).await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = interrupt => ShutdownCause::Interrupt,
        _ = terminate_signal(await_explicit_shutdown) => ShutdownCause::Terminate,
        _ = requested => ShutdownCause::Requested,
    }
}

/// Resolves on SIGTERM, or never when shutdown must be explicit.
#[cfg(unix)]
async fn terminate_signal(await_explicit_shutdown: bool) {
    use tokio::signal::unix::{SignalKind, signal};

    if await_explicit_shutdown {
        info!("Ignoring SIGTERM until /shutdown or SIGINT");
        return std::future::pending().await;
    }
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!(error = %e, "Cannot listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal(_await_explicit_shutdown: bool) {
    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.listen, "0.0.0.0:8080");
        assert!(!config.await_explicit_shutdown);
    }

    #[test]
    fn server_config_builders() {
        let config = ServerConfig::default()
            .with_listen("127.0.0.1:0")
            .with_await_explicit_shutdown(true);
        assert_eq!(config.listen, "127.0.0.1:0");
        assert!(config.await_explicit_shutdown);
    }

    #[tokio::test]
    async fn shutdown_request_ends_signal_wait() {
        let (tx, rx) = watch::channel(false);
        let waiting = tokio::spawn(shutdown_signal(true, rx));

        tx.send(true).unwrap();
        assert_eq!(waiting.await.unwrap(), ShutdownCause::Requested);
    }

    #[tokio::test]
    async fn earlier_request_is_not_missed() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        assert_eq!(shutdown_signal(true, rx).await, ShutdownCause::Requested);
    }

    #[test]
    fn shutdown_cause_names_source() {
        assert_eq!(ShutdownCause::Terminate.to_string(), "SIGTERM");
        assert_eq!(ShutdownCause::Requested.to_string(), "POST /shutdown");
    }
}

//! Addressed-message transport between the dispatcher and the worker fleet.
//!
//! Backings:
//! - **channel**: in-process tokio channels (embedded core, tests)
//! - **tcp**: [`MultipartCodec`] frames over TCP sockets
//!
//! The dispatcher binds all endpoints. Workers connect: they pull jobs from
//! the job endpoint and push fragments and failures to the result and
//! failure endpoints.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::MultipartCodec;
use super::protocol::Multipart;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Peer refused or dropped the connection. Workers retry on this.
    #[error("host unreachable: {0}")]
    HostUnreachable(String),
    #[error("no peer connected to {0}")]
    NoPeers(String),
    #[error("transport closed")]
    Closed,
    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),
    #[error(transparent)]
    Io(io::Error),
}

impl TransportError {
    pub fn is_host_unreachable(&self) -> bool {
        matches!(self, Self::HostUnreachable(_))
    }

    fn from_io(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::AddrNotAvailable => Self::HostUnreachable(e.to_string()),
            _ => Self::Io(e),
        }
    }
}

/// Outbound half of an addressed-message transport.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, message: Multipart) -> Result<(), TransportError>;
}

/// Inbound half of an addressed-message transport.
///
/// `None` means the source is closed for good. An `Err` item affects one
/// message or one connection, not the whole source.
#[async_trait]
pub trait MessageSource: Send {
    async fn recv(&mut self) -> Option<io::Result<Multipart>>;
}

/// Normalize `tcp://host:port` (or bare `host:port`) into a socket address
/// string. `*` as host means all interfaces.
pub fn parse_endpoint(endpoint: &str) -> Result<String, TransportError> {
    let addr = endpoint.strip_prefix("tcp://").unwrap_or(endpoint);
    let Some((host, port)) = addr.rsplit_once(':') else {
        return Err(TransportError::InvalidEndpoint(endpoint.to_string()));
    };
    if host.is_empty() || host.contains("://") || port.parse::<u16>().is_err() {
        return Err(TransportError::InvalidEndpoint(endpoint.to_string()));
    }
    let host = if host == "*" { "0.0.0.0" } else { host };
    Ok(format!("{}:{}", host, port))
}

// ============================================================================
// In-process channels
// ============================================================================

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Multipart>,
}

pub struct ChannelSource {
    rx: mpsc::Receiver<Multipart>,
}

/// Bounded in-process transport. Sends wait for capacity.
pub fn channel(capacity: usize) -> (ChannelSink, ChannelSource) {
    let (tx, rx) = mpsc::channel(capacity);
    (ChannelSink { tx }, ChannelSource { rx })
}

impl ChannelSink {
    /// Messages sent but not yet received.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send(&self, message: Multipart) -> Result<(), TransportError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn recv(&mut self) -> Option<io::Result<Multipart>> {
        self.rx.recv().await.map(Ok)
    }
}

// ============================================================================
// TCP: dispatcher side
// ============================================================================

/// Pause after a failed accept. Errors such as EMFILE persist until some
/// connection closes.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

async fn accept_failed(local_addr: SocketAddr, error: io::Error) {
    tracing::warn!(%local_addr, error = %error, "Accept failed, backing off");
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

struct Peer {
    addr: SocketAddr,
    writer: FramedWrite<OwnedWriteHalf, MultipartCodec>,
    alive: Arc<AtomicBool>,
}

/// Bound job endpoint. Each message goes to exactly one connected worker,
/// round-robin.
pub struct TcpFanout {
    endpoint: String,
    local_addr: SocketAddr,
    peers: Arc<Mutex<VecDeque<Peer>>>,
    peer_joined: Arc<Notify>,
    peer_wait: Duration,
    accept_task: JoinHandle<()>,
}

impl TcpFanout {
    /// Bind the job endpoint. `peer_wait` bounds how long a send waits for a
    /// worker to connect before failing with [`TransportError::NoPeers`].
    pub async fn bind(endpoint: &str, peer_wait: Duration) -> Result<Self, TransportError> {
        let addr = parse_endpoint(endpoint)?;
        let listener = TcpListener::bind(&addr).await.map_err(TransportError::Io)?;
        let local_addr = listener.local_addr().map_err(TransportError::Io)?;

        let peers: Arc<Mutex<VecDeque<Peer>>> = Arc::new(Mutex::new(VecDeque::new()));
        let peer_joined = Arc::new(Notify::new());

        let accept_task = tokio::spawn({
            let peers = Arc::clone(&peers);
            let peer_joined = Arc::clone(&peer_joined);
            async move {
                loop {
                    let (stream, addr) = match listener.accept().await {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            accept_failed(local_addr, e).await;
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    let (mut read_half, write_half) = stream.into_split();
                    let alive = Arc::new(AtomicBool::new(true));

                    // Workers never write on the job connection; EOF means gone.
                    tokio::spawn({
                        let alive = Arc::clone(&alive);
                        async move {
                            let mut buf = [0u8; 64];
                            while let Ok(n) = read_half.read(&mut buf).await {
                                if n == 0 {
                                    break;
                                }
                            }
                            alive.store(false, Ordering::Release);
                            tracing::info!(%addr, "Worker disconnected from job endpoint");
                        }
                    });

                    tracing::info!(%addr, "Worker connected to job endpoint");
                    peers.lock().await.push_back(Peer {
                        addr,
                        writer: FramedWrite::new(write_half, MultipartCodec::new()),
                        alive,
                    });
                    peer_joined.notify_waiters();
                }
            }
        });

        tracing::info!(endpoint, %local_addr, "Job endpoint bound");

        Ok(Self {
            endpoint: endpoint.to_string(),
            local_addr,
            peers,
            peer_joined,
            peer_wait,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn peer_count(&self) -> usize {
        self.peers
            .lock()
            .await
            .iter()
            .filter(|p| p.alive.load(Ordering::Acquire))
            .count()
    }

    async fn try_send(&self, message: &Multipart) -> Option<Result<(), TransportError>> {
        let mut peers = self.peers.lock().await;
        while let Some(mut peer) = peers.pop_front() {
            if !peer.alive.load(Ordering::Acquire) {
                continue;
            }
            match peer.writer.send(message.clone()).await {
                Ok(()) => {
                    peers.push_back(peer);
                    return Some(Ok(()));
                }
                Err(e) => {
                    tracing::warn!(addr = %peer.addr, error = %e, "Dropping worker after failed send");
                }
            }
        }
        None
    }
}

#[async_trait]
impl MessageSink for TcpFanout {
    async fn send(&self, message: Multipart) -> Result<(), TransportError> {
        let deadline = tokio::time::Instant::now() + self.peer_wait;
        loop {
            // Register interest before checking so a join between the check
            // and the wait is not missed.
            let joined = self.peer_joined.notified();
            tokio::pin!(joined);
            joined.as_mut().enable();

            if let Some(result) = self.try_send(&message).await {
                return result;
            }
            if tokio::time::timeout_at(deadline, joined).await.is_err() {
                return Err(TransportError::NoPeers(self.endpoint.clone()));
            }
        }
    }
}

impl Drop for TcpFanout {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Bound inbound endpoints (results and failures) merged into one source.
pub struct TcpInbound {
    rx: mpsc::Receiver<io::Result<Multipart>>,
    local_addrs: Vec<SocketAddr>,
    accept_tasks: Vec<JoinHandle<()>>,
}

impl TcpInbound {
    pub async fn bind(endpoints: &[&str]) -> Result<Self, TransportError> {
        let (tx, rx) = mpsc::channel(1024);
        let mut local_addrs = Vec::with_capacity(endpoints.len());
        let mut accept_tasks = Vec::with_capacity(endpoints.len());

        for endpoint in endpoints {
            let addr = parse_endpoint(endpoint)?;
            let listener = TcpListener::bind(&addr).await.map_err(TransportError::Io)?;
            let local_addr = listener.local_addr().map_err(TransportError::Io)?;
            tracing::info!(endpoint, %local_addr, "Inbound endpoint bound");
            local_addrs.push(local_addr);
            accept_tasks.push(tokio::spawn(accept_inbound(listener, local_addr, tx.clone())));
        }

        Ok(Self {
            rx,
            local_addrs,
            accept_tasks,
        })
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }
}

async fn accept_inbound(
    listener: TcpListener,
    local_addr: SocketAddr,
    tx: mpsc::Sender<io::Result<Multipart>>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                accept_failed(local_addr, e).await;
                continue;
            }
        };
        tracing::debug!(%addr, "Worker connected to inbound endpoint");
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut reader = FramedRead::new(stream, MultipartCodec::new());
            while let Some(frame) = reader.next().await {
                let failed = frame.is_err();
                if tx.send(frame).await.is_err() {
                    return;
                }
                // Framing is lost after a decode error.
                if failed {
                    break;
                }
            }
            tracing::debug!(%addr, "Inbound connection closed");
        });
    }
}

#[async_trait]
impl MessageSource for TcpInbound {
    async fn recv(&mut self) -> Option<io::Result<Multipart>> {
        self.rx.recv().await
    }
}

impl Drop for TcpInbound {
    fn drop(&mut self) {
        for task in &self.accept_tasks {
            task.abort();
        }
    }
}

// ============================================================================
// TCP: worker side
// ============================================================================

/// Worker connection to the job endpoint.
pub struct TcpPull {
    reader: FramedRead<TcpStream, MultipartCodec>,
}

impl TcpPull {
    pub async fn connect(endpoint: &str) -> Result<Self, TransportError> {
        let addr = parse_endpoint(endpoint)?;
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(TransportError::from_io)?;
        tracing::info!(endpoint, "Connected to job endpoint");
        Ok(Self {
            reader: FramedRead::new(stream, MultipartCodec::new()),
        })
    }
}

#[async_trait]
impl MessageSource for TcpPull {
    async fn recv(&mut self) -> Option<io::Result<Multipart>> {
        self.reader.next().await
    }
}

/// Worker connection to a result or failure endpoint. Connects on first
/// send and reconnects after a failed one.
pub struct TcpPush {
    addr: String,
    writer: Mutex<Option<FramedWrite<TcpStream, MultipartCodec>>>,
}

impl TcpPush {
    pub fn new(endpoint: &str) -> Result<Self, TransportError> {
        Ok(Self {
            addr: parse_endpoint(endpoint)?,
            writer: Mutex::new(None),
        })
    }
}

#[async_trait]
impl MessageSink for TcpPush {
    async fn send(&self, message: Multipart) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(writer) => writer,
            None => {
                let stream = TcpStream::connect(&self.addr)
                    .await
                    .map_err(TransportError::from_io)?;
                let _ = stream.set_nodelay(true);
                tracing::debug!(addr = %self.addr, "Connected reply socket");
                guard.insert(FramedWrite::new(stream, MultipartCodec::new()))
            }
        };
        if let Err(e) = writer.send(message).await {
            *guard = None;
            return Err(TransportError::from_io(e));
        }
        Ok(())
    }
}

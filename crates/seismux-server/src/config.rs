use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use seismux::bridge::protocol::MAX_FRAGMENT_COUNT;
use seismux::bridge::transport::parse_endpoint;
use seismux::transport::ServerConfig;
use seismux::{ServiceConfig, WorkerConfig};

/// Command line for the `seismux-server` binary.
///
/// Every option falls back to an environment variable, and a `.env` file in
/// the working directory is loaded before parsing.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "seismux-server",
    version,
    about = "Schedules seismic slice queries onto workers and reassembles their partial results"
)]
pub struct ServeArgs {
    /// HTTP listen address, `host:port`.
    #[arg(long, env = "SEISMUX_LISTEN", default_value_t = String::from("0.0.0.0:8080"))]
    pub listen: String,

    /// Endpoint workers connect to for jobs.
    #[arg(long, env = "SEISMUX_JOB_ADDR", default_value_t = String::from("tcp://0.0.0.0:6144"))]
    pub job_addr: String,

    /// Endpoint workers push partial results to.
    #[arg(long, env = "SEISMUX_RESULT_ADDR", default_value_t = String::from("tcp://0.0.0.0:6143"))]
    pub result_addr: String,

    /// Endpoint workers push failures to.
    #[arg(long, env = "SEISMUX_FAILURE_ADDR", default_value_t = String::from("tcp://0.0.0.0:6142"))]
    pub failure_addr: String,

    /// Storage account URL handed to workers with every job.
    #[arg(long, env = "SEISMUX_STORAGE_URL", default_value_t = String::new())]
    pub storage_url: String,

    /// How long a slice request waits for its job before answering 504.
    #[arg(long, env = "SEISMUX_REQUEST_TIMEOUT_MS", default_value_t = 15_000)]
    pub request_timeout_ms: u64,

    /// How long a job send waits for a worker to connect.
    #[arg(long, env = "SEISMUX_PEER_WAIT_MS", default_value_t = 1_000)]
    pub peer_wait_ms: u64,

    /// Ignore SIGTERM and wait for `POST /shutdown` or SIGINT.
    #[arg(long, env = "SEISMUX_AWAIT_EXPLICIT_SHUTDOWN", default_value_t = false)]
    pub await_explicit_shutdown: bool,

    /// Run the mock worker in-process over channels instead of binding TCP
    /// endpoints.
    #[arg(long, env = "SEISMUX_EMBEDDED_CORE", default_value_t = false)]
    pub embedded_core: bool,

    /// Fragments per result for the embedded worker.
    #[arg(long, env = "SEISMUX_EMBEDDED_FRAGMENTS", default_value_t = 100)]
    pub embedded_fragments: u32,
}

/// Where jobs go and replies come from.
#[derive(Debug, Clone)]
pub enum Backend {
    Tcp {
        job_addr: String,
        result_addr: String,
        failure_addr: String,
        peer_wait: Duration,
    },
    Embedded(WorkerConfig),
}

#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub server: ServerConfig,
    pub service: ServiceConfig,
    pub backend: Backend,
}

impl TryFrom<ServeArgs> for ServeConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        if args.request_timeout_ms == 0 {
            bail!("SEISMUX_REQUEST_TIMEOUT_MS must be greater than 0");
        }

        let backend = if args.embedded_core {
            Backend::Embedded(WorkerConfig::default().with_fragments(check_fragments(
                args.embedded_fragments,
                "SEISMUX_EMBEDDED_FRAGMENTS",
            )?))
        } else {
            for (name, endpoint) in [
                ("SEISMUX_JOB_ADDR", &args.job_addr),
                ("SEISMUX_RESULT_ADDR", &args.result_addr),
                ("SEISMUX_FAILURE_ADDR", &args.failure_addr),
            ] {
                parse_endpoint(endpoint).with_context(|| format!("invalid {name}"))?;
            }
            Backend::Tcp {
                job_addr: args.job_addr,
                result_addr: args.result_addr,
                failure_addr: args.failure_addr,
                peer_wait: Duration::from_millis(args.peer_wait_ms),
            }
        };

        Ok(Self {
            server: ServerConfig::default()
                .with_listen(args.listen)
                .with_await_explicit_shutdown(args.await_explicit_shutdown),
            service: ServiceConfig::default()
                .with_storage_endpoint(args.storage_url)
                .with_request_timeout(Duration::from_millis(args.request_timeout_ms)),
            backend,
        })
    }
}

/// Command line for the `seismux-mock-core` binary.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "seismux-mock-core",
    version,
    about = "Mock slice worker answering every query with a canned slice"
)]
pub struct MockCoreArgs {
    /// Job endpoint to pull from.
    #[arg(long, env = "SEISMUX_JOB_ADDR", default_value_t = String::from("tcp://localhost:6144"))]
    pub job_addr: String,

    /// Result endpoint to push fragments to.
    #[arg(long, env = "SEISMUX_RESULT_ADDR", default_value_t = String::from("tcp://localhost:6143"))]
    pub result_addr: String,

    /// Failure endpoint to push failures to.
    #[arg(long, env = "SEISMUX_FAILURE_ADDR", default_value_t = String::from("tcp://localhost:6142"))]
    pub failure_addr: String,

    /// Fragments each result is split into.
    #[arg(long, env = "SEISMUX_FRAGMENTS", default_value_t = 100)]
    pub fragments: u32,

    /// Pause between retries while an endpoint is unreachable.
    #[arg(long, env = "SEISMUX_RETRY_BACKOFF_MS", default_value_t = 100)]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone)]
pub struct MockCoreConfig {
    pub job_addr: String,
    pub result_addr: String,
    pub failure_addr: String,
    pub worker: WorkerConfig,
}

impl TryFrom<MockCoreArgs> for MockCoreConfig {
    type Error = anyhow::Error;

    fn try_from(args: MockCoreArgs) -> Result<Self, Self::Error> {
        for (name, endpoint) in [
            ("SEISMUX_JOB_ADDR", &args.job_addr),
            ("SEISMUX_RESULT_ADDR", &args.result_addr),
            ("SEISMUX_FAILURE_ADDR", &args.failure_addr),
        ] {
            parse_endpoint(endpoint).with_context(|| format!("invalid {name}"))?;
        }

        let worker = WorkerConfig::default()
            .with_fragments(check_fragments(args.fragments, "SEISMUX_FRAGMENTS")?)
            .with_retry_backoff(Duration::from_millis(args.retry_backoff_ms));

        Ok(Self {
            job_addr: args.job_addr,
            result_addr: args.result_addr,
            failure_addr: args.failure_addr,
            worker,
        })
    }
}

fn check_fragments(fragments: u32, name: &str) -> anyhow::Result<u32> {
    if fragments == 0 || fragments > MAX_FRAGMENT_COUNT {
        bail!("{name} ({fragments}) must be within 1..={MAX_FRAGMENT_COUNT}");
    }
    Ok(fragments)
}

use std::sync::Arc;

use clap::Parser;
use seismux::bridge::transport::{TcpPull, TcpPush};
use seismux::{CannedSlice, ReplySinks, run_worker};
use seismux_server::config::{MockCoreArgs, MockCoreConfig};
use seismux_server::logging::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = MockCoreArgs::parse();
    let config = MockCoreConfig::try_from(args)?;

    init_tracing();

    // The scheduler may not be up yet.
    let jobs = loop {
        match TcpPull::connect(&config.job_addr).await {
            Ok(jobs) => break jobs,
            Err(e) if e.is_host_unreachable() => {
                tracing::warn!(endpoint = %config.job_addr, error = %e, "Job endpoint unreachable, retrying");
                tokio::time::sleep(config.worker.retry_backoff).await;
            }
            Err(e) => return Err(e.into()),
        }
    };

    let replies = ReplySinks {
        results: Arc::new(TcpPush::new(&config.result_addr)?),
        failures: Arc::new(TcpPush::new(&config.failure_addr)?),
    };

    run_worker(jobs, replies, Arc::new(CannedSlice::reference()), config.worker).await?;
    Ok(())
}

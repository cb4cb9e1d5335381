use std::sync::Arc;

use clap::Parser;
use seismux::bridge::transport::{self, MessageSink, TcpFanout, TcpInbound};
use seismux::{CannedSlice, ReplySinks, SliceService, run_worker};
use seismux_server::config::{Backend, ServeArgs, ServeConfig};
use seismux_server::logging::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = ServeArgs::parse();
    let config = ServeConfig::try_from(args)?;

    init_tracing();
    tracing::info!(version = seismux::SEISMUX_VERSION, "Starting seismux");

    let service = match config.backend {
        Backend::Tcp {
            job_addr,
            result_addr,
            failure_addr,
            peer_wait,
        } => {
            let jobs = TcpFanout::bind(&job_addr, peer_wait).await?;
            let inbound =
                TcpInbound::bind(&[result_addr.as_str(), failure_addr.as_str()]).await?;
            SliceService::start(config.service, Arc::new(jobs), inbound)
        }
        Backend::Embedded(worker_config) => {
            tracing::info!(fragments = worker_config.fragments, "Running embedded mock core");
            let (job_sink, jobs) = transport::channel(1024);
            let (reply_sink, inbound) = transport::channel(4096);
            let reply_sink: Arc<dyn MessageSink> = Arc::new(reply_sink);
            let replies = ReplySinks {
                results: Arc::clone(&reply_sink),
                failures: reply_sink,
            };
            tokio::spawn(async move {
                let handler = Arc::new(CannedSlice::reference());
                if let Err(e) = run_worker(jobs, replies, handler, worker_config).await {
                    tracing::error!(error = %e, "Embedded mock core stopped");
                }
            });
            SliceService::start(config.service, Arc::new(job_sink), inbound)
        }
    };

    seismux::transport::serve(config.server, Arc::new(service)).await
}

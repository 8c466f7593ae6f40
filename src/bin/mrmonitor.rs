use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use tarpc::{client, context, tokio_serde::formats::Json};
use tokio::time::sleep;
use wet_word_count::{
    mr::coordinator::{JobState, MonitorClient},
    telemetry,
};

/// Poll the status of a running word count job until it finishes
#[derive(Parser, Debug)]
struct Args {
    /// The address passed to `wordcount run --monitor-addr`
    address: SocketAddr,
    /// Seconds between two polls
    #[arg(long, default_value_t = 1)]
    interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing()?;
    let args = Args::parse();

    // Connect to the server
    let client_transport = match tarpc::serde_transport::tcp::connect(args.address, Json::default).await {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(
                "[Monitor] Failed to connect to the job at {}, please check the job status! Error Message: {}",
                args.address,
                e
            );
            return Ok(());
        }
    };

    let client = MonitorClient::new(client::Config::default(), client_transport).spawn();

    loop {
        let status = match client.status(context::current()).await {
            Ok(status) => status,
            Err(e) => {
                // The job process exits as soon as its output is written
                tracing::info!("[Monitor] The job is no longer reachable, it has most likely exited: {}", e);
                return Ok(());
            }
        };
        tracing::info!(
            "[Monitor] {:?} | shards {}/{} done, {} failed | Records Fetched: {} | Records Collected: {}",
            status.state,
            status.shards_succeeded + status.shards_failed,
            status.shards_total,
            status.shards_failed,
            status.counters.records_fetched,
            status.counters.records_collected
        );
        if status.state.is_terminal() {
            if status.state == JobState::Failed {
                tracing::warn!("[Monitor] The job has failed");
            }
            return Ok(());
        }
        sleep(Duration::from_secs(args.interval_secs)).await;
    }
}

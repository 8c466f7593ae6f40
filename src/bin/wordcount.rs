use std::{net::SocketAddr, path::PathBuf, process::ExitCode, time::Duration};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use wet_word_count::{
    mr::{
        combiner,
        config::{DriverConfig, JobConfig, DEFAULT_MAX_FAILURE_PERCENT},
        coordinator::{self, Coordinator},
        counters::Counters,
    },
    output, telemetry,
};

/// Word count over Common Crawl WET (WARC Encoded Text) segments
#[derive(Parser, Debug)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Count the words of every conversion record under <INPUT>
    Run(RunArgs),
    /// Merge the outputs of earlier runs into a single output
    Combine(CombineArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// A WET file or a directory of WET files, `.gz` files are decompressed
    input: PathBuf,
    /// The directory receiving the `mr-*.txt[.gz]` partition files
    output: PathBuf,
    /// Only process the first <MAX_FILES> input files
    max_files: Option<usize>,
    /// The number of shards processed concurrently, defaults to the number of CPUs
    #[arg(long, env = "WORDCOUNT_WORKERS")]
    workers: Option<usize>,
    /// The percentage of input files allowed to fail
    #[arg(long, env = "WORDCOUNT_MAX_FAILURE_PERCENT", default_value_t = DEFAULT_MAX_FAILURE_PERCENT)]
    max_failure_percent: u32,
    /// Count an input file as failed once it runs longer than this
    #[arg(long, env = "WORDCOUNT_SHARD_TIMEOUT_SECS")]
    shard_timeout_secs: Option<u64>,
    #[command(flatten)]
    output_args: OutputArgs,
    /// Lowercase words before counting them
    #[arg(long, env = "WORDCOUNT_CASE_FOLD")]
    case_fold: bool,
    /// Serve the job status over RPC on this address
    #[arg(long, env = "WORDCOUNT_MONITOR_ADDR")]
    monitor_addr: Option<SocketAddr>,
}

#[derive(Args, Debug)]
struct CombineArgs {
    /// The directory receiving the combined partition files
    output: PathBuf,
    /// Outputs of earlier runs, directories or single partition files
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    #[command(flatten)]
    output_args: OutputArgs,
}

#[derive(Args, Debug)]
struct OutputArgs {
    /// The number of output partitions
    #[arg(long, env = "WORDCOUNT_REDUCE_N", default_value_t = 1)]
    reduce_n: usize,
    /// Write plain text partitions instead of gzip
    #[arg(long, env = "WORDCOUNT_NO_COMPRESS")]
    no_compress: bool,
}

impl RunArgs {
    fn into_config(self) -> (JobConfig, Option<SocketAddr>) {
        let mut driver = DriverConfig::default();
        if let Some(workers) = self.workers {
            driver.worker_n = workers;
        }
        driver.max_failure_percent = self.max_failure_percent;
        driver.shard_timeout = self.shard_timeout_secs.map(Duration::from_secs);
        driver.case_fold = self.case_fold;

        let mut config = JobConfig::new(self.input, self.output);
        config.max_files = self.max_files;
        config.reduce_n = self.output_args.reduce_n;
        config.compress = !self.output_args.no_compress;
        config.driver = driver;
        (config, self.monitor_addr)
    }
}

async fn run(args: RunArgs) -> anyhow::Result<ExitCode> {
    let (config, monitor_addr) = args.into_config();
    tracing::info!(
        "[Job Configuration] input {} | output {} | max files {} | #{} workers | {}% failures allowed",
        config.input.display(),
        config.output.display(),
        config.max_files.map_or("all".to_string(), |n| n.to_string()),
        config.driver.worker_n,
        config.driver.max_failure_percent
    );

    let shards = match coordinator::segment_shards(&config) {
        Ok(shards) => shards,
        Err(e) => {
            tracing::error!("[Job] Invalid configuration: {}", e);
            return Ok(ExitCode::FAILURE);
        }
    };

    let coordinator = Coordinator::new(config.driver);
    if let Some(address) = monitor_addr {
        coordinator::serve_monitor(coordinator.clone(), address).await?;
    }

    let final_count = match coordinator.run(shards).await {
        Ok(final_count) => final_count,
        Err(e) => {
            tracing::error!("[Job] The job has failed: {}", e);
            return Ok(ExitCode::FAILURE);
        }
    };

    let paths = tokio::task::spawn_blocking(move || {
        output::write_counts(&config.output, &final_count, config.reduce_n, config.compress)
    })
    .await?
    .context("Failed to write the job output")?;

    let counters = coordinator.counter_snapshot();
    tracing::info!(
        "[Job] Records Fetched: {} | Records Collected: {} | results written to {} file(s)",
        counters.records_fetched,
        counters.records_collected,
        paths.len()
    );
    Ok(ExitCode::SUCCESS)
}

async fn combine(args: CombineArgs) -> anyhow::Result<ExitCode> {
    if args.output_args.reduce_n == 0 {
        tracing::error!("[Combine] The reduce task number must be at least 1");
        return Ok(ExitCode::FAILURE);
    }

    let paths = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let counters = Counters::default();
        let combined = combiner::combine_outputs(&args.inputs, &counters)?;
        tracing::info!(
            "[Combine] Records Fetched: {} | {} distinct token(s)",
            counters.snapshot().records_fetched,
            combined.len()
        );
        output::write_counts(
            &args.output,
            &combined,
            args.output_args.reduce_n,
            !args.output_args.no_compress,
        )
    })
    .await??;

    tracing::info!("[Combine] Combined results written to {} file(s)", paths.len());
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    telemetry::init_tracing()?;
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Combine(args) => combine(args).await,
    }
}

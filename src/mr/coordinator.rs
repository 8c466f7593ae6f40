use std::{
    any::Any,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::{
    future::{ready, Ready},
    stream::FuturesUnordered,
    StreamExt,
};
use serde::{Deserialize, Serialize};
use tarpc::{context, server::incoming::Incoming, tokio_serde::formats::Json};
use tokio::{sync::Semaphore, task::JoinError};

use crate::{
    mr::{
        combiner::{self, FinalCount},
        config::{ConfigurationError, DriverConfig, JobConfig},
        counters::{CounterSnapshot, Counters},
        error::{JobError, ShardError},
        worker::{CancelFlag, Shard, ShardReport, Worker},
    },
    warc::{self, Record},
};

/// Lifecycle of a job, `Pending -> Running -> {Succeeded, Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// What the monitor service reports about a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    pub shards_total: usize,
    pub shards_succeeded: usize,
    pub shards_failed: usize,
    pub counters: CounterSnapshot,
}

#[derive(Debug)]
struct Progress {
    state: JobState,
    shards_total: usize,
    shards_succeeded: usize,
    shards_failed: usize,
}

/// The job driver
///
/// Dispatches shards to a bounded pool of workers, keeps the failure budget,
/// waits for every shard at the barrier and merges the surviving partials.
/// A coordinator runs a single job; clones share the same job and are used
/// to serve the monitor RPC.
#[derive(Debug, Clone)]
pub struct Coordinator {
    config: DriverConfig,
    /// The state machine and the shard tallies
    progress: Arc<Mutex<Progress>>,
    /// Records fetched and collected by every worker, updated as they go
    counters: Arc<Counters>,
}

/// `failed` shards out of `total` stay within a budget of `max_failure_percent`
/// as long as `failed <= floor(total * max_failure_percent / 100)`
pub fn within_failure_budget(failed: usize, total: usize, max_failure_percent: u32) -> bool {
    failed * 100 <= total * max_failure_percent as usize
}

fn panic_message(e: JoinError) -> String {
    if e.is_cancelled() {
        return "task was aborted".to_string();
    }
    let payload: Box<dyn Any + Send> = e.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run one shard once a worker slot frees up
async fn run_shard(
    worker: Worker,
    shard: Shard,
    semaphore: Arc<Semaphore>,
    counters: Arc<Counters>,
    timeout: Option<Duration>,
) -> Result<ShardReport, ShardError> {
    let permit = semaphore.acquire_owned().await.map_err(|_| ShardError::Cancelled)?;
    let cancel = worker.cancel_flag();
    if cancel.is_cancelled() {
        return Err(ShardError::Cancelled);
    }

    // The slot is freed when the blocking thread returns, which can be well
    // after a timeout is reported
    let handle = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        worker.map(shard, &counters)
    });
    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, handle).await {
            Ok(joined) => joined,
            Err(_) => {
                // The blocking thread notices the flag before its next record
                cancel.cancel();
                return Err(ShardError::TimedOut(limit));
            }
        },
        None => handle.await,
    };
    joined.map_err(|e| ShardError::Panicked(panic_message(e)))?
}

impl Coordinator {
    /// Create a new coordinator
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            progress: Arc::new(Mutex::new(Progress {
                state: JobState::Pending,
                shards_total: 0,
                shards_succeeded: 0,
                shards_failed: 0,
            })),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        // The tallies are plain integers, a panic elsewhere can't leave them torn
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> JobState {
        self.progress().state
    }

    pub fn counter_snapshot(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn job_status(&self) -> JobStatus {
        let progress = self.progress();
        JobStatus {
            state: progress.state,
            shards_total: progress.shards_total,
            shards_succeeded: progress.shards_succeeded,
            shards_failed: progress.shards_failed,
            counters: self.counters.snapshot(),
        }
    }

    /// Move from `Pending` to `Running`, a coordinator only runs once
    fn start(&self, shards_total: usize) -> Result<(), JobError> {
        let mut progress = self.progress();
        if progress.state != JobState::Pending {
            return Err(JobError::AlreadyStarted);
        }
        progress.state = JobState::Running;
        progress.shards_total = shards_total;
        Ok(())
    }

    fn finish(&self, state: JobState) {
        let mut progress = self.progress();
        assert_eq!(progress.state, JobState::Running);
        progress.state = state;
    }

    /// Run the job over `shards` and return the merged counts
    ///
    /// Failed shards are dropped as long as the failure budget allows it,
    /// past that point the remaining shards are cancelled and the job fails.
    pub async fn run(&self, shards: Vec<Shard>) -> Result<FinalCount, JobError> {
        self.config.validate()?;
        let total = shards.len();
        self.start(total)?;
        tracing::info!(
            "[Job] Dispatching {} shard(s) to {} worker(s), up to {}% of shards may fail",
            total,
            self.config.worker_n,
            self.config.max_failure_percent
        );

        let semaphore = Arc::new(Semaphore::new(self.config.worker_n));
        let mut cancel_flags = Vec::with_capacity(total);
        let mut abort_handles = Vec::with_capacity(total);
        let mut running = FuturesUnordered::new();
        for shard in shards {
            let shard_id = shard.id();
            let cancel = CancelFlag::default();
            let worker = Worker::new(self.config.case_fold).with_cancel(cancel.clone());
            let handle = tokio::spawn(run_shard(
                worker,
                shard,
                Arc::clone(&semaphore),
                Arc::clone(&self.counters),
                self.config.shard_timeout,
            ));
            cancel_flags.push(cancel);
            abort_handles.push(handle.abort_handle());
            running.push(async move { (shard_id, handle.await) });
        }

        let mut partials = Vec::with_capacity(total);
        let mut failed = 0;
        let mut first_failure = None;
        // The barrier, every shard reports before anything is merged
        while let Some((shard_id, joined)) = running.next().await {
            let result = joined.map_err(|e| ShardError::Panicked(panic_message(e))).and_then(|r| r);
            match result {
                Ok(report) => {
                    self.progress().shards_succeeded += 1;
                    tracing::debug!("[Map] Shard #{} has been finished", report.shard_id);
                    partials.push(report.partial);
                }
                Err(error) => {
                    failed += 1;
                    self.progress().shards_failed += 1;
                    tracing::warn!("[Map] Shard #{} failed: {}", shard_id, error);
                    let (first_shard, first_error) = first_failure.take().unwrap_or((shard_id, error));
                    if within_failure_budget(failed, total, self.config.max_failure_percent) {
                        first_failure = Some((first_shard, first_error));
                        continue;
                    }

                    cancel_flags.iter().for_each(CancelFlag::cancel);
                    abort_handles.iter().for_each(|h| h.abort());
                    self.finish(JobState::Failed);
                    tracing::error!(
                        "[Job] {} of {} shard(s) failed, over the {}% budget, cancelling the job",
                        failed,
                        total,
                        self.config.max_failure_percent
                    );
                    return Err(JobError::Failed {
                        failed,
                        total,
                        max_failure_percent: self.config.max_failure_percent,
                        first_shard,
                        first_error,
                    });
                }
            }
        }

        tracing::info!(
            "[Reduce] {} of {} shard(s) succeeded, merging their partial counts",
            partials.len(),
            total
        );
        let final_count = combiner::merge(partials);
        self.finish(JobState::Succeeded);

        let counters = self.counters.snapshot();
        tracing::info!(
            "[Job] Finished with {} distinct token(s), {} record(s) fetched, {} record(s) collected",
            final_count.len(),
            counters.records_fetched,
            counters.records_collected
        );
        Ok(final_count)
    }
}

/// Count the words of `records`, split into `worker_n` contiguous shards
pub async fn run(
    records: Vec<Record>,
    worker_n: usize,
    max_failure_percent: u32,
) -> Result<FinalCount, JobError> {
    let coordinator = Coordinator::new(DriverConfig::new(worker_n, max_failure_percent));
    let shards = Shard::split_records(records, worker_n);
    coordinator.run(shards).await
}

/// Validate `config` and build one shard per input file
pub fn segment_shards(config: &JobConfig) -> Result<Vec<Shard>, ConfigurationError> {
    config.validate()?;
    let files = warc::list_input_files(&config.input, config.max_files)
        .map_err(|e| ConfigurationError::InputUnreadable(config.input.clone(), e.to_string()))?;
    tracing::info!(
        "[Job] Found {} input file(s) under {}",
        files.len(),
        config.input.display()
    );
    Ok(Shard::segments(files))
}

/// RPC exposing the progress of a running job
#[tarpc::service]
pub trait Monitor {
    /// Get the state, shard tallies and counters of the job
    async fn status() -> JobStatus;
    /// Get the records fetched and collected so far
    async fn counters() -> CounterSnapshot;
}

#[tarpc::server]
impl Monitor for Coordinator {
    type StatusFut = Ready<JobStatus>;
    type CountersFut = Ready<CounterSnapshot>;

    fn status(self, _: context::Context) -> Self::StatusFut {
        ready(self.job_status())
    }

    fn counters(self, _: context::Context) -> Self::CountersFut {
        ready(self.counters.snapshot())
    }
}

/// Serve the monitor RPC for `coordinator` on `address`, returns the bound address
pub async fn serve_monitor(coordinator: Coordinator, address: SocketAddr) -> anyhow::Result<SocketAddr> {
    let server_transport = tarpc::serde_transport::tcp::listen(address, Json::default).await?;
    let local_addr = server_transport.local_addr();

    tokio::spawn(
        server_transport
            // Accepts if this is a valid connection, otherwise ignores this connection
            .filter_map(|r| async { r.ok() })
            .map(tarpc::server::BaseChannel::with_defaults)
            .execute(coordinator.serve()),
    );

    tracing::info!("[Monitor] Serving job status on {}", local_addr);
    Ok(local_addr)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
        time::{Duration, Instant},
    };

    use claims::{assert_err, assert_matches, assert_ok};
    use tarpc::client;

    use super::*;
    use crate::{
        mr::{function::wc, worker::RecordStream},
        warc::RecordError,
    };

    /// Tracks how many slow streams are inside a read at the same time
    #[derive(Clone, Default)]
    struct Gauge {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Gauge {
        /// A stream of `n` documents, each taking `delay` to read
        fn slow(&self, n: usize, delay: Duration) -> RecordStream {
            Box::new(Slow { remaining: n, delay, gauge: self.clone() })
        }
    }

    struct Slow {
        remaining: usize,
        delay: Duration,
        gauge: Gauge,
    }

    impl Iterator for Slow {
        type Item = Result<Record, RecordError>;

        fn next(&mut self) -> Option<Self::Item> {
            if self.remaining == 0 {
                return None;
            }
            self.remaining -= 1;
            let active = self.gauge.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.gauge.peak.fetch_max(active, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.gauge.active.fetch_sub(1, Ordering::SeqCst);
            Some(Ok(Record::conversion("slow")))
        }
    }

    fn corpus() -> Vec<Record> {
        vec![
            Record::Warcinfo,
            Record::conversion("Hello, World! World."),
            Record::Other("response".to_string()),
            Record::conversion("the quick brown fox"),
            Record::Metadata,
            Record::conversion("the lazy dog, the end"),
            Record::conversion(""),
        ]
    }

    fn expected(records: &[Record]) -> HashMap<String, u64> {
        let mut counts = HashMap::new();
        for record in records {
            if let Record::Conversion { body, .. } = record {
                for token in wc::normalize(body) {
                    *counts.entry(token).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    /// `n` shards of one document each, the ones listed in `failing` are malformed
    fn shards_with_failures(n: usize, failing: &[usize]) -> Vec<Shard> {
        (0..n)
            .map(|id| {
                let record = if failing.contains(&id) {
                    Err(RecordError::MissingContentLength)
                } else {
                    Ok(Record::conversion(format!("shard{} common", id)))
                };
                Shard::stream(id, Box::new(std::iter::once(record)))
            })
            .collect()
    }

    #[tokio::test]
    async fn counts_conversion_records_only() {
        let records = corpus();
        let counts = assert_ok!(run(records.clone(), 3, 0).await);

        assert_eq!(counts, expected(&records));
        assert_eq!(counts["the"], 3);
        assert_eq!(counts["World"], 2);
        assert!(!counts.contains_key("response"));
    }

    #[tokio::test]
    async fn conserves_the_token_total() {
        let records = corpus();
        let total_tokens: usize = records
            .iter()
            .filter_map(|r| match r {
                Record::Conversion { body, .. } => Some(wc::normalize(body).len()),
                _ => None,
            })
            .sum();

        for worker_n in [1, 2, 7, 16] {
            let counts = assert_ok!(run(records.clone(), worker_n, 5).await);
            assert_eq!(counts.values().sum::<u64>(), total_tokens as u64);
        }
    }

    #[tokio::test]
    async fn tracks_counters_and_state() {
        let coordinator = Coordinator::new(DriverConfig::new(2, 0));
        assert_eq!(coordinator.state(), JobState::Pending);

        let records = corpus();
        assert_ok!(coordinator.run(Shard::split_records(records, 2)).await);

        let status = coordinator.job_status();
        assert_eq!(status.state, JobState::Succeeded);
        assert_eq!(status.shards_total, 2);
        assert_eq!(status.shards_succeeded, 2);
        assert_eq!(status.counters.records_fetched, 7);
        // 2 + 4 + 4 distinct tokens in the three non-empty documents
        assert_eq!(status.counters.records_collected, 10);
    }

    #[tokio::test]
    async fn runs_only_once() {
        let coordinator = Coordinator::new(DriverConfig::new(1, 0));
        assert_ok!(coordinator.run(Vec::new()).await);
        assert_matches!(coordinator.run(Vec::new()).await, Err(JobError::AlreadyStarted));
    }

    #[tokio::test]
    async fn empty_input_succeeds_with_nothing() {
        let counts = assert_ok!(run(Vec::new(), 4, 5).await);
        assert!(counts.is_empty());
    }

    #[tokio::test]
    async fn tolerates_failures_within_budget() {
        let coordinator = Coordinator::new(DriverConfig::new(4, 20));
        let counts = assert_ok!(coordinator.run(shards_with_failures(10, &[2, 7])).await);

        // Failed shards contribute nothing
        assert_eq!(counts["common"], 8);
        assert!(!counts.contains_key("shard2"));
        assert!(!counts.contains_key("shard7"));
        assert_eq!(counts["shard9"], 1);

        let status = coordinator.job_status();
        assert_eq!(status.state, JobState::Succeeded);
        assert_eq!(status.shards_failed, 2);
        assert_eq!(status.shards_succeeded, 8);
    }

    #[tokio::test]
    async fn fails_one_past_the_budget() {
        let coordinator = Coordinator::new(DriverConfig::new(4, 20));
        let result = coordinator.run(shards_with_failures(10, &[1, 4, 8])).await;

        assert_matches!(result, Err(JobError::Failed { failed: 3, total: 10, max_failure_percent: 20, .. }));
        assert_eq!(coordinator.state(), JobState::Failed);
    }

    #[tokio::test]
    async fn zero_budget_fails_on_first_error() {
        let coordinator = Coordinator::new(DriverConfig::new(1, 0));
        let result = coordinator.run(shards_with_failures(3, &[0])).await;

        assert_matches!(result, Err(JobError::Failed { failed: 1, first_shard: 0, .. }));
    }

    #[test]
    fn failure_budget_boundary() {
        assert!(within_failure_budget(2, 10, 20));
        assert!(!within_failure_budget(3, 10, 20));
        // floor(19 * 5 / 100) == 0
        assert!(within_failure_budget(0, 19, 5));
        assert!(!within_failure_budget(1, 19, 5));
        assert!(within_failure_budget(1, 20, 5));
        assert!(within_failure_budget(10, 10, 100));
    }

    #[tokio::test]
    async fn invalid_driver_config_is_rejected_before_dispatch() {
        let coordinator = Coordinator::new(DriverConfig::new(0, 5));
        let result = coordinator.run(Shard::split_records(corpus(), 1)).await;

        assert_matches!(result, Err(JobError::Configuration(ConfigurationError::NoWorkers)));
        assert_eq!(coordinator.state(), JobState::Pending);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_shard_times_out() {
        let mut config = DriverConfig::new(2, 50);
        config.shard_timeout = Some(Duration::from_millis(200));
        let coordinator = Coordinator::new(config);
        let shards = vec![
            Shard::stream(0, Gauge::default().slow(usize::MAX, Duration::from_millis(50))),
            Shard::records(1, vec![Record::conversion("fast shard")]),
        ];

        let counts = assert_ok!(coordinator.run(shards).await);
        assert_eq!(counts["fast"], 1);
        assert_eq!(coordinator.job_status().shards_failed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timed_out_shard_keeps_its_slot_until_it_stops() {
        let gauge = Gauge::default();
        let mut config = DriverConfig::new(1, 100);
        config.shard_timeout = Some(Duration::from_millis(100));
        let coordinator = Coordinator::new(config);
        let shards = (0..4)
            .map(|id| Shard::stream(id, gauge.slow(1, Duration::from_millis(300))))
            .collect();

        assert_ok!(coordinator.run(shards).await);
        assert_eq!(coordinator.job_status().shards_failed, 4);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exceeding_the_budget_cancels_outstanding_shards() {
        let gauge = Gauge::default();
        let coordinator = Coordinator::new(DriverConfig::new(1, 0));
        let mut shards = shards_with_failures(1, &[0]);
        shards.extend((1..4).map(|id| Shard::stream(id, gauge.slow(50, Duration::from_millis(20)))));

        let started = Instant::now();
        let result = coordinator.run(shards).await;

        assert_matches!(result, Err(JobError::Failed { failed: 1, total: 4, first_shard: 0, .. }));
        // Left alone the slow shards would take 3s and fetch 150 records
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(coordinator.counter_snapshot().records_fetched < 5);
    }

    #[tokio::test]
    async fn panicking_worker_counts_as_failure() {
        let config = DriverConfig::new(1, 0);
        let coordinator = Coordinator::new(config);
        let stream: Box<dyn Iterator<Item = Result<Record, RecordError>> + Send> =
            Box::new(std::iter::once(()).map(|_| -> Result<Record, RecordError> { panic!("tokenizer crashed") }));

        let result = coordinator.run(vec![Shard::stream(0, stream)]).await;
        let error = assert_err!(result);
        assert_matches!(&error, JobError::Failed { first_error: ShardError::Panicked(msg), .. } if msg.contains("tokenizer crashed"));
    }

    #[tokio::test]
    async fn monitor_reports_status() {
        let coordinator = Coordinator::new(DriverConfig::new(2, 5));
        let address = assert_ok!(serve_monitor(coordinator.clone(), "127.0.0.1:0".parse().unwrap()).await);

        let transport = assert_ok!(tarpc::serde_transport::tcp::connect(address, Json::default).await);
        let client = MonitorClient::new(client::Config::default(), transport).spawn();

        let status = assert_ok!(client.status(context::current()).await);
        assert_eq!(status.state, JobState::Pending);

        assert_ok!(coordinator.run(Shard::split_records(corpus(), 2)).await);
        let status = assert_ok!(client.status(context::current()).await);
        assert_eq!(status.state, JobState::Succeeded);
        let counters = assert_ok!(client.counters(context::current()).await);
        assert_eq!(counters.records_fetched, 7);
    }
}

use std::{
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{
    mr::{
        counters::Counters,
        error::ShardError,
        function::wc::{self, PartialCount},
    },
    warc::{self, Record, RecordError},
};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct KeyValue {
    key: String,
    value: u64,
}

impl KeyValue {
    pub fn new(key: String, value: u64) -> Self {
        Self { key, value }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> u64 {
        self.value
    }
}

/// The signature of a map function, `wc::map` for word count
pub type MapFunc = fn(&Record, bool) -> Vec<KeyValue>;

/// Any source of records, one WET segment or an in-memory sequence
pub type RecordStream = Box<dyn Iterator<Item = Result<Record, RecordError>> + Send>;

enum ShardInput {
    Records(Vec<Record>),
    Segment(PathBuf),
    Stream(RecordStream),
}

/// One unit of parallel work, handed to exactly one worker
pub struct Shard {
    id: usize,
    input: ShardInput,
}

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let input = match &self.input {
            ShardInput::Records(records) => format!("{} record(s)", records.len()),
            ShardInput::Segment(path) => path.display().to_string(),
            ShardInput::Stream(_) => "stream".to_string(),
        };
        f.debug_struct("Shard").field("id", &self.id).field("input", &input).finish()
    }
}

impl Shard {
    pub fn records(id: usize, records: Vec<Record>) -> Self {
        Self { id, input: ShardInput::Records(records) }
    }

    /// A whole WET file, opened by the worker that picks it up
    pub fn segment(id: usize, path: PathBuf) -> Self {
        Self { id, input: ShardInput::Segment(path) }
    }

    pub fn stream(id: usize, stream: RecordStream) -> Self {
        Self { id, input: ShardInput::Stream(stream) }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Split a record sequence into at most `shard_n` contiguous shards
    pub fn split_records(records: Vec<Record>, shard_n: usize) -> Vec<Shard> {
        let size = records.len().div_ceil(shard_n.max(1)).max(1);
        let mut shards = Vec::new();
        let mut records = records.into_iter().peekable();
        while records.peek().is_some() {
            let chunk = records.by_ref().take(size).collect();
            shards.push(Shard::records(shards.len(), chunk));
        }
        shards
    }

    /// One shard per file, numbered in path order
    pub fn segments(paths: Vec<PathBuf>) -> Vec<Shard> {
        paths
            .into_iter()
            .enumerate()
            .map(|(id, path)| Shard::segment(id, path))
            .collect()
    }

    fn open(self) -> Result<RecordStream, ShardError> {
        match self.input {
            ShardInput::Records(records) => Ok(Box::new(records.into_iter().map(Ok))),
            ShardInput::Segment(path) => match warc::open_segment(&path) {
                Ok(reader) => Ok(Box::new(reader)),
                Err(source) => Err(ShardError::Open { path, source }),
            },
            ShardInput::Stream(stream) => Ok(stream),
        }
    }
}

/// Raised by the driver to stop a worker between two records
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// What a worker hands back after finishing its shard
#[derive(Debug)]
pub struct ShardReport {
    pub shard_id: usize,
    pub partial: PartialCount,
    pub fetched: u64,
    pub collected: u64,
}

/// Calls the map function on one record
pub fn call_map_func(map_func: MapFunc, record: &Record, case_fold: bool) -> Vec<KeyValue> {
    map_func(record, case_fold)
}

/// One worker only ever touches its own shard and partial count, the only
/// shared state is the atomic counters
pub struct Worker {
    /// Lowercase tokens before counting
    case_fold: bool,
    map_func: MapFunc,
    cancel: CancelFlag,
}

impl Worker {
    pub fn new(case_fold: bool) -> Self {
        Self {
            case_fold,
            map_func: wc::map,
            cancel: CancelFlag::default(),
        }
    }

    pub fn with_map_func(mut self, map_func: MapFunc) -> Self {
        self.map_func = map_func;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Map every record of the shard and pre-aggregate the emitted pairs
    /// into a single partial count
    pub fn map(&self, shard: Shard, counters: &Counters) -> Result<ShardReport, ShardError> {
        let shard_id = shard.id();
        tracing::debug!("[Map] Worker is reading {:?}", shard);
        let records = shard.open()?;

        let mut partial = PartialCount::new();
        let (mut fetched, mut collected) = (0, 0);
        for record in records {
            if self.cancel.is_cancelled() {
                return Err(ShardError::Cancelled);
            }
            let record = record.map_err(|source| ShardError::MalformedRecord { fetched, source })?;
            fetched += 1;
            counters.add_fetched(1);

            let key_value_pairs = call_map_func(self.map_func, &record, self.case_fold);
            collected += key_value_pairs.len() as u64;
            counters.add_collected(key_value_pairs.len() as u64);
            for kv in key_value_pairs {
                *partial.entry(kv.key).or_insert(0) += kv.value;
            }
        }

        tracing::info!(
            "[Map] Worker finished shard #{}, {} record(s) fetched, {} collected, {} distinct token(s)",
            shard_id,
            fetched,
            collected,
            partial.len()
        );
        Ok(ShardReport { shard_id, partial, fetched, collected })
    }
}

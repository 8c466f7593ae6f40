use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::{mr::config::ConfigurationError, warc::RecordError};

/// Why a single shard produced no partial count
#[derive(Debug, Error)]
pub enum ShardError {
    #[error("malformed record after {fetched} record(s): {source}")]
    MalformedRecord {
        fetched: u64,
        #[source]
        source: RecordError,
    },
    #[error("failed to open segment {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("worker panicked: {0}")]
    Panicked(String),
    #[error("shard did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("shard was cancelled")]
    Cancelled,
}

/// Why a job produced no final count
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(
        "{failed} of {total} shard(s) failed, over the {max_failure_percent}% failure budget \
         (first failure: shard #{first_shard}: {first_error})"
    )]
    Failed {
        failed: usize,
        total: usize,
        max_failure_percent: u32,
        first_shard: usize,
        #[source]
        first_error: ShardError,
    },
    #[error("this coordinator has already run a job")]
    AlreadyStarted,
}

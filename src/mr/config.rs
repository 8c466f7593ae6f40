use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Percentage of failed shards tolerated unless configured otherwise
pub const DEFAULT_MAX_FAILURE_PERCENT: u32 = 5;

/// Rejected before any work is dispatched
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("no input path found")]
    MissingInput,
    #[error("no output path found")]
    MissingOutput,
    #[error("input path {0} does not exist")]
    InputNotFound(PathBuf),
    #[error("failed to list input path {0}: {1}")]
    InputUnreadable(PathBuf, String),
    #[error("the worker count must be at least 1")]
    NoWorkers,
    #[error("the reduce task number must be at least 1")]
    NoReduceTasks,
    #[error("max failure percent must be within 0..=100, got {0}")]
    FailurePercentOutOfRange(u32),
}

/// Settings of the worker pool and failure budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// The number of shards processed concurrently
    pub worker_n: usize,
    /// The percentage of shards allowed to fail before the job fails
    pub max_failure_percent: u32,
    /// A shard running longer than this is counted as failed
    pub shard_timeout: Option<Duration>,
    /// Lowercase tokens before counting
    pub case_fold: bool,
}

impl DriverConfig {
    pub fn new(worker_n: usize, max_failure_percent: u32) -> Self {
        Self {
            worker_n,
            max_failure_percent,
            shard_timeout: None,
            case_fold: false,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.worker_n == 0 {
            return Err(ConfigurationError::NoWorkers);
        }
        if self.max_failure_percent > 100 {
            return Err(ConfigurationError::FailurePercentOutOfRange(self.max_failure_percent));
        }
        Ok(())
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        let worker_n = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self::new(worker_n, DEFAULT_MAX_FAILURE_PERCENT)
    }
}

/// A word count job over a set of WET segments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    /// A WET file, or a directory holding WET files
    pub input: PathBuf,
    /// The directory receiving the partition files
    pub output: PathBuf,
    /// Only process the first `max_files` input files, all of them if unset
    pub max_files: Option<usize>,
    /// The number of output partitions
    pub reduce_n: usize,
    /// Gzip the output partitions
    pub compress: bool,
    pub driver: DriverConfig,
}

impl JobConfig {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            max_files: None,
            reduce_n: 1,
            compress: true,
            driver: DriverConfig::default(),
        }
    }

    /// Check the configuration, failing fast on anything that would make the
    /// job pointless to start
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.input.as_os_str().is_empty() {
            return Err(ConfigurationError::MissingInput);
        }
        if self.output.as_os_str().is_empty() {
            return Err(ConfigurationError::MissingOutput);
        }
        if !self.input.exists() {
            return Err(ConfigurationError::InputNotFound(self.input.clone()));
        }
        if self.reduce_n == 0 {
            return Err(ConfigurationError::NoReduceTasks);
        }
        self.driver.validate()
    }
}

pub mod combiner;
pub mod config;
pub mod coordinator;
pub mod counters;
pub mod error;
pub mod function;
pub mod worker;

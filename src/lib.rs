pub mod mr;
pub mod output;
pub mod telemetry;
pub mod warc;

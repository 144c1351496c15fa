//! Crate-wide error type.
//!
//! Only the fatal kinds ever escape a worker loop as `Err`: a `ConfigError`,
//! an `IoError` bringing up a bus or socket, or a clean `ReplayEnd`. The
//! remaining kinds a full pipeline has to reckon with — transient bus
//! errors, per-message decode failures, queue overflow, malformed panda
//! datagrams — are non-fatal by design and are logged and counted in
//! place rather than threaded through `Result`.

use thiserror::Error;

/// Fatal and quasi-fatal errors that can terminate a worker.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bring up bus: {0}")]
    BusUnavailable(String),

    #[error("replay reached end of file")]
    ReplayEnd,
}

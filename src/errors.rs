use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure to open or drive a capture channel.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("no such device: {0}")]
    NoSuchDevice(String),
    #[error("permission denied opening capture on {0} (needs CAP_NET_RAW)")]
    PermissionDenied(String),
    #[error("failed to join fanout group {group}: {source}")]
    FanoutJoinFailed {
        group: u16,
        #[source]
        source: io::Error,
    },
    #[error("invalid ring geometry: {0}")]
    InvalidRing(String),
    #[error("{0}")]
    Io(#[from] io::Error),
}

/// Failure while building the worker pool. Raised only after every
/// previously created worker has been released.
#[derive(Error, Debug)]
pub enum InitError {
    #[error("worker count must be at least 1")]
    NoWorkers,
    #[error("worker {worker}: {source}")]
    Capture {
        worker: usize,
        #[source]
        source: CaptureError,
    },
    #[error("worker {worker}: classifier init failed: {reason}")]
    Classifier { worker: usize, reason: String },
    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] io::Error),
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("unsupported collector endpoint: {0}")]
    UnsupportedEndpoint(String),
    #[error("failed to reach collector at {endpoint}: {source}")]
    Io {
        endpoint: String,
        #[source]
        source: io::Error,
    },
}

/// Outcome of a non-blocking send attempt.
#[derive(Error, Debug)]
pub enum SendError {
    /// The transport is at its high-water-mark; retry the same payload later.
    #[error("transport would block")]
    WouldBlock,
    #[error("transport failure: {0}")]
    Fatal(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("can't read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("can't parse '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Init(#[from] InitError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("failed to install signal handlers: {0}")]
    Signal(#[from] ctrlc::Error),
}

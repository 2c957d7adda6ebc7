use std::{io, net::SocketAddr, path::PathBuf};

use thiserror::Error;

/// Errors raised by the node role outside of per-request HTTP statuses.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to prepare bundle directory `{path}`: {source}")]
    PrepareCacheDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to scan bundle directory `{path}`: {source}")]
    ScanCacheDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid bundle fingerprint `{hash}`")]
    InvalidFingerprint { hash: String },
    #[error("no bundle slot reserved for `{hash}`")]
    NotReserved { hash: String },
    #[error("failed to stage bundle `{hash}`: {source}")]
    StageBundle {
        hash: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to inspect bundle `{hash}`: {source}")]
    DescribeBundle {
        hash: String,
        #[source]
        source: io::Error,
    },
    #[error("unknown worker `{id}`")]
    UnknownWorker { id: String },
    #[error("worker control channel is closed")]
    ControlClosed,
    #[error("node credentials are required before starting")]
    MissingCredentials,
    #[error("failed to bind `{addr}`: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Host(#[from] HostError),
}

/// Errors raised while spawning or wiring a child host process.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("host program `{binary}` could not be spawned: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("host stdin unavailable")]
    StdinUnavailable,
    #[error("host stdout unavailable")]
    StdoutUnavailable,
    #[error("host stderr unavailable")]
    StderrUnavailable,
    #[error("failed to serialize spawn options: {source}")]
    EncodeOptions {
        #[source]
        source: serde_json::Error,
    },
}

use offload_proto::FaultPayload;
use thiserror::Error;

/// Errors surfaced synchronously by `spawn` and the pre-launch steps
/// (placement, identity probe, bundle upload).
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("no node is registered with the pool")]
    NoNodeAvailable,
    #[error("invalid node url `{url}`: {detail}")]
    InvalidNodeUrl { url: String, detail: String },
    #[error("failed to construct http client: {source}")]
    Http {
        #[source]
        source: reqwest::Error,
    },
    #[error("node `{node}` is unreachable: {source}")]
    NodeUnreachable {
        node: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("node `{node}` rejected the bundle: {reason}")]
    BundleRejected { node: String, reason: String },
    #[error("node `{node}` sent an unexpected response: {detail}")]
    UnexpectedResponse { node: String, detail: String },
    #[error("failed to produce bundle artifact: {source}")]
    Bundle {
        #[source]
        source: std::io::Error,
    },
}

/// Post-launch failures observed on a worker handle.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkerError {
    /// The event stream closed before a terminal event; the worker's true
    /// fate is unknown and the handle is dead.
    #[error("worker event stream disconnected before exit")]
    Disconnected,
    /// The child reported a fault; carries the reconstructed error
    /// envelope.
    #[error("worker faulted: {}: {}", .0.name, .0.message)]
    Fault(FaultPayload),
    /// The caller used the handle after the worker exited.
    #[error("worker has exited")]
    AfterExit,
    #[error("worker event stream framing error: {detail}")]
    Protocol { detail: String },
}

#![forbid(unsafe_code)]
//! Wire layer shared by offload nodes and clients.
//!
//! A node and its callers exchange two long-lived line streams per worker: an
//! event stream (node to client) and a control stream (client to node). Both
//! use the same framing: one record per `\n`, `name ": " value`, with binary
//! payloads carried as base64 so the records survive any text-oriented
//! transport. This crate owns that framing, the JSON bodies of the node's
//! HTTP endpoints, the bundle fingerprint function, and the `server` header
//! handshake used for version compatibility checks.

mod api;
mod digest;
mod frame;
mod version;

pub use api::{
    BundleDescription, CreateBundleRequest, CreateWorkerRequest, HealthReport, NodeIdentity,
    ResourceLimits, SpawnOptions, BASIC_REALM, COMPRESSION_NONE, WORKER_ID_HEADER,
};
pub use digest::fingerprint;
pub use frame::{ControlMessage, FaultPayload, FrameDecoder, FrameError, Framed, WorkerEvent};
pub use version::{parse_server_header, server_header, versions_compatible, PRODUCT};

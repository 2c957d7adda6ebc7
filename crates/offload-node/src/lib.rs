#![forbid(unsafe_code)]
//! Server role of the offload dispatch system.
//!
//! A node hosts a content-addressed bundle cache on scratch storage, owns
//! the child processes that execute bundles, and multiplexes each worker's
//! lifecycle and standard streams over long-lived HTTP connections. The
//! actual execution of an entrypoint is delegated to a [`WorkerHost`]; the
//! default [`ProcessHost`] runs a configurable host program per worker and
//! speaks the wire framing over its stdio.
//!
//! ```rust,no_run
//! use offload_node::{Credentials, NodeServer, ProcessHost};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = NodeServer::builder()
//!     .credentials(Credentials::new("user", "secret"))
//!     .host(std::sync::Arc::new(ProcessHost::new("node").arg("child-host.js")))
//!     .build();
//! let running = server.start(([0, 0, 0, 0], 9400).into()).await?;
//! println!("node listening on {}", running.addr());
//! # Ok(()) }
//! ```

mod bundles;
mod error;
mod health;
mod host;
mod routes;
pub mod testing;
mod workers;

pub use bundles::{BundleStore, DEFAULT_MAX_ENTRIES};
pub use error::{HostError, NodeError};
pub use health::CpuSampler;
pub use host::{ProcessHost, SpawnedWorker, WorkerHost, WorkerSpawnSpec, SPAWN_OPTIONS_ENV};
pub use workers::{EventReader, Lifecycle, ReaderGuard, WorkerEntry, WorkerRegistry, DEFAULT_GRACE};

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use semver::Version;
use tokio::{net::TcpListener, task::JoinHandle};
use tracing::{info, warn};

/// The static credential pair a node accepts over HTTP Basic.
#[derive(Clone, Debug)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub(crate) fn matches(&self, username: &str, password: &str) -> bool {
        self.username == username && self.password == password
    }
}

/// Shared state behind every route handler.
#[derive(Clone)]
pub(crate) struct NodeState {
    inner: Arc<StateInner>,
}

struct StateInner {
    name: String,
    version: Version,
    credentials: Credentials,
    bundles: BundleStore,
    workers: WorkerRegistry,
    cpu: CpuSampler,
    host: Arc<dyn WorkerHost>,
}

impl NodeState {
    pub(crate) fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn version(&self) -> &Version {
        &self.inner.version
    }

    pub(crate) fn credentials(&self) -> &Credentials {
        &self.inner.credentials
    }

    pub(crate) fn bundles(&self) -> &BundleStore {
        &self.inner.bundles
    }

    pub(crate) fn workers(&self) -> &WorkerRegistry {
        &self.inner.workers
    }

    pub(crate) fn cpu(&self) -> &CpuSampler {
        &self.inner.cpu
    }

    pub(crate) fn host(&self) -> &dyn WorkerHost {
        self.inner.host.as_ref()
    }
}

/// Builder for a [`NodeServer`] with safe defaults: cache under the system
/// temp directory, one-second disconnect grace, `node` as the host program.
pub struct NodeServerBuilder {
    name: Option<String>,
    credentials: Option<Credentials>,
    cache_dir: Option<PathBuf>,
    cache_max_entries: usize,
    grace: Duration,
    host: Option<Arc<dyn WorkerHost>>,
    version: Option<Version>,
}

impl Default for NodeServerBuilder {
    fn default() -> Self {
        Self {
            name: None,
            credentials: None,
            cache_dir: None,
            cache_max_entries: DEFAULT_MAX_ENTRIES,
            grace: DEFAULT_GRACE,
            host: None,
            version: None,
        }
    }
}

impl NodeServerBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn cache_max_entries(mut self, max_entries: usize) -> Self {
        self.cache_max_entries = max_entries;
        self
    }

    /// Disconnect grace window for workers created with
    /// `exitOnRequestEnd`.
    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn host(mut self, host: Arc<dyn WorkerHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn build(self) -> NodeServer {
        NodeServer { config: self }
    }
}

/// An unbound node server; call [`NodeServer::start`] to serve.
pub struct NodeServer {
    config: NodeServerBuilder,
}

impl NodeServer {
    pub fn builder() -> NodeServerBuilder {
        NodeServerBuilder::default()
    }

    /// Binds `addr` and serves until the returned handle is shut down or
    /// dropped. The bundle cache is opened (and bulk-cleared when over
    /// threshold) before the listener accepts anything.
    pub async fn start(self, addr: SocketAddr) -> Result<RunningNode, NodeError> {
        let config = self.config;
        let credentials = config.credentials.ok_or(NodeError::MissingCredentials)?;
        let cache_dir = config
            .cache_dir
            .unwrap_or_else(|| std::env::temp_dir().join("offload_bundles"));
        let bundles = BundleStore::open(cache_dir, config.cache_max_entries).await?;
        let version = config.version.unwrap_or_else(|| {
            Version::parse(env!("CARGO_PKG_VERSION")).unwrap_or_else(|_| Version::new(0, 0, 0))
        });
        let name = config
            .name
            .or_else(sysinfo::System::host_name)
            .unwrap_or_else(|| "offload-node".to_string());
        let host = config
            .host
            .unwrap_or_else(|| Arc::new(ProcessHost::new("node")));

        let state = NodeState {
            inner: Arc::new(StateInner {
                name,
                version,
                credentials,
                bundles,
                workers: WorkerRegistry::new(config.grace),
                cpu: CpuSampler::new(),
                host,
            }),
        };

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| NodeError::Bind { addr, source })?;
        let local = listener
            .local_addr()
            .map_err(|source| NodeError::Bind { addr, source })?;
        info!(addr = %local, "node listening");

        let router = routes::router(state.clone());
        let task = tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, router).await {
                warn!(?error, "node server stopped");
            }
        });

        Ok(RunningNode {
            addr: local,
            task,
            state,
        })
    }
}

/// Handle to a serving node. Dropping it tears the listener and every
/// open event stream down abruptly.
pub struct RunningNode {
    addr: SocketAddr,
    task: JoinHandle<()>,
    state: NodeState,
}

impl RunningNode {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL without credentials.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn shutdown(self) {
        self.stop();
    }

    fn stop(&self) {
        self.task.abort();
        self.state.workers().sever_readers();
    }
}

impl Drop for RunningNode {
    fn drop(&mut self) {
        self.stop();
    }
}

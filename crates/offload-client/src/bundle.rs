use std::{io::Write, path::Path};

use async_trait::async_trait;
use offload_proto::{CreateBundleRequest, COMPRESSION_NONE};
use reqwest::{Method, StatusCode};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::{node::NodeClient, SpawnError};

/// Turns a caller-supplied entrypoint into a single self-contained program
/// artifact. The bundling itself is an external concern; the pool only
/// requires the staged result.
#[async_trait]
pub trait Bundler: Send + Sync + 'static {
    async fn bundle(&self, entrypoint: &Path) -> Result<BundleArtifact, SpawnError>;
}

/// A staged bundle artifact. The backing temp file is deleted on drop,
/// which the pool relies on after a successful upload.
pub struct BundleArtifact {
    path: tempfile::TempPath,
}

impl BundleArtifact {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SpawnError> {
        let stage = |source| SpawnError::Bundle { source };
        let mut file = NamedTempFile::new().map_err(stage)?;
        file.write_all(bytes).map_err(stage)?;
        Ok(Self {
            path: file.into_temp_path(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) async fn read(&self) -> Result<Vec<u8>, SpawnError> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|source| SpawnError::Bundle { source })
    }
}

/// Bundler for entrypoints that are already self-contained artifacts; it
/// stages a copy and nothing more. Useful for pre-bundled programs and for
/// suites.
pub struct FileBundler;

#[async_trait]
impl Bundler for FileBundler {
    async fn bundle(&self, entrypoint: &Path) -> Result<BundleArtifact, SpawnError> {
        let bytes = tokio::fs::read(entrypoint)
            .await
            .map_err(|source| SpawnError::Bundle { source })?;
        BundleArtifact::from_bytes(&bytes)
    }
}

/// Outcome of the upload dedupe: whether bytes actually went over the
/// wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BundleUpload {
    AlreadyCached,
    Uploaded,
}

/// Makes sure the node caches `hash`: describe first, and only on a miss
/// reserve a slot and push the bytes.
pub(crate) async fn ensure_bundle(
    node: &NodeClient,
    hash: &str,
    bytes: &[u8],
) -> Result<BundleUpload, SpawnError> {
    let described = node
        .request(Method::GET, &format!("bundles/{hash}"))?
        .send()
        .await
        .map_err(|source| node.unreachable(source))?;
    if described.status().is_success() {
        debug!(node = %node.display(), hash, "bundle already cached");
        return Ok(BundleUpload::AlreadyCached);
    }
    if described.status() != StatusCode::NOT_FOUND {
        return Err(node.unexpected(format!(
            "describe bundle returned {}",
            described.status()
        )));
    }

    let created = node
        .request(Method::POST, "bundles/create")?
        .json(&CreateBundleRequest {
            hash: hash.to_string(),
        })
        .send()
        .await
        .map_err(|source| node.unreachable(source))?;
    if !created.status().is_success() {
        return Err(node.unexpected(format!("create bundle returned {}", created.status())));
    }

    let uploaded = node
        .request(
            Method::POST,
            &format!("bundles/{hash}/data?compression={COMPRESSION_NONE}"),
        )?
        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
        .body(bytes.to_vec())
        .send()
        .await
        .map_err(|source| node.unreachable(source))?;
    if uploaded.status() != StatusCode::NO_CONTENT {
        return Err(node.unexpected(format!("bundle upload returned {}", uploaded.status())));
    }

    debug!(node = %node.display(), hash, size = bytes.len(), "bundle uploaded");
    Ok(BundleUpload::Uploaded)
}

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use offload_proto::BundleDescription;
use tokio::fs;
use tracing::{info, warn};

use crate::NodeError;

/// Number of completed artifacts beyond which the cache is wiped wholesale
/// at startup. Bundles are cheap to re-upload and content-addressed, so the
/// clear is deliberately coarse.
pub const DEFAULT_MAX_ENTRIES: usize = 10;

const ARTIFACT_SUFFIX: &str = ".js";
const STAGING_SUFFIX: &str = ".js.part";

/// Content-addressed bundle storage backed by a single scratch directory.
///
/// Uploads are staged to `{hash}.js.part` and renamed to `{hash}.js` once
/// complete, so `describe` never observes a half-written artifact. Slot
/// reservations live in memory; two clients racing the same fingerprint
/// converge on identical bytes, so either writer's rename suffices.
pub struct BundleStore {
    dir: PathBuf,
    reserved: Mutex<HashSet<String>>,
}

impl BundleStore {
    /// Opens (and creates if absent) the store at `dir`. When the startup
    /// scan finds more than `max_entries` completed artifacts the whole
    /// directory is cleared.
    pub async fn open(dir: PathBuf, max_entries: usize) -> Result<Self, NodeError> {
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| NodeError::PrepareCacheDir {
                path: dir.clone(),
                source,
            })?;

        let mut completed = 0usize;
        let mut leftovers = Vec::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|source| NodeError::ScanCacheDir {
                path: dir.clone(),
                source,
            })?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| NodeError::ScanCacheDir {
                path: dir.clone(),
                source,
            })?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(STAGING_SUFFIX) {
                leftovers.push(entry.path());
            } else if name.ends_with(ARTIFACT_SUFFIX) {
                completed += 1;
            }
        }

        // Interrupted uploads from a previous run are never completed.
        for path in leftovers {
            if let Err(error) = fs::remove_file(&path).await {
                warn!(?error, path = %path.display(), "failed to remove stale staging file");
            }
        }

        if completed > max_entries {
            info!(
                entries = completed,
                max_entries,
                dir = %dir.display(),
                "bundle cache over threshold, clearing"
            );
            fs::remove_dir_all(&dir)
                .await
                .map_err(|source| NodeError::PrepareCacheDir {
                    path: dir.clone(),
                    source,
                })?;
            fs::create_dir_all(&dir)
                .await
                .map_err(|source| NodeError::PrepareCacheDir {
                    path: dir.clone(),
                    source,
                })?;
        }

        Ok(Self {
            dir,
            reserved: Mutex::new(HashSet::new()),
        })
    }

    /// Reserves an empty slot for `hash`. Idempotent.
    pub fn reserve(&self, hash: &str) -> Result<(), NodeError> {
        validate_fingerprint(hash)?;
        self.reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(hash.to_string());
        Ok(())
    }

    /// Writes the artifact for a previously reserved slot.
    pub async fn put(&self, hash: &str, bytes: &[u8]) -> Result<(), NodeError> {
        validate_fingerprint(hash)?;
        let reserved = self
            .reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(hash);
        if !reserved && self.describe(hash).await?.is_none() {
            return Err(NodeError::NotReserved {
                hash: hash.to_string(),
            });
        }

        let staging = self.dir.join(format!("{hash}{STAGING_SUFFIX}"));
        let target = self.artifact_path(hash);
        let stage_err = |source| NodeError::StageBundle {
            hash: hash.to_string(),
            source,
        };
        fs::write(&staging, bytes).await.map_err(stage_err)?;
        fs::rename(&staging, &target).await.map_err(stage_err)?;

        self.reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(hash);
        Ok(())
    }

    /// Describes a completed artifact, or `None` when absent. Zero-size
    /// entries report absent so `describe` cannot succeed before `put`.
    pub async fn describe(&self, hash: &str) -> Result<Option<BundleDescription>, NodeError> {
        validate_fingerprint(hash)?;
        let metadata = match fs::metadata(self.artifact_path(hash)).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(NodeError::DescribeBundle {
                    hash: hash.to_string(),
                    source,
                })
            }
        };
        if metadata.len() == 0 {
            return Ok(None);
        }
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let created = created
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Ok(Some(BundleDescription {
            hash: hash.to_string(),
            size: metadata.len(),
            created,
        }))
    }

    /// True when a completed artifact is cached for `hash`.
    pub async fn contains(&self, hash: &str) -> Result<bool, NodeError> {
        Ok(self.describe(hash).await?.is_some())
    }

    /// Path of the completed artifact handed to the worker launcher.
    pub fn artifact_path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{hash}{ARTIFACT_SUFFIX}"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Fingerprints name files on disk, so anything but lowercase hex is
/// rejected before it can reach a path.
fn validate_fingerprint(hash: &str) -> Result<(), NodeError> {
    let valid = !hash.is_empty()
        && hash.len() <= 128
        && hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if valid {
        Ok(())
    } else {
        Err(NodeError::InvalidFingerprint {
            hash: hash.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offload_proto::fingerprint;

    async fn store_in(dir: &Path) -> BundleStore {
        BundleStore::open(dir.to_path_buf(), DEFAULT_MAX_ENTRIES)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn uploading_twice_leaves_one_copy_with_stable_description() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        let bytes = b"module.exports = () => 7;";
        let hash = fingerprint(bytes);

        store.reserve(&hash).unwrap();
        store.put(&hash, bytes).await.unwrap();
        let first = store.describe(&hash).await.unwrap().unwrap();

        store.reserve(&hash).unwrap();
        store.put(&hash, bytes).await.unwrap();
        let second = store.describe(&hash).await.unwrap().unwrap();

        assert_eq!(first.hash, second.hash);
        assert_eq!(first.size, second.size);
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn reserve_is_idempotent_and_put_requires_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        let bytes = b"x";
        let hash = fingerprint(bytes);

        assert!(matches!(
            store.put(&hash, bytes).await,
            Err(NodeError::NotReserved { .. })
        ));

        store.reserve(&hash).unwrap();
        store.reserve(&hash).unwrap();
        store.put(&hash, bytes).await.unwrap();
        assert!(store.contains(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn describe_does_not_see_reserved_or_staged_slots() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        let hash = fingerprint(b"pending");

        store.reserve(&hash).unwrap();
        assert!(store.describe(&hash).await.unwrap().is_none());

        // A zero-size artifact (e.g. truncated write) also reports absent.
        std::fs::write(store.artifact_path(&hash), b"").unwrap();
        assert!(store.describe(&hash).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn startup_clears_cache_over_threshold() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..4 {
            let bytes = format!("artifact {i}");
            let hash = fingerprint(bytes.as_bytes());
            std::fs::write(dir.path().join(format!("{hash}.js")), bytes).unwrap();
        }

        let store = BundleStore::open(dir.path().to_path_buf(), 3).await.unwrap();
        let files: Vec<_> = std::fs::read_dir(store.dir()).unwrap().collect();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn startup_keeps_cache_under_threshold_and_drops_staging_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = b"kept";
        let hash = fingerprint(bytes);
        std::fs::write(dir.path().join(format!("{hash}.js")), bytes).unwrap();
        std::fs::write(dir.path().join("deadbeef.js.part"), b"partial").unwrap();

        let store = BundleStore::open(dir.path().to_path_buf(), 3).await.unwrap();
        assert!(store.contains(&hash).await.unwrap());
        let names: Vec<_> = std::fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn traversal_fingerprints_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        for hash in ["../escape", "UPPER", "", "has space"] {
            assert!(matches!(
                store.reserve(hash),
                Err(NodeError::InvalidFingerprint { .. })
            ));
        }
    }
}

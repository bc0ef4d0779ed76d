//! On-disk cache of the last accepted snapshot per namespace.
//!
//! One JSON file per `(appId, cluster, namespace)` lives under
//! `<cache root>/<appId>/config-cache/`. Files are written to a temporary
//! sibling and renamed into place, so a crash mid-write leaves either the old
//! file or the new one, never a truncated mix.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::snapshot::{ConfigEntries, Snapshot, SourceType};

/// Directory (below the per-app directory) holding cache files.
const CACHE_DIR_NAME: &str = "config-cache";
const CACHE_FILE_EXTENSION: &str = "json";

/// Errors emitted by the [`LocalCacheStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("filesystem error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Serialized form of one namespace's last accepted snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalCacheFile {
    pub app_id: String,
    pub cluster: String,
    pub namespace: String,
    pub release_key: String,
    pub configurations: ConfigEntries,
}

impl LocalCacheFile {
    fn into_snapshot(self) -> Snapshot {
        Snapshot::new(
            self.namespace,
            self.release_key,
            self.configurations,
            SourceType::LocalFallback,
        )
    }
}

/// Durable per-namespace snapshot cache.
#[derive(Debug, Clone)]
pub struct LocalCacheStore {
    dir: PathBuf,
    app_id: String,
    cluster: String,
}

impl LocalCacheStore {
    /// Opens (creating if needed) the cache directory for one app/cluster.
    pub fn open(
        root: impl AsRef<Path>,
        app_id: impl Into<String>,
        cluster: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let app_id = app_id.into();
        let dir = root.as_ref().join(&app_id).join(CACHE_DIR_NAME);
        fs::create_dir_all(&dir).map_err(|err| StoreError::io(&dir, err))?;
        Ok(Self {
            dir,
            app_id,
            cluster: cluster.into(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the cache file for `namespace`.
    pub fn file_path(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!(
            "{}+{}+{}.{}",
            self.app_id, self.cluster, namespace, CACHE_FILE_EXTENSION
        ))
    }

    /// Loads the cached snapshot, if a readable one exists.
    ///
    /// Unparseable files are logged and reported as absent; they are left on
    /// disk until the next successful fetch overwrites them.
    pub fn load(&self, namespace: &str) -> Option<Snapshot> {
        match self.read(namespace) {
            Ok(Some(file)) => {
                debug!(
                    namespace,
                    release_key = %file.release_key,
                    entries = file.configurations.len(),
                    "config-sync loaded local cache"
                );
                Some(file.into_snapshot())
            }
            Ok(None) => None,
            Err(err) => {
                warn!(namespace, %err, "config-sync ignoring unreadable local cache file");
                None
            }
        }
    }

    /// Persists `snapshot` unless the file already holds identical content.
    ///
    /// Returns whether the file was (re)written. Snapshots without a release
    /// key are never persisted.
    pub fn save(&self, namespace: &str, snapshot: &Snapshot) -> Result<bool, StoreError> {
        let Some(release_key) = snapshot.release_key.clone() else {
            return Ok(false);
        };
        let record = LocalCacheFile {
            app_id: self.app_id.clone(),
            cluster: self.cluster.clone(),
            namespace: namespace.to_string(),
            release_key,
            configurations: snapshot.entries.clone(),
        };

        if let Ok(Some(existing)) = self.read(namespace) {
            if existing == record {
                return Ok(false);
            }
        }

        let bytes = serde_json::to_vec_pretty(&record)?;
        let path = self.file_path(namespace);
        write_atomic(&path, &bytes)?;
        debug!(namespace, path = %path.display(), "config-sync wrote local cache");
        Ok(true)
    }

    fn read(&self, namespace: &str) -> Result<Option<LocalCacheFile>, StoreError> {
        let path = self.file_path(namespace);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io(&path, err)),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

/// Writes `bytes` to a temporary sibling, syncs it, then renames over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(
        ".{file_name}.{}.{:08x}.tmp",
        std::process::id(),
        fastrand::u32(..)
    ));

    let result = (|| {
        let mut file = fs::File::create(&tmp).map_err(|err| StoreError::io(&tmp, err))?;
        file.write_all(bytes).map_err(|err| StoreError::io(&tmp, err))?;
        file.sync_all().map_err(|err| StoreError::io(&tmp, err))?;
        fs::rename(&tmp, path).map_err(|err| StoreError::io(path, err))
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

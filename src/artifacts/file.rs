//! Filesystem artifact store
//!
//! ```text
//! <root>/<app>/<user>/sessions/<session>/<filename>/
//!     meta.json
//!     versions/0.json
//!     versions/1.json
//! <root>/<app>/<user>/user/<filename>/...
//! ```
//!
//! A version is written to a temp file in `versions/` and then hard-linked
//! to `N.json`. The link fails if `N.json` exists, so a version is never
//! overwritten, and a failed write never leaves a partial `N.json`. Saves
//! to one key are serialized by a per-key lock that is dropped from the
//! table once nobody holds it.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ArtifactEnvelope, ArtifactKey, ArtifactMeta, ArtifactStore, USER_PREFIX};
use crate::{Error, Result};

const META_FILE: &str = "meta.json";
const VERSIONS_DIR: &str = "versions";

/// Artifact store rooted at a directory
pub struct FileArtifactStore {
    root: PathBuf,
    locks: Mutex<HashMap<ArtifactKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileArtifactStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_dir(&self, key: &ArtifactKey) -> PathBuf {
        self.root.join(key.relative_dir())
    }

    fn lock_for(&self, key: &ArtifactKey) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| Error::Artifact("artifact lock table poisoned".to_string()))?;
        Ok(locks.entry(key.clone()).or_default().clone())
    }

    /// Drop our handle and prune the table entry if it was the last one
    fn release(&self, key: &ArtifactKey, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        if let Ok(mut locks) = self.locks.lock() {
            // Handles are only cloned under the table lock, so the count is stable here
            if locks.get(key).map(|l| Arc::strong_count(l) == 1).unwrap_or(false) {
                locks.remove(key);
            }
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    async fn save_locked(&self, key: &ArtifactKey, payload: Value) -> Result<u32> {
        let dir = self.key_dir(key);
        tokio::fs::create_dir_all(dir.join(VERSIONS_DIR)).await?;

        let existing = read_versions(&dir).await?;
        let version = existing.len() as u32;
        if existing.last().map(|last| *last + 1 != version).unwrap_or(false) {
            return Err(Error::Artifact(format!(
                "version history of {} is not contiguous",
                key
            )));
        }

        let now = Utc::now();
        let envelope = ArtifactEnvelope {
            version,
            saved_at: now,
            payload,
        };
        let content = serde_json::to_vec_pretty(&envelope)?;

        write_version(&dir, version, &content)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => Error::Artifact(format!(
                    "version {} of {} already exists (concurrent writer?)",
                    version, key
                )),
                _ => Error::Io(e),
            })?;

        let created_at = self
            .meta(key)
            .await?
            .map(|m| m.created_at)
            .unwrap_or(now);
        let meta = ArtifactMeta {
            filename: key.filename.clone(),
            scope: key.scope.clone(),
            created_at,
            updated_at: now,
            latest_version: version,
        };
        write_atomic(&dir.join(META_FILE), &serde_json::to_vec_pretty(&meta)?).await?;

        info!("Saved artifact {} version {}", key, version);
        Ok(version)
    }

    /// Read a key's metadata record
    pub async fn meta(&self, key: &ArtifactKey) -> Result<Option<ArtifactMeta>> {
        let path = self.key_dir(key).join(META_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load a full envelope rather than just its payload
    pub async fn load_envelope(
        &self,
        key: &ArtifactKey,
        version: Option<u32>,
    ) -> Result<Option<ArtifactEnvelope>> {
        let version = match version {
            Some(v) => v,
            None => match self.list_versions(key).await?.last() {
                Some(v) => *v,
                None => return Ok(None),
            },
        };

        let path = version_path(&self.key_dir(key), version);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn version_path(dir: &Path, version: u32) -> PathBuf {
    dir.join(VERSIONS_DIR).join(format!("{}.json", version))
}

async fn read_versions(dir: &Path) -> Result<Vec<u32>> {
    let mut entries = match tokio::fs::read_dir(dir.join(VERSIONS_DIR)).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut versions = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if let Some(v) = name
            .to_str()
            .and_then(|n| n.strip_suffix(".json"))
            .and_then(|n| n.parse::<u32>().ok())
        {
            versions.push(v);
        }
    }
    versions.sort_unstable();
    Ok(versions)
}

async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Write `versions/<version>.json` without ever exposing a partial file
async fn write_version(dir: &Path, version: u32, content: &[u8]) -> std::io::Result<()> {
    let tmp = dir
        .join(VERSIONS_DIR)
        .join(format!(".{}.{}.tmp", version, Uuid::new_v4().simple()));
    let result = async {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)
            .await?;
        file.write_all(content).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::hard_link(&tmp, version_path(dir, version)).await
    }
    .await;

    if let Err(e) = tokio::fs::remove_file(&tmp).await {
        if e.kind() != ErrorKind::NotFound {
            debug!("Could not remove {}: {}", tmp.display(), e);
        }
    }
    result
}

#[async_trait]
impl ArtifactStore for FileArtifactStore {
    async fn save(&self, key: &ArtifactKey, payload: Value) -> Result<u32> {
        let lock = self.lock_for(key)?;
        let result = {
            let _guard = lock.lock().await;
            self.save_locked(key, payload).await
        };
        self.release(key, lock);
        result
    }

    async fn load(&self, key: &ArtifactKey, version: Option<u32>) -> Result<Option<Value>> {
        Ok(self.load_envelope(key, version).await?.map(|e| e.payload))
    }

    async fn list_versions(&self, key: &ArtifactKey) -> Result<Vec<u32>> {
        read_versions(&self.key_dir(key)).await
    }

    async fn delete(&self, key: &ArtifactKey) -> Result<bool> {
        let lock = self.lock_for(key)?;
        let result = {
            let _guard = lock.lock().await;
            match tokio::fs::remove_dir_all(self.key_dir(key)).await {
                Ok(()) => {
                    info!("Deleted artifact {}", key);
                    Ok(true)
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!("Artifact {} not found for delete", key);
                    Ok(false)
                }
                Err(e) => Err(e.into()),
            }
        };
        self.release(key, lock);
        result
    }

    async fn list_filenames(&self, app: &str, user: &str, session_id: &str) -> Result<Vec<String>> {
        // Any valid filename yields the scope directories we need
        let probe = ArtifactKey::new(app, user, session_id, "probe")?;
        let user_probe = ArtifactKey::new(app, user, session_id, "user:probe")?;

        let mut names = Vec::new();
        for (probe, prefix) in [(probe, ""), (user_probe, USER_PREFIX)] {
            let scope_dir = match self.key_dir(&probe).parent() {
                Some(parent) => parent.to_path_buf(),
                None => continue,
            };
            let mut entries = match tokio::fs::read_dir(&scope_dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                if tokio::fs::metadata(entry.path().join(META_FILE)).await.is_ok() {
                    if let Some(name) = entry.file_name().to_str() {
                        names.push(format!("{}{}", prefix, name));
                    }
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

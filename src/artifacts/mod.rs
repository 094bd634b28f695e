//! Versioned artifact store
//!
//! Append-only blobs keyed by (app, user, scope, filename). Every save
//! writes a new immutable version; versions are numbered from 0 with no
//! gaps. A filename prefixed with `user:` is stored in user scope and is
//! visible from every session of that user.

mod file;

pub use file::FileArtifactStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;

use crate::{Error, Result};

/// Prefix selecting user scope
pub const USER_PREFIX: &str = "user:";

/// Where an artifact lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactScope {
    Session(String),
    User,
}

/// Identity of a versioned artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub app: String,
    pub user: String,
    pub scope: ArtifactScope,
    pub filename: String,
}

impl ArtifactKey {
    /// Key for `filename` in `session_id`, or in user scope when the name
    /// carries the `user:` prefix
    pub fn new(app: &str, user: &str, session_id: &str, filename: &str) -> Result<Self> {
        let (scope, filename) = match filename.strip_prefix(USER_PREFIX) {
            Some(rest) => (ArtifactScope::User, rest),
            None => (ArtifactScope::Session(session_id.to_string()), filename),
        };

        check_component("app", app)?;
        check_component("user", user)?;
        if let ArtifactScope::Session(id) = &scope {
            check_component("session", id)?;
        }
        check_component("filename", filename)?;

        Ok(Self {
            app: app.to_string(),
            user: user.to_string(),
            scope,
            filename: filename.to_string(),
        })
    }

    /// Directory of this key, relative to the store root
    pub fn relative_dir(&self) -> PathBuf {
        let mut dir = PathBuf::from(&self.app).join(&self.user);
        match &self.scope {
            ArtifactScope::Session(id) => dir.push(PathBuf::from("sessions").join(id)),
            ArtifactScope::User => dir.push("user"),
        }
        dir.join(&self.filename)
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            ArtifactScope::Session(id) => {
                write!(f, "{}/{}/{}/{}", self.app, self.user, id, self.filename)
            }
            ArtifactScope::User => write!(f, "{}/{}/user:{}", self.app, self.user, self.filename),
        }
    }
}

fn check_component(what: &str, value: &str) -> Result<()> {
    let bad = value.is_empty()
        || value.contains(['/', '\\', '\0'])
        || value.contains("..")
        || value.starts_with('.');
    if bad {
        return Err(Error::Artifact(format!("Invalid {}: {:?}", what, value)));
    }
    Ok(())
}

/// One immutable stored version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEnvelope {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub payload: Value,
}

/// Per-key metadata record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub filename: String,
    pub scope: ArtifactScope,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub latest_version: u32,
}

/// Versioned blob store
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Append a new version, returning its number
    async fn save(&self, key: &ArtifactKey, payload: Value) -> Result<u32>;

    /// Load a version, the latest by default
    async fn load(&self, key: &ArtifactKey, version: Option<u32>) -> Result<Option<Value>>;

    /// Stored versions in ascending order
    async fn list_versions(&self, key: &ArtifactKey) -> Result<Vec<u32>>;

    /// Remove every version of a key. Returns whether it existed.
    async fn delete(&self, key: &ArtifactKey) -> Result<bool>;

    /// Filenames stored for a session (user-scope names carry the prefix)
    async fn list_filenames(&self, app: &str, user: &str, session_id: &str) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_prefix_selects_user_scope() {
        let key = ArtifactKey::new("popper", "ana", "s1", "user:profile.json").unwrap();
        assert_eq!(key.scope, ArtifactScope::User);
        assert_eq!(key.filename, "profile.json");
        assert_eq!(
            key.relative_dir(),
            PathBuf::from("popper/ana/user/profile.json")
        );

        let key = ArtifactKey::new("popper", "ana", "s1", "plan.json").unwrap();
        assert_eq!(key.scope, ArtifactScope::Session("s1".to_string()));
        assert_eq!(
            key.relative_dir(),
            PathBuf::from("popper/ana/sessions/s1/plan.json")
        );
    }

    #[test]
    fn test_rejects_path_components() {
        assert!(ArtifactKey::new("popper", "ana", "s1", "../escape").is_err());
        assert!(ArtifactKey::new("popper", "ana", "s1", "a/b").is_err());
        assert!(ArtifactKey::new("popper", "ana", "s1", "").is_err());
        assert!(ArtifactKey::new("popper", "ana", "s1", "user:").is_err());
        assert!(ArtifactKey::new("popper", "a/b", "s1", "x.json").is_err());
        assert!(ArtifactKey::new("popper", "ana", "..", "x.json").is_err());
    }
}

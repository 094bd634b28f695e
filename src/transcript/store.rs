//! Session transcript files
//!
//! One YAML file per session under the sessions directory. Progress
//! messages are dropped on save.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::Transcript;
use crate::{Error, Result};

/// Listing entry for a saved session
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub title: Option<String>,
    pub updated: DateTime<Utc>,
    pub messages: usize,
}

/// Manage session transcript files
pub struct TranscriptStore {
    base_dir: PathBuf,
}

impl TranscriptStore {
    /// Create a new store rooted at `base_dir`
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
            return Err(Error::Session(format!("Invalid session id: {}", id)));
        }
        Ok(self.base_dir.join(format!("{}.yaml", id)))
    }

    /// Save a transcript, dropping progress messages
    pub fn save(&self, transcript: &Transcript) -> Result<PathBuf> {
        let path = self.path_for(&transcript.id)?;
        std::fs::create_dir_all(&self.base_dir)?;

        let mut persisted = transcript.clone();
        persisted.compact();
        persisted.updated = Utc::now();

        let content = serde_yaml::to_string(&persisted)?;
        let tmp = path.with_extension("yaml.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;

        debug!("Saved session {} to {}", transcript.id, path.display());
        Ok(path)
    }

    /// Load a transcript by session id
    pub fn load(&self, id: &str) -> Result<Transcript> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Err(Error::Session(format!("Session not found: {}", id)));
        }
        load_file(&path)
    }

    /// List saved sessions, newest first
    pub fn list(&self) -> Result<Vec<SessionSummary>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "yaml").unwrap_or(false) {
                if let Ok(transcript) = load_file(&path) {
                    sessions.push(SessionSummary {
                        id: transcript.id.clone(),
                        title: transcript.title.clone(),
                        updated: transcript.updated,
                        messages: transcript.messages.len(),
                    });
                }
            }
        }

        sessions.sort_by(|a, b| b.updated.cmp(&a.updated));
        Ok(sessions)
    }
}

fn load_file(path: &Path) -> Result<Transcript> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

//! Persisted authentication session.
//!
//! The login flow (out of process) writes `~/.gbos/session.json`; the
//! orchestrator only reads it, except for `touch()` which refreshes
//! `saved_at`. Writes replace the whole file atomically so a crashed
//! writer never leaves a truncated store behind.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStore {
    /// Bearer token for the control plane
    pub access_token: String,
    /// Private token for GitLab merge-request creation
    #[serde(default)]
    pub gitlab_token: Option<String>,
    /// Control-plane base URL, e.g. "https://gbos.dev/api"
    pub base_url: String,
    /// Display name of the signed-in user
    #[serde(default)]
    pub user: Option<String>,
    pub saved_at: DateTime<Utc>,

    #[serde(skip)]
    path: PathBuf,
}

impl SessionStore {
    /// Load the session store, or `None` when the user never logged in.
    pub fn load(config: &Config) -> Result<Option<Self>> {
        Self::load_from(&config.session_file_path())
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(path).context("Failed to read session store")?;
        let mut store: SessionStore =
            serde_json::from_str(&contents).context("Failed to parse session store")?;
        store.path = path.to_path_buf();
        Ok(Some(store))
    }

    /// True when a usable control-plane token is present.
    pub fn is_authenticated(&self) -> bool {
        !self.access_token.is_empty()
    }

    /// Base URL with any trailing slash removed.
    pub fn api_base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// Write the store back, whole-file atomic (temp + rename).
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create state directory")?;
        }

        let contents = serde_json::to_string_pretty(self)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents).context("Failed to write session store")?;
        fs::rename(&tmp, &self.path).context("Failed to replace session store")?;
        Ok(())
    }

    /// Refresh `saved_at` and persist.
    pub fn touch(&mut self) -> Result<()> {
        self.saved_at = Utc::now();
        self.save()
    }

    #[cfg(test)]
    pub fn for_tests(path: PathBuf, access_token: &str, base_url: &str) -> Self {
        Self {
            access_token: access_token.to_string(),
            gitlab_token: None,
            base_url: base_url.to_string(),
            user: None,
            saved_at: Utc::now(),
            path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_missing_returns_none() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("session.json");
        let result = SessionStore::load_from(&path).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("session.json");

        let mut store = SessionStore::for_tests(path.clone(), "tok-123", "https://gbos.dev/api/");
        store.gitlab_token = Some("glpat-abc".to_string());
        store.save().unwrap();

        let loaded = SessionStore::load_from(&path).unwrap().unwrap();
        assert_eq!(loaded.access_token, "tok-123");
        assert_eq!(loaded.gitlab_token.as_deref(), Some("glpat-abc"));
        assert_eq!(loaded.api_base(), "https://gbos.dev/api");
        assert!(loaded.is_authenticated());
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("session.json");

        let store = SessionStore::for_tests(path.clone(), "tok", "https://gbos.dev");
        store.save().unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn empty_token_is_not_authenticated() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("session.json");
        let store = SessionStore::for_tests(path, "", "https://gbos.dev");
        assert!(!store.is_authenticated());
    }
}

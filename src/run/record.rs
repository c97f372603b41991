//! Persisted run records and the on-disk run store.
//!
//! One JSON file per run under `<state>/runs/`, replaced whole on every
//! mutation (write temp, rename). Run ids carry a UTC-seconds prefix so
//! file names sort by creation time and store scans can walk newest-first
//! without opening every file.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::state::{can_transition, RunState};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One stage-history entry. `to_state` equals the run's state immediately
/// after the entry was appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEntry {
    pub from_state: RunState,
    pub to_state: RunState,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub stage: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputEntry {
    pub output: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: String,
    pub path: String,
    #[serde(default)]
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

/// Mutable context accumulated across stages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunContext {
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub task_key: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub agent_vendor: Option<String>,

    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub stages: Vec<StageEntry>,
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputEntry>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,

    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub cloud_run_url: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl RunContext {
    /// Copy well-known keys from a stage-data object into the typed fields.
    fn absorb(&mut self, data: &Value) {
        let Some(map) = data.as_object() else { return };
        for (key, value) in map {
            let Some(text) = value.as_str() else { continue };
            let slot = match key.as_str() {
                "app_id" => &mut self.app_id,
                "node_id" => &mut self.node_id,
                "task_id" => &mut self.task_id,
                "task_key" => &mut self.task_key,
                "branch" => &mut self.branch,
                "agent_vendor" => &mut self.agent_vendor,
                "repo_url" => &mut self.repo_url,
                "cloud_run_url" => &mut self.cloud_run_url,
                "working_dir" => &mut self.working_dir,
                _ => continue,
            };
            *slot = Some(text.to_string());
        }
    }
}

/// A persisted orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub state: RunState,
    pub context: RunContext,
    pub saved_at: DateTime<Utc>,

    #[serde(skip)]
    path: PathBuf,
}

impl Run {
    /// Validate against the transition table, append a stage entry, absorb
    /// `data` into the context, and persist. An invalid transition returns
    /// an error without mutating anything.
    pub fn transition(&mut self, to: RunState, data: Value) -> Result<(), RunError> {
        if !can_transition(self.state, to) {
            return Err(RunError::InvalidTransition {
                from: self.state,
                to,
            });
        }

        let now = Utc::now();
        let from = self.state;

        self.context.absorb(&data);
        self.context.stages.push(StageEntry {
            from_state: from,
            to_state: to,
            timestamp: now,
            data,
        });

        if self.context.start_time.is_none() && to != RunState::Idle {
            self.context.start_time = Some(now);
        }
        if to.is_terminal() {
            self.context.end_time = Some(now);
        }

        self.state = to;
        self.save()?;
        debug!(run_id = %self.run_id, %from, %to, "Transitioned");
        Ok(())
    }

    /// Append an error entry and persist.
    pub fn record_error(&mut self, message: &str, stage: Option<&str>) -> Result<(), RunError> {
        self.context.errors.push(ErrorEntry {
            stage: stage.unwrap_or(self.state.as_str()).to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        });
        self.save()
    }

    /// Record (or overwrite) the output of a stage and persist.
    pub fn record_output(&mut self, stage: &str, output: Value) -> Result<(), RunError> {
        self.context.outputs.insert(
            stage.to_string(),
            OutputEntry {
                output,
                timestamp: Utc::now(),
            },
        );
        self.save()
    }

    /// Append an artifact reference and persist.
    pub fn add_artifact(&mut self, kind: &str, path: &str, metadata: Value) -> Result<(), RunError> {
        self.context.artifacts.push(Artifact {
            kind: kind.to_string(),
            path: path.to_string(),
            metadata,
            timestamp: Utc::now(),
        });
        self.save()
    }

    /// Whole-file atomic write: temp then rename.
    pub fn save(&mut self) -> Result<(), RunError> {
        self.saved_at = Utc::now();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create runs directory")
                .map_err(RunError::Other)?;
        }

        let contents = serde_json::to_string_pretty(self)
            .context("Failed to serialize run")
            .map_err(RunError::Other)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents)
            .context("Failed to write run file")
            .map_err(RunError::Other)?;
        fs::rename(&tmp, &self.path)
            .context("Failed to replace run file")
            .map_err(RunError::Other)?;
        Ok(())
    }

    pub fn file_path(&self) -> &Path {
        &self.path
    }

    /// Wall-clock duration, when both endpoints are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.context.start_time, self.context.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// The on-disk run store.
pub struct RunStore {
    runs_dir: PathBuf,
}

impl RunStore {
    pub fn new(runs_dir: PathBuf) -> Self {
        Self { runs_dir }
    }

    /// Create a fresh run in state `idle` and persist it immediately.
    pub fn new_run(&self) -> Result<Run, RunError> {
        let run_id = Self::generate_run_id();
        let mut run = Run {
            path: self.runs_dir.join(format!("{run_id}.json")),
            run_id,
            state: RunState::Idle,
            context: RunContext::default(),
            saved_at: Utc::now(),
        };
        run.save()?;
        Ok(run)
    }

    /// Hydrate a run from its file.
    pub fn load(&self, run_id: &str) -> Result<Run, RunError> {
        let path = self.runs_dir.join(format!("{run_id}.json"));
        if !path.exists() {
            return Err(RunError::RunNotFound(run_id.to_string()));
        }

        let contents = fs::read_to_string(&path)
            .context("Failed to read run file")
            .map_err(RunError::Other)?;
        let mut run: Run = serde_json::from_str(&contents)
            .context("Failed to parse run file")
            .map_err(RunError::Other)?;
        run.path = path;
        Ok(run)
    }

    /// Newest run whose state is non-terminal, or `None`.
    pub fn active_run(&self) -> Result<Option<Run>, RunError> {
        for run_id in self.run_ids_desc()? {
            let run = self.load(&run_id)?;
            if !run.state.is_terminal() {
                return Ok(Some(run));
            }
        }
        Ok(None)
    }

    /// The most recent `limit` runs, newest first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<Run>, RunError> {
        let mut runs = Vec::new();
        for run_id in self.run_ids_desc()?.into_iter().take(limit) {
            runs.push(self.load(&run_id)?);
        }
        Ok(runs)
    }

    /// Run ids sorted descending; relies on the sortable id format.
    fn run_ids_desc(&self) -> Result<Vec<String>, RunError> {
        if !self.runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids: Vec<String> = fs::read_dir(&self.runs_dir)
            .context("Failed to read runs directory")
            .map_err(RunError::Other)?
            .filter_map(|entry| {
                let name = entry.ok()?.file_name().to_string_lossy().to_string();
                name.strip_suffix(".json").map(String::from)
            })
            .collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(ids)
    }

    /// Time-prefixed id, lexically sortable by creation time.
    fn generate_run_id() -> String {
        let prefix = Utc::now().format("%Y%m%d%H%M%S");
        let suffix = &Uuid::new_v4().simple().to_string()[..8];
        format!("run_{prefix}_{suffix}")
    }
}

//! Git operations for the task workspace.
//!
//! Every operation is a shell-out to the git CLI (rather than libgit2) to
//! stay compatible with hooks, credential helpers, and whatever git config
//! the user relies on. Untrusted strings (commit messages, branch names)
//! are always passed as separate arguments, never interpolated into a
//! shell line.

use anyhow::anyhow;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::api::gitlab::{GitLabClient, MergeRequest, MergeRequestParams};
use crate::api::types::Task;

pub const COMMIT_SIGNATURE: &str = "Committed by the gbos orchestrator";

#[derive(Debug, Error)]
pub enum GitError {
    #[error("no GitLab token configured")]
    NoGitLabToken,
    #[error("no origin remote configured")]
    NoRemote,
    #[error("git {command} failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Execute a git command and return trimmed stdout.
pub(crate) async fn run_git(args: &[&str], cwd: &Path) -> Result<String, GitError> {
    debug!(?args, ?cwd, "Running git command");

    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| GitError::Other(anyhow!("failed to execute git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::Command {
            command: (*args.first().unwrap_or(&"")).to_string(),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Working-tree status parsed from `git status --porcelain`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Status {
    pub has_changes: bool,
    pub modified: Vec<String>,
    pub added: Vec<String>,
    pub deleted: Vec<String>,
}

pub(crate) fn parse_porcelain(output: &str) -> Status {
    let mut status = Status::default();
    for line in output.lines() {
        if line.len() < 4 {
            continue;
        }
        let (code, path) = line.split_at(3);
        let path = path.trim().to_string();
        match code.trim() {
            "M" | "MM" | "AM" => status.modified.push(path),
            "A" | "??" => status.added.push(path),
            "D" => status.deleted.push(path),
            _ => status.modified.push(path),
        }
    }
    status.has_changes = !status.modified.is_empty()
        || !status.added.is_empty()
        || !status.deleted.is_empty();
    status
}

/// One commit's identity.
#[derive(Debug, Clone, Serialize)]
pub struct Commit {
    pub hash: String,
    pub short_hash: String,
    pub message: String,
    pub author: String,
    pub date: String,
}

/// Per-file numstat plus totals from `git diff --numstat HEAD~1`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiffSummary {
    pub files: Vec<DiffFile>,
    pub additions: u64,
    pub deletions: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiffFile {
    pub path: String,
    pub additions: u64,
    pub deletions: u64,
}

pub(crate) fn parse_numstat(output: &str) -> DiffSummary {
    let mut summary = DiffSummary::default();
    for line in output.lines() {
        let mut parts = line.split_whitespace();
        let (Some(add), Some(del), Some(path)) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        // Binary files report "-"
        let additions = add.parse().unwrap_or(0);
        let deletions = del.parse().unwrap_or(0);
        summary.additions += additions;
        summary.deletions += deletions;
        summary.files.push(DiffFile {
            path: path.to_string(),
            additions,
            deletions,
        });
    }
    summary
}

/// Aggregate result of the combined commit/push/MR operations.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommitPushResult {
    pub committed: bool,
    pub pushed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<Commit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_request: Option<MergeRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_request_error: Option<String>,
    pub message: String,
}

/// GitLab credentials for MR creation.
#[derive(Debug, Clone)]
pub struct GitLabConfig {
    pub token: String,
}

pub struct GitManager {
    cwd: PathBuf,
    gitlab: Option<GitLabConfig>,
    target_branch: String,
    remove_source_branch: bool,
}

impl GitManager {
    pub fn new(cwd: PathBuf) -> Self {
        Self {
            cwd,
            gitlab: None,
            target_branch: "main".to_string(),
            remove_source_branch: true,
        }
    }

    pub fn with_gitlab(mut self, config: Option<GitLabConfig>) -> Self {
        self.gitlab = config;
        self
    }

    pub fn with_target_branch(mut self, branch: &str) -> Self {
        self.target_branch = branch.to_string();
        self
    }

    pub fn with_remove_source_branch(mut self, remove: bool) -> Self {
        self.remove_source_branch = remove;
        self
    }

    /// `git add -A`, then the resulting porcelain status.
    #[instrument(skip_all)]
    pub async fn stage_all(&self) -> Result<Status, GitError> {
        run_git(&["add", "-A"], &self.cwd).await?;
        let porcelain = run_git(&["status", "--porcelain"], &self.cwd).await?;
        Ok(parse_porcelain(&porcelain))
    }

    /// Commit staged changes. With a task, the message is prefixed with the
    /// task key; the orchestrator signature trailer is always appended.
    #[instrument(skip_all)]
    pub async fn commit(&self, message: &str, task: Option<&Task>) -> Result<Commit, GitError> {
        let subject = match task {
            Some(task) => format!("[{}] {}", task.key_or_id(), message),
            None => message.to_string(),
        };
        let full_message = format!("{subject}\n\n{COMMIT_SIGNATURE}");

        run_git(&["commit", "-m", &full_message], &self.cwd).await?;
        self.last_commit().await
    }

    /// Identity of HEAD.
    #[instrument(skip_all)]
    pub async fn last_commit(&self) -> Result<Commit, GitError> {
        let raw = run_git(
            &["log", "-1", "--pretty=format:%H%n%h%n%s%n%an%n%aI"],
            &self.cwd,
        )
        .await?;
        let mut lines = raw.lines();
        Ok(Commit {
            hash: lines.next().unwrap_or_default().to_string(),
            short_hash: lines.next().unwrap_or_default().to_string(),
            message: lines.next().unwrap_or_default().to_string(),
            author: lines.next().unwrap_or_default().to_string(),
            date: lines.next().unwrap_or_default().to_string(),
        })
    }

    /// Push to origin. The first attempt sets the upstream; if that is
    /// rejected, retry a plain push.
    #[instrument(skip_all, fields(branch))]
    pub async fn push(&self, branch: Option<&str>, force: bool) -> Result<(), GitError> {
        let branch = match branch {
            Some(b) => b.to_string(),
            None => self.current_branch().await?,
        };

        let mut args = vec!["push", "-u", "origin", branch.as_str()];
        if force {
            args.push("--force-with-lease");
        }
        match run_git(&args, &self.cwd).await {
            Ok(_) => Ok(()),
            Err(first_err) => {
                warn!(%branch, "push -u failed, retrying without upstream");
                let mut args = vec!["push", "origin", branch.as_str()];
                if force {
                    args.push("--force-with-lease");
                }
                run_git(&args, &self.cwd).await.map(|_| ()).map_err(|_| first_err)
            }
        }
    }

    pub async fn current_branch(&self) -> Result<String, GitError> {
        run_git(&["rev-parse", "--abbrev-ref", "HEAD"], &self.cwd).await
    }

    pub async fn remote_url(&self) -> Result<String, GitError> {
        run_git(&["remote", "get-url", "origin"], &self.cwd)
            .await
            .map_err(|_| GitError::NoRemote)
    }

    pub async fn has_remote(&self) -> bool {
        self.remote_url().await.is_ok()
    }

    /// Numstat summary of the last commit.
    pub async fn diff_summary(&self) -> Result<DiffSummary, GitError> {
        let raw = run_git(&["diff", "--numstat", "HEAD~1"], &self.cwd)
            .await
            .unwrap_or_default();
        Ok(parse_numstat(&raw))
    }

    /// Create a merge request for `source` via the GitLab API. The host and
    /// project path are derived from the origin remote.
    #[instrument(skip_all, fields(source))]
    pub async fn create_merge_request(
        &self,
        source: &str,
        title: &str,
        description: &str,
    ) -> Result<MergeRequest, GitError> {
        let gitlab = self.gitlab.as_ref().ok_or(GitError::NoGitLabToken)?;
        let remote = self.remote_url().await?;
        let (host, project_path) =
            split_remote(&remote).ok_or_else(|| GitError::Other(anyhow!("unparsable remote: {remote}")))?;

        let client = GitLabClient::new(&format!("https://{host}"), &gitlab.token)
            .map_err(|e| GitError::Other(anyhow!(e)))?;
        client
            .create_merge_request(
                &project_path,
                &MergeRequestParams {
                    source_branch: source.to_string(),
                    target_branch: self.target_branch.clone(),
                    title: title.to_string(),
                    description: description.to_string(),
                    remove_source_branch: self.remove_source_branch,
                },
            )
            .await
            .map_err(|e| GitError::Other(anyhow!(e)))
    }

    /// Stage, commit, and push. No-op on a clean tree.
    pub async fn commit_and_push(
        &self,
        message: &str,
        task: Option<&Task>,
    ) -> Result<CommitPushResult, GitError> {
        let status = self.stage_all().await?;
        if !status.has_changes {
            return Ok(CommitPushResult {
                message: "No changes to commit".to_string(),
                ..Default::default()
            });
        }

        let commit = self.commit(message, task).await?;
        let branch = self.current_branch().await?;
        self.push(Some(&branch), false).await?;

        Ok(CommitPushResult {
            committed: true,
            pushed: true,
            message: format!("Committed {} and pushed {branch}", commit.short_hash),
            commit: Some(commit),
            ..Default::default()
        })
    }

    /// Stage, commit, push, then attempt MR creation. An MR failure is
    /// recorded in the result; the commit and push stand.
    pub async fn commit_push_and_mr(
        &self,
        message: &str,
        task: Option<&Task>,
        mr_title: &str,
    ) -> Result<CommitPushResult, GitError> {
        let mut result = self.commit_and_push(message, task).await?;
        if !result.committed {
            return Ok(result);
        }

        let branch = self.current_branch().await?;
        let diff = self.diff_summary().await.unwrap_or_default();
        let description = self.mr_description(task, &diff);

        match self.create_merge_request(&branch, mr_title, &description).await {
            Ok(mr) => {
                result.message = format!("{} (MR {})", result.message, mr.url);
                result.merge_request = Some(mr);
            }
            Err(e) => {
                warn!(error = %e, "Merge request creation failed");
                result.merge_request_error = Some(e.to_string());
            }
        }
        Ok(result)
    }

    /// Stage and commit without pushing, for local-only workspaces.
    pub async fn commit_only(&self, message: &str) -> Result<CommitPushResult, GitError> {
        let status = self.stage_all().await?;
        if !status.has_changes {
            return Ok(CommitPushResult {
                message: "No changes to commit".to_string(),
                ..Default::default()
            });
        }

        let commit = self.commit(message, None).await?;
        Ok(CommitPushResult {
            committed: true,
            pushed: false,
            message: format!("Committed {}", commit.short_hash),
            commit: Some(commit),
            ..Default::default()
        })
    }

    /// Templated MR description: Summary, Task, Description, Changes,
    /// signature.
    pub fn mr_description(&self, task: Option<&Task>, diff: &DiffSummary) -> String {
        let mut body = String::new();
        body.push_str("## Summary\n\n");
        match task {
            Some(task) => body.push_str(&format!("Automated change for task {}.\n\n", task.key_or_id())),
            None => body.push_str("Automated change.\n\n"),
        }

        if let Some(task) = task {
            body.push_str("## Task\n\n");
            body.push_str(&format!("- Title: {}\n", task.title));
            if let Some(key) = &task.task_key {
                body.push_str(&format!("- Key: {key}\n"));
            }
            body.push_str(&format!("- Id: {}\n\n", task.id));

            let description = task.body();
            if !description.is_empty() {
                body.push_str("## Description\n\n");
                body.push_str(description);
                body.push_str("\n\n");
            }
        }

        body.push_str("## Changes\n\n");
        if diff.files.is_empty() {
            body.push_str("See commit diff.\n");
        } else {
            for file in &diff.files {
                body.push_str(&format!(
                    "- `{}` (+{} / -{})\n",
                    file.path, file.additions, file.deletions
                ));
            }
            body.push_str(&format!(
                "\n{} additions, {} deletions\n",
                diff.additions, diff.deletions
            ));
        }

        body.push_str(&format!("\n---\n{COMMIT_SIGNATURE}\n"));
        body
    }
}

/// Split an origin URL into `(host, namespace/name)`.
pub(crate) fn split_remote(remote: &str) -> Option<(String, String)> {
    let remote = remote.trim().trim_end_matches(".git");

    if let Some(rest) = remote.strip_prefix("git@") {
        let (host, path) = rest.split_once(':')?;
        return Some((host.to_string(), path.to_string()));
    }

    let rest = remote
        .strip_prefix("https://")
        .or_else(|| remote.strip_prefix("http://"))?;
    let (host, path) = rest.split_once('/')?;
    Some((host.to_string(), path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn init_repo(dir: &Path) {
        run_git(&["init", "-q"], dir).await.unwrap();
        run_git(&["config", "user.email", "test@gbos.dev"], dir).await.unwrap();
        run_git(&["config", "user.name", "gbos test"], dir).await.unwrap();
    }

    fn sample_task() -> Task {
        serde_json::from_value(serde_json::json!({
            "id": "42",
            "task_key": "ABC-1",
            "title": "Add feature",
        }))
        .unwrap()
    }

    #[test]
    fn porcelain_parsing() {
        let status = parse_porcelain(" M src/app.ts\nA  src/new.ts\n?? notes.md\n D gone.ts\n");
        assert!(status.has_changes);
        assert_eq!(status.modified, vec!["src/app.ts"]);
        assert_eq!(status.added, vec!["src/new.ts", "notes.md"]);
        assert_eq!(status.deleted, vec!["gone.ts"]);

        let clean = parse_porcelain("");
        assert!(!clean.has_changes);
    }

    #[test]
    fn numstat_parsing() {
        let diff = parse_numstat("10\t2\tsrc/app.ts\n-\t-\tlogo.png\n3\t0\tREADME.md\n");
        assert_eq!(diff.files.len(), 3);
        assert_eq!(diff.additions, 13);
        assert_eq!(diff.deletions, 2);
        assert_eq!(diff.files[1].additions, 0);
    }

    #[test]
    fn remote_splitting() {
        assert_eq!(
            split_remote("git@gitlab.com:acme/shop.git"),
            Some(("gitlab.com".to_string(), "acme/shop".to_string()))
        );
        assert_eq!(
            split_remote("https://gitlab.example.com/group/sub/app.git"),
            Some(("gitlab.example.com".to_string(), "group/sub/app".to_string()))
        );
        assert_eq!(split_remote("not a url"), None);
    }

    #[tokio::test]
    async fn commit_prefixes_task_key_and_signs() {
        let temp = TempDir::new().unwrap();
        init_repo(temp.path()).await;
        std::fs::write(temp.path().join("file.txt"), "content").unwrap();

        let manager = GitManager::new(temp.path().to_path_buf());
        let status = manager.stage_all().await.unwrap();
        assert!(status.has_changes);

        let commit = manager.commit("add file", Some(&sample_task())).await.unwrap();
        assert_eq!(commit.message, "[ABC-1] add file");

        let full = run_git(&["log", "-1", "--pretty=%B"], temp.path()).await.unwrap();
        assert!(full.contains(COMMIT_SIGNATURE));
    }

    #[tokio::test]
    async fn commit_handles_quotes_in_message() {
        let temp = TempDir::new().unwrap();
        init_repo(temp.path()).await;
        std::fs::write(temp.path().join("file.txt"), "content").unwrap();

        let manager = GitManager::new(temp.path().to_path_buf());
        manager.stage_all().await.unwrap();
        let commit = manager
            .commit(r#"fix "quoted" and 'single' text"#, None)
            .await
            .unwrap();
        assert!(commit.message.contains(r#""quoted""#));
    }

    #[tokio::test]
    async fn commit_only_on_clean_tree_is_noop() {
        let temp = TempDir::new().unwrap();
        init_repo(temp.path()).await;
        std::fs::write(temp.path().join("file.txt"), "content").unwrap();

        let manager = GitManager::new(temp.path().to_path_buf());
        let first = manager.commit_only("initial").await.unwrap();
        assert!(first.committed);

        let second = manager.commit_only("nothing").await.unwrap();
        assert!(!second.committed);
        assert!(!second.pushed);
        assert_eq!(second.message, "No changes to commit");
    }

    #[tokio::test]
    async fn create_mr_without_token_fails() {
        let temp = TempDir::new().unwrap();
        init_repo(temp.path()).await;

        let manager = GitManager::new(temp.path().to_path_buf());
        let err = manager
            .create_merge_request("task/x", "title", "body")
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::NoGitLabToken));
    }

    #[tokio::test]
    async fn create_mr_without_remote_fails() {
        let temp = TempDir::new().unwrap();
        init_repo(temp.path()).await;

        let manager = GitManager::new(temp.path().to_path_buf()).with_gitlab(Some(GitLabConfig {
            token: "glpat-x".to_string(),
        }));
        let err = manager
            .create_merge_request("task/x", "title", "body")
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::NoRemote));
    }

    #[test]
    fn mr_description_sections() {
        let temp = TempDir::new().unwrap();
        let manager = GitManager::new(temp.path().to_path_buf());
        let diff = parse_numstat("5\t1\tsrc/app.ts\n");
        let body = manager.mr_description(Some(&sample_task()), &diff);

        assert!(body.contains("## Summary"));
        assert!(body.contains("## Task"));
        assert!(body.contains("- Key: ABC-1"));
        assert!(body.contains("## Changes"));
        assert!(body.contains("`src/app.ts` (+5 / -1)"));
        assert!(body.contains(COMMIT_SIGNATURE));
    }
}

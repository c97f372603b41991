//! Workspace preparation for a task.
//!
//! Decides where the working tree lives, gets it onto a clean task branch,
//! and exposes the environment the agent runs with. Remote interactions
//! during `prepare` (fetch, pull) are best-effort; a flaky network must not
//! keep the agent from working on what is already on disk.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::api::types::{Application, Task};
use crate::git::{parse_porcelain, run_git, Status};

/// Lower-case slug of a task title: non-alphanumerics collapse to single
/// dashes, trimmed, capped at 30 characters.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_dash = true;
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_matches('-');
    let mut capped: String = slug.chars().take(30).collect();
    while capped.ends_with('-') {
        capped.pop();
    }
    capped
}

/// Deterministic branch name for a task: `task/<key_or_id>-<slug>`.
pub fn branch_for_task(task: &Task) -> String {
    let slug = slugify(&task.title);
    if slug.is_empty() {
        format!("task/{}", task.key_or_id())
    } else {
        format!("task/{}-{slug}", task.key_or_id())
    }
}

/// Canonical form of a repository URL for equality checks: `git@host:path`
/// becomes `host/path`, the scheme and `.git` suffix are stripped, and the
/// result is lower-cased.
pub fn normalize_repo_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/').trim_end_matches(".git");

    let without_scheme = if let Some(rest) = url.strip_prefix("git@") {
        rest.replacen(':', "/", 1)
    } else {
        url.strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .or_else(|| url.strip_prefix("ssh://git@"))
            .unwrap_or(url)
            .to_string()
    };

    without_scheme.to_lowercase()
}

/// Last path segment of a repository URL, without `.git`.
pub fn repo_name(url: &str) -> String {
    normalize_repo_url(url)
        .rsplit('/')
        .next()
        .unwrap_or("repo")
        .to_string()
}

pub struct WorkspaceManager {
    app: Application,
    task: Option<Task>,
    pub working_dir: PathBuf,
    pub branch: Option<String>,
    /// True when the application has no repository URL
    pub local_only: bool,
}

impl WorkspaceManager {
    /// Resolve the working directory for `app`:
    /// 1. an explicit directory wins;
    /// 2. the current directory, when its origin matches the app's repo;
    /// 3. `<workspaces_dir>/<repo_name>` when the app has a repo;
    /// 4. the current directory (local-only mode).
    #[instrument(skip_all, fields(app = %app.name))]
    pub async fn resolve(
        app: &Application,
        task: Option<&Task>,
        explicit_dir: Option<&Path>,
        workspaces_dir: &Path,
    ) -> Result<Self> {
        let repo_url = app.repo().map(String::from);

        let working_dir = if let Some(dir) = explicit_dir {
            dir.to_path_buf()
        } else if let Some(repo) = &repo_url {
            let cwd = std::env::current_dir().context("No current directory")?;
            if cwd_matches_repo(&cwd, repo).await {
                debug!(?cwd, "Current directory matches application repo");
                cwd
            } else {
                workspaces_dir.join(repo_name(repo))
            }
        } else {
            std::env::current_dir().context("No current directory")?
        };

        Ok(Self {
            local_only: repo_url.is_none(),
            branch: task.map(branch_for_task),
            task: task.cloned(),
            working_dir,
            app: app.clone(),
        })
    }

    /// Swap in a newly fetched task, recomputing the branch.
    pub fn set_task(&mut self, task: &Task) {
        self.branch = Some(branch_for_task(task));
        self.task = Some(task.clone());
    }

    pub fn repo_url(&self) -> Option<&str> {
        self.app.repo()
    }

    pub fn cloud_run_url(&self) -> Option<&str> {
        self.app.deploy()
    }

    /// Get the working tree onto the task branch, cloning or initializing
    /// as needed, then make sure basic tooling is usable.
    #[instrument(skip_all, fields(dir = %self.working_dir.display()))]
    pub async fn prepare(&self) -> Result<()> {
        if self.local_only {
            self.prepare_local_only().await?;
        } else {
            self.prepare_with_repo().await?;
        }
        self.check_tooling().await;
        Ok(())
    }

    async fn prepare_with_repo(&self) -> Result<()> {
        let repo = self
            .app
            .repo()
            .ok_or_else(|| anyhow!("application has no repository URL"))?;
        let dir = &self.working_dir;

        if !dir.join(".git").exists() {
            if !dir.exists() {
                info!(%repo, "Cloning repository");
                let parent = dir.parent().unwrap_or(Path::new("."));
                std::fs::create_dir_all(parent)?;
                run_git(
                    &["clone", repo, &dir.to_string_lossy()],
                    parent,
                )
                .await
                .context("git clone failed")?;
            } else {
                // Directory exists but is not a repo: initialize in place
                info!(?dir, "Initializing existing directory as a repository");
                run_git(&["init"], dir).await?;
                run_git(&["remote", "add", "origin", repo], dir).await?;
                let _ = run_git(
                    &["commit", "--allow-empty", "-m", "Initial commit"],
                    dir,
                )
                .await;
                let _ = run_git(&["branch", "-M", "main"], dir).await;
                if let Err(e) =
                    run_git(&["pull", "origin", "main", "--allow-unrelated-histories"], dir).await
                {
                    warn!(error = %e, "Initial pull failed (continuing)");
                }
            }
        }

        // Sync with origin; every remote interaction here is best-effort
        if let Err(e) = run_git(&["fetch", "origin", "--prune"], dir).await {
            warn!(error = %e, "fetch failed (continuing)");
        }
        let _ = run_git(&["stash", "--include-untracked"], dir).await;
        let _ = run_git(&["reset"], dir).await;

        let base = if run_git(&["rev-parse", "--verify", "main"], dir).await.is_ok() {
            "main"
        } else {
            "master"
        };
        run_git(&["checkout", base], dir)
            .await
            .with_context(|| format!("checkout {base} failed"))?;
        if let Err(e) = run_git(&["pull", "--rebase", "origin", base], dir).await {
            warn!(error = %e, "rebase pull failed (continuing)");
        }

        if let Some(branch) = &self.branch {
            self.checkout_task_branch(branch).await?;
        }
        Ok(())
    }

    async fn prepare_local_only(&self) -> Result<()> {
        let dir = &self.working_dir;
        std::fs::create_dir_all(dir)?;

        if !dir.join(".git").exists() {
            info!(?dir, "Initializing local-only repository");
            run_git(&["init"], dir).await?;
        }
        if run_git(&["rev-parse", "--verify", "HEAD"], dir).await.is_err() {
            run_git(&["commit", "--allow-empty", "-m", "Initial commit"], dir).await?;
        }
        if let Some(branch) = &self.branch {
            self.checkout_task_branch(branch).await?;
        }
        Ok(())
    }

    async fn checkout_task_branch(&self, branch: &str) -> Result<()> {
        let dir = &self.working_dir;
        if run_git(&["rev-parse", "--verify", branch], dir).await.is_ok() {
            run_git(&["checkout", branch], dir).await?;
        } else {
            run_git(&["checkout", "-b", branch], dir).await?;
        }
        info!(%branch, "On task branch");
        Ok(())
    }

    /// Probe node/npm/git and install node dependencies when they are
    /// declared but absent. Failures are logged, never fatal.
    async fn check_tooling(&self) {
        for (binary, args) in [("node", "--version"), ("npm", "--version"), ("git", "--version")] {
            match probe(binary, args).await {
                Some(version) => debug!(binary, version, "Tool available"),
                None => warn!(binary, "Tool not available"),
            }
        }

        let dir = &self.working_dir;
        if dir.join("package.json").exists() && !dir.join("node_modules").exists() {
            info!("package.json without node_modules, running npm install");
            let result = Command::new("npm")
                .arg("install")
                .current_dir(dir)
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .output()
                .await;
            match result {
                Ok(output) if output.status.success() => info!("npm install finished"),
                Ok(output) => warn!(
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "npm install failed (continuing)"
                ),
                Err(e) => warn!(error = %e, "npm install could not start"),
            }
        }
    }

    /// Full environment for the agent process: parent env plus workspace
    /// variables plus `extra`.
    pub fn environment(&self, extra: &[(String, String)]) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.insert(
            "GBOS_WORKSPACE".to_string(),
            self.working_dir.to_string_lossy().to_string(),
        );
        if let Some(branch) = &self.branch {
            env.insert("GBOS_BRANCH".to_string(), branch.clone());
        }
        if let Some(repo) = self.app.repo() {
            env.insert("GBOS_REPO".to_string(), repo.to_string());
        }
        for (key, value) in extra {
            env.insert(key.clone(), value.clone());
        }
        env
    }

    pub async fn git_status(&self) -> Result<Status> {
        let porcelain = run_git(&["status", "--porcelain"], &self.working_dir).await?;
        Ok(parse_porcelain(&porcelain))
    }

    pub async fn current_commit(&self) -> Result<String> {
        Ok(run_git(&["rev-parse", "HEAD"], &self.working_dir).await?)
    }

    pub async fn current_branch(&self) -> Result<String> {
        Ok(run_git(&["rev-parse", "--abbrev-ref", "HEAD"], &self.working_dir).await?)
    }
}

/// Does `cwd`'s origin remote point at `repo`?
async fn cwd_matches_repo(cwd: &Path, repo: &str) -> bool {
    match run_git(&["remote", "get-url", "origin"], cwd).await {
        Ok(origin) => normalize_repo_url(&origin) == normalize_repo_url(repo),
        Err(_) => false,
    }
}

async fn probe(binary: &str, arg: &str) -> Option<String> {
    let output = Command::new(binary)
        .arg(arg)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn task(id: &str, key: Option<&str>, title: &str) -> Task {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "task_key": key,
            "title": title,
        }))
        .unwrap()
    }

    #[test]
    fn slug_is_lowercase_dashed_capped() {
        assert_eq!(slugify("Add  *SHINY*  feature!"), "add-shiny-feature");
        assert_eq!(slugify("simple"), "simple");
        assert_eq!(slugify("***"), "");

        let long = slugify("This is a very long task title that keeps going and going");
        assert!(long.len() <= 30);
        assert!(!long.ends_with('-'));
        assert!(long.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn branch_name_is_deterministic() {
        let t = task("42", Some("ABC-1"), "Add  *SHINY*  feature!");
        assert_eq!(branch_for_task(&t), "task/ABC-1-add-shiny-feature");

        // Without a key, the id is used
        let t = task("42", None, "Add  *SHINY*  feature!");
        assert_eq!(branch_for_task(&t), "task/42-add-shiny-feature");

        // A title with no usable characters still yields a branch
        let t = task("7", Some("X-2"), "!!!");
        assert_eq!(branch_for_task(&t), "task/X-2");
    }

    #[test]
    fn url_normalization_equates_ssh_and_https() {
        assert_eq!(
            normalize_repo_url("git@gitlab.com:Acme/Shop.git"),
            normalize_repo_url("https://gitlab.com/acme/shop")
        );
        assert_eq!(
            normalize_repo_url("https://gitlab.com/acme/shop.git/"),
            "gitlab.com/acme/shop"
        );
        assert_ne!(
            normalize_repo_url("git@gitlab.com:acme/shop"),
            normalize_repo_url("git@gitlab.com:acme/store")
        );
    }

    #[test]
    fn repo_name_from_url() {
        assert_eq!(repo_name("git@gitlab.com:acme/shop.git"), "shop");
        assert_eq!(repo_name("https://gitlab.com/acme/my-app"), "my-app");
    }

    fn app_without_repo() -> Application {
        serde_json::from_value(serde_json::json!({"id": "a1", "name": "scratch"})).unwrap()
    }

    /// Give git an identity so empty commits work on bare CI machines.
    fn ensure_git_identity() {
        for (key, value) in [
            ("GIT_AUTHOR_NAME", "gbos test"),
            ("GIT_AUTHOR_EMAIL", "test@gbos.dev"),
            ("GIT_COMMITTER_NAME", "gbos test"),
            ("GIT_COMMITTER_EMAIL", "test@gbos.dev"),
        ] {
            std::env::set_var(key, value);
        }
    }

    #[tokio::test]
    async fn explicit_dir_wins() {
        let temp = TempDir::new().unwrap();
        let app = app_without_repo();
        let ws = WorkspaceManager::resolve(&app, None, Some(temp.path()), Path::new("/tmp/wss"))
            .await
            .unwrap();
        assert_eq!(ws.working_dir, temp.path());
        assert!(ws.local_only);
    }

    #[tokio::test]
    async fn repo_app_defaults_to_workspaces_dir() {
        let app: Application = serde_json::from_value(serde_json::json!({
            "id": "a1",
            "name": "shop",
            "gitlab_repo_url": "git@gitlab.com:acme/shop.git",
        }))
        .unwrap();
        let ws = WorkspaceManager::resolve(&app, None, None, Path::new("/tmp/gbos-ws"))
            .await
            .unwrap();
        // The test cwd's origin does not match, so the managed dir is used
        assert_eq!(ws.working_dir, PathBuf::from("/tmp/gbos-ws/shop"));
        assert!(!ws.local_only);
    }

    #[tokio::test]
    async fn prepare_local_only_creates_branch() {
        ensure_git_identity();
        let temp = TempDir::new().unwrap();
        let app = app_without_repo();
        let t = task("9", Some("LOC-1"), "Local change");
        let mut ws = WorkspaceManager::resolve(&app, None, Some(temp.path()), Path::new("/x"))
            .await
            .unwrap();
        ws.set_task(&t);

        ws.prepare().await.unwrap();
        assert_eq!(ws.current_branch().await.unwrap(), "task/LOC-1-local-change");
        assert!(!ws.current_commit().await.unwrap().is_empty());

        // Preparing again with the same branch is idempotent
        ws.prepare().await.unwrap();
        assert_eq!(ws.current_branch().await.unwrap(), "task/LOC-1-local-change");
    }

    #[tokio::test]
    async fn environment_injects_workspace_vars() {
        ensure_git_identity();
        let temp = TempDir::new().unwrap();
        let app = app_without_repo();
        let t = task("9", None, "Env test");
        let mut ws = WorkspaceManager::resolve(&app, None, Some(temp.path()), Path::new("/x"))
            .await
            .unwrap();
        ws.set_task(&t);

        let env = ws.environment(&[("CI".to_string(), "1".to_string())]);
        assert_eq!(
            env.get("GBOS_WORKSPACE").map(String::as_str),
            Some(temp.path().to_string_lossy().as_ref())
        );
        assert_eq!(env.get("GBOS_BRANCH").map(String::as_str), Some("task/9-env-test"));
        assert_eq!(env.get("CI").map(String::as_str), Some("1"));
        assert!(!env.contains_key("GBOS_REPO"));
    }

    #[tokio::test]
    async fn git_status_reports_changes() {
        ensure_git_identity();
        let temp = TempDir::new().unwrap();
        let app = app_without_repo();
        let ws = WorkspaceManager::resolve(&app, None, Some(temp.path()), Path::new("/x"))
            .await
            .unwrap();
        ws.prepare().await.unwrap();

        std::fs::write(temp.path().join("new.txt"), "data").unwrap();
        let status = ws.git_status().await.unwrap();
        assert!(status.has_changes);
        assert_eq!(status.added, vec!["new.txt"]);
    }
}

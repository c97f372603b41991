//! Project verification: linting, formatting, type-checking, and tests.
//!
//! The project type is detected from marker files; each stage picks the
//! first applicable command and is skipped (counted as passed) when the
//! project declares nothing for it. Only unit tests are critical for the
//! overall verdict; everything else is advisory.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectType {
    Node,
    Python,
    Unknown,
}

/// What the project declares, read once per verification pass.
#[derive(Debug, Clone)]
pub struct ProjectInfo {
    pub project_type: ProjectType,
    pub scripts: HashMap<String, String>,
    pub dependencies: HashSet<String>,
}

impl ProjectInfo {
    pub fn has_dependency(&self, name: &str) -> bool {
        self.dependencies.contains(name)
    }

    pub fn has_script(&self, name: &str) -> bool {
        self.scripts.contains_key(name)
    }
}

/// Detect the project type by file presence and read declared
/// scripts/dependencies when available.
pub fn detect_project(dir: &Path) -> ProjectInfo {
    let package_json = dir.join("package.json");
    if package_json.exists() {
        let mut scripts = HashMap::new();
        let mut dependencies = HashSet::new();
        if let Ok(contents) = std::fs::read_to_string(&package_json) {
            if let Ok(value) = serde_json::from_str::<Value>(&contents) {
                if let Some(map) = value.get("scripts").and_then(Value::as_object) {
                    for (name, script) in map {
                        if let Some(script) = script.as_str() {
                            scripts.insert(name.clone(), script.to_string());
                        }
                    }
                }
                for key in ["dependencies", "devDependencies"] {
                    if let Some(map) = value.get(key).and_then(Value::as_object) {
                        dependencies.extend(map.keys().cloned());
                    }
                }
            }
        }
        return ProjectInfo {
            project_type: ProjectType::Node,
            scripts,
            dependencies,
        };
    }

    if dir.join("pyproject.toml").exists() || dir.join("requirements.txt").exists() {
        return ProjectInfo {
            project_type: ProjectType::Python,
            scripts: HashMap::new(),
            dependencies: HashSet::new(),
        };
    }

    ProjectInfo {
        project_type: ProjectType::Unknown,
        scripts: HashMap::new(),
        dependencies: HashSet::new(),
    }
}

/// Best-effort test counts parsed from runner output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TestStats {
    pub passed: u32,
    pub failed: u32,
}

static PASSED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\s+pass(?:ed|ing)?").expect("passed pattern"));
static FAILED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\s+fail(?:ed|ing)?").expect("failed pattern"));

/// Matches jest (`Tests: 1 failed, 3 passed`), pytest (`3 passed, 1 failed`),
/// and playwright (`3 passed (2s)`) summaries.
pub fn parse_test_stats(output: &str) -> Option<TestStats> {
    let passed = PASSED_RE
        .captures(output)
        .and_then(|c| c[1].parse().ok());
    let failed = FAILED_RE
        .captures(output)
        .and_then(|c| c[1].parse().ok());
    if passed.is_none() && failed.is_none() {
        return None;
    }
    Some(TestStats {
        passed: passed.unwrap_or(0),
        failed: failed.unwrap_or(0),
    })
}

/// Result of one verification stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub passed: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<TestStats>,
}

impl StageResult {
    fn skipped(message: &str) -> Self {
        Self {
            passed: true,
            output: message.to_string(),
            command: None,
            stats: None,
        }
    }
}

/// Full verification report. `None` stages were not applicable at all
/// (e.g. E2E without a deployed URL).
#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub project_type: ProjectType,
    pub linting: Option<StageResult>,
    pub formatting: Option<StageResult>,
    pub type_check: Option<StageResult>,
    pub unit_tests: Option<StageResult>,
    pub e2e_tests: Option<StageResult>,
    pub passed: bool,
    pub summary: String,
}

impl VerificationReport {
    /// Critical set: unit tests (absent counts as passed). Everything else
    /// only feeds the summary.
    fn finalize(mut self) -> Self {
        self.passed = self.unit_tests.as_ref().is_none_or(|s| s.passed);

        let optional = [&self.linting, &self.formatting, &self.type_check, &self.e2e_tests];
        let applicable = optional.iter().filter(|s| s.is_some()).count();
        let passing = optional
            .iter()
            .filter(|s| s.as_ref().is_some_and(|s| s.passed))
            .count();

        let unit = match &self.unit_tests {
            Some(stage) if stage.passed => "unit tests passed",
            Some(_) => "unit tests FAILED",
            None => "no unit tests",
        };
        self.summary = format!("{unit}; {passing}/{applicable} optional checks passed");
        self
    }
}

/// Outcome of the pre-verification auto-fix pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PostProcessReport {
    pub actions: Vec<StageResult>,
}

pub struct VerificationManager {
    dir: PathBuf,
    check_timeout: Duration,
    test_timeout: Duration,
    cloud_run_url: Option<String>,
}

impl VerificationManager {
    pub fn new(dir: PathBuf, check_timeout: Duration, test_timeout: Duration) -> Self {
        Self {
            dir,
            check_timeout,
            test_timeout,
            cloud_run_url: None,
        }
    }

    pub fn with_cloud_run_url(mut self, url: Option<String>) -> Self {
        self.cloud_run_url = url;
        self
    }

    /// Run every applicable stage and compute the overall verdict.
    pub async fn run_all(&self) -> VerificationReport {
        let info = detect_project(&self.dir);
        info!(project_type = ?info.project_type, "Running verification");

        let report = VerificationReport {
            project_type: info.project_type,
            linting: self.run_linting(&info).await,
            formatting: self.run_formatting(&info).await,
            type_check: self.run_type_check(&info).await,
            unit_tests: self.run_unit_tests(&info).await,
            e2e_tests: self.run_e2e_tests(&info).await,
            passed: false,
            summary: String::new(),
        };
        report.finalize()
    }

    /// Auto-fix pass run before verification: lint fixers and formatters.
    /// Failures are recorded in the report but never propagate.
    pub async fn post_process(&self) -> PostProcessReport {
        let info = detect_project(&self.dir);
        let mut report = PostProcessReport::default();

        match info.project_type {
            ProjectType::Node => {
                if info.has_script("lint:fix") {
                    report.actions.push(
                        self.run_stage("npm", &["run", "lint:fix"], &[], self.check_timeout).await,
                    );
                } else if info.has_dependency("eslint") {
                    report.actions.push(
                        self.run_stage("npx", &["eslint", ".", "--fix"], &[], self.check_timeout)
                            .await,
                    );
                }
                if info.has_dependency("prettier") {
                    report.actions.push(
                        self.run_stage("npx", &["prettier", "--write", "."], &[], self.check_timeout)
                            .await,
                    );
                }
            }
            ProjectType::Python => {
                if binary_available("black") {
                    report
                        .actions
                        .push(self.run_stage("black", &["."], &[], self.check_timeout).await);
                }
            }
            ProjectType::Unknown => {}
        }

        for action in &report.actions {
            if !action.passed {
                warn!(command = ?action.command, "Post-processing step failed (continuing)");
            }
        }
        report
    }

    async fn run_linting(&self, info: &ProjectInfo) -> Option<StageResult> {
        match info.project_type {
            ProjectType::Node => {
                if info.has_script("lint") {
                    Some(self.run_stage("npm", &["run", "lint"], &[], self.check_timeout).await)
                } else if info.has_dependency("eslint") {
                    Some(self.run_stage("npx", &["eslint", "."], &[], self.check_timeout).await)
                } else {
                    Some(StageResult::skipped("No linting configured"))
                }
            }
            ProjectType::Python => {
                if binary_available("flake8") {
                    Some(self.run_stage("flake8", &[], &[], self.check_timeout).await)
                } else if binary_available("pylint") {
                    Some(self.run_stage("pylint", &["."], &[], self.check_timeout).await)
                } else {
                    Some(StageResult::skipped("No linting configured"))
                }
            }
            ProjectType::Unknown => None,
        }
    }

    async fn run_formatting(&self, info: &ProjectInfo) -> Option<StageResult> {
        match info.project_type {
            ProjectType::Node => {
                if info.has_script("format") {
                    Some(
                        self.run_stage("npm", &["run", "format", "--", "--check"], &[], self.check_timeout)
                            .await,
                    )
                } else if info.has_dependency("prettier") {
                    Some(
                        self.run_stage("npx", &["prettier", "--check", "."], &[], self.check_timeout)
                            .await,
                    )
                } else {
                    Some(StageResult::skipped("No formatter configured"))
                }
            }
            ProjectType::Python => {
                if binary_available("black") {
                    Some(
                        self.run_stage("black", &["--check", "."], &[], self.check_timeout)
                            .await,
                    )
                } else if binary_available("autopep8") {
                    Some(
                        self.run_stage("autopep8", &["--diff", "."], &[], self.check_timeout)
                            .await,
                    )
                } else {
                    Some(StageResult::skipped("No formatter configured"))
                }
            }
            ProjectType::Unknown => None,
        }
    }

    async fn run_type_check(&self, info: &ProjectInfo) -> Option<StageResult> {
        match info.project_type {
            ProjectType::Node => {
                if info.has_dependency("typescript") {
                    Some(
                        self.run_stage("npx", &["tsc", "--noEmit"], &[], self.check_timeout)
                            .await,
                    )
                } else {
                    Some(StageResult::skipped("No type checker configured"))
                }
            }
            ProjectType::Python => {
                if binary_available("mypy") {
                    Some(self.run_stage("mypy", &["."], &[], self.check_timeout).await)
                } else {
                    Some(StageResult::skipped("No type checker configured"))
                }
            }
            ProjectType::Unknown => None,
        }
    }

    async fn run_unit_tests(&self, info: &ProjectInfo) -> Option<StageResult> {
        let ci = [("CI".to_string(), "1".to_string())];
        match info.project_type {
            ProjectType::Node => {
                let result = if info.has_script("test") {
                    self.run_stage("npm", &["test"], &ci, self.test_timeout).await
                } else if info.has_dependency("jest") {
                    self.run_stage("npx", &["jest"], &ci, self.test_timeout).await
                } else if info.has_dependency("vitest") {
                    self.run_stage("npx", &["vitest", "run"], &ci, self.test_timeout).await
                } else if info.has_dependency("mocha") {
                    self.run_stage("npx", &["mocha"], &ci, self.test_timeout).await
                } else {
                    StageResult::skipped("No unit tests configured")
                };
                Some(result)
            }
            ProjectType::Python => {
                if binary_available("pytest") {
                    Some(self.run_stage("pytest", &[], &ci, self.test_timeout).await)
                } else {
                    Some(StageResult::skipped("No unit tests configured"))
                }
            }
            ProjectType::Unknown => None,
        }
    }

    /// E2E only runs against a deployed URL, and only when the project
    /// declares Playwright.
    async fn run_e2e_tests(&self, info: &ProjectInfo) -> Option<StageResult> {
        let url = self.cloud_run_url.as_ref()?;
        if info.project_type != ProjectType::Node
            || !(info.has_dependency("@playwright/test") || info.has_dependency("playwright"))
        {
            return None;
        }

        let env = [
            ("CI".to_string(), "1".to_string()),
            ("BASE_URL".to_string(), url.clone()),
            ("PLAYWRIGHT_BASE_URL".to_string(), url.clone()),
        ];
        Some(
            self.run_stage("npx", &["playwright", "test"], &env, self.test_timeout)
                .await,
        )
    }

    async fn run_stage(
        &self,
        command: &str,
        args: &[&str],
        env: &[(String, String)],
        timeout: Duration,
    ) -> StageResult {
        let display_str = if args.is_empty() {
            command.to_string()
        } else {
            format!("{command} {}", args.join(" "))
        };
        debug!(command = %display_str, "Running verification stage");

        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let result = tokio::time::timeout(timeout, cmd.output()).await;
        match result {
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).to_string();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                let stats = parse_test_stats(&text);
                StageResult {
                    passed: output.status.success(),
                    output: text,
                    command: Some(display_str),
                    stats,
                }
            }
            Ok(Err(e)) => StageResult {
                passed: false,
                output: format!("failed to run: {e}"),
                command: Some(display_str),
                stats: None,
            },
            Err(_) => StageResult {
                passed: false,
                output: format!("timed out after {}s", timeout.as_secs()),
                command: Some(display_str),
                stats: None,
            },
        }
    }
}

fn binary_available(name: &str) -> bool {
    which::which(name).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_package_json(dir: &Path, contents: &str) {
        std::fs::write(dir.join("package.json"), contents).unwrap();
    }

    #[test]
    fn detects_node_with_scripts_and_deps() {
        let temp = TempDir::new().unwrap();
        write_package_json(
            temp.path(),
            r#"{
                "scripts": {"test": "jest", "lint": "eslint ."},
                "dependencies": {"react": "^18"},
                "devDependencies": {"jest": "^29", "typescript": "^5"}
            }"#,
        );

        let info = detect_project(temp.path());
        assert_eq!(info.project_type, ProjectType::Node);
        assert!(info.has_script("test"));
        assert!(info.has_script("lint"));
        assert!(info.has_dependency("react"));
        assert!(info.has_dependency("typescript"));
    }

    #[test]
    fn detects_python_by_marker_files() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("pyproject.toml"), "[project]\nname = \"x\"").unwrap();
        assert_eq!(detect_project(temp.path()).project_type, ProjectType::Python);

        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("requirements.txt"), "flask\n").unwrap();
        assert_eq!(detect_project(temp.path()).project_type, ProjectType::Python);
    }

    #[test]
    fn detects_unknown_for_empty_dir() {
        let temp = TempDir::new().unwrap();
        assert_eq!(detect_project(temp.path()).project_type, ProjectType::Unknown);
    }

    #[test]
    fn node_wins_over_python_markers() {
        let temp = TempDir::new().unwrap();
        write_package_json(temp.path(), "{}");
        std::fs::write(temp.path().join("requirements.txt"), "flask\n").unwrap();
        assert_eq!(detect_project(temp.path()).project_type, ProjectType::Node);
    }

    #[test]
    fn stats_parsing_covers_runners() {
        // jest
        let stats = parse_test_stats("Tests:       1 failed, 7 passed, 8 total").unwrap();
        assert_eq!(stats, TestStats { passed: 7, failed: 1 });

        // pytest
        let stats = parse_test_stats("==== 12 passed, 2 failed in 3.42s ====").unwrap();
        assert_eq!(stats, TestStats { passed: 12, failed: 2 });

        // playwright
        let stats = parse_test_stats("  3 passed (4.2s)").unwrap();
        assert_eq!(stats, TestStats { passed: 3, failed: 0 });

        assert!(parse_test_stats("no numbers here").is_none());
    }

    #[test]
    fn verdict_requires_only_unit_tests() {
        let failing_optional = VerificationReport {
            project_type: ProjectType::Node,
            linting: Some(StageResult {
                passed: false,
                output: String::new(),
                command: None,
                stats: None,
            }),
            formatting: Some(StageResult::skipped("none")),
            type_check: None,
            unit_tests: Some(StageResult {
                passed: true,
                output: String::new(),
                command: None,
                stats: None,
            }),
            e2e_tests: None,
            passed: false,
            summary: String::new(),
        }
        .finalize();

        assert!(failing_optional.passed);
        assert!(failing_optional.summary.contains("unit tests passed"));
        assert!(failing_optional.summary.contains("1/2 optional"));
    }

    #[test]
    fn verdict_fails_on_unit_test_failure() {
        let report = VerificationReport {
            project_type: ProjectType::Node,
            linting: None,
            formatting: None,
            type_check: None,
            unit_tests: Some(StageResult {
                passed: false,
                output: String::new(),
                command: None,
                stats: None,
            }),
            e2e_tests: None,
            passed: true,
            summary: String::new(),
        }
        .finalize();

        assert!(!report.passed);
        assert!(report.summary.contains("FAILED"));
    }

    #[test]
    fn verdict_without_unit_tests_passes() {
        let report = VerificationReport {
            project_type: ProjectType::Unknown,
            linting: None,
            formatting: None,
            type_check: None,
            unit_tests: None,
            e2e_tests: None,
            passed: false,
            summary: String::new(),
        }
        .finalize();
        assert!(report.passed);
        assert!(report.summary.contains("no unit tests"));
    }

    #[tokio::test]
    async fn unknown_project_verifies_trivially() {
        let temp = TempDir::new().unwrap();
        let manager = VerificationManager::new(
            temp.path().to_path_buf(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );

        let report = manager.run_all().await;
        assert_eq!(report.project_type, ProjectType::Unknown);
        assert!(report.passed);
        assert!(report.linting.is_none());
        assert!(report.e2e_tests.is_none());
    }

    #[tokio::test]
    async fn e2e_requires_cloud_url_and_playwright() {
        let temp = TempDir::new().unwrap();
        write_package_json(temp.path(), r#"{"devDependencies": {"@playwright/test": "^1"}}"#);

        // No URL: stage not applicable
        let manager = VerificationManager::new(
            temp.path().to_path_buf(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        let info = detect_project(temp.path());
        assert!(manager.run_e2e_tests(&info).await.is_none());
    }

    #[tokio::test]
    async fn post_process_on_unknown_project_is_empty() {
        let temp = TempDir::new().unwrap();
        let manager = VerificationManager::new(
            temp.path().to_path_buf(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        let report = manager.post_process().await;
        assert!(report.actions.is_empty());
    }

    #[tokio::test]
    async fn stage_timeout_fails_stage() {
        let temp = TempDir::new().unwrap();
        let manager = VerificationManager::new(
            temp.path().to_path_buf(),
            Duration::from_millis(200),
            Duration::from_millis(200),
        );
        let result = manager
            .run_stage("sleep", &["5"], &[], Duration::from_millis(200))
            .await;
        assert!(!result.passed);
        assert!(result.output.contains("timed out"));
    }
}

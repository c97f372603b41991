use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Default agent vendor when `start --agent` is not given
    #[serde(default = "default_vendor")]
    pub vendor: String,
    /// Skip the agent's interactive confirmations
    #[serde(default = "default_true")]
    pub auto_approve: bool,
    /// Model override passed through to the agent CLI
    #[serde(default)]
    pub model: Option<String>,
    /// Maximum agent turns, for vendors that support it
    #[serde(default)]
    pub max_turns: Option<u32>,
}

fn default_vendor() -> String {
    "claude-code".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            vendor: default_vendor(),
            auto_approve: true,
            model: None,
            max_turns: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Seconds an agent session may run before termination (default: 1800 = 30 min)
    #[serde(default = "default_agent_timeout")]
    pub agent_secs: u64,
    /// Seconds for lint/format/typecheck commands (default: 60)
    #[serde(default = "default_check_timeout")]
    pub check_secs: u64,
    /// Seconds for unit and E2E test commands (default: 600 = 10 min)
    #[serde(default = "default_test_timeout")]
    pub test_secs: u64,
    /// Grace period between SIGTERM and SIGKILL (default: 5)
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,
}

fn default_agent_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_check_timeout() -> u64 {
    60
}

fn default_test_timeout() -> u64 {
    600 // 10 minutes
}

fn default_kill_grace() -> u64 {
    5
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            agent_secs: default_agent_timeout(),
            check_secs: default_check_timeout(),
            test_secs: default_test_timeout(),
            kill_grace_secs: default_kill_grace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Seconds between liveness posts to the control plane (default: 30)
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
}

fn default_heartbeat_interval() -> u64 {
    30
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of persisted state: runs, logs, workspaces, session store
    #[serde(default = "default_state_dir")]
    pub state: String,
}

fn default_state_dir() -> String {
    "~/.gbos".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state: default_state_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Open a merge request after pushing a task branch
    #[serde(default = "default_true")]
    pub create_merge_request: bool,
    /// Ask GitLab to delete the source branch on merge
    #[serde(default = "default_true")]
    pub remove_source_branch: bool,
    /// Target branch for merge requests (default: main)
    #[serde(default = "default_target_branch")]
    pub target_branch: String,
}

fn default_target_branch() -> String {
    "main".to_string()
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            create_merge_request: true,
            remove_source_branch: true,
            target_branch: default_target_branch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApiConfig {
    /// Control-plane base URL override; the session store value wins otherwise
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Write driver logs to a file under the state directory
    #[serde(default = "default_true")]
    pub to_file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            to_file: true,
        }
    }
}

impl Config {
    /// User config in ~/.config/gbos/config.toml (optional overrides)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("gbos").join("config.toml"))
    }

    pub fn load(config_path: Option<&str>) -> Result<Self> {
        // Start with embedded defaults so gbos works without config files
        let defaults = Config::default();
        let defaults_json =
            serde_json::to_string(&defaults).context("Failed to serialize default config")?;

        let mut builder = config::Config::builder().add_source(config::File::from_str(
            &defaults_json,
            config::FileFormat::Json,
        ));

        if let Some(user_config) = Self::user_config_path() {
            if user_config.exists() {
                builder = builder.add_source(config::File::from(user_config));
            }
        }

        // Explicit config file (CLI override)
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment variables with GBOS_ prefix, e.g. GBOS_TIMEOUTS__AGENT_SECS
        builder = builder.add_source(
            config::Environment::with_prefix("GBOS")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to load configuration")?;
        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    pub fn save(&self) -> Result<()> {
        let config_path =
            Self::user_config_path().context("No user config directory on this platform")?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, toml_str).context("Failed to write config file")?;
        Ok(())
    }

    /// Absolute state root, with a leading `~` expanded
    pub fn state_path(&self) -> PathBuf {
        let raw = &self.paths.state;
        if let Some(rest) = raw.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        let path = PathBuf::from(raw);
        if path.is_absolute() {
            path
        } else {
            std::env::current_dir().unwrap_or_default().join(path)
        }
    }

    /// Directory holding one JSON file per run
    pub fn runs_path(&self) -> PathBuf {
        self.state_path().join("runs")
    }

    /// Directory holding driver and session logs
    pub fn logs_path(&self) -> PathBuf {
        self.state_path().join("logs")
    }

    /// Directory holding cloned repositories
    pub fn workspaces_path(&self) -> PathBuf {
        self.state_path().join("workspaces")
    }

    /// Path of the persisted authentication session
    pub fn session_file_path(&self) -> PathBuf {
        self.state_path().join("session.json")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            timeouts: TimeoutsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            paths: PathsConfig::default(),
            git: GitConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.agent.vendor, "claude-code");
        assert!(config.agent.auto_approve);
        assert_eq!(config.timeouts.agent_secs, 1800);
        assert_eq!(config.timeouts.kill_grace_secs, 5);
        assert_eq!(config.heartbeat.interval_secs, 30);
        assert!(config.git.create_merge_request);
    }

    #[test]
    fn state_path_expands_tilde() {
        let config = Config::default();
        let state = config.state_path();
        assert!(state.is_absolute());
        assert!(state.ends_with(".gbos"));
    }

    #[test]
    fn derived_paths_hang_off_state() {
        let mut config = Config::default();
        config.paths.state = "/tmp/gbos-test".to_string();
        assert_eq!(config.runs_path(), PathBuf::from("/tmp/gbos-test/runs"));
        assert_eq!(config.logs_path(), PathBuf::from("/tmp/gbos-test/logs"));
        assert_eq!(
            config.workspaces_path(),
            PathBuf::from("/tmp/gbos-test/workspaces")
        );
        assert_eq!(
            config.session_file_path(),
            PathBuf::from("/tmp/gbos-test/session.json")
        );
    }

    #[test]
    fn relative_state_path_resolves_against_cwd() {
        let mut config = Config::default();
        config.paths.state = "local-state".to_string();
        let state = config.state_path();
        assert!(state.is_absolute());
        assert!(state.ends_with("local-state"));
    }
}

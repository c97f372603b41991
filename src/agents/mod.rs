//! Agent adapters.
//!
//! An adapter turns a third-party coding-agent CLI into the orchestrator's
//! contract: availability probing, command assembly, prompt rendering, and
//! output heuristics. Adapters are selected by lower-cased alias; unknown
//! names fail with [`AdapterError::UnknownAdapter`].

pub mod claude;
pub mod codex;
pub mod gemini;
pub mod heuristics;
pub mod prompt;

pub use heuristics::ParsedOutput;
pub use prompt::PromptContext;

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;

use crate::api::types::Task;
use heuristics::PatternSet;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unknown agent adapter: {0}")]
    UnknownAdapter(String),
}

/// Static facts about an adapter.
#[derive(Debug, Clone)]
pub struct AdapterDescriptor {
    pub name: &'static str,
    pub supports_non_interactive: bool,
    pub supports_interactive: bool,
}

/// Caller-selected invocation options.
#[derive(Debug, Clone, Default)]
pub struct AgentInvocation {
    /// Map to the vendor's "skip confirmations" flag
    pub auto_approve: bool,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub quiet: bool,
    pub verbose: bool,
    /// Explicit API key; otherwise forwarded from the parent environment
    pub api_key: Option<String>,
}

/// A fully assembled agent command, ready for the session runner.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Close the child's stdin once the prompt is written; vendors that wait
    /// for EOF before starting need this.
    pub close_stdin_on_write: bool,
}

#[async_trait]
pub trait AgentAdapter: Send + Sync + std::fmt::Debug {
    fn descriptor(&self) -> AdapterDescriptor;

    /// The binary probed on `$PATH`.
    fn binary(&self) -> &'static str;

    /// Vendor-specific detection patterns, layered over the defaults.
    fn patterns(&self) -> &'static PatternSet;

    /// Assemble the child-process command for one agent session.
    fn command(&self, invocation: &AgentInvocation) -> AgentCommand;

    fn name(&self) -> &'static str {
        self.descriptor().name
    }

    /// Whether the agent binary is callable.
    async fn is_available(&self) -> bool {
        which::which(self.binary()).is_ok()
    }

    /// Short version string; "unknown" when the probe fails.
    async fn version(&self) -> String {
        let result = Command::new(self.binary())
            .arg("--version")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await;

        match result {
            Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            _ => "unknown".to_string(),
        }
    }

    /// Render the task prompt. The default covers every vendor; override
    /// only when a vendor needs special framing.
    fn format_prompt(&self, task: &Task, context: &PromptContext) -> String {
        prompt::render(task, context)
    }

    fn detect_completion(&self, output: &str) -> bool {
        heuristics::detect_completion(self.patterns(), output)
    }

    fn detect_waiting_for_input(&self, output: &str) -> bool {
        heuristics::detect_waiting_for_input(self.patterns(), output)
    }

    fn detect_error(&self, output: &str) -> bool {
        heuristics::detect_error(self.patterns(), output)
    }

    fn parse_output(&self, output: &str) -> ParsedOutput {
        heuristics::parse_output(output)
    }
}

/// Forward an API key into the child env: explicit key wins, otherwise the
/// first parent-environment variable that is set.
pub(crate) fn forward_api_key(
    invocation: &AgentInvocation,
    var_names: &[&str],
) -> Vec<(String, String)> {
    if let Some(key) = &invocation.api_key {
        if let Some(primary) = var_names.first() {
            return vec![((*primary).to_string(), key.clone())];
        }
    }
    for name in var_names {
        if let Ok(value) = std::env::var(name) {
            if !value.is_empty() {
                return vec![((*name).to_string(), value)];
            }
        }
    }
    Vec::new()
}

/// Resolve an adapter by alias (case-insensitive).
pub fn resolve(name: &str) -> Result<Arc<dyn AgentAdapter>, AdapterError> {
    match name.to_lowercase().as_str() {
        "claude-code" | "claude" => Ok(Arc::new(claude::ClaudeAdapter)),
        "codex" | "openai" => Ok(Arc::new(codex::CodexAdapter)),
        "gemini" | "google" => Ok(Arc::new(gemini::GeminiAdapter)),
        other => Err(AdapterError::UnknownAdapter(other.to_string())),
    }
}

/// Canonical adapter names, for help text.
pub fn known_adapters() -> &'static [&'static str] {
    &["claude-code", "codex", "gemini"]
}

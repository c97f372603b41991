//! Codex adapter.
//!
//! Runs `codex exec` reading the prompt from stdin.

use once_cell::sync::Lazy;
use regex::Regex;

use super::heuristics::PatternSet;
use super::{forward_api_key, AdapterDescriptor, AgentAdapter, AgentCommand, AgentInvocation};

#[derive(Debug)]
pub struct CodexAdapter;

static PATTERNS: Lazy<PatternSet> = Lazy::new(|| PatternSet {
    completion: vec![
        Regex::new(r"(?i)^\s*tokens used:").unwrap(),
        Regex::new(r"(?i)\bturn (limit reached|complete)").unwrap(),
    ],
    waiting: vec![Regex::new(r"(?i)\bapprove this (command|change)\b").unwrap()],
    error: vec![
        Regex::new(r"(?i)\bincorrect api key\b").unwrap(),
        Regex::new(r"(?i)\binsufficient[_ ]quota\b").unwrap(),
    ],
});

impl AgentAdapter for CodexAdapter {
    fn descriptor(&self) -> AdapterDescriptor {
        AdapterDescriptor {
            name: "codex",
            supports_non_interactive: true,
            supports_interactive: true,
        }
    }

    fn binary(&self) -> &'static str {
        "codex"
    }

    fn patterns(&self) -> &'static PatternSet {
        &PATTERNS
    }

    fn command(&self, invocation: &AgentInvocation) -> AgentCommand {
        let mut args = vec!["exec".to_string()];

        if invocation.auto_approve {
            args.push("--full-auto".to_string());
        }
        if let Some(model) = &invocation.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if invocation.quiet {
            args.push("--quiet".to_string());
        }

        AgentCommand {
            command: self.binary().to_string(),
            args,
            env: forward_api_key(invocation, &["OPENAI_API_KEY"]),
            close_stdin_on_write: true,
        }
    }
}

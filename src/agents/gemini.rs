//! Gemini CLI adapter.

use once_cell::sync::Lazy;
use regex::Regex;

use super::heuristics::PatternSet;
use super::{forward_api_key, AdapterDescriptor, AgentAdapter, AgentCommand, AgentInvocation};

#[derive(Debug)]
pub struct GeminiAdapter;

static PATTERNS: Lazy<PatternSet> = Lazy::new(|| PatternSet {
    completion: vec![Regex::new(r"(?i)\bagent (loop )?finished\b").unwrap()],
    waiting: vec![Regex::new(r"(?i)\bconfirm to proceed\b").unwrap()],
    error: vec![
        Regex::new(r"(?i)\bresource[_ ]exhausted\b").unwrap(),
        Regex::new(r"(?i)\bquota exceeded\b").unwrap(),
    ],
});

impl AgentAdapter for GeminiAdapter {
    fn descriptor(&self) -> AdapterDescriptor {
        AdapterDescriptor {
            name: "gemini",
            supports_non_interactive: true,
            supports_interactive: true,
        }
    }

    fn binary(&self) -> &'static str {
        "gemini"
    }

    fn patterns(&self) -> &'static PatternSet {
        &PATTERNS
    }

    fn command(&self, invocation: &AgentInvocation) -> AgentCommand {
        let mut args = Vec::new();

        if invocation.auto_approve {
            args.push("--yolo".to_string());
        }
        if let Some(model) = &invocation.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        AgentCommand {
            command: self.binary().to_string(),
            args,
            env: forward_api_key(invocation, &["GEMINI_API_KEY", "GOOGLE_API_KEY"]),
            close_stdin_on_write: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_approve_maps_to_yolo() {
        let invocation = AgentInvocation {
            auto_approve: true,
            ..Default::default()
        };
        let cmd = GeminiAdapter.command(&invocation);
        assert_eq!(cmd.command, "gemini");
        assert!(cmd.args.contains(&"--yolo".to_string()));
    }

    #[test]
    fn no_flags_without_options() {
        let cmd = GeminiAdapter.command(&AgentInvocation::default());
        assert!(cmd.args.is_empty());
    }

    #[test]
    fn vendor_error_patterns() {
        let adapter = GeminiAdapter;
        assert!(adapter.detect_error("RESOURCE_EXHAUSTED: Quota exceeded"));
    }
}

//! Claude Code adapter.
//!
//! Runs `claude --print` with the prompt on stdin; the CLI waits for EOF
//! before starting, so the command declares `close_stdin_on_write`.

use once_cell::sync::Lazy;
use regex::Regex;

use super::heuristics::PatternSet;
use super::{forward_api_key, AdapterDescriptor, AgentAdapter, AgentCommand, AgentInvocation};

#[derive(Debug)]
pub struct ClaudeAdapter;

static PATTERNS: Lazy<PatternSet> = Lazy::new(|| PatternSet {
    completion: vec![
        Regex::new(r"(?i)\bsession (limit|complete)").unwrap(),
        Regex::new(r"(?i)^\s*total cost:").unwrap(),
    ],
    waiting: vec![
        Regex::new(r"(?i)\bneeds? your permission\b").unwrap(),
        Regex::new(r"(?i)\ballow this tool\b").unwrap(),
    ],
    error: vec![
        Regex::new(r"(?i)\bcredit balance is too low\b").unwrap(),
        Regex::new(r"(?i)\boverloaded_error\b").unwrap(),
    ],
});

impl AgentAdapter for ClaudeAdapter {
    fn descriptor(&self) -> AdapterDescriptor {
        AdapterDescriptor {
            name: "claude-code",
            supports_non_interactive: true,
            supports_interactive: true,
        }
    }

    fn binary(&self) -> &'static str {
        "claude"
    }

    fn patterns(&self) -> &'static PatternSet {
        &PATTERNS
    }

    fn command(&self, invocation: &AgentInvocation) -> AgentCommand {
        let mut args = vec!["--print".to_string()];

        if invocation.auto_approve {
            args.push("--dangerously-skip-permissions".to_string());
        }
        if let Some(model) = &invocation.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(max_turns) = invocation.max_turns {
            args.push("--max-turns".to_string());
            args.push(max_turns.to_string());
        }
        if invocation.verbose {
            args.push("--verbose".to_string());
        }

        AgentCommand {
            command: self.binary().to_string(),
            args,
            env: forward_api_key(invocation, &["ANTHROPIC_API_KEY"]),
            close_stdin_on_write: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_defaults_to_print_mode() {
        let cmd = ClaudeAdapter.command(&AgentInvocation::default());
        assert_eq!(cmd.command, "claude");
        assert_eq!(cmd.args, vec!["--print"]);
        assert!(cmd.close_stdin_on_write);
    }

    #[test]
    fn auto_approve_maps_to_skip_permissions() {
        let invocation = AgentInvocation {
            auto_approve: true,
            ..Default::default()
        };
        let cmd = ClaudeAdapter.command(&invocation);
        assert!(cmd
            .args
            .contains(&"--dangerously-skip-permissions".to_string()));
    }

    #[test]
    fn model_and_turns_flags() {
        let invocation = AgentInvocation {
            model: Some("sonnet".to_string()),
            max_turns: Some(25),
            ..Default::default()
        };
        let cmd = ClaudeAdapter.command(&invocation);
        let joined = cmd.args.join(" ");
        assert!(joined.contains("--model sonnet"));
        assert!(joined.contains("--max-turns 25"));
    }

    #[test]
    fn vendor_error_patterns() {
        let adapter = ClaudeAdapter;
        assert!(adapter.detect_error("Your credit balance is too low"));
        assert!(adapter.detect_waiting_for_input("Claude needs your permission to run Bash"));
    }
}

//! Shared output heuristics for agent adapters.
//!
//! Each vendor CLI signals completion, input prompts, and failures with its
//! own phrasing. A default pattern set covers the common shapes; adapters
//! layer a vendor-specific set on top.

use once_cell::sync::Lazy;
use regex::Regex;

/// Compiled pattern groups for one detection source.
pub struct PatternSet {
    pub completion: Vec<Regex>,
    pub waiting: Vec<Regex>,
    pub error: Vec<Regex>,
}

impl PatternSet {
    fn compile(completion: &[&str], waiting: &[&str], error: &[&str]) -> Self {
        let build = |patterns: &[&str]| {
            patterns
                .iter()
                .map(|p| Regex::new(p).expect("invalid built-in pattern"))
                .collect()
        };
        Self {
            completion: build(completion),
            waiting: build(waiting),
            error: build(error),
        }
    }

    pub fn empty() -> Self {
        Self {
            completion: Vec::new(),
            waiting: Vec::new(),
            error: Vec::new(),
        }
    }
}

/// Patterns most agent CLIs share.
pub static DEFAULT_PATTERNS: Lazy<PatternSet> = Lazy::new(|| {
    PatternSet::compile(
        &[
            r"(?i)\btask (is )?complete",
            r"(?i)\ball (tests|checks) pass(ed)?",
            r"(?i)\bimplementation (is )?(now )?(complete|finished|done)",
            r"(?i)\bfinished (the|all) (task|work|changes)",
            r"(?i)\bsuccessfully (implemented|completed)",
        ],
        &[
            r"(?i)\bdo you want (me )?to\b.*\?",
            r"(?i)\bshould i\b.*\?",
            r"(?i)\bwaiting for (your )?(input|confirmation|response)",
            r"(?i)\bpress (enter|y)\b",
            r"(?i)\[y/n\]",
        ],
        &[
            r"(?im)^error:",
            r"(?i)\bfatal error\b",
            r"(?i)\bpermission denied\b",
            r"(?i)\bcommand not found\b",
            r"(?i)\brate limit(ed)? (reached|exceeded)",
            r"(?i)\bapi key (is )?(invalid|missing|not set)",
        ],
    )
});

fn any_match(patterns: &[Regex], output: &str) -> bool {
    patterns.iter().any(|p| p.is_match(output))
}

/// True when the default set or the vendor set signals completion.
pub fn detect_completion(vendor: &PatternSet, output: &str) -> bool {
    any_match(&DEFAULT_PATTERNS.completion, output) || any_match(&vendor.completion, output)
}

/// True when the output ends in a question the agent expects answered.
pub fn detect_waiting_for_input(vendor: &PatternSet, output: &str) -> bool {
    any_match(&DEFAULT_PATTERNS.waiting, output) || any_match(&vendor.waiting, output)
}

/// True when the output carries a fatal-looking failure.
pub fn detect_error(vendor: &PatternSet, output: &str) -> bool {
    any_match(&DEFAULT_PATTERNS.error, output) || any_match(&vendor.error, output)
}

/// Structured extraction from accumulated agent output.
#[derive(Debug, Clone, Default)]
pub struct ParsedOutput {
    pub raw: String,
    pub files_modified: Vec<String>,
    pub tests_run: bool,
    pub errors: Vec<String>,
}

static FILE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^\s*(?:modified|created|updated|wrote|writing|editing)[: ]+([\w./\\-]+\.\w+)")
        .expect("invalid file pattern")
});

static TEST_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)\b(?:running|ran)\s+(?:\d+\s+)?tests?\b|\btests?\s+(?:passed|failed)\b")
        .expect("invalid test pattern")
});

static ERROR_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^.*\b(?:error|failed)[: ].*$").expect("invalid error pattern"));

/// Best-effort extraction of modified files, test activity, and error lines.
pub fn parse_output(output: &str) -> ParsedOutput {
    let mut files_modified: Vec<String> = FILE_LINE
        .captures_iter(output)
        .map(|c| c[1].to_string())
        .collect();
    files_modified.sort_unstable();
    files_modified.dedup();

    let errors: Vec<String> = ERROR_LINE
        .find_iter(output)
        .map(|m| m.as_str().trim().to_string())
        .take(20)
        .collect();

    ParsedOutput {
        raw: output.to_string(),
        files_modified,
        tests_run: TEST_LINE.is_match(output),
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_completion_phrases() {
        let empty = PatternSet::empty();
        assert!(detect_completion(&empty, "All tests passed.\nTask complete."));
        assert!(detect_completion(&empty, "The implementation is now complete"));
        assert!(!detect_completion(&empty, "Starting to work on the task"));
    }

    #[test]
    fn default_waiting_phrases() {
        let empty = PatternSet::empty();
        assert!(detect_waiting_for_input(&empty, "Do you want me to continue?"));
        assert!(detect_waiting_for_input(&empty, "Overwrite? [y/N]"));
        assert!(!detect_waiting_for_input(&empty, "I will now edit the file"));
    }

    #[test]
    fn default_error_phrases() {
        let empty = PatternSet::empty();
        assert!(detect_error(&empty, "error: cannot find module"));
        assert!(detect_error(&empty, "Your API key is invalid"));
        assert!(detect_error(&empty, "rate limit exceeded, try later"));
        assert!(!detect_error(&empty, "0 errors found"));
    }

    #[test]
    fn vendor_patterns_layer_on_defaults() {
        let vendor = PatternSet::compile(&[r"(?i)session ended"], &[], &[]);
        assert!(detect_completion(&vendor, "Session ended"));
        // Default set still applies
        assert!(detect_completion(&vendor, "task complete"));
    }

    #[test]
    fn parse_extracts_files() {
        let output = "Modified: src/app.ts\nCreated: src/app.test.ts\nModified: src/app.ts\n";
        let parsed = parse_output(output);
        assert_eq!(parsed.files_modified, vec!["src/app.test.ts", "src/app.ts"]);
    }

    #[test]
    fn parse_detects_tests_and_errors() {
        let output = "Running 12 tests\n3 tests failed\nerror: assertion failed in foo\n";
        let parsed = parse_output(output);
        assert!(parsed.tests_run);
        assert!(!parsed.errors.is_empty());
        assert_eq!(parsed.raw, output);
    }

    #[test]
    fn parse_empty_output() {
        let parsed = parse_output("");
        assert!(parsed.files_modified.is_empty());
        assert!(!parsed.tests_run);
        assert!(parsed.errors.is_empty());
    }
}

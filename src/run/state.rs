//! Run states and the transition table.
//!
//! The table is data, separate from the driver, so the validation logic can
//! be tested in isolation. The driver is flexible: several stages have
//! multiple successors because options can skip post-processing, tests, or
//! git stages.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    AuthConfig,
    WorkspaceReady,
    FetchTask,
    GeneratePrompt,
    RunAgent,
    PostProcess,
    RunTests,
    CommitPush,
    ReportStatus,
    Completed,
    Failed,
    Paused,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::AuthConfig => "auth_config",
            RunState::WorkspaceReady => "workspace_ready",
            RunState::FetchTask => "fetch_task",
            RunState::GeneratePrompt => "generate_prompt",
            RunState::RunAgent => "run_agent",
            RunState::PostProcess => "post_process",
            RunState::RunTests => "run_tests",
            RunState::CommitPush => "commit_push",
            RunState::ReportStatus => "report_status",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Paused => "paused",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allowed transitions. Terminal states have no successors.
pub const TRANSITIONS: &[(RunState, &[RunState])] = &[
    (RunState::Idle, &[RunState::AuthConfig]),
    (
        RunState::AuthConfig,
        &[RunState::WorkspaceReady, RunState::Failed],
    ),
    (
        RunState::WorkspaceReady,
        &[RunState::FetchTask, RunState::Failed],
    ),
    (
        RunState::FetchTask,
        &[
            RunState::GeneratePrompt,
            RunState::Completed,
            RunState::Failed,
        ],
    ),
    (
        RunState::GeneratePrompt,
        &[RunState::RunAgent, RunState::Failed],
    ),
    (
        RunState::RunAgent,
        &[
            RunState::PostProcess,
            RunState::RunTests,
            RunState::CommitPush,
            RunState::ReportStatus,
            RunState::Completed,
            RunState::Failed,
            RunState::Paused,
        ],
    ),
    (
        RunState::PostProcess,
        &[
            RunState::RunTests,
            RunState::CommitPush,
            RunState::ReportStatus,
            RunState::Failed,
        ],
    ),
    (
        RunState::RunTests,
        &[
            RunState::CommitPush,
            RunState::ReportStatus,
            RunState::RunAgent,
            RunState::Failed,
        ],
    ),
    (
        RunState::CommitPush,
        &[RunState::ReportStatus, RunState::Failed],
    ),
    (
        RunState::ReportStatus,
        &[RunState::FetchTask, RunState::Completed, RunState::Failed],
    ),
    (
        RunState::Paused,
        &[RunState::RunAgent, RunState::FetchTask, RunState::Failed],
    ),
];

/// Check the transition table. Terminal states never transition.
pub fn can_transition(from: RunState, to: RunState) -> bool {
    TRANSITIONS
        .iter()
        .find(|(state, _)| *state == from)
        .is_some_and(|(_, successors)| successors.contains(&to))
}

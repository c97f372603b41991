//! Persisted state-machine invariants exercised through the public surface.

use gbos::run::{RunState, RunStore};
use serde_json::json;
use tempfile::TempDir;

fn store(temp: &TempDir) -> RunStore {
    RunStore::new(temp.path().join("runs"))
}

#[test]
fn stage_history_tracks_every_transition() {
    let temp = TempDir::new().unwrap();
    let s = store(&temp);
    let mut run = s.new_run().unwrap();

    let path = [
        RunState::AuthConfig,
        RunState::WorkspaceReady,
        RunState::FetchTask,
        RunState::GeneratePrompt,
        RunState::RunAgent,
        RunState::PostProcess,
        RunState::RunTests,
        RunState::CommitPush,
        RunState::ReportStatus,
        RunState::FetchTask,
        RunState::Completed,
    ];
    for (i, state) in path.iter().enumerate() {
        run.transition(*state, json!({ "step": i })).unwrap();
        assert_eq!(run.context.stages.len(), i + 1);
        assert_eq!(run.context.stages.last().unwrap().to_state, run.state);
    }

    // The persisted file agrees with memory
    let loaded = s.load(&run.run_id).unwrap();
    assert_eq!(loaded.state, RunState::Completed);
    assert_eq!(loaded.context.stages.len(), path.len());
}

#[test]
fn end_time_iff_terminal() {
    let temp = TempDir::new().unwrap();
    let s = store(&temp);

    let mut run = s.new_run().unwrap();
    assert!(run.context.end_time.is_none());

    run.transition(RunState::AuthConfig, json!({})).unwrap();
    assert!(s.load(&run.run_id).unwrap().context.end_time.is_none());

    run.transition(RunState::Failed, json!({})).unwrap();
    let loaded = s.load(&run.run_id).unwrap();
    assert!(loaded.context.end_time.is_some());
    assert!(loaded.context.start_time.is_some());
}

#[test]
fn terminal_run_rejects_further_transitions() {
    let temp = TempDir::new().unwrap();
    let s = store(&temp);

    let mut run = s.new_run().unwrap();
    run.transition(RunState::AuthConfig, json!({})).unwrap();
    run.transition(RunState::Failed, json!({})).unwrap();

    let before = std::fs::read_to_string(run.file_path()).unwrap();
    assert!(run.transition(RunState::RunAgent, json!({})).is_err());
    let after = std::fs::read_to_string(run.file_path()).unwrap();
    assert_eq!(before, after, "an invalid transition must not touch the file");
}

#[test]
fn active_run_is_none_iff_all_terminal() {
    let temp = TempDir::new().unwrap();
    let s = store(&temp);

    assert!(s.active_run().unwrap().is_none());

    let mut a = s.new_run().unwrap();
    a.transition(RunState::AuthConfig, json!({})).unwrap();
    a.transition(RunState::WorkspaceReady, json!({})).unwrap();
    a.transition(RunState::FetchTask, json!({})).unwrap();
    a.transition(RunState::Completed, json!({})).unwrap();

    assert!(s.active_run().unwrap().is_none());

    let open = s.new_run().unwrap();
    assert_eq!(s.active_run().unwrap().unwrap().run_id, open.run_id);
}

#[test]
fn paused_run_round_trips_through_store() {
    let temp = TempDir::new().unwrap();
    let s = store(&temp);

    let mut run = s.new_run().unwrap();
    for state in [
        RunState::AuthConfig,
        RunState::WorkspaceReady,
        RunState::FetchTask,
        RunState::GeneratePrompt,
        RunState::RunAgent,
    ] {
        run.transition(state, json!({})).unwrap();
    }
    run.transition(RunState::Paused, json!({ "task_id": "t1" })).unwrap();

    // The paused run is still the active one and resumes legally
    let mut active = s.active_run().unwrap().unwrap();
    assert_eq!(active.state, RunState::Paused);
    assert_eq!(active.context.task_id.as_deref(), Some("t1"));

    active.transition(RunState::RunAgent, json!({})).unwrap();
    active.transition(RunState::RunTests, json!({})).unwrap();
    active.transition(RunState::ReportStatus, json!({})).unwrap();
    active.transition(RunState::Completed, json!({})).unwrap();

    assert!(s.active_run().unwrap().is_none());
}

#[test]
fn outputs_and_artifacts_survive_reload() {
    let temp = TempDir::new().unwrap();
    let s = store(&temp);

    let mut run = s.new_run().unwrap();
    run.record_output("run_agent", json!({ "exit_code": 0, "output_length": 4096 }))
        .unwrap();
    run.record_output("run_tests", json!({ "passed": true }))
        .unwrap();
    run.add_artifact("session_log", "/tmp/session_1.log", json!({ "bytes": 4096 }))
        .unwrap();

    let loaded = s.load(&run.run_id).unwrap();
    assert_eq!(loaded.context.outputs.len(), 2);
    assert_eq!(
        loaded.context.outputs["run_agent"].output["exit_code"],
        json!(0)
    );
    assert_eq!(loaded.context.artifacts.len(), 1);
    assert_eq!(loaded.context.artifacts[0].kind, "session_log");
}

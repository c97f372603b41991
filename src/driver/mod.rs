//! The orchestrator driver.
//!
//! Owns one run at a time and walks it through the workflow:
//! auth_config, workspace_ready, then a task cycle of fetch_task,
//! generate_prompt, run_agent, post_process, run_tests, commit_push,
//! report_status until the queue is empty or `max_tasks` is reached. Every
//! transition is validated and persisted by the run record; all run
//! mutations happen on the driver task. A heartbeat task posts liveness
//! every 30 seconds and an output forwarder republishes agent output as
//! driver events.
//!
//! Resume policy: a run loaded in `run_agent` is treated as "the agent
//! already ran" and continues from post-processing; the agent is never run
//! twice for one stage entry. A paused run with a task in flight re-runs
//! the agent for that task.

pub mod events;

pub use events::Event;

use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::agents::{self, AdapterError, AgentAdapter, AgentInvocation, PromptContext};
use crate::api::{ApiError, ControlPlaneClient, Heartbeat, Task, TaskCompletion};
use crate::config::Config;
use crate::git::{GitLabConfig, GitManager};
use crate::run::{can_transition, Run, RunError, RunState, RunStore};
use crate::session::{SessionEvent, SessionOptions, SessionRunner};
use crate::session_store::SessionStore;
use crate::verify::VerificationManager;
use crate::workspace::WorkspaceManager;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("not authenticated; log in first")]
    NotAuthenticated,
    #[error("another run is already in progress")]
    AlreadyRunning,
    #[error("no active run to resume")]
    NoActiveRun,
    #[error("cannot resume a run in state {0}")]
    CannotResume(RunState),
    #[error("agent '{0}' is not available on PATH")]
    AgentUnavailable(String),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Options assembled by the `start`/`resume` commands.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub agent: String,
    pub auto_approve: bool,
    pub create_merge_request: bool,
    pub continuous: bool,
    pub max_tasks: u32,
    pub explicit_dir: Option<PathBuf>,
    /// Fetch this specific task first (consumed once)
    pub task_id: Option<String>,
    pub skip_post_process: bool,
    pub skip_verification: bool,
    pub skip_git: bool,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            agent: "claude-code".to_string(),
            auto_approve: true,
            create_merge_request: true,
            continuous: false,
            max_tasks: 1,
            explicit_dir: None,
            task_id: None,
            skip_post_process: false,
            skip_verification: false,
            skip_git: false,
            model: None,
            max_turns: None,
        }
    }
}

/// Phases of one task cycle, in execution order. Resume enters mid-cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    GeneratePrompt,
    RunAgent,
    PostProcess,
    RunTests,
    CommitPush,
    Report,
}

enum CycleEnd {
    Done,
    Paused,
}

/// Where a resumed run re-enters the cycle for its in-flight task.
/// `None` means the state re-enters at the fetch loop instead. The bool is
/// whether the stored prompt should be reused.
fn resume_phase(state: RunState) -> Option<(Phase, bool)> {
    match state {
        RunState::FetchTask => Some((Phase::GeneratePrompt, false)),
        RunState::GeneratePrompt => Some((Phase::RunAgent, true)),
        // The agent already ran; do not run it twice
        RunState::RunAgent => Some((Phase::PostProcess, false)),
        RunState::PostProcess => Some((Phase::RunTests, false)),
        RunState::RunTests => Some((Phase::CommitPush, false)),
        RunState::CommitPush => Some((Phase::Report, false)),
        // A paused run re-runs the agent for its in-flight task
        RunState::Paused => Some((Phase::RunAgent, true)),
        _ => None,
    }
}

#[derive(Default)]
struct HeartbeatState {
    current_task_id: Mutex<Option<String>>,
    state_name: Mutex<String>,
}

/// Results threaded between cycle stages for status reporting.
#[derive(Default)]
struct CycleData {
    tests_passed: Option<bool>,
    commit_hash: Option<String>,
    merge_request_url: Option<String>,
}

pub struct OrchestratorDriver {
    config: Config,
    options: DriverOptions,
    api: Arc<ControlPlaneClient>,
    gitlab_token: Option<String>,
    store: RunStore,
    session: Arc<SessionRunner>,
    events: broadcast::Sender<Event>,
    is_running: AtomicBool,
    paused: AtomicBool,
    agent_timed_out: Arc<AtomicBool>,
    heartbeat: Arc<HeartbeatState>,
    task_id_once: Mutex<Option<String>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl OrchestratorDriver {
    pub fn new(
        config: Config,
        options: DriverOptions,
        session: &SessionStore,
    ) -> Result<Self, DriverError> {
        if !session.is_authenticated() {
            return Err(DriverError::NotAuthenticated);
        }
        let api = ControlPlaneClient::from_session(session, config.api.base_url.as_deref())?;
        let (events, _) = events::channel();

        Ok(Self {
            store: RunStore::new(config.runs_path()),
            session: Arc::new(SessionRunner::new(config.logs_path())),
            gitlab_token: session.gitlab_token.clone(),
            task_id_once: Mutex::new(options.task_id.clone()),
            api: Arc::new(api),
            events,
            is_running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            agent_timed_out: Arc::new(AtomicBool::new(false)),
            heartbeat: Arc::new(HeartbeatState::default()),
            handles: Mutex::new(Vec::new()),
            config,
            options,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Cooperative stop: the running agent session is signalled and the
    /// workflow drops out of its loop at the next stage boundary.
    pub async fn stop(&self) {
        info!("Stop requested");
        self.paused.store(true, Ordering::SeqCst);
        self.session.stop().await;
        let _ = self.events.send(Event::Stopped);
    }

    /// Create a new run and drive it to a terminal or paused state.
    /// Returns the number of tasks completed.
    pub async fn start(&self) -> Result<u32, DriverError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(DriverError::AlreadyRunning);
        }
        let result = self.start_inner().await;
        self.finish_background();
        self.is_running.store(false, Ordering::SeqCst);
        result
    }

    async fn start_inner(&self) -> Result<u32, DriverError> {
        let mut run = self.store.new_run()?;
        info!(run_id = %run.run_id, "Run created");
        let _ = self.events.send(Event::Started {
            run_id: run.run_id.clone(),
        });

        match self.workflow_from_start(&mut run).await {
            Ok(n) => Ok(n),
            Err(e) => Err(self.fail_run(&mut run, e).await),
        }
    }

    /// Load and continue a run. With no id, the newest non-terminal run.
    pub async fn resume(&self, run_id: Option<&str>) -> Result<u32, DriverError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(DriverError::AlreadyRunning);
        }
        let result = self.resume_inner(run_id).await;
        self.finish_background();
        self.is_running.store(false, Ordering::SeqCst);
        result
    }

    async fn resume_inner(&self, run_id: Option<&str>) -> Result<u32, DriverError> {
        let mut run = match run_id {
            Some(id) => self.store.load(id)?,
            None => self.store.active_run()?.ok_or(DriverError::NoActiveRun)?,
        };
        if run.state.is_terminal() || run.state == RunState::Idle {
            return Err(DriverError::CannotResume(run.state));
        }

        info!(run_id = %run.run_id, state = %run.state, "Resuming run");
        let _ = self.events.send(Event::Started {
            run_id: run.run_id.clone(),
        });

        match self.workflow_from_resume(&mut run).await {
            Ok(n) => Ok(n),
            Err(e) => Err(self.fail_run(&mut run, e).await),
        }
    }

    /// Record the error, report the in-flight task as failed upstream
    /// (best-effort), move to `failed` when legal, emit, and pass the
    /// error on.
    async fn fail_run(&self, run: &mut Run, error: DriverError) -> DriverError {
        let message = error.to_string();
        warn!(run_id = %run.run_id, %message, "Run failed");
        let _ = run.record_error(&message, None);

        let mid_task = matches!(
            run.state,
            RunState::FetchTask
                | RunState::GeneratePrompt
                | RunState::RunAgent
                | RunState::PostProcess
                | RunState::RunTests
                | RunState::CommitPush
        );
        if mid_task {
            if let Some(task_id) = run.context.task_id.clone() {
                if let Err(e) = self.api.fail_task(&task_id, &message).await {
                    warn!(error = %e, "Task failure report failed (ignored)");
                }
            }
        }

        if can_transition(run.state, RunState::Failed) {
            let _ = run.transition(RunState::Failed, json!({ "error": message }));
        }
        let _ = self.events.send(Event::Failed { error: message });
        error
    }

    async fn workflow_from_start(&self, run: &mut Run) -> Result<u32, DriverError> {
        let adapter = agents::resolve(&self.options.agent)?;
        let app = self.stage_auth_config(run, adapter.as_ref()).await?;

        self.start_heartbeat();
        self.start_output_forwarder();

        let mut workspace = self.stage_workspace_ready(run, &app).await?;
        self.task_loop(run, &mut workspace, adapter.as_ref(), None).await
    }

    async fn workflow_from_resume(&self, run: &mut Run) -> Result<u32, DriverError> {
        let vendor = run
            .context
            .agent_vendor
            .clone()
            .unwrap_or_else(|| self.options.agent.clone());
        let adapter = agents::resolve(&vendor)?;

        // Re-establish the connection without replaying auth_config
        let connection = self.api.connection().await?;
        self.start_heartbeat();
        self.start_output_forwarder();

        let explicit = run
            .context
            .working_dir
            .clone()
            .map(PathBuf::from)
            .or_else(|| self.options.explicit_dir.clone());
        let mut workspace = WorkspaceManager::resolve(
            &connection.application,
            None,
            explicit.as_deref(),
            &self.config.workspaces_path(),
        )
        .await?;

        self.note_state(run);

        match resume_phase(run.state) {
            None if matches!(run.state, RunState::WorkspaceReady | RunState::ReportStatus) => {
                self.task_loop(run, &mut workspace, adapter.as_ref(), None).await
            }
            None => Err(DriverError::CannotResume(run.state)),
            Some((phase, reuse_prompt)) => {
                let Some(task_id) = run.context.task_id.clone() else {
                    // Paused before any task was in flight: back to the loop
                    if run.state == RunState::Paused {
                        return self.task_loop(run, &mut workspace, adapter.as_ref(), None).await;
                    }
                    return Err(DriverError::CannotResume(run.state));
                };

                let task = self.api.task(&task_id).await?;
                workspace.set_task(&task);
                workspace.prepare().await?;
                self.set_heartbeat_task(Some(task.id.clone()));

                let stored_prompt = if reuse_prompt {
                    run.context
                        .outputs
                        .get("generate_prompt")
                        .and_then(|o| o.output.as_str().map(String::from))
                } else {
                    None
                };

                self.task_loop(
                    run,
                    &mut workspace,
                    adapter.as_ref(),
                    Some((task, phase, stored_prompt)),
                )
                .await
            }
        }
    }

    /// The task cycle loop. `initial` is a mid-cycle entry used by resume.
    async fn task_loop(
        &self,
        run: &mut Run,
        workspace: &mut WorkspaceManager,
        adapter: &dyn AgentAdapter,
        initial: Option<(Task, Phase, Option<String>)>,
    ) -> Result<u32, DriverError> {
        let mut tasks_completed = 0u32;

        if let Some((task, phase, stored_prompt)) = initial {
            match self
                .run_cycle(run, workspace, adapter, &task, phase, stored_prompt)
                .await?
            {
                CycleEnd::Paused => return Ok(tasks_completed),
                CycleEnd::Done => {
                    tasks_completed += 1;
                    let _ = self.events.send(Event::TaskDone {
                        task_id: task.id.clone(),
                    });
                }
            }
        }

        loop {
            if self.is_paused() {
                return self.pause_out(run, tasks_completed);
            }
            if !self.options.continuous && tasks_completed >= self.options.max_tasks {
                break;
            }

            let Some(task) = self.stage_fetch_task(run).await? else {
                // Queue is empty: the run is complete
                run.transition(
                    RunState::Completed,
                    json!({ "tasks_completed": tasks_completed }),
                )?;
                self.note_state(run);
                let _ = self.events.send(Event::Completed { tasks_completed });
                return Ok(tasks_completed);
            };

            workspace.set_task(&task);
            workspace.prepare().await?;
            self.api.start_task(&task.id).await?;
            self.set_heartbeat_task(Some(task.id.clone()));

            match self
                .run_cycle(run, workspace, adapter, &task, Phase::GeneratePrompt, None)
                .await?
            {
                CycleEnd::Paused => return Ok(tasks_completed),
                CycleEnd::Done => {
                    tasks_completed += 1;
                    let _ = self.events.send(Event::TaskDone {
                        task_id: task.id.clone(),
                    });
                }
            }
        }

        self.finish_completed(run, tasks_completed)?;
        Ok(tasks_completed)
    }

    /// Natural loop exit: reach `completed` through a legal path.
    fn finish_completed(&self, run: &mut Run, tasks_completed: u32) -> Result<(), DriverError> {
        if !can_transition(run.state, RunState::Completed) {
            // max_tasks reached before any fetch (e.g. --max-tasks 0):
            // pass through fetch_task without touching the control plane
            run.transition(RunState::FetchTask, json!({ "skipped": true }))?;
        }
        run.transition(
            RunState::Completed,
            json!({ "tasks_completed": tasks_completed }),
        )?;
        self.note_state(run);
        let _ = self.events.send(Event::Completed { tasks_completed });
        Ok(())
    }

    fn pause_out(&self, run: &mut Run, tasks_completed: u32) -> Result<u32, DriverError> {
        if can_transition(run.state, RunState::Paused) {
            run.transition(RunState::Paused, json!({}))?;
            self.note_state(run);
        }
        Ok(tasks_completed)
    }

    async fn run_cycle(
        &self,
        run: &mut Run,
        workspace: &WorkspaceManager,
        adapter: &dyn AgentAdapter,
        task: &Task,
        start: Phase,
        stored_prompt: Option<String>,
    ) -> Result<CycleEnd, DriverError> {
        let mut data = CycleData::default();
        let mut prompt = stored_prompt;

        if start <= Phase::GeneratePrompt {
            prompt = Some(self.stage_generate_prompt(run, workspace, adapter, task)?);
        }

        if start <= Phase::RunAgent {
            let text = match prompt.take() {
                Some(text) => text,
                None => adapter.format_prompt(task, &self.prompt_context(workspace)),
            };
            self.stage_run_agent(run, workspace, adapter, &text).await?;

            if self.is_paused() {
                run.transition(RunState::Paused, json!({ "task_id": task.id }))?;
                self.note_state(run);
                return Ok(CycleEnd::Paused);
            }
        }

        if start <= Phase::PostProcess && !self.options.skip_post_process {
            self.stage_post_process(run, workspace).await?;
        }

        if start <= Phase::RunTests && !self.options.skip_verification {
            data.tests_passed = Some(self.stage_run_tests(run, workspace).await?);
        } else if let Some(output) = run.context.outputs.get("run_tests") {
            // Resuming past the test stage: reuse the recorded verdict
            data.tests_passed = output.output.get("passed").and_then(serde_json::Value::as_bool);
        }

        if start <= Phase::CommitPush && !self.options.skip_git {
            self.stage_commit_push(run, workspace, task, &mut data).await?;
        }

        self.stage_report_status(run, task, &data).await?;
        Ok(CycleEnd::Done)
    }

    async fn stage_auth_config(
        &self,
        run: &mut Run,
        adapter: &dyn AgentAdapter,
    ) -> Result<crate::api::Application, DriverError> {
        self.emit_stage("auth_config");

        self.api.auth_session().await?;
        let connection = self.api.connection().await?;

        if !adapter.is_available().await {
            return Err(DriverError::AgentUnavailable(adapter.name().to_string()));
        }
        let version = adapter.version().await;
        let _ = self.events.send(Event::Log {
            message: format!("{} {version}", adapter.name()),
        });

        run.transition(
            RunState::AuthConfig,
            json!({
                "app_id": connection.application.id,
                "node_id": connection.node.id,
                "agent_vendor": adapter.name(),
            }),
        )?;
        self.note_state(run);
        Ok(connection.application)
    }

    async fn stage_workspace_ready(
        &self,
        run: &mut Run,
        app: &crate::api::Application,
    ) -> Result<WorkspaceManager, DriverError> {
        self.emit_stage("workspace_ready");

        let workspace = WorkspaceManager::resolve(
            app,
            None,
            self.options.explicit_dir.as_deref(),
            &self.config.workspaces_path(),
        )
        .await?;

        run.transition(
            RunState::WorkspaceReady,
            json!({
                "working_dir": workspace.working_dir.to_string_lossy(),
                "repo_url": workspace.repo_url(),
                "cloud_run_url": workspace.cloud_run_url(),
            }),
        )?;
        self.note_state(run);
        Ok(workspace)
    }

    async fn stage_fetch_task(&self, run: &mut Run) -> Result<Option<Task>, DriverError> {
        self.emit_stage("fetch_task");

        let one_shot = self.task_id_once.lock().expect("task id lock").take();
        let task = match one_shot {
            Some(id) => Some(self.api.task(&id).await?),
            None => self.api.next_task().await?,
        };

        match &task {
            Some(task) => {
                info!(task_id = %task.id, title = %task.title, "Fetched task");
                run.transition(
                    RunState::FetchTask,
                    json!({
                        "task_id": task.id,
                        "task_key": task.task_key,
                        "title": task.title,
                    }),
                )?;
            }
            None => {
                info!("No tasks available");
                run.transition(RunState::FetchTask, json!({ "no_task": true }))?;
            }
        }
        self.note_state(run);
        Ok(task)
    }

    fn prompt_context(&self, workspace: &WorkspaceManager) -> PromptContext {
        PromptContext {
            repo_url: workspace.repo_url().map(String::from),
            branch: workspace.branch.clone(),
            cloud_run_url: workspace.cloud_run_url().map(String::from),
            working_dir: Some(workspace.working_dir.to_string_lossy().to_string()),
        }
    }

    fn stage_generate_prompt(
        &self,
        run: &mut Run,
        workspace: &WorkspaceManager,
        adapter: &dyn AgentAdapter,
        task: &Task,
    ) -> Result<String, DriverError> {
        self.emit_stage("generate_prompt");

        let prompt = adapter.format_prompt(task, &self.prompt_context(workspace));
        run.record_output("generate_prompt", json!(prompt))?;
        run.transition(
            RunState::GeneratePrompt,
            json!({
                "task_id": task.id,
                "branch": workspace.branch,
                "prompt_length": prompt.len(),
            }),
        )?;
        self.note_state(run);
        let _ = self.events.send(Event::Prompt {
            text: prompt.clone(),
        });
        Ok(prompt)
    }

    async fn stage_run_agent(
        &self,
        run: &mut Run,
        workspace: &WorkspaceManager,
        adapter: &dyn AgentAdapter,
        prompt: &str,
    ) -> Result<(), DriverError> {
        self.emit_stage("run_agent");
        let _ = self.events.send(Event::AgentStart {
            agent: adapter.name().to_string(),
        });

        let invocation = AgentInvocation {
            auto_approve: self.options.auto_approve,
            model: self
                .options
                .model
                .clone()
                .or_else(|| self.config.agent.model.clone()),
            max_turns: self.options.max_turns.or(self.config.agent.max_turns),
            quiet: false,
            verbose: false,
            api_key: None,
        };
        let command = adapter.command(&invocation);

        let env: Vec<(String, String)> = workspace.environment(&command.env).into_iter().collect();
        let timeout_secs = self.config.timeouts.agent_secs;
        let session_options = SessionOptions {
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            retries: 0,
            cwd: Some(workspace.working_dir.clone()),
            env,
            log_to_file: true,
            close_stdin_on_write: command.close_stdin_on_write,
            kill_grace: Duration::from_secs(self.config.timeouts.kill_grace_secs),
        };

        self.agent_timed_out.store(false, Ordering::SeqCst);
        let result = self
            .session
            .start(&command.command, &command.args, Some(prompt), &session_options)
            .await
            .map_err(|e| DriverError::Other(e.into()))?;

        let _ = self.events.send(Event::AgentDone {
            exit_code: result.exit_code,
        });

        if let Some(log_path) = self.session.log_path() {
            run.add_artifact("session_log", &log_path.to_string_lossy(), json!({}))?;
        }
        let parsed = adapter.parse_output(&result.output);
        run.record_output(
            "run_agent",
            json!({
                "exit_code": result.exit_code,
                "output_length": result.output.len(),
                "files_modified": parsed.files_modified,
                "tests_run": parsed.tests_run,
                "completion_detected": adapter.detect_completion(&result.output),
            }),
        )?;
        run.transition(RunState::RunAgent, json!({ "exit_code": result.exit_code }))?;
        self.note_state(run);

        if self.agent_timed_out.load(Ordering::SeqCst) {
            return Err(DriverError::Other(anyhow::anyhow!(
                "agent session timed out after {timeout_secs}s"
            )));
        }
        if result.exit_code != 0 && !self.is_paused() {
            warn!(exit_code = result.exit_code, "Agent exited nonzero");
            run.record_error(
                &format!("agent exited with code {}", result.exit_code),
                Some("run_agent"),
            )?;
        }
        Ok(())
    }

    async fn stage_post_process(
        &self,
        run: &mut Run,
        workspace: &WorkspaceManager,
    ) -> Result<(), DriverError> {
        self.emit_stage("post_process");

        let report = self.verifier(workspace).post_process().await;
        run.record_output(
            "post_process",
            serde_json::to_value(&report).unwrap_or_default(),
        )?;
        run.transition(RunState::PostProcess, json!({}))?;
        self.note_state(run);
        Ok(())
    }

    async fn stage_run_tests(
        &self,
        run: &mut Run,
        workspace: &WorkspaceManager,
    ) -> Result<bool, DriverError> {
        self.emit_stage("run_tests");

        let report = self.verifier(workspace).run_all().await;
        if !report.passed {
            // Verification failure does not abort the task; it is recorded
            // and reported upstream
            warn!(summary = %report.summary, "Tests failed, continuing");
            run.record_error(&report.summary, Some("run_tests"))?;
        }
        run.record_output(
            "run_tests",
            json!({ "passed": report.passed, "summary": report.summary }),
        )?;
        run.transition(RunState::RunTests, json!({ "tests_passed": report.passed }))?;
        self.note_state(run);
        Ok(report.passed)
    }

    fn verifier(&self, workspace: &WorkspaceManager) -> VerificationManager {
        VerificationManager::new(
            workspace.working_dir.clone(),
            Duration::from_secs(self.config.timeouts.check_secs),
            Duration::from_secs(self.config.timeouts.test_secs),
        )
        .with_cloud_run_url(workspace.cloud_run_url().map(String::from))
    }

    async fn stage_commit_push(
        &self,
        run: &mut Run,
        workspace: &WorkspaceManager,
        task: &Task,
        data: &mut CycleData,
    ) -> Result<(), DriverError> {
        self.emit_stage("commit_push");

        let git = GitManager::new(workspace.working_dir.clone())
            .with_gitlab(
                self.gitlab_token
                    .clone()
                    .map(|token| GitLabConfig { token }),
            )
            .with_target_branch(&self.config.git.target_branch)
            .with_remove_source_branch(self.config.git.remove_source_branch);

        let message = task.title.clone();
        let result = if !workspace.local_only && git.has_remote().await {
            if self.options.create_merge_request && self.gitlab_token.is_some() {
                let mr_title = format!("[{}] {}", task.key_or_id(), task.title);
                git.commit_push_and_mr(&message, Some(task), &mr_title).await
            } else {
                git.commit_and_push(&message, Some(task)).await
            }
        } else {
            git.commit_only(&message).await
        }
        .map_err(|e| DriverError::Other(e.into()))?;

        data.commit_hash = result.commit.as_ref().map(|c| c.short_hash.clone());
        data.merge_request_url = result.merge_request.as_ref().map(|mr| mr.url.clone());

        if let Some(error) = &result.merge_request_error {
            run.record_error(error, Some("commit_push"))?;
        }
        run.record_output(
            "commit_push",
            serde_json::to_value(&result).unwrap_or_default(),
        )?;
        run.transition(
            RunState::CommitPush,
            json!({
                "committed": result.committed,
                "commit": data.commit_hash,
                "merge_request": data.merge_request_url,
            }),
        )?;
        self.note_state(run);

        let _ = self.events.send(Event::Committed {
            commit: data.commit_hash.clone(),
            merge_request: data.merge_request_url.clone(),
        });
        Ok(())
    }

    async fn stage_report_status(
        &self,
        run: &mut Run,
        task: &Task,
        data: &CycleData,
    ) -> Result<(), DriverError> {
        self.emit_stage("report_status");

        let completion = TaskCompletion {
            completion_notes: "Completed by the gbos orchestrator".to_string(),
            commit_hash: data.commit_hash.clone(),
            merge_request_url: data.merge_request_url.clone(),
            tests_passed: data.tests_passed,
        };
        // The task is locally done even when the control plane is unreachable
        if let Err(e) = self.api.complete_task(&task.id, &completion).await {
            warn!(error = %e, "Task completion report failed (continuing)");
            run.record_error(&e.to_string(), Some("report_status"))?;
        }

        run.transition(RunState::ReportStatus, json!({ "task_id": task.id }))?;
        self.note_state(run);
        self.set_heartbeat_task(None);
        Ok(())
    }

    fn emit_stage(&self, name: &str) {
        let _ = self.events.send(Event::Stage {
            name: name.to_string(),
        });
    }

    fn note_state(&self, run: &Run) {
        *self.heartbeat.state_name.lock().expect("state lock") = run.state.as_str().to_string();
    }

    fn set_heartbeat_task(&self, task_id: Option<String>) {
        *self.heartbeat.current_task_id.lock().expect("task lock") = task_id;
    }

    /// Heartbeat timer: POST liveness with the current task and state.
    /// Failures are swallowed.
    fn start_heartbeat(&self) {
        let api = Arc::clone(&self.api);
        let heartbeat = Arc::clone(&self.heartbeat);
        let interval = self.config.heartbeat.interval_secs.max(1);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval));
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                let beat = Heartbeat {
                    current_task_id: heartbeat
                        .current_task_id
                        .lock()
                        .expect("task lock")
                        .clone(),
                    progress: Some(heartbeat.state_name.lock().expect("state lock").clone()),
                };
                if let Err(e) = api.heartbeat(&beat).await {
                    tracing::debug!(error = %e, "Heartbeat failed (ignored)");
                }
            }
        });
        self.handles.lock().expect("handles lock").push(handle);
    }

    /// Republish agent output as driver events and watch for timeouts.
    fn start_output_forwarder(&self) {
        let mut receiver = self.session.subscribe();
        let events = self.events.clone();
        let timed_out = Arc::clone(&self.agent_timed_out);

        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(SessionEvent::Stdout(chunk) | SessionEvent::Stderr(chunk)) => {
                        let _ = events.send(Event::AgentOutput { chunk });
                    }
                    Ok(SessionEvent::TimedOut) => {
                        timed_out.store(true, Ordering::SeqCst);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.handles.lock().expect("handles lock").push(handle);
    }

    fn finish_background(&self) {
        for handle in self.handles.lock().expect("handles lock").drain(..) {
            handle.abort();
        }
    }
}

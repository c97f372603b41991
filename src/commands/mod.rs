//! The driver-facing CLI commands: start, resume, stop, runs.
//!
//! Thin consumers: they check preconditions, construct or load a driver,
//! subscribe to its events for human-readable output, and translate the
//! outcome into an exit code (0 completed, 1 failed, 130 paused).

use anyhow::{bail, Context, Result};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::driver::{DriverOptions, Event, OrchestratorDriver};
use crate::run::{RunState, RunStore};
use crate::session_store::SessionStore;

pub const EXIT_COMPLETED: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
pub const EXIT_PAUSED: i32 = 130;

fn load_session(config: &Config) -> Result<SessionStore> {
    SessionStore::load(config)?
        .filter(SessionStore::is_authenticated)
        .context("Not authenticated. Log in before starting the orchestrator.")
}

/// `gbos start`
pub async fn cmd_start(
    config: Config,
    options: DriverOptions,
    show_prompt: bool,
) -> Result<i32> {
    let session = load_session(&config)?;

    // One orchestrator per host: refuse while an earlier run is still open
    let store = RunStore::new(config.runs_path());
    if let Some(active) = store.active_run()? {
        bail!(
            "Run {} is still {} - resume it with `gbos resume` or close it with `gbos stop`",
            active.run_id,
            active.state
        );
    }

    let driver = Arc::new(OrchestratorDriver::new(config, options, &session)?);
    let printer = spawn_printer(driver.subscribe(), show_prompt);
    let signals = spawn_signal_handler(Arc::clone(&driver));

    let result = driver.start().await;

    signals.abort();
    printer.abort();

    match result {
        Ok(_) if driver.is_paused() => Ok(EXIT_PAUSED),
        Ok(_) => Ok(EXIT_COMPLETED),
        Err(e) => {
            eprintln!("Error: {e}");
            Ok(EXIT_FAILED)
        }
    }
}

/// `gbos resume`
pub async fn cmd_resume(
    config: Config,
    options: DriverOptions,
    run_id: Option<&str>,
    show_prompt: bool,
) -> Result<i32> {
    let session = load_session(&config)?;

    let driver = Arc::new(OrchestratorDriver::new(config, options, &session)?);
    let printer = spawn_printer(driver.subscribe(), show_prompt);
    let signals = spawn_signal_handler(Arc::clone(&driver));

    let result = driver.resume(run_id).await;

    signals.abort();
    printer.abort();

    match result {
        Ok(_) if driver.is_paused() => Ok(EXIT_PAUSED),
        Ok(_) => Ok(EXIT_COMPLETED),
        Err(e) => {
            eprintln!("Error: {e}");
            Ok(EXIT_FAILED)
        }
    }
}

/// `gbos stop` - close a run that no live driver owns. With `--force` the
/// run is failed; otherwise it is paused (when the state allows pausing).
pub async fn cmd_stop(config: &Config, run_id: Option<&str>, force: bool) -> Result<i32> {
    let store = RunStore::new(config.runs_path());
    let mut run = match run_id {
        Some(id) => store.load(id)?,
        None => match store.active_run()? {
            Some(run) => run,
            None => {
                println!("No active run.");
                return Ok(EXIT_COMPLETED);
            }
        },
    };

    if run.state.is_terminal() {
        println!("Run {} is already {}.", run.run_id, run.state);
        return Ok(EXIT_COMPLETED);
    }

    let target = if force {
        RunState::Failed
    } else {
        RunState::Paused
    };
    match run.transition(target, serde_json::json!({ "stopped_by": "user" })) {
        Ok(()) => {
            println!("Run {} is now {}.", run.run_id, run.state);
            Ok(EXIT_COMPLETED)
        }
        Err(e) => {
            eprintln!("Error: {e}");
            Ok(EXIT_FAILED)
        }
    }
}

/// `gbos runs` - newest runs first.
pub fn cmd_runs(config: &Config, limit: usize) -> Result<i32> {
    let store = RunStore::new(config.runs_path());
    let runs = store.list_runs(limit)?;

    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(EXIT_COMPLETED);
    }

    for run in runs {
        let tasks = run
            .context
            .stages
            .iter()
            .filter(|s| s.to_state == RunState::ReportStatus)
            .count();
        let duration = run
            .duration()
            .map(|d| format_duration(d.num_seconds()))
            .unwrap_or_else(|| "-".to_string());
        let started = run
            .context
            .start_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{}  {:<15} {}  {:>8}  {} task(s)",
            run.run_id, run.state, started, duration, tasks
        );
    }
    Ok(EXIT_COMPLETED)
}

fn format_duration(total_secs: i64) -> String {
    let secs = total_secs.max(0);
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

/// SIGINT requests a graceful pause.
fn spawn_signal_handler(driver: Arc<OrchestratorDriver>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted - pausing run (resume with `gbos resume`)");
            driver.stop().await;
        }
    })
}

fn spawn_printer(
    mut events: broadcast::Receiver<Event>,
    show_prompt: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event, show_prompt),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn print_event(event: &Event, show_prompt: bool) {
    match event {
        Event::Started { run_id } => println!("Run {run_id}"),
        Event::Stage { name } => println!("==> {name}"),
        Event::Log { message } => println!("    {message}"),
        Event::Prompt { text } => {
            if show_prompt {
                println!("--- prompt ---\n{text}\n--------------");
            }
        }
        Event::AgentStart { agent } => println!("    launching {agent}"),
        Event::AgentOutput { chunk } => {
            print!("{chunk}");
            let _ = std::io::stdout().flush();
        }
        Event::AgentDone { exit_code } => println!("\n    agent exited with code {exit_code}"),
        Event::Committed {
            commit,
            merge_request,
        } => match (commit, merge_request) {
            (Some(commit), Some(mr)) => println!("    committed {commit} ({mr})"),
            (Some(commit), None) => println!("    committed {commit}"),
            _ => println!("    nothing to commit"),
        },
        Event::TaskDone { task_id } => println!("    task {task_id} done"),
        Event::Completed { tasks_completed } => {
            println!("Run completed ({tasks_completed} task(s))");
        }
        Event::Failed { error } => eprintln!("Run failed: {error}"),
        Event::Stopped => println!("Stopping..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(temp: &TempDir) -> Config {
        let mut config = Config::default();
        config.paths.state = temp.path().to_string_lossy().to_string();
        config
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(192), "3m12s");
        assert_eq!(format_duration(3725), "1h02m");
        assert_eq!(format_duration(-5), "0s");
    }

    #[test]
    fn runs_on_empty_store() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        assert_eq!(cmd_runs(&config, 10).unwrap(), EXIT_COMPLETED);
    }

    #[tokio::test]
    async fn stop_without_runs_is_fine() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        assert_eq!(cmd_stop(&config, None, false).await.unwrap(), EXIT_COMPLETED);
    }

    #[tokio::test]
    async fn stop_force_fails_active_run() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);

        let store = RunStore::new(config.runs_path());
        let mut run = store.new_run().unwrap();
        run.transition(RunState::AuthConfig, serde_json::json!({})).unwrap();

        assert_eq!(
            cmd_stop(&config, Some(&run.run_id), true).await.unwrap(),
            EXIT_COMPLETED
        );
        let reloaded = store.load(&run.run_id).unwrap();
        assert_eq!(reloaded.state, RunState::Failed);
    }

    #[tokio::test]
    async fn stop_without_force_needs_pausable_state() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);

        let store = RunStore::new(config.runs_path());
        let mut run = store.new_run().unwrap();
        run.transition(RunState::AuthConfig, serde_json::json!({})).unwrap();

        // auth_config cannot pause; the command reports failure
        assert_eq!(
            cmd_stop(&config, Some(&run.run_id), false).await.unwrap(),
            EXIT_FAILED
        );
        assert_eq!(store.load(&run.run_id).unwrap().state, RunState::AuthConfig);
    }

    #[tokio::test]
    async fn start_refuses_without_session() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let result = cmd_start(config, DriverOptions::default(), false).await;
        assert!(result.is_err());
    }
}

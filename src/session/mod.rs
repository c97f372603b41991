//! Child-process session runner.
//!
//! Spawns the agent (or any command) with piped stdio, streams combined
//! output to subscribers, appends it to a per-session log file, enforces a
//! timeout, and retries on nonzero exit when configured. `stop()` sends
//! SIGTERM and escalates to SIGKILL after the grace period.

use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::broadcast;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("session is not running")]
    NotRunning,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Options for one session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Wall-clock limit; `None` disables the timer
    pub timeout: Option<Duration>,
    /// Restarts after nonzero exit
    pub retries: u32,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub log_to_file: bool,
    /// Close the child's stdin after the initial write; agents that wait
    /// for EOF need this
    pub close_stdin_on_write: bool,
    /// SIGTERM-to-SIGKILL grace
    pub kill_grace: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(1800)),
            retries: 0,
            cwd: None,
            env: Vec::new(),
            log_to_file: true,
            close_stdin_on_write: false,
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// Final result of a session (after any retries).
#[derive(Debug, Clone)]
pub struct SessionResult {
    pub exit_code: i32,
    pub output: String,
}

/// Events emitted while a session runs.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started { pid: u32 },
    Stdout(String),
    Stderr(String),
    Exited { exit_code: i32, signal: Option<i32> },
    TimedOut,
    Retrying { attempt: u32 },
    Killed,
}

/// Supervises one child process at a time.
pub struct SessionRunner {
    logs_dir: PathBuf,
    events: broadcast::Sender<SessionEvent>,
    output: Arc<Mutex<String>>,
    pid: Arc<Mutex<Option<u32>>>,
    stdin: Arc<AsyncMutex<Option<ChildStdin>>>,
    stopping: Arc<AtomicBool>,
    kill_grace: Arc<Mutex<Duration>>,
    log_path: Arc<Mutex<Option<PathBuf>>>,
}

impl SessionRunner {
    pub fn new(logs_dir: PathBuf) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            logs_dir,
            events,
            output: Arc::new(Mutex::new(String::new())),
            pid: Arc::new(Mutex::new(None)),
            stdin: Arc::new(AsyncMutex::new(None)),
            stopping: Arc::new(AtomicBool::new(false)),
            kill_grace: Arc::new(Mutex::new(Duration::from_secs(5))),
            log_path: Arc::new(Mutex::new(None)),
        }
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Accumulated combined output so far. Monotonically non-decreasing
    /// while a session runs.
    pub fn output(&self) -> String {
        self.output.lock().expect("output lock").clone()
    }

    /// The session log file of the current/last session, when enabled.
    pub fn log_path(&self) -> Option<PathBuf> {
        self.log_path.lock().expect("log path lock").clone()
    }

    /// Run `command` to completion, retrying on nonzero exit up to
    /// `options.retries` times. Spawn failures reject immediately.
    pub async fn start(
        &self,
        command: &str,
        args: &[String],
        input: Option<&str>,
        options: &SessionOptions,
    ) -> Result<SessionResult, SessionError> {
        self.stopping.store(false, Ordering::SeqCst);
        self.output.lock().expect("output lock").clear();
        *self.kill_grace.lock().expect("grace lock") = options.kill_grace;

        let log_file = if options.log_to_file {
            let timestamp = Utc::now().format("%Y%m%d%H%M%S%3f");
            let path = self.logs_dir.join(format!("session_{timestamp}.log"));
            tokio::fs::create_dir_all(&self.logs_dir).await?;
            let file = tokio::fs::File::create(&path).await?;
            *self.log_path.lock().expect("log path lock") = Some(path);
            Some(Arc::new(AsyncMutex::new(file)))
        } else {
            *self.log_path.lock().expect("log path lock") = None;
            None
        };

        let mut attempt = 0u32;
        loop {
            let exit = self
                .run_once(command, args, input, options, log_file.clone())
                .await?;

            if exit != 0 && attempt < options.retries && !self.stopping.load(Ordering::SeqCst) {
                attempt += 1;
                warn!(command, exit, attempt, "Nonzero exit, retrying");
                let _ = self.events.send(SessionEvent::Retrying { attempt });
                continue;
            }

            return Ok(SessionResult {
                exit_code: exit,
                output: self.output(),
            });
        }
    }

    async fn run_once(
        &self,
        command: &str,
        args: &[String],
        input: Option<&str>,
        options: &SessionOptions,
        log_file: Option<Arc<AsyncMutex<tokio::fs::File>>>,
    ) -> Result<i32, SessionError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Agents suppress ANSI on a non-tty; force it back on
            .env("FORCE_COLOR", "1")
            .kill_on_drop(true);

        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| SessionError::Spawn {
            command: command.to_string(),
            source,
        })?;

        let pid = child.id().unwrap_or(0);
        *self.pid.lock().expect("pid lock") = Some(pid);
        debug!(command, pid, "Session started");
        let _ = self.events.send(SessionEvent::Started { pid });

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let mut stdin = child.stdin.take();

        let stdout_pump = self.spawn_pump(stdout, false, log_file.clone());
        let stderr_pump = self.spawn_pump(stderr, true, log_file.clone());

        if let Some(input) = input {
            if let Some(handle) = stdin.as_mut() {
                handle.write_all(input.as_bytes()).await?;
                handle.flush().await?;
            }
            if options.close_stdin_on_write {
                stdin = None;
            }
        }
        *self.stdin.lock().await = stdin;

        let status = if let Some(timeout) = options.timeout {
            tokio::select! {
                status = child.wait() => status?,
                () = tokio::time::sleep(timeout) => {
                    warn!(command, pid, ?timeout, "Session timed out");
                    let _ = self.events.send(SessionEvent::TimedOut);
                    self.stop().await;
                    child.wait().await?
                }
            }
        } else {
            child.wait().await?
        };

        // Drain remaining output before reporting the exit
        let _ = stdout_pump.await;
        let _ = stderr_pump.await;
        if let Some(file) = &log_file {
            let _ = file.lock().await.flush().await;
        }

        *self.pid.lock().expect("pid lock") = None;
        *self.stdin.lock().await = None;

        let signal = exit_signal(&status);
        let exit_code = status.code().unwrap_or(-1);
        debug!(command, exit_code, ?signal, "Session exited");
        let _ = self.events.send(SessionEvent::Exited { exit_code, signal });

        Ok(exit_code)
    }

    fn spawn_pump(
        &self,
        mut reader: impl AsyncReadExt + Unpin + Send + 'static,
        is_stderr: bool,
        log_file: Option<Arc<AsyncMutex<tokio::fs::File>>>,
    ) -> tokio::task::JoinHandle<()> {
        let output = Arc::clone(&self.output);
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                        output.lock().expect("output lock").push_str(&chunk);
                        if let Some(file) = &log_file {
                            let _ = file.lock().await.write_all(chunk.as_bytes()).await;
                        }
                        let event = if is_stderr {
                            SessionEvent::Stderr(chunk)
                        } else {
                            SessionEvent::Stdout(chunk)
                        };
                        let _ = events.send(event);
                    }
                }
            }
        })
    }

    /// Write to the child's stdin.
    pub async fn write(&self, data: &str) -> Result<(), SessionError> {
        let mut guard = self.stdin.lock().await;
        let handle = guard.as_mut().ok_or(SessionError::NotRunning)?;
        handle.write_all(data.as_bytes()).await?;
        handle.flush().await?;
        Ok(())
    }

    /// Close the child's stdin (EOF).
    pub async fn close_stdin(&self) {
        *self.stdin.lock().await = None;
    }

    /// Graceful stop: SIGTERM, then SIGKILL after the grace period.
    /// Idempotent; a no-op when nothing is running.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);

        let pid = *self.pid.lock().expect("pid lock");
        let Some(pid) = pid else { return };
        let target = Pid::from_raw(pid as i32);

        debug!(pid, "Stopping session (SIGTERM)");
        let _ = kill(target, Signal::SIGTERM);

        let grace = *self.kill_grace.lock().expect("grace lock");
        tokio::time::sleep(grace).await;

        // Still alive after the grace period: force kill
        if self.pid.lock().expect("pid lock").is_some() {
            warn!(pid, "Session survived SIGTERM, sending SIGKILL");
            let _ = kill(target, Signal::SIGKILL);
            let _ = self.events.send(SessionEvent::Killed);
        }
    }

    /// Whether a stop was requested for the current session.
    pub fn stop_requested(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

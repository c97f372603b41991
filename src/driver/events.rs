//! Typed driver events.
//!
//! The driver publishes immutable event values on a broadcast channel;
//! consumers (the CLI commands) subscribe and render them. Lagging
//! subscribers lose old events rather than blocking the driver.

use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum Event {
    Started { run_id: String },
    Stage { name: String },
    Log { message: String },
    Prompt { text: String },
    AgentStart { agent: String },
    AgentOutput { chunk: String },
    AgentDone { exit_code: i32 },
    Committed {
        commit: Option<String>,
        merge_request: Option<String>,
    },
    TaskDone { task_id: String },
    Completed { tasks_completed: u32 },
    Failed { error: String },
    Stopped,
}

/// Create the driver's event channel.
pub fn channel() -> (broadcast::Sender<Event>, broadcast::Receiver<Event>) {
    broadcast::channel(1024)
}

//! Control-plane data transfer objects.
//!
//! The control plane has grown a few alternate field names over time
//! (`agent_prompt` vs `prompt`, `gitlab_repo_url` vs `repo_url`); the
//! accessor methods resolve those so the rest of the crate never has to.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A unit of work fetched from the control plane. Read-only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub task_key: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub agent_prompt: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub target_files: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<Value>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Task {
    /// The task body: `agent_prompt` wins, then `prompt`, then `description`.
    pub fn body(&self) -> &str {
        self.agent_prompt
            .as_deref()
            .or(self.prompt.as_deref())
            .or(self.description.as_deref())
            .unwrap_or("")
    }

    /// Task key when assigned, otherwise the id.
    pub fn key_or_id(&self) -> &str {
        self.task_key.as_deref().unwrap_or(&self.id)
    }
}

/// The application a node is bound to. Read-only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub gitlab_repo_url: Option<String>,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub repository_url: Option<String>,
    #[serde(default)]
    pub cloud_run_url: Option<String>,
    #[serde(default)]
    pub deploy_url: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl Application {
    /// Repository URL: `gitlab_repo_url` wins, then `repo_url`, then `repository_url`.
    pub fn repo(&self) -> Option<&str> {
        self.gitlab_repo_url
            .as_deref()
            .or(self.repo_url.as_deref())
            .or(self.repository_url.as_deref())
    }

    /// Deployed URL: `cloud_run_url` wins, then `deploy_url`, then `url`.
    pub fn deploy(&self) -> Option<&str> {
        self.cloud_run_url
            .as_deref()
            .or(self.deploy_url.as_deref())
            .or(self.url.as_deref())
    }
}

/// A dev node registered with the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Result of `GET /cli/auth/session`.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSession {
    #[serde(default)]
    pub user: Option<Value>,
    #[serde(default)]
    pub account: Option<Value>,
}

/// Result of `GET /cli/connection`.
#[derive(Debug, Clone, Deserialize)]
pub struct Connection {
    pub application: Application,
    pub node: Node,
}

/// Body of `POST /cli/connect/<node_id>`.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectRequest {
    pub working_directory: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_repo_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    pub agent_cli: String,
}

/// Body of `POST /cli/tasks/<id>/complete`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskCompletion {
    pub completion_notes: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_request_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tests_passed: Option<bool>,
}

/// Body of `POST /cli/heartbeat`.
#[derive(Debug, Clone, Serialize)]
pub struct Heartbeat {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
}

/// Generic `{data: ...}` envelope the control plane wraps responses in.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_body_precedence() {
        let mut task: Task = serde_json::from_value(serde_json::json!({
            "id": "t1",
            "title": "Do things",
            "description": "desc",
            "prompt": "prompt",
            "agent_prompt": "agent prompt",
        }))
        .unwrap();

        assert_eq!(task.body(), "agent prompt");
        task.agent_prompt = None;
        assert_eq!(task.body(), "prompt");
        task.prompt = None;
        assert_eq!(task.body(), "desc");
        task.description = None;
        assert_eq!(task.body(), "");
    }

    #[test]
    fn task_key_falls_back_to_id() {
        let task: Task = serde_json::from_value(serde_json::json!({
            "id": "42",
            "title": "T",
        }))
        .unwrap();
        assert_eq!(task.key_or_id(), "42");

        let task: Task = serde_json::from_value(serde_json::json!({
            "id": "42",
            "task_key": "ABC-1",
            "title": "T",
        }))
        .unwrap();
        assert_eq!(task.key_or_id(), "ABC-1");
    }

    #[test]
    fn application_url_precedence() {
        let app: Application = serde_json::from_value(serde_json::json!({
            "id": "a1",
            "name": "shop",
            "repo_url": "https://gitlab.com/acme/shop",
            "deploy_url": "https://shop.example.com",
        }))
        .unwrap();

        assert_eq!(app.repo(), Some("https://gitlab.com/acme/shop"));
        assert_eq!(app.deploy(), Some("https://shop.example.com"));
    }

    #[test]
    fn application_without_repo_is_local_only() {
        let app: Application = serde_json::from_value(serde_json::json!({
            "id": "a1",
            "name": "scratch",
        }))
        .unwrap();
        assert!(app.repo().is_none());
        assert!(app.deploy().is_none());
    }

    #[test]
    fn completion_skips_absent_fields() {
        let completion = TaskCompletion {
            completion_notes: "done".to_string(),
            commit_hash: None,
            merge_request_url: None,
            tests_passed: Some(true),
        };
        let json = serde_json::to_value(&completion).unwrap();
        assert!(json.get("commit_hash").is_none());
        assert_eq!(json["tests_passed"], serde_json::json!(true));
    }

    #[test]
    fn envelope_unwraps_data() {
        let env: Envelope<Task> = serde_json::from_value(serde_json::json!({
            "data": {"id": "t9", "title": "Wrapped"},
        }))
        .unwrap();
        assert_eq!(env.data.id, "t9");
    }
}

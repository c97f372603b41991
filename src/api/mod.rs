//! Control-plane HTTP client.
//!
//! One shared `reqwest::Client` with bearer-token injection, JSON bodies,
//! and typed response decoding. Non-2xx responses become [`ApiError`]s
//! carrying the HTTP status and the server's error body; a 404 from
//! `tasks/next` is translated to `Ok(None)` ("no work").

pub mod error;
pub mod gitlab;
pub mod types;

pub use error::ApiError;
pub use gitlab::GitLabClient;
pub use types::{
    Application, AuthSession, Connection, Envelope, Heartbeat, Node, Task, TaskCompletion,
};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::session_store::SessionStore;

const SERVICE: &str = "gbos";

/// Client for the gbos control plane.
pub struct ControlPlaneClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl ControlPlaneClient {
    /// Build a client from the persisted session. `base_override` wins over
    /// the stored base URL when given.
    pub fn from_session(store: &SessionStore, base_override: Option<&str>) -> Result<Self, ApiError> {
        if !store.is_authenticated() {
            return Err(ApiError::not_configured(SERVICE));
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("gbos/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ApiError::network(SERVICE, e.to_string()))?;

        Ok(Self {
            base_url: base_override.unwrap_or(store.api_base()).to_string(),
            token: store.access_token.clone(),
            client,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = format!("{}{path}", self.base_url);
        debug!(%url, "GET");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ApiError::network(SERVICE, e.to_string()))?;

        Self::decode(path, response).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ApiError> {
        let url = format!("{}{path}", self.base_url);
        debug!(%url, "POST");

        let mut request = self.client.post(&url).bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::network(SERVICE, e.to_string()))?;

        Self::decode(path, response).await
    }

    async fn decode<T: DeserializeOwned>(
        path: &str,
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::network(SERVICE, e.to_string()))?;

        if !status.is_success() {
            // Prefer the server's message field when the body is JSON
            let message = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| {
                    v.get("message")
                        .or_else(|| v.get("error"))
                        .and_then(|m| m.as_str())
                        .map(String::from)
                })
                .unwrap_or(text);
            return Err(ApiError::from_status(SERVICE, path, status.as_u16(), &message));
        }

        if text.is_empty() {
            // Some endpoints reply 204/empty; decode from null
            return serde_json::from_value(serde_json::Value::Null)
                .map_err(|e| ApiError::http(SERVICE, status.as_u16(), e.to_string()));
        }

        serde_json::from_str(&text)
            .map_err(|e| ApiError::http(SERVICE, status.as_u16(), format!("decode error: {e}")))
    }

    /// Validate the current session.
    pub async fn auth_session(&self) -> Result<AuthSession, ApiError> {
        let env: Envelope<AuthSession> = self.get("/cli/auth/session").await?;
        Ok(env.data)
    }

    /// Current node connection (application + node).
    pub async fn connection(&self) -> Result<Connection, ApiError> {
        let env: Envelope<Connection> = self.get("/cli/connection").await?;
        Ok(env.data)
    }

    /// List dev nodes, optionally scoped to an application.
    pub async fn nodes(&self, application_id: Option<&str>) -> Result<Vec<Node>, ApiError> {
        let path = match application_id {
            Some(id) => format!("/cli/nodes?application_id={id}"),
            None => "/cli/nodes".to_string(),
        };
        let env: Envelope<Vec<Node>> = self.get(&path).await?;
        Ok(env.data)
    }

    /// Bind this CLI to a dev node.
    pub async fn connect(
        &self,
        node_id: &str,
        request: &types::ConnectRequest,
    ) -> Result<(), ApiError> {
        let _: serde_json::Value = self
            .post(&format!("/cli/connect/{node_id}"), Some(request))
            .await?;
        Ok(())
    }

    /// Release the node binding.
    pub async fn disconnect(&self) -> Result<(), ApiError> {
        let _: serde_json::Value = self
            .post::<(), _>("/cli/disconnect", None)
            .await?;
        Ok(())
    }

    /// Post a liveness message. Callers treat failures as best-effort.
    pub async fn heartbeat(&self, beat: &Heartbeat) -> Result<(), ApiError> {
        let _: serde_json::Value = self.post("/cli/heartbeat", Some(beat)).await?;
        Ok(())
    }

    /// Fetch the next task for this node. `None` when the queue is empty.
    pub async fn next_task(&self) -> Result<Option<Task>, ApiError> {
        match self.get::<Envelope<Task>>("/cli/tasks/next").await {
            Ok(env) => Ok(Some(env.data)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fetch a specific task by id.
    pub async fn task(&self, task_id: &str) -> Result<Task, ApiError> {
        let env: Envelope<Task> = self.get(&format!("/cli/tasks/{task_id}")).await?;
        Ok(env.data)
    }

    /// Mark a task in progress.
    pub async fn start_task(&self, task_id: &str) -> Result<(), ApiError> {
        let _: serde_json::Value = self
            .post::<(), _>(&format!("/cli/tasks/{task_id}/start"), None)
            .await?;
        Ok(())
    }

    /// Report task completion with commit/MR/tests metadata.
    pub async fn complete_task(
        &self,
        task_id: &str,
        completion: &TaskCompletion,
    ) -> Result<(), ApiError> {
        let _: serde_json::Value = self
            .post(&format!("/cli/tasks/{task_id}/complete"), Some(completion))
            .await?;
        Ok(())
    }

    /// Report task failure with a reason.
    pub async fn fail_task(&self, task_id: &str, reason: &str) -> Result<(), ApiError> {
        let body = serde_json::json!({ "reason": reason });
        let _: serde_json::Value = self
            .post(&format!("/cli/tasks/{task_id}/fail"), Some(&body))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_store::SessionStore;
    use std::path::PathBuf;

    #[test]
    fn from_session_requires_token() {
        let store = SessionStore::for_tests(PathBuf::from("/tmp/x.json"), "", "https://gbos.dev");
        let result = ControlPlaneClient::from_session(&store, None);
        assert!(matches!(result, Err(ApiError::NotConfigured { .. })));
    }

    #[test]
    fn from_session_strips_trailing_slash() {
        let store =
            SessionStore::for_tests(PathBuf::from("/tmp/x.json"), "tok", "https://gbos.dev/api/");
        let client = ControlPlaneClient::from_session(&store, None).unwrap();
        assert_eq!(client.base_url, "https://gbos.dev/api");
    }

    #[test]
    fn base_override_wins() {
        let store =
            SessionStore::for_tests(PathBuf::from("/tmp/x.json"), "tok", "https://gbos.dev/api");
        let client =
            ControlPlaneClient::from_session(&store, Some("http://localhost:4000")).unwrap();
        assert_eq!(client.base_url, "http://localhost:4000");
    }
}

//! GitLab REST client for merge-request creation.
//!
//! Only the single endpoint the orchestrator needs:
//! `POST /api/v4/projects/<url-encoded-path>/merge_requests` with the
//! `PRIVATE-TOKEN` header.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::ApiError;

const SERVICE: &str = "gitlab";

/// Parameters for creating a merge request.
#[derive(Debug, Clone, Serialize)]
pub struct MergeRequestParams {
    pub source_branch: String,
    pub target_branch: String,
    pub title: String,
    pub description: String,
    pub remove_source_branch: bool,
}

/// The subset of GitLab's MR response the orchestrator records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
    pub id: u64,
    #[serde(rename = "web_url")]
    pub url: String,
    pub title: String,
    pub source_branch: String,
    pub target_branch: String,
}

/// Minimal GitLab API client bound to one host.
pub struct GitLabClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl GitLabClient {
    /// `base_url` is the GitLab host root, e.g. "https://gitlab.com".
    pub fn new(base_url: &str, token: &str) -> Result<Self, ApiError> {
        if token.is_empty() {
            return Err(ApiError::not_configured(SERVICE));
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("gbos/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ApiError::network(SERVICE, e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client,
        })
    }

    /// Create a merge request on `project_path` (`namespace/name`).
    pub async fn create_merge_request(
        &self,
        project_path: &str,
        params: &MergeRequestParams,
    ) -> Result<MergeRequest, ApiError> {
        let path = format!(
            "/api/v4/projects/{}/merge_requests",
            encode_path_segment(project_path)
        );
        let url = format!("{}{path}", self.base_url);
        debug!(%url, source = %params.source_branch, "Creating merge request");

        let response = self
            .client
            .post(&url)
            .header("PRIVATE-TOKEN", &self.token)
            .json(params)
            .send()
            .await
            .map_err(|e| ApiError::network(SERVICE, e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::network(SERVICE, e.to_string()))?;

        if !status.is_success() {
            let message = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v.get("message").map(|m| m.to_string()))
                .unwrap_or(text);
            return Err(ApiError::from_status(SERVICE, &path, status.as_u16(), &message));
        }

        serde_json::from_str(&text)
            .map_err(|e| ApiError::http(SERVICE, status.as_u16(), format!("decode error: {e}")))
    }
}

/// Percent-encode a project path for use as a single URL segment.
/// GitLab requires the `namespace/name` separator itself to be encoded.
fn encode_path_segment(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 8);
    for byte in path.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}

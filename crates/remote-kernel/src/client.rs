//! Client for the remote kernelspec control plane.
//!
//! Two calls matter to a launch:
//! - `GET  /kernelspec?user=<id>` lists the cluster templates offered to a user
//! - `POST /kernelspec` registers a new kernel spec and returns its name
//!
//! No retries happen here. A failed create is a client-visible error, not a
//! lag condition; waiting for the registry is [`crate::sync`]'s job.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::launch::{LaunchRequest, Offerings, ResourceMap};
use crate::settings::RemoteKernelSettings;

const KERNELSPEC_ENDPOINT: &str = "kernelspec";

/// Error type for control-plane calls.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("Control plane unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Malformed response from control plane: {0}")]
    MalformedResponse(String),

    #[error("Request rejected: {detail}")]
    RequestRejected {
        /// HTTP status, absent when the request was refused before sending.
        status: Option<u16>,
        detail: String,
    },
}

/// Typed access to the kernelspec control plane.
#[async_trait]
pub trait KernelSpecClient: Send + Sync {
    /// Snapshot of the cluster templates currently offered to `user`.
    async fn list_offerings(&self, user: &str) -> Result<Offerings, ClientError>;

    /// Register a new kernel spec; returns the name the service assigned.
    async fn create_spec(&self, request: &LaunchRequest) -> Result<String, ClientError>;
}

/// Body of `POST /kernelspec`.
#[derive(Debug, Serialize)]
pub struct CreateSpecBody<'a> {
    pub cluster: &'a str,
    pub language: &'a str,
    pub username: &'a str,
    pub workdir: &'a str,
    pub exec_path: &'a str,
    pub user_scripts: &'a str,
    pub spec: &'a ResourceMap,
}

#[derive(Debug, Deserialize)]
struct CreateSpecResponse {
    name: String,
}

/// HTTP implementation of [`KernelSpecClient`].
#[derive(Debug, Clone)]
pub struct HttpKernelSpecClient {
    base_url: Url,
    http: reqwest::Client,
    username: String,
    language: String,
}

impl HttpKernelSpecClient {
    /// Create a client for the control plane at `base_url`.
    ///
    /// `username` is sent with every create call; the listing user is passed
    /// per call.
    pub fn new(mut base_url: Url, username: impl Into<String>) -> Self {
        // Url::join replaces the last segment unless the base ends in '/'
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            base_url,
            http: reqwest::Client::new(),
            username: username.into(),
            language: "python".to_string(),
        }
    }

    /// Build a client from settings.
    pub fn from_settings(settings: &RemoteKernelSettings) -> anyhow::Result<Self> {
        let base_url = Url::parse(&settings.gateway_url).map_err(|e| {
            anyhow::anyhow!("Invalid gateway_url {:?}: {}", settings.gateway_url, e)
        })?;
        let client = Self::new(base_url, settings.username())
            .with_language(&settings.language)
            .with_timeout(Duration::from_secs(settings.request_timeout_secs))?;
        Ok(client)
    }

    /// Set the kernel language sent on create.
    pub fn with_language(mut self, language: &str) -> Self {
        self.language = language.to_string();
        self
    }

    /// Set the overall per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> anyhow::Result<Self> {
        self.http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    fn endpoint(&self) -> Result<Url, ClientError> {
        self.base_url
            .join(KERNELSPEC_ENDPOINT)
            .map_err(|e| ClientError::RemoteUnavailable(format!("bad endpoint url: {e}")))
    }

    /// Fetch the raw `{ <name>: <kernelspec> }` listing for a user.
    pub async fn fetch_listing(&self, user: &str) -> Result<Map<String, Value>, ClientError> {
        // There is no request to edit yet, so nothing here is a rejection
        if user.trim().is_empty() {
            return Err(ClientError::RemoteUnavailable(
                "no user configured for the control plane".to_string(),
            ));
        }

        let url = self.endpoint()?;
        debug!("[kernelspec-client] GET {} (user={})", url, user);
        let response = self
            .http
            .get(url)
            .query(&[("user", user)])
            .send()
            .await
            .map_err(|e| ClientError::RemoteUnavailable(e.to_string()))?;

        match read_json(response, Rejection::Unavailable).await? {
            Value::Object(listing) => Ok(listing),
            other => Err(ClientError::MalformedResponse(format!(
                "expected an object of kernelspecs, got {}",
                json_type_name(&other)
            ))),
        }
    }
}

#[async_trait]
impl KernelSpecClient for HttpKernelSpecClient {
    async fn list_offerings(&self, user: &str) -> Result<Offerings, ClientError> {
        let listing = self.fetch_listing(user).await?;
        let offerings = Offerings::from_listing(listing).map_err(ClientError::MalformedResponse)?;
        info!(
            "[kernelspec-client] {} cluster(s) offered to {}",
            offerings.len(),
            user
        );
        Ok(offerings)
    }

    async fn create_spec(&self, request: &LaunchRequest) -> Result<String, ClientError> {
        let body = CreateSpecBody {
            cluster: &request.cluster,
            language: &self.language,
            username: &self.username,
            workdir: &request.workdir,
            exec_path: &request.exec_path,
            user_scripts: &request.user_scripts,
            spec: &request.resources,
        };

        let url = self.endpoint()?;
        debug!(
            "[kernelspec-client] POST {} (cluster={})",
            url, request.cluster
        );
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::RemoteUnavailable(e.to_string()))?;

        let value = read_json(response, Rejection::Rejected).await?;
        let created: CreateSpecResponse = serde_json::from_value(value)
            .map_err(|e| ClientError::MalformedResponse(e.to_string()))?;
        if created.name.is_empty() {
            return Err(ClientError::MalformedResponse(
                "create returned an empty kernel name".to_string(),
            ));
        }

        info!(
            "[kernelspec-client] Created kernel spec {} on {}",
            created.name, request.cluster
        );
        Ok(created.name)
    }
}

/// How a 4xx answer is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    /// The caller sent a launch request the user can edit and resubmit.
    Rejected,
    /// Nothing user-editable was sent; the service just did not serve us.
    Unavailable,
}

/// Map the status and decode the body of a control-plane response.
async fn read_json(
    response: reqwest::Response,
    rejection: Rejection,
) -> Result<Value, ClientError> {
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ClientError::RemoteUnavailable(e.to_string()))?;

    if status.is_client_error() && rejection == Rejection::Rejected {
        return Err(ClientError::RequestRejected {
            status: Some(status.as_u16()),
            detail: error_detail(&bytes, status),
        });
    }
    if !status.is_success() {
        return Err(ClientError::RemoteUnavailable(format!(
            "HTTP {}: {}",
            status.as_u16(),
            error_detail(&bytes, status)
        )));
    }

    serde_json::from_slice(&bytes).map_err(|e| ClientError::MalformedResponse(e.to_string()))
}

/// Pull a human-readable message out of an error body.
///
/// Prefers a `message`, `detail`, or `error` string in a JSON body, then the
/// raw text, then the status reason.
fn error_detail(body: &[u8], status: reqwest::StatusCode) -> String {
    if let Ok(Value::Object(obj)) = serde_json::from_slice::<Value>(body) {
        for key in ["message", "detail", "error"] {
            if let Some(msg) = obj.get(key).and_then(Value::as_str) {
                return msg.to_string();
            }
        }
    }
    let text = String::from_utf8_lossy(body).trim().to_string();
    if !text.is_empty() {
        return text;
    }
    status
        .canonical_reason()
        .unwrap_or("unknown error")
        .to_string()
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let client = HttpKernelSpecClient::new(
            Url::parse("http://gateway.example/api").unwrap(),
            "yasith",
        );
        assert_eq!(client.base_url().as_str(), "http://gateway.example/api/");
        assert_eq!(
            client.endpoint().unwrap().as_str(),
            "http://gateway.example/api/kernelspec"
        );
    }

    #[test]
    fn test_error_detail_prefers_json_message() {
        let status = reqwest::StatusCode::BAD_REQUEST;
        assert_eq!(
            error_detail(br#"{"message": "bad workdir"}"#, status),
            "bad workdir"
        );
        assert_eq!(error_detail(b"Unauthorized", status), "Unauthorized");
        assert_eq!(error_detail(b"", status), "Bad Request");
    }

    #[test]
    fn test_create_body_shape() {
        let request = LaunchRequest {
            cluster: "gkeyll".to_string(),
            workdir: "/export".to_string(),
            exec_path: String::new(),
            user_scripts: String::new(),
            resources: ResourceMap::from_pairs([("cpus-per-task", "1"), ("time", "01:00:00")]),
        };
        let body = CreateSpecBody {
            cluster: &request.cluster,
            language: "python",
            username: "yasith",
            workdir: &request.workdir,
            exec_path: &request.exec_path,
            user_scripts: &request.user_scripts,
            spec: &request.resources,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "cluster": "gkeyll",
                "language": "python",
                "username": "yasith",
                "workdir": "/export",
                "exec_path": "",
                "user_scripts": "",
                "spec": {"cpus-per-task": "1", "time": "01:00:00"}
            })
        );
    }

    #[tokio::test]
    async fn test_empty_user_fails_without_network() {
        // Nothing listens on port 9; an empty user must fail before connecting
        let client = HttpKernelSpecClient::new(Url::parse("http://127.0.0.1:9/").unwrap(), "");
        let err = client.list_offerings("").await.unwrap_err();
        match err {
            ClientError::RemoteUnavailable(detail) => assert!(detail.contains("no user")),
            other => panic!("unexpected error {other}"),
        }
    }
}

//! Authenticated memory API client
//!
//! Every request asks the token session for an access token first, so a
//! token about to expire is rotated before it is sent. Responses wrapped in a
//! top-level `data` field are unwrapped.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use serde_json::Value;
use token_session::AuthService;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Memory API client sharing the process-wide token session.
#[derive(Clone)]
pub struct ApiClient {
    auth: Arc<AuthService>,
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(
        auth: Arc<AuthService>,
        http: reqwest::Client,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            auth,
            http,
            base_url: base_url.into(),
            timeout,
        }
    }

    /// Send one request. `path` may carry a query string.
    pub async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let token = self.auth.get_access_token().await?;
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        debug!(method = %method, path, "memory API request");

        let mut builder = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(token.expose_str())
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.timeout);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout {
                    method: method.to_string(),
                    path: path.to_string(),
                    secs: self.timeout.as_secs(),
                }
            } else {
                Error::Http(e.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            warn!(path, ?retry_after, "memory API rate limited");
            return Err(Error::RateLimited { retry_after });
        }

        let raw = response
            .text()
            .await
            .map_err(|e| Error::Http(format!("reading response: {e}")))?;

        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&raw)
                .ok()
                .and_then(|v| {
                    v.pointer("/error/message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });
            warn!(status = status.as_u16(), path, "memory API request failed");
            return Err(Error::Status {
                status: status.as_u16(),
                message,
            });
        }

        if raw.trim().is_empty() {
            return Ok(Value::Null);
        }
        let value: Value =
            serde_json::from_str(&raw).map_err(|e| Error::Decode(e.to_string()))?;
        Ok(unwrap_data(value))
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn put(&self, path: &str, body: &Value) -> Result<Value> {
        self.request(Method::PUT, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.request(Method::DELETE, path, None).await
    }
}

fn unwrap_data(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.get("data").is_some_and(|d| !d.is_null()) => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

//! Device Authorization Grant (RFC 8628)
//!
//! The flow is a small state machine:
//!
//! ```text
//! Discovering -> ResolvingClient -> RequestingDeviceCode
//!     -> AwaitingUserAuthorization -> Polling -> Succeeded | Denied | Expired | Failed
//! ```
//!
//! `next_state` is the pure transition function for the polling phase;
//! `DeviceFlow::execute` performs the I/O around it. All waiting goes
//! through the injected `Clock`, and the loop is bounded by a monotonic
//! deadline derived from the device code's `expires_in`, so it ends even if
//! the server never answers `expired_token`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::Secret;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::constants::{
    DEFAULT_POLL_INTERVAL_SECS, DEVICE_CODE_GRANT_TYPE, SCOPES, SLOW_DOWN_INCREMENT_SECS,
};
use crate::credentials::Credential;
use crate::discovery::discover;
use crate::error::{Error, Result};
use crate::registration::client_id_from;
use crate::token::{OAuthErrorBody, TokenReply, TokenResponse, post_token_form};

/// Device authorization endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: Secret<String>,
    pub user_code: String,
    #[serde(alias = "verification_url")]
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    /// Lifetime of the device code in seconds
    pub expires_in: u64,
    /// Minimum poll period in seconds
    #[serde(default)]
    pub interval: Option<u64>,
}

impl DeviceAuthorization {
    /// URL to show the user; the complete form embeds the user code.
    pub fn verification_url(&self) -> &str {
        self.verification_uri_complete
            .as_deref()
            .unwrap_or(&self.verification_uri)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.interval.unwrap_or(DEFAULT_POLL_INTERVAL_SECS))
    }
}

/// What the operator needs to complete authorization on another device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationPrompt {
    pub verification_url: String,
    pub user_code: String,
    pub expires_in: Duration,
}

/// Operator-facing output of the flow.
pub trait Prompter: Send + Sync {
    /// Show the verification URL and user code.
    fn verification_required(&self, prompt: &VerificationPrompt);

    /// A new client was registered because none was configured.
    fn client_registered(&self, _client_id: &str) {}

    /// The user approved the request.
    fn authorized(&self) {}
}

/// Best-effort browser launcher. Failures never affect the flow.
#[async_trait]
pub trait UrlOpener: Send + Sync {
    async fn open(&self, url: &str) -> std::io::Result<()>;
}

/// Device flow states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowState {
    Discovering,
    ResolvingClient,
    RequestingDeviceCode,
    AwaitingUserAuthorization,
    Polling { interval: Duration },
    Succeeded,
    Denied,
    Expired,
    Failed(String),
}

impl FlowState {
    /// State label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            FlowState::Discovering => "discovering",
            FlowState::ResolvingClient => "resolving_client",
            FlowState::RequestingDeviceCode => "requesting_device_code",
            FlowState::AwaitingUserAuthorization => "awaiting_user_authorization",
            FlowState::Polling { .. } => "polling",
            FlowState::Succeeded => "succeeded",
            FlowState::Denied => "denied",
            FlowState::Expired => "expired",
            FlowState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowState::Succeeded | FlowState::Denied | FlowState::Expired | FlowState::Failed(_)
        )
    }
}

/// Classified token endpoint answer to a device code poll.
#[derive(Debug)]
pub enum PollResponse {
    Issued(TokenResponse),
    Pending,
    SlowDown,
    AccessDenied,
    ExpiredToken,
    Error(String),
}

impl PollResponse {
    fn classify(reply: TokenReply) -> Self {
        match reply {
            TokenReply::Issued(tokens) => PollResponse::Issued(tokens),
            TokenReply::Rejected { status, body, raw } => match body.error.as_deref() {
                Some("authorization_pending") => PollResponse::Pending,
                Some("slow_down") => PollResponse::SlowDown,
                Some("access_denied") => PollResponse::AccessDenied,
                Some("expired_token") => PollResponse::ExpiredToken,
                _ => PollResponse::Error(poll_error_message(status, &body, &raw)),
            },
        }
    }
}

fn poll_error_message(status: reqwest::StatusCode, body: &OAuthErrorBody, raw: &str) -> String {
    match body.message() {
        Some(message) => message.to_string(),
        None if !raw.trim().is_empty() => format!("{status}: {}", raw.trim()),
        None => status.to_string(),
    }
}

/// Transition for one poll response. Terminal states absorb every response.
pub fn next_state(state: &FlowState, response: &PollResponse) -> FlowState {
    let FlowState::Polling { interval } = state else {
        return state.clone();
    };
    match response {
        PollResponse::Issued(_) => FlowState::Succeeded,
        PollResponse::Pending => FlowState::Polling {
            interval: *interval,
        },
        PollResponse::SlowDown => FlowState::Polling {
            interval: interval.saturating_add(Duration::from_secs(SLOW_DOWN_INCREMENT_SECS)),
        },
        PollResponse::AccessDenied => FlowState::Denied,
        PollResponse::ExpiredToken => FlowState::Expired,
        PollResponse::Error(message) => FlowState::Failed(message.clone()),
    }
}

/// Tokens issued by a completed device flow.
#[derive(Debug, Clone)]
pub struct DeviceFlowResult {
    /// Client id used for the flow, configured or freshly registered
    pub client_id: String,
    pub tokens: TokenResponse,
}

impl DeviceFlowResult {
    /// Credential to persist, with `expires_at` relative to `now_millis`.
    pub fn into_credential(self, now_millis: u64) -> Credential {
        Credential::issued(self.client_id, &self.tokens, now_millis)
    }
}

/// Device flow executor.
pub struct DeviceFlow {
    http: reqwest::Client,
    auth_url: String,
    client_id: Option<String>,
    scope: String,
    clock: Arc<dyn Clock>,
    opener: Option<Arc<dyn UrlOpener>>,
}

impl DeviceFlow {
    pub fn new(http: reqwest::Client, auth_url: impl Into<String>) -> Self {
        Self {
            http,
            auth_url: auth_url.into(),
            client_id: None,
            scope: SCOPES.to_string(),
            clock: Arc::new(SystemClock::new()),
            opener: None,
        }
    }

    /// Use this client id instead of registering one.
    pub fn with_client_id(mut self, client_id: Option<String>) -> Self {
        self.client_id = client_id;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_url_opener(mut self, opener: Arc<dyn UrlOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    /// Run the flow to completion.
    ///
    /// Terminal states map to errors: `Denied` to `AuthorizationDenied`,
    /// `Expired` to `DeviceCodeExpired`, `Failed` to `AuthorizationFailed`.
    pub async fn execute(&self, prompter: &dyn Prompter) -> Result<DeviceFlowResult> {
        enter(&FlowState::Discovering);
        let discovery = discover(&self.http, &self.auth_url).await?;

        enter(&FlowState::ResolvingClient);
        let client_id =
            client_id_from(&self.http, &discovery, self.client_id.as_deref()).await?;
        if self.client_id.is_none() {
            prompter.client_registered(&client_id);
        }

        enter(&FlowState::RequestingDeviceCode);
        let device_endpoint = discovery.device_authorization_endpoint()?;
        let authorization = self.request_device_code(device_endpoint, &client_id).await?;
        let deadline = self
            .clock
            .monotonic()
            .checked_add(Duration::from_secs(authorization.expires_in))
            .unwrap_or(Duration::MAX);

        enter(&FlowState::AwaitingUserAuthorization);
        prompter.verification_required(&VerificationPrompt {
            verification_url: authorization.verification_url().to_string(),
            user_code: authorization.user_code.clone(),
            expires_in: Duration::from_secs(authorization.expires_in),
        });
        if let Some(opener) = &self.opener
            && let Err(e) = opener.open(authorization.verification_url()).await
        {
            debug!(error = %e, "could not open verification URL, continuing");
        }

        let tokens = self
            .poll(
                &discovery.token_endpoint,
                &client_id,
                &authorization,
                deadline,
            )
            .await?;
        prompter.authorized();
        info!(client_id = %client_id, "device authorization succeeded");

        Ok(DeviceFlowResult { client_id, tokens })
    }

    async fn request_device_code(
        &self,
        endpoint: &str,
        client_id: &str,
    ) -> Result<DeviceAuthorization> {
        let response = self
            .http
            .post(endpoint)
            .form(&[("client_id", client_id), ("scope", self.scope.as_str())])
            .send()
            .await
            .map_err(|e| Error::Http(format!("device authorization request failed: {e}")))?;

        let status = response.status();
        let raw = response
            .text()
            .await
            .map_err(|e| Error::Http(format!("reading device authorization response: {e}")))?;

        if !status.is_success() {
            let body = serde_json::from_str::<OAuthErrorBody>(&raw).unwrap_or_default();
            return Err(Error::DeviceAuthorization(match body.message() {
                Some(message) => format!("{status} - {message}"),
                None => status.to_string(),
            }));
        }

        serde_json::from_str(&raw).map_err(|e| {
            Error::DeviceAuthorization(format!("invalid device authorization response: {e}"))
        })
    }

    /// Poll the token endpoint until a terminal state or the deadline.
    async fn poll(
        &self,
        token_endpoint: &str,
        client_id: &str,
        authorization: &DeviceAuthorization,
        deadline: Duration,
    ) -> Result<TokenResponse> {
        let mut state = FlowState::Polling {
            interval: authorization.poll_interval(),
        };
        enter(&state);

        while let FlowState::Polling { interval } = state {
            if self.clock.monotonic() >= deadline {
                state = FlowState::Expired;
                break;
            }
            self.clock.sleep(interval).await;
            if self.clock.monotonic() >= deadline {
                state = FlowState::Expired;
                break;
            }

            let reply = post_token_form(
                &self.http,
                token_endpoint,
                &[
                    ("grant_type", DEVICE_CODE_GRANT_TYPE),
                    ("device_code", authorization.device_code.expose_str()),
                    ("client_id", client_id),
                ],
            )
            .await?;

            let response = PollResponse::classify(reply);
            let next = next_state(&state, &response);
            if next != state {
                enter(&next);
            }
            if let PollResponse::Issued(tokens) = response {
                return Ok(tokens);
            }
            state = next;
        }

        match state {
            FlowState::Denied => Err(Error::AuthorizationDenied),
            FlowState::Expired => {
                warn!("device code expired before authorization completed");
                Err(Error::DeviceCodeExpired)
            }
            FlowState::Failed(message) => Err(Error::AuthorizationFailed(message)),
            other => Err(Error::AuthorizationFailed(format!(
                "polling stopped in state {}",
                other.label()
            ))),
        }
    }
}

fn enter(state: &FlowState) {
    match state {
        FlowState::Polling { interval } => {
            debug!(state = state.label(), interval_secs = interval.as_secs(), "device flow state")
        }
        _ => debug!(state = state.label(), "device flow state"),
    }
}

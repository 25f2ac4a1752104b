//! Token endpoint interactions and refresh-token rotation
//!
//! Both grants this client uses (device code and refresh) POST form-encoded
//! bodies to the discovered `token_endpoint` and get back either a token
//! document or an RFC 6749 §5.2 error document. `post_token_form` does the
//! shared transport work; `refresh_token` is the rotator entry point.

use common::Secret;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::REFRESH_TOKEN_GRANT_TYPE;
use crate::discovery::discover;
use crate::error::{Error, Result};

/// Successful token endpoint response for both grants.
///
/// `expires_in` is a delta in seconds from the response time. The caller
/// converts it to an absolute unix millisecond timestamp when storing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: Secret<String>,
    /// Present when the server rotates (RFC 9700) or on first issuance
    /// with `offline_access`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<Secret<String>>,
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

/// RFC 6749 §5.2 error document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuthErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl OAuthErrorBody {
    /// Human-readable message: description first, then the bare code.
    pub fn message(&self) -> Option<&str> {
        self.error_description
            .as_deref()
            .or(self.error.as_deref())
    }
}

/// Outcome of a token endpoint request that reached the server.
#[derive(Debug)]
pub(crate) enum TokenReply {
    Issued(TokenResponse),
    Rejected {
        status: StatusCode,
        body: OAuthErrorBody,
        raw: String,
    },
}

impl TokenReply {
    /// Convert a rejection into `Error::TokenRejected`.
    pub(crate) fn rejection(status: StatusCode, body: &OAuthErrorBody, raw: &str) -> Error {
        let code = body
            .error
            .clone()
            .unwrap_or_else(|| "unexpected_response".into());
        let message = match body.message() {
            Some(message) => message.to_string(),
            None if !raw.trim().is_empty() => raw.trim().to_string(),
            None => status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string(),
        };
        Error::TokenRejected {
            status: status.as_u16(),
            code,
            message,
        }
    }
}

/// POST a form to the token endpoint and classify the reply.
///
/// Only transport failures and undecodable success bodies are errors here;
/// an OAuth error document is a normal `TokenReply::Rejected`, since the
/// device flow treats several of them as control signals.
pub(crate) async fn post_token_form(
    client: &reqwest::Client,
    endpoint: &str,
    form: &[(&str, &str)],
) -> Result<TokenReply> {
    let response = client
        .post(endpoint)
        .form(form)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token request failed: {e}")))?;

    let status = response.status();
    let raw = response
        .text()
        .await
        .map_err(|e| Error::Http(format!("reading token response: {e}")))?;

    if status.is_success() {
        let tokens = serde_json::from_str::<TokenResponse>(&raw)
            .map_err(|e| Error::TokenExchange(format!("invalid token response: {e}")))?;
        return Ok(TokenReply::Issued(tokens));
    }

    let body = serde_json::from_str::<OAuthErrorBody>(&raw).unwrap_or_default();
    Ok(TokenReply::Rejected { status, body, raw })
}

/// Exchange a refresh token for a new token set.
///
/// Re-runs discovery so a moved token endpoint is picked up. The returned
/// `refresh_token`, when present, must replace the caller's current one;
/// see `Credential::rotated`.
pub async fn refresh_token(
    client: &reqwest::Client,
    auth_url: &str,
    refresh: &str,
    client_id: &str,
) -> Result<TokenResponse> {
    let discovery = discover(client, auth_url).await?;

    let reply = post_token_form(
        client,
        &discovery.token_endpoint,
        &[
            ("grant_type", REFRESH_TOKEN_GRANT_TYPE),
            ("refresh_token", refresh),
            ("client_id", client_id),
        ],
    )
    .await?;

    match reply {
        TokenReply::Issued(tokens) => {
            debug!(
                client_id,
                rotated = tokens.refresh_token.is_some(),
                expires_in = tokens.expires_in,
                "refresh grant succeeded"
            );
            Ok(tokens)
        }
        TokenReply::Rejected { status, body, raw } => {
            Err(TokenReply::rejection(status, &body, &raw))
        }
    }
}

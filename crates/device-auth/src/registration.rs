//! Dynamic Client Registration (RFC 7591)
//!
//! A configured client id always wins and costs no network call. Without
//! one, the client registers itself as a public client (`token_endpoint_auth_method:
//! none`) able to use the device code and refresh grants. The issued id is
//! stored in the credential and reused by later logins.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::constants::{
    CLIENT_NAME, DEVICE_CODE_GRANT_TYPE, REFRESH_TOKEN_GRANT_TYPE, REGISTRATION_REDIRECT_URI,
    SCOPES,
};
use crate::discovery::{DiscoveryDocument, discover};
use crate::error::{Error, Result};
use crate::token::OAuthErrorBody;

/// Registration request body.
#[derive(Debug, Serialize)]
struct RegistrationRequest<'a> {
    client_name: &'a str,
    redirect_uris: [&'a str; 1],
    grant_types: [&'a str; 2],
    response_types: [&'a str; 1],
    token_endpoint_auth_method: &'a str,
    scope: &'a str,
}

impl Default for RegistrationRequest<'static> {
    fn default() -> Self {
        Self {
            client_name: CLIENT_NAME,
            redirect_uris: [REGISTRATION_REDIRECT_URI],
            grant_types: [DEVICE_CODE_GRANT_TYPE, REFRESH_TOKEN_GRANT_TYPE],
            response_types: ["code"],
            token_endpoint_auth_method: "none",
            scope: SCOPES,
        }
    }
}

/// Registration response. Only `client_id` is required.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientRegistration {
    pub client_id: String,
    #[serde(default)]
    pub client_id_issued_at: Option<u64>,
    #[serde(default)]
    pub client_name: Option<String>,
}

/// Register a new public client at `registration_endpoint`.
pub async fn register_client(
    client: &reqwest::Client,
    registration_endpoint: &str,
) -> Result<ClientRegistration> {
    let response = client
        .post(registration_endpoint)
        .json(&RegistrationRequest::default())
        .send()
        .await
        .map_err(|e| Error::Http(format!("registration request failed: {e}")))?;

    let status = response.status();
    let raw = response
        .text()
        .await
        .map_err(|e| Error::Http(format!("reading registration response: {e}")))?;

    if !status.is_success() {
        let body = serde_json::from_str::<OAuthErrorBody>(&raw).unwrap_or_default();
        let reason = body
            .message()
            .map(str::to_string)
            .or_else(|| status.canonical_reason().map(str::to_string))
            .unwrap_or_else(|| status.to_string());
        return Err(Error::Registration(reason));
    }

    let registration: ClientRegistration = serde_json::from_str(&raw)
        .map_err(|e| Error::Registration(format!("invalid registration response: {e}")))?;
    if registration.client_id.is_empty() {
        return Err(Error::Registration("server issued an empty client_id".into()));
    }

    info!(client_id = %registration.client_id, "registered dynamic client");
    Ok(registration)
}

/// Return `provided` unchanged, or discover and register a new client.
pub async fn resolve_client_id(
    client: &reqwest::Client,
    auth_url: &str,
    provided: Option<&str>,
) -> Result<String> {
    if let Some(id) = provided {
        return Ok(id.to_string());
    }
    let discovery = discover(client, auth_url).await?;
    client_id_from(client, &discovery, None).await
}

/// Same as `resolve_client_id` for callers that already hold the metadata.
pub(crate) async fn client_id_from(
    client: &reqwest::Client,
    discovery: &DiscoveryDocument,
    provided: Option<&str>,
) -> Result<String> {
    if let Some(id) = provided {
        return Ok(id.to_string());
    }
    let endpoint = discovery.registration_endpoint()?;
    Ok(register_client(client, endpoint).await?.client_id)
}

//! Authorization server metadata discovery (RFC 8414)
//!
//! Every operation that needs an endpoint re-fetches the metadata document.
//! Nothing is cached: endpoint URLs are always fresh at the cost of one extra
//! round trip per login or refresh.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::DISCOVERY_PATH;
use crate::error::{Error, Result};

/// Subset of the RFC 8414 metadata document this client uses.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryDocument {
    #[serde(default)]
    pub issuer: Option<String>,
    pub token_endpoint: String,
    #[serde(default)]
    pub device_authorization_endpoint: Option<String>,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
}

impl DiscoveryDocument {
    /// Device authorization endpoint, required for the device flow.
    pub fn device_authorization_endpoint(&self) -> Result<&str> {
        self.device_authorization_endpoint
            .as_deref()
            .ok_or_else(|| {
                Error::DeviceAuthorization(
                    "device authorization grant unsupported: device_authorization_endpoint not advertised".into(),
                )
            })
    }

    /// Registration endpoint, required when no client id is configured.
    pub fn registration_endpoint(&self) -> Result<&str> {
        self.registration_endpoint.as_deref().ok_or_else(|| {
            Error::Registration(
                "DCR unsupported: registration_endpoint not advertised".into(),
            )
        })
    }
}

/// Full metadata URL for an authorization server base URL.
pub fn metadata_url(auth_url: &str) -> String {
    format!("{}{}", auth_url.trim_end_matches('/'), DISCOVERY_PATH)
}

/// Fetch and validate the authorization server metadata.
///
/// Transport failures map to `Error::Http` so refresh retries can tell them
/// apart from a server that answered with garbage (`Error::Discovery`).
pub async fn discover(client: &reqwest::Client, auth_url: &str) -> Result<DiscoveryDocument> {
    let url = metadata_url(auth_url);
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| Error::Http(format!("discovery request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::Discovery(format!("{url} returned {status}")));
    }

    let body = response
        .text()
        .await
        .map_err(|e| Error::Http(format!("reading discovery response: {e}")))?;
    let document: DiscoveryDocument = serde_json::from_str(&body)
        .map_err(|e| Error::Discovery(format!("malformed metadata document: {e}")))?;

    if document.token_endpoint.trim().is_empty() {
        return Err(Error::Discovery("token_endpoint is empty".into()));
    }

    debug!(
        token_endpoint = %document.token_endpoint,
        device_flow = document.device_authorization_endpoint.is_some(),
        registration = document.registration_endpoint.is_some(),
        "discovered authorization server metadata"
    );
    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockAuthServer, MockOptions, unreachable_url};
    use axum::http::StatusCode;

    #[test]
    fn metadata_url_ignores_trailing_slash() {
        assert_eq!(
            metadata_url("https://auth.example.test/"),
            "https://auth.example.test/.well-known/oauth-authorization-server"
        );
        assert_eq!(
            metadata_url("https://auth.example.test"),
            "https://auth.example.test/.well-known/oauth-authorization-server"
        );
    }

    #[test]
    fn optional_endpoints_default_to_none() {
        let json = r#"{"token_endpoint":"https://a.test/token"}"#;
        let doc: DiscoveryDocument = serde_json::from_str(json).unwrap();
        assert!(doc.device_authorization_endpoint.is_none());
        assert!(doc.scopes_supported.is_empty());
        assert!(matches!(
            doc.registration_endpoint(),
            Err(Error::Registration(msg)) if msg.contains("DCR unsupported")
        ));
        assert!(matches!(
            doc.device_authorization_endpoint(),
            Err(Error::DeviceAuthorization(_))
        ));
    }

    #[test]
    fn missing_token_endpoint_is_malformed() {
        let json = r#"{"issuer":"https://a.test"}"#;
        assert!(serde_json::from_str::<DiscoveryDocument>(json).is_err());
    }

    #[tokio::test]
    async fn discover_reads_all_endpoints() {
        let server = MockAuthServer::start().await;
        let doc = discover(&reqwest::Client::new(), server.url()).await.unwrap();

        assert_eq!(doc.token_endpoint, format!("{}/oauth/token", server.url()));
        assert_eq!(
            doc.device_authorization_endpoint.as_deref(),
            Some(format!("{}/oauth/device", server.url()).as_str())
        );
        assert!(doc.registration_endpoint.is_some());
        assert_eq!(doc.scopes_supported.len(), 3);
    }

    #[tokio::test]
    async fn discover_is_not_cached() {
        let server = MockAuthServer::start().await;
        let client = reqwest::Client::new();
        discover(&client, server.url()).await.unwrap();
        discover(&client, server.url()).await.unwrap();
        assert_eq!(server.discovery_hits(), 2);
    }

    #[tokio::test]
    async fn non_success_status_is_discovery_error() {
        let server = MockAuthServer::start_with(MockOptions {
            discovery_status: StatusCode::NOT_FOUND,
            ..MockOptions::default()
        })
        .await;
        let err = discover(&reqwest::Client::new(), server.url())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Discovery(_)), "got: {err:?}");
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn connection_failure_is_transient() {
        let url = unreachable_url().await;
        let err = discover(&reqwest::Client::new(), &url).await.unwrap_err();
        assert!(matches!(err, Error::Http(_)), "got: {err:?}");
        assert!(err.is_transient());
    }
}

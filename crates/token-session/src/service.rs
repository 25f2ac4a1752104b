//! Credential cache, token accessor and single-flight refresh
//!
//! `AuthService` is created once per process and shared via `Arc` between
//! the request path and the background scheduler. The credential store stays
//! the source of truth; the cache is populated from it on first use, updated
//! after every successful rotation, and replaced when the store holds a newer
//! credential written by another login.
//!
//! Refresh coordination: every refresh runs while holding `refresh_gate`.
//! A caller records the completed-refresh generation before queueing on the
//! gate. If the generation moved while it waited, another refresh finished
//! in the meantime and the caller reuses that outcome instead of spending
//! the (possibly already rotated) refresh token a second time.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::Secret;
use device_auth::{Clock, Credential, CredentialStore, SystemClock};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Default proactive refresh buffer: refresh when less than 4 h remain.
pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::from_secs(4 * 60 * 60);

/// What caused a refresh, for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// Token accessor found the cached token inside the buffer
    Request,
    /// Background scheduler tick
    Scheduled,
}

impl RefreshTrigger {
    pub fn label(&self) -> &'static str {
        match self {
            RefreshTrigger::Request => "request",
            RefreshTrigger::Scheduled => "scheduled",
        }
    }
}

/// Non-secret view of the stored credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub client_id: String,
    pub expires_at: u64,
    pub remaining: Duration,
    pub can_refresh: bool,
    pub authenticated: bool,
}

#[derive(Default)]
struct RefreshSlot {
    last: Option<Result<Credential>>,
}

/// Process-wide token session.
pub struct AuthService {
    store: CredentialStore,
    http: reqwest::Client,
    auth_url: String,
    clock: Arc<dyn Clock>,
    buffer: Duration,
    retry: RetryPolicy,
    cache: RwLock<Option<Credential>>,
    refresh_gate: Mutex<RefreshSlot>,
    generation: AtomicU64,
}

impl AuthService {
    pub fn new(store: CredentialStore, http: reqwest::Client, auth_url: impl Into<String>) -> Self {
        Self {
            store,
            http,
            auth_url: auth_url.into(),
            clock: Arc::new(SystemClock::new()),
            buffer: DEFAULT_REFRESH_BUFFER,
            retry: RetryPolicy::default(),
            cache: RwLock::new(None),
            refresh_gate: Mutex::new(RefreshSlot::default()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Refresh tokens with less than `buffer` lifetime left.
    pub fn with_buffer(mut self, buffer: Duration) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn buffer(&self) -> Duration {
        self.buffer
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Load the stored credential into the cache and report what was found.
    pub async fn start(&self) -> Option<SessionStatus> {
        let loaded = self.store.load().await;
        *self.cache.write().await = loaded.clone();

        match loaded {
            Some(credential) => {
                let status = self.status_of(&credential);
                record_expiry(&credential, self.clock.now_millis());
                info!(
                    client_id = %status.client_id,
                    remaining_secs = status.remaining.as_secs(),
                    can_refresh = status.can_refresh,
                    "auth service started with stored credentials"
                );
                Some(status)
            }
            None => {
                info!(path = %self.store.path().display(), "auth service started without credentials");
                None
            }
        }
    }

    /// Return a valid access token, refreshing first if it is inside the
    /// buffer.
    ///
    /// A token inside the buffer but not yet expired is still returned when
    /// there is no refresh token to rotate it with.
    pub async fn get_access_token(&self) -> Result<Secret<String>> {
        let credential = self.cached().await.ok_or(Error::NotAuthenticated)?;
        let now = self.clock.now_millis();

        if !credential.needs_refresh(self.buffer, now) {
            return Ok(credential.access_token);
        }

        if !credential.can_refresh() {
            if credential.is_expired(now) {
                return Err(Error::TokenExpired);
            }
            debug!(
                remaining_secs = credential.remaining(now).as_secs(),
                "token inside refresh buffer without a refresh token"
            );
            return Ok(credential.access_token);
        }

        match self.refresh_from(credential, RefreshTrigger::Request).await {
            Ok(refreshed) => Ok(refreshed.access_token),
            Err(e) => {
                // A login from another process may have replaced the credential.
                if let Some(stored) = self.store.load().await
                    && !stored.is_expired(self.clock.now_millis())
                    && self.adopt(&stored).await
                {
                    return Ok(stored.access_token);
                }
                Err(e)
            }
        }
    }

    /// Replace the cached credential with `stored` when it carries a
    /// different access token that expires later. Returns whether the cache
    /// changed.
    pub async fn adopt(&self, stored: &Credential) -> bool {
        let mut cache = self.cache.write().await;
        let newer = cache.as_ref().is_none_or(|current| {
            current.access_token != stored.access_token && stored.expires_at > current.expires_at
        });
        if newer {
            *cache = Some(stored.clone());
            record_expiry(stored, self.clock.now_millis());
            info!(client_id = %stored.client_id, "adopted newer stored credential");
        }
        newer
    }

    /// Whether a usable credential exists: the access token is outside the
    /// buffer, or it can be refreshed.
    pub async fn is_authenticated(&self) -> bool {
        match self.cached().await {
            Some(credential) => {
                credential.can_refresh()
                    || !credential.needs_refresh(self.buffer, self.clock.now_millis())
            }
            None => false,
        }
    }

    /// Non-secret summary of the cached credential.
    pub async fn status(&self) -> Option<SessionStatus> {
        self.cached().await.map(|c| self.status_of(&c))
    }

    /// Rotate `base` through the single-flight gate and persist the result.
    ///
    /// `base` is the credential the caller decided to refresh: the cached one
    /// for the request path, a fresh store read for the scheduler.
    pub async fn refresh_from(
        &self,
        base: Credential,
        trigger: RefreshTrigger,
    ) -> Result<Credential> {
        let observed = self.generation.load(Ordering::Acquire);
        let mut slot = self.refresh_gate.lock().await;

        if self.generation.load(Ordering::Acquire) != observed {
            if let Some(outcome) = &slot.last {
                debug!(trigger = trigger.label(), "reusing concurrent refresh outcome");
                return outcome.clone();
            }
        }

        // A refresh may have completed before this caller read the cache.
        if let Some(current) = self.cache.read().await.as_ref() {
            let now = self.clock.now_millis();
            if current.access_token != base.access_token && !current.needs_refresh(self.buffer, now)
            {
                debug!(trigger = trigger.label(), "cached token already rotated");
                return Ok(current.clone());
            }
        }

        let outcome = self.rotate(&base, trigger).await;
        slot.last = Some(outcome.clone());
        self.generation.fetch_add(1, Ordering::Release);
        outcome
    }

    async fn rotate(&self, base: &Credential, trigger: RefreshTrigger) -> Result<Credential> {
        let Some(refresh) = base.refresh_token.as_ref() else {
            return Err(Error::TokenExpired);
        };

        let http = &self.http;
        let auth_url = self.auth_url.as_str();
        let client_id = base.client_id.as_str();
        let refresh = refresh.expose_str();

        let result = self
            .retry
            .run(self.clock.as_ref(), move |attempt| {
                debug!(
                    attempt,
                    trigger = trigger.label(),
                    client_id,
                    "refreshing access token"
                );
                device_auth::refresh_token(http, auth_url, refresh, client_id)
            })
            .await;

        let tokens = match result {
            Ok(tokens) => tokens,
            Err(e) => {
                record_refresh(trigger, "failure");
                warn!(
                    trigger = trigger.label(),
                    requires_login = e.requires_login(),
                    error = %e,
                    "token refresh failed"
                );
                return Err(Error::RefreshFailed(e.to_string()));
            }
        };

        let now = self.clock.now_millis();
        let rotated = base.rotated(&tokens, now);
        if let Err(e) = self.store.save(&rotated).await {
            warn!(error = %e, "failed to persist refreshed credential, keeping it in memory");
        }
        *self.cache.write().await = Some(rotated.clone());

        record_refresh(trigger, "success");
        record_expiry(&rotated, now);
        info!(
            trigger = trigger.label(),
            rotated = tokens.refresh_token.is_some(),
            expires_in = tokens.expires_in,
            "access token refreshed"
        );
        Ok(rotated)
    }

    async fn cached(&self) -> Option<Credential> {
        if let Some(credential) = self.cache.read().await.as_ref() {
            return Some(credential.clone());
        }
        let loaded = self.store.load().await?;
        let mut cache = self.cache.write().await;
        Some(cache.get_or_insert(loaded).clone())
    }

    fn status_of(&self, credential: &Credential) -> SessionStatus {
        let now = self.clock.now_millis();
        SessionStatus {
            client_id: credential.client_id.clone(),
            expires_at: credential.expires_at,
            remaining: credential.remaining(now),
            can_refresh: credential.can_refresh(),
            authenticated: credential.can_refresh() || !credential.needs_refresh(self.buffer, now),
        }
    }
}

fn record_refresh(trigger: RefreshTrigger, outcome: &'static str) {
    metrics::counter!(
        "auth_token_refresh_total",
        "trigger" => trigger.label(),
        "outcome" => outcome
    )
    .increment(1);
}

fn record_expiry(credential: &Credential, now_millis: u64) {
    metrics::gauge!("auth_token_expires_in_seconds")
        .set(credential.remaining(now_millis).as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use device_auth::ManualClock;
    use device_auth::testing::{MockAuthServer, token_success, unreachable_url};
    use serde_json::json;

    const NOW: u64 = 1_750_000_000_000;
    const HOUR_MS: u64 = 3_600_000;

    fn credential(expires_at: u64, refresh: Option<&str>) -> Credential {
        Credential {
            schema_version: device_auth::credentials::CURRENT_SCHEMA_VERSION,
            client_id: "client-1".into(),
            access_token: "at_old".into(),
            refresh_token: refresh.map(Secret::from),
            expires_at,
            created_at: NOW - HOUR_MS,
        }
    }

    async fn service_with(
        dir: &tempfile::TempDir,
        auth_url: &str,
        stored: Option<Credential>,
    ) -> (AuthService, Arc<ManualClock>) {
        let store = CredentialStore::new(dir.path().join("credentials.json"));
        if let Some(credential) = stored {
            store.save(&credential).await.unwrap();
        }
        let clock = Arc::new(ManualClock::new(NOW));
        let service = AuthService::new(store, reqwest::Client::new(), auth_url)
            .with_clock(clock.clone());
        (service, clock)
    }

    #[tokio::test]
    async fn no_credential_is_not_authenticated() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = service_with(&dir, "http://127.0.0.1:9", None).await;

        assert!(service.start().await.is_none());
        assert!(matches!(
            service.get_access_token().await,
            Err(Error::NotAuthenticated)
        ));
        assert!(!service.is_authenticated().await);
    }

    #[tokio::test]
    async fn fresh_token_is_returned_without_network() {
        let server = MockAuthServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let stored = credential(NOW + 10 * HOUR_MS, Some("rt_old"));
        let (service, _) = service_with(&dir, server.url(), Some(stored)).await;

        let token = service.get_access_token().await.unwrap();
        assert_eq!(token.expose(), "at_old");
        assert_eq!(server.discovery_hits(), 0);
        assert!(service.is_authenticated().await);
    }

    #[tokio::test]
    async fn token_inside_buffer_is_refreshed_and_persisted() {
        let server = MockAuthServer::start().await;
        server.push_token_reply(StatusCode::OK, token_success("at_new", Some("rt_new"), 28_800));
        let dir = tempfile::tempdir().unwrap();
        let stored = credential(NOW + HOUR_MS, Some("rt_old"));
        let (service, _) = service_with(&dir, server.url(), Some(stored)).await;

        let token = service.get_access_token().await.unwrap();
        assert_eq!(token.expose(), "at_new");

        let requests = server.token_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["refresh_token"], "rt_old");
        assert_eq!(requests[0]["client_id"], "client-1");

        let on_disk = service.store().load().await.unwrap();
        assert_eq!(on_disk.access_token.expose(), "at_new");
        assert_eq!(on_disk.refresh_token.unwrap().expose(), "rt_new");
        assert_eq!(on_disk.expires_at, NOW + 8 * HOUR_MS);
    }

    #[tokio::test]
    async fn refresh_without_rotation_keeps_refresh_token() {
        let server = MockAuthServer::start().await;
        server.push_token_reply(StatusCode::OK, token_success("at_new", None, 28_800));
        let dir = tempfile::tempdir().unwrap();
        let stored = credential(NOW + HOUR_MS, Some("rt_keep"));
        let (service, _) = service_with(&dir, server.url(), Some(stored)).await;

        service.get_access_token().await.unwrap();
        let on_disk = service.store().load().await.unwrap();
        assert_eq!(on_disk.refresh_token.unwrap().expose(), "rt_keep");
    }

    #[tokio::test]
    async fn expired_without_refresh_token_is_token_expired() {
        let dir = tempfile::tempdir().unwrap();
        let stored = credential(NOW - 1, None);
        let (service, _) = service_with(&dir, "http://127.0.0.1:9", Some(stored)).await;

        assert!(matches!(
            service.get_access_token().await,
            Err(Error::TokenExpired)
        ));
        assert!(!service.is_authenticated().await);
    }

    #[tokio::test]
    async fn inside_buffer_without_refresh_token_still_returns_token() {
        let dir = tempfile::tempdir().unwrap();
        let stored = credential(NOW + HOUR_MS, None);
        let (service, _) = service_with(&dir, "http://127.0.0.1:9", Some(stored)).await;

        let token = service.get_access_token().await.unwrap();
        assert_eq!(token.expose(), "at_old");
        // Usable now, but not for long and not renewable
        assert!(!service.is_authenticated().await);
    }

    #[tokio::test]
    async fn rejected_refresh_fails_once_without_retry() {
        let server = MockAuthServer::start().await;
        server.push_token_reply(
            StatusCode::BAD_REQUEST,
            json!({"error": "invalid_grant", "error_description": "refresh token revoked"}),
        );
        let dir = tempfile::tempdir().unwrap();
        let stored = credential(NOW + HOUR_MS, Some("rt_dead"));
        let (service, clock) = service_with(&dir, server.url(), Some(stored)).await;

        let err = service.get_access_token().await.unwrap_err();
        assert!(matches!(&err, Error::RefreshFailed(msg) if msg.contains("refresh token revoked")));
        assert_eq!(server.token_request_count(), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn rejected_refresh_falls_back_to_newer_stored_credential() {
        let server = MockAuthServer::start().await;
        server.push_token_reply(StatusCode::BAD_REQUEST, json!({"error": "invalid_grant"}));
        server.push_token_reply(StatusCode::BAD_REQUEST, json!({"error": "invalid_grant"}));
        let dir = tempfile::tempdir().unwrap();
        let stored = credential(NOW + HOUR_MS, Some("rt_dead"));
        let (service, _) = service_with(&dir, server.url(), Some(stored)).await;
        service.start().await.unwrap();
        assert!(service.get_access_token().await.is_err());

        let mut fresh = credential(NOW + 10 * HOUR_MS, Some("rt_fresh"));
        fresh.access_token = "at_fresh".into();
        service.store().save(&fresh).await.unwrap();

        let token = service.get_access_token().await.unwrap();
        assert_eq!(token.expose(), "at_fresh");
        // The cache now holds the new credential; no further refresh
        let again = service.get_access_token().await.unwrap();
        assert_eq!(again.expose(), "at_fresh");
        assert_eq!(server.token_request_count(), 2);
    }

    #[tokio::test]
    async fn adopt_ignores_older_or_identical_credential() {
        let dir = tempfile::tempdir().unwrap();
        let stored = credential(NOW + 5 * HOUR_MS, Some("rt_old"));
        let (service, _) = service_with(&dir, "http://127.0.0.1:9", Some(stored.clone())).await;
        service.start().await.unwrap();

        assert!(!service.adopt(&stored).await);
        let mut older = credential(NOW + HOUR_MS, Some("rt_other"));
        older.access_token = "at_other".into();
        assert!(!service.adopt(&older).await);
        assert_eq!(service.status().await.unwrap().expires_at, NOW + 5 * HOUR_MS);
    }

    #[tokio::test]
    async fn unreachable_server_retries_three_times() {
        let url = unreachable_url().await;
        let dir = tempfile::tempdir().unwrap();
        let stored = credential(NOW + HOUR_MS, Some("rt_old"));
        let (service, clock) = service_with(&dir, &url, Some(stored)).await;

        let err = service.get_access_token().await.unwrap_err();
        assert!(matches!(err, Error::RefreshFailed(_)));
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let server = MockAuthServer::start().await;
        server.push_token_reply(StatusCode::OK, token_success("at_new", Some("rt_new"), 28_800));
        let dir = tempfile::tempdir().unwrap();
        let stored = credential(NOW + HOUR_MS, Some("rt_old"));
        let (service, _) = service_with(&dir, server.url(), Some(stored)).await;
        let service = Arc::new(service);

        let (a, b, c) = tokio::join!(
            service.get_access_token(),
            service.get_access_token(),
            service.get_access_token()
        );

        for token in [a, b, c] {
            assert_eq!(token.unwrap().expose(), "at_new");
        }
        assert_eq!(server.token_request_count(), 1);
    }

    #[tokio::test]
    async fn persist_failure_still_returns_refreshed_token() {
        let server = MockAuthServer::start().await;
        server.push_token_reply(StatusCode::OK, token_success("at_new", Some("rt_new"), 28_800));
        let dir = tempfile::tempdir().unwrap();
        let stored = credential(NOW + HOUR_MS, Some("rt_old"));
        let (service, _) = service_with(&dir, server.url(), Some(stored)).await;
        service.start().await.unwrap();

        // A directory at the credential path makes the final rename fail
        let path = service.store().path().to_path_buf();
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), b"x").unwrap();

        let token = service.get_access_token().await.unwrap();
        assert_eq!(token.expose(), "at_new");
        // Served from the cache afterwards, no second refresh
        let again = service.get_access_token().await.unwrap();
        assert_eq!(again.expose(), "at_new");
        assert_eq!(server.token_request_count(), 1);
    }

    #[tokio::test]
    async fn status_reports_without_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let stored = credential(NOW + 5 * HOUR_MS, Some("rt_old"));
        let (service, _) = service_with(&dir, "http://127.0.0.1:9", Some(stored)).await;

        let status = service.start().await.unwrap();
        assert_eq!(status.client_id, "client-1");
        assert_eq!(status.remaining, Duration::from_secs(5 * 3600));
        assert!(status.can_refresh);
        assert!(status.authenticated);
        assert_eq!(service.status().await, Some(status));
    }
}

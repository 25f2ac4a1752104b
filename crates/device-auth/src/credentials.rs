//! Credential storage for OAuth tokens
//!
//! Persists the single current token set as a JSON file. All writes use a
//! uniquely named temp file + rename, so a reader never sees a half-written
//! record and a crash mid-write leaves the previous record in place. Writers
//! don't need a lock: concurrent saves each rename a complete file and the
//! last rename wins.
//!
//! Reads never fail. A missing, unreadable, corrupt or unsupported file is
//! reported as "no credential" and the caller falls back to asking for login.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::token::TokenResponse;

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Oldest schema version this build can read.
pub const MIN_SCHEMA_VERSION: u32 = 1;

/// Distinguishes temp files of concurrent writers within one process.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// The persisted token record.
///
/// `expires_at` and `created_at` are unix timestamps in milliseconds.
/// Field aliases accept the older `version`/`access`/`refresh`/`expires`
/// layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    #[serde(alias = "version")]
    pub schema_version: u32,
    pub client_id: String,
    #[serde(alias = "access")]
    pub access_token: Secret<String>,
    #[serde(default, alias = "refresh", skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<Secret<String>>,
    #[serde(alias = "expires")]
    pub expires_at: u64,
    #[serde(default)]
    pub created_at: u64,
}

/// `expires_in` is server-controlled; saturate instead of overflowing.
fn expires_at(tokens: &TokenResponse, now_millis: u64) -> u64 {
    now_millis.saturating_add(tokens.expires_in.saturating_mul(1000))
}

impl Credential {
    /// Build a first credential from a token response received at `now_millis`.
    pub fn issued(client_id: impl Into<String>, tokens: &TokenResponse, now_millis: u64) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            client_id: client_id.into(),
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            expires_at: expires_at(tokens, now_millis),
            created_at: now_millis,
        }
    }

    /// Apply a refresh response (RFC 9700 rotation).
    ///
    /// A returned refresh token replaces the current one; when the server
    /// omits it the current one is kept, so a rotating client is never
    /// silently downgraded.
    pub fn rotated(&self, tokens: &TokenResponse, now_millis: u64) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            client_id: self.client_id.clone(),
            access_token: tokens.access_token.clone(),
            refresh_token: tokens
                .refresh_token
                .clone()
                .or_else(|| self.refresh_token.clone()),
            expires_at: expires_at(tokens, now_millis),
            created_at: now_millis,
        }
    }

    /// Lifetime left at `now_millis`; zero once expired.
    pub fn remaining(&self, now_millis: u64) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now_millis))
    }

    /// Whether the access token is past `expires_at`.
    pub fn is_expired(&self, now_millis: u64) -> bool {
        now_millis >= self.expires_at
    }

    /// Whether the remaining lifetime is below `buffer`.
    pub fn needs_refresh(&self, buffer: Duration, now_millis: u64) -> bool {
        self.remaining(now_millis) < buffer
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }

    fn is_supported(&self) -> bool {
        (MIN_SCHEMA_VERSION..=CURRENT_SCHEMA_VERSION).contains(&self.schema_version)
    }
}

/// File-backed store for the single current credential.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

/// A fully written temp file that has not been renamed into place yet.
#[derive(Debug)]
pub(crate) struct StagedWrite {
    tmp_path: PathBuf,
    final_path: PathBuf,
}

impl StagedWrite {
    /// Atomically replace the target with the staged file.
    pub(crate) async fn commit(self) -> Result<()> {
        if let Err(e) = tokio::fs::rename(&self.tmp_path, &self.final_path).await {
            let _ = tokio::fs::remove_file(&self.tmp_path).await;
            return Err(Error::Io(format!("renaming temp credential file: {e}")));
        }
        debug!(path = %self.final_path.display(), "persisted credential");
        Ok(())
    }
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the current credential, or `None` if there is no usable one.
    pub async fn load(&self) -> Option<Credential> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no credential file");
                return None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "credential file unreadable, treating as unauthenticated");
                return None;
            }
        };

        let credential: Credential = match serde_json::from_str(&contents) {
            Ok(credential) => credential,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "credential file corrupt, treating as unauthenticated");
                return None;
            }
        };

        if !credential.is_supported() {
            warn!(
                path = %self.path.display(),
                schema_version = credential.schema_version,
                "unsupported credential schema version, treating as unauthenticated"
            );
            return None;
        }

        if credential.client_id.is_empty() || credential.access_token.expose().is_empty() {
            warn!(path = %self.path.display(), "credential record incomplete, treating as unauthenticated");
            return None;
        }

        Some(credential)
    }

    /// Persist `credential`, replacing any previous record atomically.
    ///
    /// The parent directory is created with mode 0700 if missing and the
    /// file is created with mode 0600 (unix only).
    pub async fn save(&self, credential: &Credential) -> Result<()> {
        self.stage(credential).await?.commit().await
    }

    /// Write `credential` to a fresh temp file beside the target.
    pub(crate) async fn stage(&self, credential: &Credential) -> Result<StagedWrite> {
        let json = serde_json::to_string_pretty(credential)
            .map_err(|e| Error::CredentialParse(format!("serializing credential: {e}")))?;

        let dir = self
            .path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;
        ensure_private_dir(dir).await?;

        let file_name = self
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("credentials.json");
        let tmp_path = dir.join(format!(
            ".{file_name}.tmp.{}.{}",
            std::process::id(),
            TMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));

        if let Err(e) = write_private_file(&tmp_path, json.as_bytes()).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        Ok(StagedWrite {
            tmp_path,
            final_path: self.path.clone(),
        })
    }
}

/// Create `dir` (and missing ancestors) owner-only. Existing directories
/// are left untouched.
async fn ensure_private_dir(dir: &Path) -> Result<()> {
    if tokio::fs::try_exists(dir).await.unwrap_or(false) {
        return Ok(());
    }
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder
        .create(dir)
        .await
        .map_err(|e| Error::Io(format!("creating credential directory: {e}")))
}

/// Create `path` with owner-only permissions, write `bytes` and flush to disk.
async fn write_private_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options
        .open(path)
        .await
        .map_err(|e| Error::Io(format!("creating temp credential file: {e}")))?;
    file.write_all(bytes)
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;
    file.sync_all()
        .await
        .map_err(|e| Error::Io(format!("syncing temp credential file: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_credential(suffix: &str) -> Credential {
        Credential {
            schema_version: CURRENT_SCHEMA_VERSION,
            client_id: "client-1".into(),
            access_token: format!("at_{suffix}").into(),
            refresh_token: Some(format!("rt_{suffix}").into()),
            expires_at: 1_735_500_000_000,
            created_at: 1_735_490_000_000,
        }
    }

    fn tokens(access: &str, refresh: Option<&str>, expires_in: u64) -> TokenResponse {
        TokenResponse {
            access_token: access.into(),
            refresh_token: refresh.map(Into::into),
            expires_in,
            scope: None,
            token_type: None,
        }
    }

    #[tokio::test]
    async fn save_then_load_roundtrips_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials.json"));

        let saved = test_credential("1");
        store.save(&saved).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, saved);
    }

    #[tokio::test]
    async fn credential_without_refresh_token_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials.json"));

        let mut saved = test_credential("1");
        saved.refresh_token = None;
        store.save(&saved).await.unwrap();

        let contents = tokio::fs::read_to_string(store.path()).await.unwrap();
        assert!(!contents.contains("refreshToken"), "got: {contents}");
        assert_eq!(store.load().await.unwrap(), saved);
    }

    #[tokio::test]
    async fn file_uses_camel_case_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials.json"));
        store.save(&test_credential("1")).await.unwrap();

        let contents = tokio::fs::read_to_string(store.path()).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(json["schemaVersion"], 1);
        assert_eq!(json["clientId"], "client-1");
        assert_eq!(json["accessToken"], "at_1");
        assert_eq!(json["refreshToken"], "rt_1");
        assert_eq!(json["expiresAt"], 1_735_500_000_000u64);
    }

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials.json"));
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn corrupt_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        tokio::fs::write(&path, "{\"schemaVersion\": 1, \"clientId\": ").await.unwrap();
        assert!(CredentialStore::new(path).load().await.is_none());
    }

    #[tokio::test]
    async fn old_schema_version_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let json = r#"{"schemaVersion":0,"clientId":"c","accessToken":"at","expiresAt":1,"createdAt":1}"#;
        tokio::fs::write(&path, json).await.unwrap();
        assert!(CredentialStore::new(path).load().await.is_none());
    }

    #[tokio::test]
    async fn future_schema_version_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let json = r#"{"schemaVersion":2,"clientId":"c","accessToken":"at","expiresAt":1,"createdAt":1}"#;
        tokio::fs::write(&path, json).await.unwrap();
        assert!(CredentialStore::new(path).load().await.is_none());
    }

    #[tokio::test]
    async fn legacy_field_names_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let json = r#"{"version":1,"clientId":"c","access":"at_old","refresh":"rt_old","expires":42,"createdAt":7}"#;
        tokio::fs::write(&path, json).await.unwrap();

        let cred = CredentialStore::new(path).load().await.unwrap();
        assert_eq!(cred.access_token.expose(), "at_old");
        assert_eq!(cred.refresh_token.unwrap().expose(), "rt_old");
        assert_eq!(cred.expires_at, 42);
    }

    #[tokio::test]
    async fn crash_before_rename_keeps_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials.json"));
        let previous = test_credential("old");
        store.save(&previous).await.unwrap();

        // Temp file fully written, process dies before the rename
        let staged = store.stage(&test_credential("new")).await.unwrap();
        assert!(staged.tmp_path.exists());
        drop(staged);

        assert_eq!(store.load().await.unwrap(), previous);
    }

    #[tokio::test]
    async fn crash_before_first_rename_leaves_no_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials.json"));

        let staged = store.stage(&test_credential("new")).await.unwrap();
        drop(staged);

        assert!(!store.path().exists());
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn save_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("agent").join("credentials.json");
        let store = CredentialStore::new(path.clone());
        store.save(&test_credential("1")).await.unwrap();
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_is_0600_and_created_dir_is_0700() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let cred_dir = dir.path().join("agent");
        let path = cred_dir.join("credentials.json");
        CredentialStore::new(path.clone())
            .save(&test_credential("1"))
            .await
            .unwrap();

        let file_mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "credential file must be 0600, got {file_mode:o}");

        let dir_mode = tokio::fs::metadata(&cred_dir).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700, "credential dir must be 0700, got {dir_mode:o}");
    }

    #[tokio::test]
    async fn concurrent_saves_leave_one_complete_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(CredentialStore::new(dir.path().join("credentials.json")));

        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.save(&test_credential(&i.to_string())).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let loaded = store.load().await.unwrap();
        assert!(loaded.access_token.expose().starts_with("at_"));

        // No temp files left behind
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = vec![];
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["credentials.json"]);
    }

    #[test]
    fn rotation_replaces_refresh_token_when_returned() {
        let current = test_credential("1");
        let next = current.rotated(&tokens("at_2", Some("rt_2"), 3600), 1_000_000);
        assert_eq!(next.access_token.expose(), "at_2");
        assert_eq!(next.refresh_token.unwrap().expose(), "rt_2");
        assert_eq!(next.expires_at, 1_000_000 + 3_600_000);
        assert_eq!(next.created_at, 1_000_000);
        assert_eq!(next.client_id, "client-1");
    }

    #[test]
    fn rotation_keeps_refresh_token_when_omitted() {
        let current = test_credential("1");
        let next = current.rotated(&tokens("at_2", None, 60), 0);
        assert_eq!(next.refresh_token.unwrap().expose(), "rt_1");
    }

    #[test]
    fn issued_computes_absolute_expiry() {
        let cred = Credential::issued("client-9", &tokens("at", None, 3600), 5_000);
        assert_eq!(cred.expires_at, 3_605_000);
        assert_eq!(cred.schema_version, CURRENT_SCHEMA_VERSION);
        assert!(!cred.can_refresh());
    }

    #[test]
    fn huge_expires_in_saturates() {
        let now = 1_750_000_000_000;
        let huge = tokens("at", Some("rt"), 18_446_744_073_709_551);

        let issued = Credential::issued("c", &huge, now);
        assert_eq!(issued.expires_at, u64::MAX);
        assert!(!issued.needs_refresh(Duration::from_secs(4 * 3600), now));

        let rotated = test_credential("1").rotated(&tokens("at", None, u64::MAX), now);
        assert_eq!(rotated.expires_at, u64::MAX);
        assert!(!rotated.is_expired(now));
    }

    #[test]
    fn refresh_window_arithmetic() {
        let hour = 3_600_000u64;
        let mut cred = test_credential("1");
        cred.expires_at = 10 * hour;

        assert_eq!(cred.remaining(7 * hour), Duration::from_secs(3 * 3600));
        assert!(cred.needs_refresh(Duration::from_secs(4 * 3600), 7 * hour));
        assert!(!cred.needs_refresh(Duration::from_secs(4 * 3600), 5 * hour));
        assert!(!cred.is_expired(10 * hour - 1));
        assert!(cred.is_expired(10 * hour));
        assert_eq!(cred.remaining(11 * hour), Duration::ZERO);
    }
}

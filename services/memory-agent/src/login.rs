//! `login` command: device flow against the configured authorization server

use std::sync::Arc;

use async_trait::async_trait;
use device_auth::{
    Clock, Credential, CredentialStore, DeviceFlow, Prompter, SystemClock, UrlOpener,
    VerificationPrompt,
};
use tracing::{debug, info, warn};

/// Prints login instructions on stderr.
pub struct CliPrompter;

impl Prompter for CliPrompter {
    fn verification_required(&self, prompt: &VerificationPrompt) {
        eprintln!();
        eprintln!("To sign in, open this URL in a browser:");
        eprintln!("  {}", prompt.verification_url);
        eprintln!();
        eprintln!("and confirm the code: {}", prompt.user_code);
        eprintln!(
            "The code expires in {} minutes. Waiting for authorization...",
            prompt.expires_in.as_secs() / 60
        );
    }

    fn client_registered(&self, client_id: &str) {
        eprintln!("Registered new client {client_id}");
    }

    fn authorized(&self) {
        eprintln!("Authorized.");
    }
}

/// Opens URLs with the platform's default browser.
pub struct BrowserOpener;

#[async_trait]
impl UrlOpener for BrowserOpener {
    async fn open(&self, url: &str) -> std::io::Result<()> {
        let url = url.to_string();
        tokio::task::spawn_blocking(move || open_url(&url))
            .await
            .map_err(std::io::Error::other)?
    }
}

fn open_url(url: &str) -> std::io::Result<()> {
    #[cfg(target_os = "macos")]
    let status = std::process::Command::new("open").arg(url).status()?;
    #[cfg(target_os = "windows")]
    let status = std::process::Command::new("cmd")
        .args(["/C", "start", url])
        .status()?;
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let status = std::process::Command::new("xdg-open").arg(url).status()?;

    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("browser launcher exited with {status}")))
    }
}

/// Inputs for one login.
pub struct Login {
    pub http: reqwest::Client,
    pub auth_url: String,
    /// Configured client id; takes precedence over the stored one
    pub client_id: Option<String>,
    pub store: CredentialStore,
    pub clock: Arc<dyn Clock>,
    pub opener: Option<Arc<dyn UrlOpener>>,
}

impl Login {
    pub fn new(http: reqwest::Client, auth_url: impl Into<String>, store: CredentialStore) -> Self {
        Self {
            http,
            auth_url: auth_url.into(),
            client_id: None,
            store,
            clock: Arc::new(SystemClock::new()),
            opener: None,
        }
    }

    /// Run the device flow and persist the issued credential.
    pub async fn execute(&self, prompter: &dyn Prompter) -> device_auth::Result<Credential> {
        let client_id = match &self.client_id {
            Some(id) => Some(id.clone()),
            None => {
                let stored = self.store.load().await.map(|c| c.client_id);
                if let Some(id) = &stored {
                    debug!(client_id = %id, "reusing client id from stored credential");
                }
                stored
            }
        };

        let mut flow = DeviceFlow::new(self.http.clone(), self.auth_url.clone())
            .with_client_id(client_id)
            .with_clock(self.clock.clone());
        if let Some(opener) = &self.opener {
            flow = flow.with_url_opener(opener.clone());
        }

        let result = match flow.execute(prompter).await {
            Ok(result) => result,
            Err(e) => {
                warn!(outcome = outcome_label(&e), error = %e, "device flow finished");
                return Err(e);
            }
        };

        let credential = result.into_credential(self.clock.now_millis());
        if let Err(e) = self.store.save(&credential).await {
            warn!(outcome = "failed", error = %e, "device flow finished, credential not saved");
            return Err(e);
        }
        info!(
            outcome = "success",
            client_id = %credential.client_id,
            path = %self.store.path().display(),
            can_refresh = credential.can_refresh(),
            "login complete, credential saved"
        );
        Ok(credential)
    }
}

fn outcome_label(error: &device_auth::Error) -> &'static str {
    match error {
        device_auth::Error::AuthorizationDenied => "denied",
        device_auth::Error::DeviceCodeExpired => "expired",
        _ => "failed",
    }
}

//! Proactive background token refresh
//!
//! A periodic task re-reads the credential from the store on every tick and
//! rotates it when less than the buffer remains. A newer credential written by
//! a login from another process replaces the cached one. Most request-time
//! refresh latency never happens because of this task. Tick failures are
//! logged and the task keeps running; the request path reports its own errors.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::service::{AuthService, RefreshTrigger};

/// Default tick period.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Result of one scheduler tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    NoCredential,
    NotDue { remaining: Duration },
    /// Inside the buffer, but nothing to rotate with
    NoRefreshToken,
    Refreshed,
    Failed(String),
}

/// Handle to the running refresh task. Aborts the task when dropped.
#[derive(Debug)]
pub struct RefreshScheduler {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshScheduler {
    /// Spawn the refresh task. The first tick fires one `interval` after
    /// start since the credential was just loaded.
    pub fn spawn(service: Arc<AuthService>, interval: Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                tick(&service).await;
            }
        });
        info!(interval_secs = interval.as_secs(), "refresh scheduler started");

        Self {
            task: Mutex::new(Some(task)),
        }
    }

    /// Stop the task. Calling it again is a no-op.
    pub fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            info!("refresh scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run one refresh check against the stored credential.
pub async fn tick(service: &AuthService) -> TickOutcome {
    let Some(credential) = service.store().load().await else {
        debug!("no stored credential, skipping refresh tick");
        return TickOutcome::NoCredential;
    };
    service.adopt(&credential).await;

    let now = service.clock().now_millis();
    let remaining = credential.remaining(now);
    if !credential.needs_refresh(service.buffer(), now) {
        debug!(remaining_secs = remaining.as_secs(), "token not due for refresh");
        return TickOutcome::NotDue { remaining };
    }

    if !credential.can_refresh() {
        warn!(
            remaining_secs = remaining.as_secs(),
            "token expiring soon but no refresh token is stored, run `memory-agent login`"
        );
        return TickOutcome::NoRefreshToken;
    }

    match service
        .refresh_from(credential, RefreshTrigger::Scheduled)
        .await
    {
        Ok(_) => TickOutcome::Refreshed,
        Err(e) => {
            warn!(error = %e, "background refresh failed, will retry next tick");
            TickOutcome::Failed(e.to_string())
        }
    }
}

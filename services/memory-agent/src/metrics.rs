//! Prometheus metrics exposition
//!
//! Metrics emitted by the agent:
//!
//! - `auth_token_refresh_total` (counter): labels `trigger`, `outcome`
//! - `auth_token_expires_in_seconds` (gauge)
//!
//! Both are recorded inside `token-session`; this module installs the
//! recorder that `run` exposes on `/metrics`.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe();
    Ok(handle)
}

fn describe() {
    metrics::describe_counter!(
        "auth_token_refresh_total",
        "Access token refresh attempts by trigger and outcome"
    );
    metrics::describe_gauge!(
        "auth_token_expires_in_seconds",
        "Seconds until the current access token expires"
    );
}

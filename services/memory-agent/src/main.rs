//! Memory agent
//!
//! Single-binary client for the memory API that:
//! 1. Signs in with the OAuth device flow (`login`)
//! 2. Keeps the access token fresh with a background refresh task (`run`)
//! 3. Serves `/health` and `/metrics` while running, when configured
//! 4. Issues one-off authenticated API requests (`api`)

mod api_client;
mod config;
mod error;
mod login;
mod metrics;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use clap::{Args, Parser, Subcommand};
use device_auth::CredentialStore;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use token_session::{AuthService, RefreshScheduler};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api_client::ApiClient;
use crate::config::Config;
use crate::login::{BrowserOpener, CliPrompter, Login};

/// Concurrent requests accepted by the health listener.
const MAX_HEALTH_CONNECTIONS: usize = 64;

/// Memory agent: device-flow login and token lifecycle for the memory API
#[derive(Parser)]
#[command(name = "memory-agent", version, about)]
struct Cli {
    /// Config file path (default: $CONFIG_PATH or ./memory-agent.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in with the OAuth device flow and store the credential
    Login,
    /// Show stored credential status (never prints tokens)
    Status,
    /// Keep the token fresh in the background until interrupted
    Run,
    /// Send one authenticated request to the memory API
    Api(ApiArgs),
}

#[derive(Args)]
struct ApiArgs {
    /// HTTP method
    method: String,
    /// Request path, may include a query string (e.g. /api/v2/memories?limit=5)
    path: String,
    /// JSON request body
    #[arg(long)]
    body: Option<String>,
}

/// Shared state for the health listener
#[derive(Clone)]
struct AppState {
    auth: Arc<AuthService>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router for `/health` and `/metrics`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(matches!(cli.command, Command::Run));

    let config_path = Config::resolve_path(cli.config.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let credential_path = config.credential_path()?;
    info!(
        config = %config_path.display(),
        auth_url = %config.auth.url,
        credentials = %credential_path.display(),
        "configuration loaded"
    );

    let http = reqwest::Client::builder()
        .user_agent(concat!("memory-agent/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;
    let store = CredentialStore::new(credential_path);

    match cli.command {
        Command::Login => run_login(&config, http, store).await,
        Command::Status => run_status(&config, http, store).await,
        Command::Run => run_service(&config, http, store).await,
        Command::Api(args) => run_api(&config, http, store, args).await,
    }
}

/// Initialize tracing with `LOG_LEVEL` / `RUST_LOG` support. JSON for the
/// long-running service, compact stderr output for interactive commands.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn auth_service(config: &Config, http: reqwest::Client, store: CredentialStore) -> AuthService {
    AuthService::new(store, http, config.auth.url.clone()).with_buffer(config.refresh_buffer())
}

async fn run_login(config: &Config, http: reqwest::Client, store: CredentialStore) -> Result<()> {
    let mut login = Login::new(http, config.auth.url.clone(), store);
    login.client_id = config.auth.client_id.clone();
    if config.auth.open_browser {
        login.opener = Some(Arc::new(BrowserOpener));
    }

    match login.execute(&CliPrompter).await {
        Ok(credential) => {
            println!(
                "Logged in. Credentials saved to {}",
                login.store.path().display()
            );
            if !credential.can_refresh() {
                println!("Warning: no refresh token issued, you will need to log in again when the token expires.");
            }
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "login failed");
            Err(anyhow::Error::new(e).context("login failed"))
        }
    }
}

async fn run_status(config: &Config, http: reqwest::Client, store: CredentialStore) -> Result<()> {
    let auth = auth_service(config, http, store);
    match auth.start().await {
        Some(status) => {
            println!("Client ID:      {}", status.client_id);
            println!("Expires in:     {}", format_duration(status.remaining));
            println!(
                "Refresh token:  {}",
                if status.can_refresh { "present" } else { "absent" }
            );
            println!(
                "Authenticated:  {}",
                if status.authenticated { "yes" } else { "no, run `memory-agent login`" }
            );
        }
        None => println!("Not authenticated. Run `memory-agent login`."),
    }
    Ok(())
}

async fn run_service(config: &Config, http: reqwest::Client, store: CredentialStore) -> Result<()> {
    info!("starting memory-agent");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder().context("failed to install metrics recorder")?;

    let auth = Arc::new(auth_service(config, http, store));
    auth.start().await;
    let scheduler = RefreshScheduler::spawn(auth.clone(), config.refresh_interval());

    let result = match config.health.listen_addr {
        Some(addr) => {
            let state = AppState {
                auth: auth.clone(),
                prometheus,
                started_at: Instant::now(),
            };
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind to {addr}"))?;
            info!(addr = %addr, "health listener ready");
            axum::serve(listener, build_router(state, MAX_HEALTH_CONNECTIONS))
                .with_graceful_shutdown(shutdown_signal())
                .await
                .context("health listener failed")
        }
        None => {
            shutdown_signal().await;
            Ok(())
        }
    };

    scheduler.stop();
    info!("shutdown complete");
    result
}

async fn run_api(
    config: &Config,
    http: reqwest::Client,
    store: CredentialStore,
    args: ApiArgs,
) -> Result<()> {
    let method = reqwest::Method::from_bytes(args.method.to_uppercase().as_bytes())
        .with_context(|| format!("invalid HTTP method: {}", args.method))?;
    let body = args
        .body
        .as_deref()
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("--body must be valid JSON")?;

    let auth = Arc::new(auth_service(config, http.clone(), store));
    let api = ApiClient::new(auth, http, config.api.url.clone(), config.api_timeout());
    let value = api.request(method, &args.path, body.as_ref()).await?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        return "expired".into();
    }
    format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
}

/// Health endpoint: 200 when a usable credential exists, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();
    let authenticated = state.auth.is_authenticated().await;
    let session = state.auth.status().await;

    let body = serde_json::json!({
        "status": if authenticated { "healthy" } else { "unauthenticated" },
        "authenticated": authenticated,
        "can_refresh": session.as_ref().is_some_and(|s| s.can_refresh),
        "expires_in_seconds": session.as_ref().map(|s| s.remaining.as_secs()),
        "uptime_seconds": uptime,
    });
    let status_code = if authenticated {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

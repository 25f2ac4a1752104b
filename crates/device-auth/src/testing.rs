//! In-process mock authorization server for tests
//!
//! Serves discovery, registration, device authorization and token endpoints
//! on `127.0.0.1:0`. Token endpoint replies are scripted through a queue;
//! once the queue is empty every poll answers `authorization_pending`.
//! Every request body is recorded so tests can assert on what was sent.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Status code and JSON body returned by a mock endpoint.
pub type Reply = (StatusCode, Value);

/// Shape of the mock server's discovery document and fixed replies.
#[derive(Debug, Clone)]
pub struct MockOptions {
    pub discovery_status: StatusCode,
    pub advertise_device_endpoint: bool,
    pub advertise_registration_endpoint: bool,
    pub device_reply: Reply,
    pub registration_reply: Reply,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            discovery_status: StatusCode::OK,
            advertise_device_endpoint: true,
            advertise_registration_endpoint: true,
            device_reply: (
                StatusCode::OK,
                json!({
                    "device_code": "dc_test",
                    "user_code": "ABCD-EFGH",
                    "verification_uri": "https://auth.example.test/device",
                    "verification_uri_complete": "https://auth.example.test/device?user_code=ABCD-EFGH",
                    "expires_in": 600,
                    "interval": 5
                }),
            ),
            registration_reply: (
                StatusCode::CREATED,
                json!({
                    "client_id": "registered-client",
                    "client_id_issued_at": 1_760_000_000,
                    "client_name": "memory-agent"
                }),
            ),
        }
    }
}

#[derive(Debug)]
struct MockState {
    base_url: String,
    options: MockOptions,
    token_replies: Mutex<VecDeque<Reply>>,
    token_requests: Mutex<Vec<HashMap<String, String>>>,
    device_requests: Mutex<Vec<HashMap<String, String>>>,
    registrations: Mutex<Vec<Value>>,
    discovery_hits: AtomicUsize,
}

/// Running mock authorization server. Stops when dropped.
pub struct MockAuthServer {
    state: Arc<MockState>,
    task: JoinHandle<()>,
}

impl MockAuthServer {
    /// Start with every endpoint advertised.
    pub async fn start() -> Self {
        Self::start_with(MockOptions::default()).await
    }

    pub async fn start_with(options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock auth server");
        let addr = listener.local_addr().expect("mock auth server address");

        let state = Arc::new(MockState {
            base_url: format!("http://{addr}"),
            options,
            token_replies: Mutex::new(VecDeque::new()),
            token_requests: Mutex::new(Vec::new()),
            device_requests: Mutex::new(Vec::new()),
            registrations: Mutex::new(Vec::new()),
            discovery_hits: AtomicUsize::new(0),
        });

        let router = Router::new()
            .route("/.well-known/oauth-authorization-server", get(discovery))
            .route("/oauth/token", post(token))
            .route("/oauth/device", post(device))
            .route("/oauth/register", post(register))
            .with_state(state.clone());

        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Self { state, task }
    }

    /// Base URL to pass as the authorization server URL.
    pub fn url(&self) -> &str {
        &self.state.base_url
    }

    /// Queue the next token endpoint reply.
    pub fn push_token_reply(&self, status: StatusCode, body: Value) {
        lock(&self.state.token_replies).push_back((status, body));
    }

    /// Queue an OAuth error reply (`400 {"error": code}`).
    pub fn push_token_error(&self, code: &str) {
        self.push_token_reply(StatusCode::BAD_REQUEST, json!({ "error": code }));
    }

    /// Form bodies received by the token endpoint, in order.
    pub fn token_requests(&self) -> Vec<HashMap<String, String>> {
        lock(&self.state.token_requests).clone()
    }

    pub fn token_request_count(&self) -> usize {
        lock(&self.state.token_requests).len()
    }

    pub fn device_requests(&self) -> Vec<HashMap<String, String>> {
        lock(&self.state.device_requests).clone()
    }

    pub fn registrations(&self) -> Vec<Value> {
        lock(&self.state.registrations).clone()
    }

    pub fn discovery_hits(&self) -> usize {
        self.state.discovery_hits.load(Ordering::SeqCst)
    }
}

impl Drop for MockAuthServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Successful token endpoint body.
pub fn token_success(access: &str, refresh: Option<&str>, expires_in: u64) -> Value {
    let mut body = json!({
        "access_token": access,
        "token_type": "Bearer",
        "expires_in": expires_in,
        "scope": "read write offline_access"
    });
    if let Some(refresh) = refresh {
        body["refresh_token"] = json!(refresh);
    }
    body
}

/// A loopback URL with nothing listening on it; requests fail to connect.
pub async fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind throwaway listener");
    let addr = listener.local_addr().expect("throwaway address");
    drop(listener);
    format!("http://{addr}")
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn discovery(State(state): State<Arc<MockState>>) -> (StatusCode, Json<Value>) {
    state.discovery_hits.fetch_add(1, Ordering::SeqCst);
    if state.options.discovery_status != StatusCode::OK {
        return (
            state.options.discovery_status,
            Json(json!({ "error": "unavailable" })),
        );
    }

    let base = &state.base_url;
    let mut doc = json!({
        "issuer": base,
        "token_endpoint": format!("{base}/oauth/token"),
        "scopes_supported": ["read", "write", "offline_access"]
    });
    if state.options.advertise_device_endpoint {
        doc["device_authorization_endpoint"] = json!(format!("{base}/oauth/device"));
    }
    if state.options.advertise_registration_endpoint {
        doc["registration_endpoint"] = json!(format!("{base}/oauth/register"));
    }
    (StatusCode::OK, Json(doc))
}

async fn token(
    State(state): State<Arc<MockState>>,
    Form(form): Form<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    lock(&state.token_requests).push(form);
    let (status, body) = lock(&state.token_replies).pop_front().unwrap_or((
        StatusCode::BAD_REQUEST,
        json!({ "error": "authorization_pending" }),
    ));
    (status, Json(body))
}

async fn device(
    State(state): State<Arc<MockState>>,
    Form(form): Form<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    lock(&state.device_requests).push(form);
    let (status, body) = state.options.device_reply.clone();
    (status, Json(body))
}

async fn register(
    State(state): State<Arc<MockState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    lock(&state.registrations).push(body);
    let (status, body) = state.options.registration_reply.clone();
    (status, Json(body))
}

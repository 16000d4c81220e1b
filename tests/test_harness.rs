//! Fake orchestrator for end-to-end agent tests.
//!
//! Serves the execution API on an ephemeral local port, records every call
//! the agent makes and hands out queued command envelopes.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use exec_agent::config::{AgentConfig, OrchestratorConfig, ServerIdentity, TimingConfig};

pub const TEST_TOKEN: &str = "test-token";
pub const SERVER_NAME: &str = "agent-under-test";

/// Delay before an empty poll answers 204, standing in for the long poll.
const EMPTY_POLL_DELAY: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct Upload {
    pub server: String,
    pub execution_id: String,
    pub filename: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Everything the fake has seen, plus knobs for failure injection.
#[derive(Debug, Default)]
pub struct Recorded {
    pub logins: Vec<Value>,
    pub registrations: Vec<Value>,
    pub updates: Vec<Value>,
    pub heartbeats: Vec<Vec<String>>,
    pub polls: usize,
    pub reports: Vec<Value>,
    pub uploads: Vec<Upload>,
    pub acks: Vec<Value>,
    pub authorization: Vec<String>,
    pending: VecDeque<Value>,
    reservations: HashMap<String, String>,
    fail_heartbeats: bool,
    fail_polls: bool,
    already_registered: bool,
    reject_login: bool,
}

#[derive(Clone, Default)]
pub struct FakeState {
    inner: Arc<Mutex<Recorded>>,
}

impl FakeState {
    pub fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap()
    }

    fn record_auth(&self, headers: &HeaderMap) {
        if let Some(value) = headers.get(header::AUTHORIZATION) {
            let value = value.to_str().unwrap_or_default().to_string();
            self.lock().authorization.push(value);
        }
    }
}

/// Handle to a running fake orchestrator.
pub struct FakeOrchestrator {
    pub addr: SocketAddr,
    pub state: FakeState,
    handle: JoinHandle<()>,
}

impl FakeOrchestrator {
    pub async fn start() -> Self {
        let state = FakeState::default();
        let app = Router::new()
            .route("/API/Auth/login", put(login))
            .route(
                "/API/Execution/ExecutionServers",
                put(register).post(update_server),
            )
            .route("/API/Execution/Status", post(status))
            .route("/API/Execution/PendingCommand", delete(pending_command))
            .route("/API/Execution/Reservations/:id", get(reservation))
            .route("/API/Execution/FinishedExecution", put(finished_execution))
            .route(
                "/API/Execution/ExecutionReport/:server/:execution_id/:filename",
                post(execution_report),
            )
            .route("/API/Execution/UpdateFilesEnded", post(update_files_ended))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            host: self.addr.ip().to_string(),
            api_port: self.addr.port(),
            username: "admin".to_string(),
            password: "s3cret".to_string(),
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    /// Agent config with short timings for tests.
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig::new(
            self.orchestrator_config(),
            ServerIdentity {
                name: SERVER_NAME.to_string(),
                description: "integration test agent".to_string(),
                server_type: "Python".to_string(),
                capacity: 5,
            },
        )
        .with_timing(TimingConfig {
            heartbeat_interval: Duration::from_millis(50),
            poll_backoff: Duration::from_millis(50),
            report_attempts: 3,
            report_retry_delay: Duration::from_millis(10),
        })
    }

    pub fn push_command(&self, envelope: Value) {
        self.state.lock().pending.push_back(envelope);
    }

    pub fn start_execution(&self, execution_id: &str, test_path: &str, arguments: &str) {
        self.push_command(json!({
            "Type": "startExecution",
            "ExecutionId": execution_id,
            "TestPath": test_path,
            "TestArguments": arguments,
            "UserName": "tester",
            "ReservationId": null,
        }));
    }

    pub fn stop_execution(&self, execution_id: &str) {
        self.push_command(json!({
            "Type": "stopExecution",
            "ExecutionId": execution_id,
        }));
    }

    pub fn add_reservation(&self, reservation_id: &str, body: &str) {
        self.state
            .lock()
            .reservations
            .insert(reservation_id.to_string(), body.to_string());
    }

    pub fn set_fail_heartbeats(&self, fail: bool) {
        self.state.lock().fail_heartbeats = fail;
    }

    /// While set, PendingCommand answers 500 and leaves the queue alone.
    pub fn set_fail_polls(&self, fail: bool) {
        self.state.lock().fail_polls = fail;
    }

    pub fn set_already_registered(&self, already: bool) {
        self.state.lock().already_registered = already;
    }

    pub fn set_reject_login(&self, reject: bool) {
        self.state.lock().reject_login = reject;
    }

    /// Terminal reports sent for `execution_id`.
    pub fn reports_for(&self, execution_id: &str) -> Vec<Value> {
        self.state
            .lock()
            .reports
            .iter()
            .filter(|r| r["ExecutionId"] == execution_id)
            .cloned()
            .collect()
    }

    pub fn uploads_for(&self, execution_id: &str) -> Vec<Upload> {
        self.state
            .lock()
            .uploads
            .iter()
            .filter(|u| u.execution_id == execution_id)
            .cloned()
            .collect()
    }

    pub fn heartbeats(&self) -> Vec<Vec<String>> {
        self.state.lock().heartbeats.clone()
    }

    pub fn polls(&self) -> usize {
        self.state.lock().polls
    }
}

impl Drop for FakeOrchestrator {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn login(State(state): State<FakeState>, Json(body): Json<Value>) -> Response {
    let mut recorded = state.lock();
    recorded.logins.push(body);
    if recorded.reject_login {
        return (StatusCode::UNAUTHORIZED, "Login failed").into_response();
    }
    Json(TEST_TOKEN).into_response()
}

async fn register(
    State(state): State<FakeState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.record_auth(&headers);
    let mut recorded = state.lock();
    if recorded.already_registered {
        let message = format!("Execution server {} already exists", body["Name"]);
        return (StatusCode::BAD_REQUEST, message).into_response();
    }
    recorded.registrations.push(body);
    StatusCode::OK.into_response()
}

async fn update_server(
    State(state): State<FakeState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    state.record_auth(&headers);
    state.lock().updates.push(body);
    StatusCode::OK
}

async fn status(State(state): State<FakeState>, Json(body): Json<Value>) -> StatusCode {
    let mut recorded = state.lock();
    if recorded.fail_heartbeats {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    let ids = body["ExecutionIds"]
        .as_array()
        .map(|ids| {
            ids.iter()
                .filter_map(|id| id.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    recorded.heartbeats.push(ids);
    StatusCode::OK
}

async fn pending_command(State(state): State<FakeState>, headers: HeaderMap) -> Response {
    state.record_auth(&headers);
    let next = {
        let mut recorded = state.lock();
        recorded.polls += 1;
        if recorded.fail_polls {
            return (StatusCode::INTERNAL_SERVER_ERROR, "Poll failed").into_response();
        }
        recorded.pending.pop_front()
    };
    match next {
        Some(envelope) => Json(envelope).into_response(),
        None => {
            tokio::time::sleep(EMPTY_POLL_DELAY).await;
            StatusCode::NO_CONTENT.into_response()
        }
    }
}

async fn reservation(State(state): State<FakeState>, Path(id): Path<String>) -> Response {
    match state.lock().reservations.get(&id) {
        Some(body) => body.clone().into_response(),
        None => (StatusCode::NOT_FOUND, "Reservation not found").into_response(),
    }
}

async fn finished_execution(State(state): State<FakeState>, Json(body): Json<Value>) -> StatusCode {
    state.lock().reports.push(body);
    StatusCode::OK
}

async fn execution_report(
    State(state): State<FakeState>,
    Path((server, execution_id, filename)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.lock().uploads.push(Upload {
        server,
        execution_id,
        filename,
        content_type,
        body: body.to_vec(),
    });
    StatusCode::OK
}

async fn update_files_ended(State(state): State<FakeState>, Json(body): Json<Value>) -> StatusCode {
    state.lock().acks.push(body);
    StatusCode::OK
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(condition: F, timeout_duration: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration).await;
    assert!(result, "{}", message);
}

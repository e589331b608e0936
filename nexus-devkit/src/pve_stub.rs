/*!
Programmable Proxmox VE API stub

Serves the subset of `/api2/json` the kernel consumes. Inventory is seeded
with the builder methods; every request is recorded (path relative to
`/api2/json`) and any path can be made to fail with a 500.

With `require_ticket`, requests other than the login need the stub ticket
cookie, and writes additionally need the CSRF header.
*/

use crate::test_utils::{serve_router, StubServer};
use anyhow::Result;
use axum::extract::{Form, Path, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub const STUB_TICKET: &str = "PVE:root@pam:STUBTICKET";
pub const STUB_CSRF: &str = "stub-csrf-token";
const API_ROOT: &str = "/api2/json";

#[derive(Default)]
struct PveState {
    nodes: Vec<Value>,
    node_status: HashMap<String, Value>,
    storage: HashMap<String, Vec<Value>>,
    guests: HashMap<(String, String), Vec<Value>>,
    guest_status: HashMap<(String, String, u32), Value>,
    fail_paths: HashSet<String>,
    credentials: Option<(String, String)>,
    logins: usize,
    requests: Vec<String>,
}

#[derive(Clone, Default)]
pub struct PveStub {
    state: Arc<Mutex<PveState>>,
}

impl PveStub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(self, name: &str, online: bool) -> Self {
        self.state.lock().nodes.push(crate::fixtures::node(name, online));
        self
    }

    pub fn with_node_status(self, node: &str, status: Value) -> Self {
        self.state.lock().node_status.insert(node.to_string(), status);
        self
    }

    pub fn with_storage(self, node: &str, entry: Value) -> Self {
        self.state.lock().storage.entry(node.to_string()).or_default().push(entry);
        self
    }

    /// `kind` is `qemu` or `lxc`.
    pub fn with_guest(self, node: &str, kind: &str, entry: Value) -> Self {
        self.state
            .lock()
            .guests
            .entry((node.to_string(), kind.to_string()))
            .or_default()
            .push(entry);
        self
    }

    pub fn with_guest_status(self, node: &str, kind: &str, vmid: u32, status: Value) -> Self {
        self.state
            .lock()
            .guest_status
            .insert((node.to_string(), kind.to_string(), vmid), status);
        self
    }

    /// Answer 500 on this path (relative to `/api2/json`, e.g. `/nodes/pve1/status`).
    pub fn fail_path(self, path: &str) -> Self {
        self.state.lock().fail_paths.insert(path.to_string());
        self
    }

    pub fn require_ticket(self, user: &str, password: &str) -> Self {
        self.state.lock().credentials = Some((user.to_string(), password.to_string()));
        self
    }

    /// Successful logins so far.
    pub fn logins(&self) -> usize {
        self.state.lock().logins
    }

    /// Every request seen, as `"METHOD /path"`.
    pub fn requests(&self) -> Vec<String> {
        self.state.lock().requests.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api2/json/access/ticket", post(ticket))
            .route("/api2/json/nodes", get(nodes))
            .route("/api2/json/nodes/{node}/status", get(node_status))
            .route("/api2/json/nodes/{node}/storage", get(storage))
            .route("/api2/json/nodes/{node}/{kind}", get(guests))
            .route("/api2/json/nodes/{node}/{kind}/{vmid}/status/current", get(guest_status))
            .route("/api2/json/nodes/{node}/{kind}/{vmid}/status/{action}", post(guest_action))
            .layer(middleware::from_fn_with_state(self.clone(), guard))
            .with_state(self.clone())
    }

    pub async fn serve(&self) -> Result<StubServer> {
        serve_router(self.router()).await
    }
}

fn data(value: Value) -> Response {
    Json(json!({ "data": value })).into_response()
}

fn not_found(what: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "data": null, "errors": { "path": what } }))).into_response()
}

async fn guard(State(stub): State<PveStub>, req: Request, next: Next) -> Response {
    let full_path = req.uri().path().to_string();
    let path = full_path.strip_prefix(API_ROOT).unwrap_or(&full_path).to_string();
    let method = req.method().clone();

    {
        let mut state = stub.state.lock();
        state.requests.push(format!("{method} {path}"));

        if state.fail_paths.contains(&path) {
            return (StatusCode::INTERNAL_SERVER_ERROR, "injected failure").into_response();
        }

        if state.credentials.is_some() && path != "/access/ticket" {
            let header_str = |name: &str| req.headers().get(name).and_then(|v| v.to_str().ok());
            let cookie_ok = header_str(header::COOKIE.as_str())
                .is_some_and(|c| c.contains(&format!("PVEAuthCookie={STUB_TICKET}")));
            let csrf_ok = method == Method::GET || header_str("CSRFPreventionToken") == Some(STUB_CSRF);
            if !(cookie_ok && csrf_ok) {
                return StatusCode::UNAUTHORIZED.into_response();
            }
        }
    }

    next.run(req).await
}

#[derive(Deserialize)]
struct TicketForm {
    username: String,
    password: String,
}

async fn ticket(State(stub): State<PveStub>, Form(form): Form<TicketForm>) -> Response {
    let mut state = stub.state.lock();
    if let Some((user, password)) = &state.credentials {
        if *user != form.username || *password != form.password {
            return (StatusCode::UNAUTHORIZED, "authentication failure").into_response();
        }
    }
    state.logins += 1;
    data(json!({
        "ticket": STUB_TICKET,
        "CSRFPreventionToken": STUB_CSRF,
        "username": form.username,
    }))
}

async fn nodes(State(stub): State<PveStub>) -> Response {
    data(Value::Array(stub.state.lock().nodes.clone()))
}

async fn node_status(State(stub): State<PveStub>, Path(node): Path<String>) -> Response {
    match stub.state.lock().node_status.get(&node) {
        Some(status) => data(status.clone()),
        None => not_found(format!("/nodes/{node}/status")),
    }
}

async fn storage(State(stub): State<PveStub>, Path(node): Path<String>) -> Response {
    let entries = stub.state.lock().storage.get(&node).cloned().unwrap_or_default();
    data(Value::Array(entries))
}

async fn guests(State(stub): State<PveStub>, Path((node, kind)): Path<(String, String)>) -> Response {
    let entries = stub.state.lock().guests.get(&(node, kind)).cloned().unwrap_or_default();
    data(Value::Array(entries))
}

async fn guest_status(
    State(stub): State<PveStub>,
    Path((node, kind, vmid)): Path<(String, String, u32)>,
) -> Response {
    let path = format!("/nodes/{node}/{kind}/{vmid}/status/current");
    match stub.state.lock().guest_status.get(&(node, kind, vmid)) {
        Some(status) => data(status.clone()),
        None => not_found(path),
    }
}

async fn guest_action(Path((node, kind, vmid, action)): Path<(String, String, u32, String)>) -> Response {
    if action != "start" && action != "stop" {
        return (StatusCode::BAD_REQUEST, "unsupported action").into_response();
    }
    data(json!(format!("UPID:{node}:0000C0DE:{kind}{action}:{vmid}:root@pam:")))
}

/*!
Grafana HTTP API stub

Health (`/api/health`, also `/-/ready` so it can stand in for Prometheus)
answers 503 for the first N calls, then 200. Datasource and dashboard writes
are recorded verbatim. With `require_basic_auth`, the datasource and
dashboard endpoints reject other credentials with 401 and record nothing.
*/

use crate::test_utils::{serve_router, StubServer};
use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Default)]
struct GrafanaState {
    health_failures_left: usize,
    health_calls: usize,
    datasources: HashSet<String>,
    expected_auth: Option<String>,
    datasource_posts: Vec<Value>,
    dashboard_posts: Vec<Value>,
}

#[derive(Clone, Default)]
pub struct GrafanaStub {
    state: Arc<Mutex<GrafanaState>>,
}

impl GrafanaStub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_health(self, times: usize) -> Self {
        self.state.lock().health_failures_left = times;
        self
    }

    pub fn with_datasource(self, name: &str) -> Self {
        self.state.lock().datasources.insert(name.to_string());
        self
    }

    pub fn require_basic_auth(self, user: &str, password: &str) -> Self {
        let encoded = STANDARD.encode(format!("{user}:{password}"));
        self.state.lock().expected_auth = Some(format!("Basic {encoded}"));
        self
    }

    pub fn health_calls(&self) -> usize {
        self.state.lock().health_calls
    }

    pub fn datasource_posts(&self) -> Vec<Value> {
        self.state.lock().datasource_posts.clone()
    }

    pub fn dashboard_posts(&self) -> Vec<Value> {
        self.state.lock().dashboard_posts.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/health", get(health))
            .route("/-/ready", get(health))
            .route("/api/datasources", post(create_datasource))
            .route("/api/datasources/name/{name}", get(lookup_datasource))
            .route("/api/dashboards/db", post(import_dashboard))
            .with_state(self.clone())
    }

    pub async fn serve(&self) -> Result<StubServer> {
        serve_router(self.router()).await
    }
}

fn authorized(state: &GrafanaState, headers: &HeaderMap) -> bool {
    match &state.expected_auth {
        None => true,
        Some(expected) => headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == expected),
    }
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "message": "invalid username or password" }))).into_response()
}

async fn health(State(stub): State<GrafanaStub>) -> Response {
    let mut state = stub.state.lock();
    state.health_calls += 1;
    if state.health_failures_left > 0 {
        state.health_failures_left -= 1;
        return (StatusCode::SERVICE_UNAVAILABLE, "starting").into_response();
    }
    Json(json!({ "database": "ok", "version": "stub" })).into_response()
}

async fn lookup_datasource(
    State(stub): State<GrafanaStub>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Response {
    let state = stub.state.lock();
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    if state.datasources.contains(&name) {
        Json(json!({ "id": 1, "name": name, "type": "prometheus" })).into_response()
    } else {
        (StatusCode::NOT_FOUND, Json(json!({ "message": "Data source not found" }))).into_response()
    }
}

async fn create_datasource(
    State(stub): State<GrafanaStub>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut state = stub.state.lock();
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let name = body["name"].as_str().unwrap_or_default().to_string();
    if !state.datasources.insert(name.clone()) {
        return (StatusCode::CONFLICT, Json(json!({ "message": "data source with the same name already exists" })))
            .into_response();
    }
    state.datasource_posts.push(body);
    Json(json!({ "id": state.datasources.len(), "message": "Datasource added", "name": name })).into_response()
}

async fn import_dashboard(
    State(stub): State<GrafanaStub>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut state = stub.state.lock();
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let slug = body["dashboard"]["title"]
        .as_str()
        .unwrap_or("untitled")
        .to_lowercase()
        .replace(' ', "-");
    state.dashboard_posts.push(body);
    Json(json!({ "status": "success", "url": format!("/d/stub/{slug}") })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_fails_requested_number_of_times() {
        let stub = GrafanaStub::new().failing_health(2);
        let server = stub.serve().await.unwrap();

        let mut statuses = Vec::new();
        for _ in 0..3 {
            statuses.push(reqwest::get(server.url("/api/health")).await.unwrap().status().as_u16());
        }

        assert_eq!(statuses, vec![503, 503, 200]);
        assert_eq!(stub.health_calls(), 3);
    }

    #[tokio::test]
    async fn test_rejected_writes_are_not_recorded() {
        let stub = GrafanaStub::new().require_basic_auth("admin", "admin");
        let server = stub.serve().await.unwrap();
        let client = reqwest::Client::new();

        let denied = client
            .post(server.url("/api/dashboards/db"))
            .basic_auth("admin", Some("nope"))
            .json(&json!({ "dashboard": { "title": "x" } }))
            .send()
            .await
            .unwrap();
        assert_eq!(denied.status(), 401);
        assert!(stub.dashboard_posts().is_empty());

        let accepted = client
            .post(server.url("/api/dashboards/db"))
            .basic_auth("admin", Some("admin"))
            .json(&json!({ "dashboard": { "title": "Proxmox overview" } }))
            .send()
            .await
            .unwrap();
        let body: Value = accepted.json().await.unwrap();
        assert_eq!(body["url"], "/d/stub/proxmox-overview");
        assert_eq!(stub.dashboard_posts().len(), 1);
    }

    #[tokio::test]
    async fn test_created_datasource_becomes_visible() {
        let stub = GrafanaStub::new();
        let server = stub.serve().await.unwrap();
        let client = reqwest::Client::new();

        let before = client.get(server.url("/api/datasources/name/Prometheus")).send().await.unwrap();
        assert_eq!(before.status(), 404);

        client
            .post(server.url("/api/datasources"))
            .json(&json!({ "name": "Prometheus", "type": "prometheus" }))
            .send()
            .await
            .unwrap();

        let after = client.get(server.url("/api/datasources/name/Prometheus")).send().await.unwrap();
        assert_eq!(after.status(), 200);
    }
}

//! HTTP transport (spec.md §6 "HTTP REST-like, with the same command type
//! carried in a JSON body plus a `/api/shutdown` endpoint and a `/health`
//! endpoint").

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use nerve::command::{Command, SessionManager};

struct AppState {
    manager: Arc<SessionManager>,
}

pub fn router(manager: Arc<SessionManager>) -> Router {
    let state = Arc::new(AppState { manager });
    Router::new()
        .route("/health", get(health))
        .route("/api/command", post(command))
        .route("/api/shutdown", post(shutdown))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn command(State(state): State<Arc<AppState>>, Json(command): Json<Command>) -> Json<Value> {
    let response = nerve::command::dispatch(&state.manager, command).await;
    Json(serde_json::to_value(response).unwrap_or(Value::Null))
}

async fn shutdown(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.manager.shutdown().await;
    Json(json!({"stopped": true}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_reports_ok() {
        let manager = Arc::new(SessionManager::new("test"));
        let app = router(manager);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let response = reqwest::get(format!("http://{addr}/health")).await.unwrap();
        assert!(response.status().is_success());
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["status"], json!("ok"));
    }
}

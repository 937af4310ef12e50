// Status endpoints for the judge worker
// Read-only: health probe and live counters from the pool, workspaces and supervisor.

use anyhow::Context;
use axum::{extract::State, response::Json, routing::get, Router};
use judge_engine::pool::PoolStats;
use judge_engine::supervisor::SupervisorStats;
use judge_engine::workspace::WorkspaceStats;
use judge_engine::JudgePool;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Clone)]
pub struct StatusState {
    pub pool: Arc<JudgePool>,
    pub started_at: Instant,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub uptime_secs: u64,
    pub pool: PoolStats,
    pub workspaces: WorkspaceStats,
    pub supervisor: SupervisorStats,
    pub languages: Vec<String>,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(state)
}

/// GET /health - Liveness probe
async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// GET /stats - Pool, workspace and supervisor counters
async fn stats(State(state): State<StatusState>) -> Json<StatsResponse> {
    let engine = state.pool.engine();
    Json(StatsResponse {
        uptime_secs: state.started_at.elapsed().as_secs(),
        pool: state.pool.stats(),
        workspaces: engine.workspaces().stats(),
        supervisor: engine.supervisor_stats(),
        languages: engine.registry().list_languages(),
    })
}

pub async fn serve(addr: &str, state: StatusState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind status server to {}", addr))?;

    info!("Status server listening on {}", addr);

    axum::serve(listener, router(state))
        .await
        .context("Status server error")
}

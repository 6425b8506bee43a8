use crate::market::types::{ConnectionState, Mode, PipelineStatusSnapshot};
use crate::state::AppState;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub pipeline_running: bool,
    pub mode: Mode,
    pub connection: ConnectionState,
    pub live_available: bool,
}

pub fn build_health_response(
    started_at: Instant,
    pipeline_running: bool,
    snapshot: &PipelineStatusSnapshot,
) -> HealthResponse {
    HealthResponse {
        status: if snapshot.live_available { "ok" } else { "degraded" },
        uptime_ms: started_at.elapsed().as_millis(),
        pipeline_running,
        mode: snapshot.mode,
        connection: snapshot.connection,
        live_available: snapshot.live_available,
    }
}

pub async fn health(state: &AppState) -> HealthResponse {
    let pipeline_running = state.pipeline.lock().await.is_some();
    let snapshot = state.status_store.read().await.clone();
    build_health_response(state.started_at, pipeline_running, &snapshot)
}

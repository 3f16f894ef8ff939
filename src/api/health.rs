use crate::types::JobState;
use crate::AppState;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    running_jobs: usize,
    queued_jobs: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let jobs = state.scheduler.list();
    let count = |s: JobState| jobs.iter().filter(|j| j.state == s).count();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        running_jobs: count(JobState::Running),
        queued_jobs: count(JobState::Queued),
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/health", get(health))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "ok",
            version: "1.0.0",
            running_jobs: 1,
            queued_jobs: 0,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("\"version\":\"1.0.0\""));
        assert!(json.contains("\"runningJobs\":1"));
    }
}

//! Scan job endpoints.

use std::net::SocketAddr;

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::services::detector::DetectorInfo;
use crate::services::ResultLookup;
use crate::types::{JobId, JobState, JobSummary, ProgressSnapshot, ScanRequest, ScanResult};
use crate::AppState;

/// Wrapper for listing responses.
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

impl<T> ApiResponse<T> {
    fn new(data: T) -> Self {
        Self { data }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub state: JobState,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub accepted: bool,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/scans", post(submit_scan).get(list_scans))
        .route("/api/scans/:id", get(get_scan))
        .route("/api/scans/:id/result", get(get_result))
        .route("/api/scans/:id/cancel", post(cancel_scan))
        .route("/api/detectors", get(list_detectors))
}

/// Identify the caller for rate limiting: first `X-Forwarded-For` hop,
/// otherwise the peer address.
fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn parse_job_id(raw: &str) -> Result<JobId> {
    Uuid::parse_str(raw).map_err(|_| AppError::NotFound(format!("scan {} not found", raw)))
}

/// Submit a scan.
async fn submit_scan(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    payload: std::result::Result<Json<ScanRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>)> {
    let Json(request) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let owner = client_key(&headers, connect_info.map(|ConnectInfo(addr)| addr));
    debug!(owner = %owner, detector = %request.detector.name, "Scan submission");

    let job_id = state.scheduler.submit(&owner, request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id,
            state: JobState::Queued,
        }),
    ))
}

async fn list_scans(State(state): State<AppState>) -> Json<ApiResponse<Vec<JobSummary>>> {
    Json(ApiResponse::new(state.scheduler.list()))
}

/// Current progress of a scan.
async fn get_scan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProgressSnapshot>> {
    let job_id = parse_job_id(&id)?;
    state
        .scheduler
        .status(job_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("scan {} not found", id)))
}

async fn get_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ScanResult>> {
    let job_id = parse_job_id(&id)?;
    match state.scheduler.result(job_id) {
        ResultLookup::Ready(result) => Ok(Json(result)),
        ResultLookup::NotReady(state) => Err(AppError::NotReady {
            reason: (state == JobState::Cancelled).then(|| "cancelled".to_string()),
            state,
        }),
        ResultLookup::Failed(failure) => Err(AppError::NotReady {
            state: JobState::Failed,
            reason: Some(format!("{}: {}", failure.reason.as_str(), failure.message)),
        }),
        ResultLookup::NotFound => Err(AppError::NotFound(format!("scan {} not found", id))),
    }
}

async fn cancel_scan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>> {
    let job_id = parse_job_id(&id)?;
    if state.scheduler.job(job_id).is_none() {
        return Err(AppError::NotFound(format!("scan {} not found", id)));
    }
    Ok(Json(CancelResponse {
        accepted: state.scheduler.cancel(job_id),
    }))
}

async fn list_detectors(State(state): State<AppState>) -> Json<ApiResponse<Vec<DetectorInfo>>> {
    Json(ApiResponse::new(state.scheduler.registry().list()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_client_key_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert_eq!(client_key(&headers, Some(peer)), "203.0.113.7");
    }

    #[test]
    fn test_client_key_falls_back_to_peer() {
        let peer: SocketAddr = "192.168.1.9:5000".parse().unwrap();
        assert_eq!(client_key(&HeaderMap::new(), Some(peer)), "192.168.1.9");
        assert_eq!(client_key(&HeaderMap::new(), None), "unknown");
    }

    #[test]
    fn test_parse_job_id() {
        assert!(parse_job_id("not-a-uuid").is_err());
        let id = Uuid::new_v4();
        assert_eq!(parse_job_id(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn test_submit_response_serialization() {
        let response = SubmitResponse {
            job_id: Uuid::nil(),
            state: JobState::Queued,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["state"], "queued");
        assert!(json.get("jobId").is_some());
    }
}

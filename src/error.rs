use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::NaiveDate;
use serde_json::json;
use thiserror::Error;

use crate::types::{FailureReason, JobState};

/// Application error types.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Too many requests: {message}")]
    TooManyRequests {
        message: String,
        retry_after_secs: u64,
    },

    #[error("Result not ready: job is {state}")]
    NotReady {
        state: JobState,
        reason: Option<String>,
    },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            AppError::TooManyRequests {
                message,
                retry_after_secs,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "error": message, "retryAfter": retry_after_secs }),
            ),
            AppError::NotReady { state, reason } => (
                StatusCode::CONFLICT,
                json!({ "ready": false, "state": state, "reason": reason }),
            ),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": msg })),
            AppError::SerdeJson(e) => (StatusCode::BAD_REQUEST, json!({ "error": e.to_string() })),
            AppError::Anyhow(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": e.to_string() }),
            ),
        };

        let mut body = body;
        body["status"] = json!(status.as_u16());
        let mut response = (status, Json(body)).into_response();

        if let AppError::TooManyRequests {
            retry_after_secs, ..
        } = &self
        {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Submission refused before a job is created.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("scanner at capacity, retry in {retry_after_secs}s")]
    AtCapacity { retry_after_secs: u64 },

    #[error("invalid scan request: {0}")]
    InvalidRequest(String),
}

impl From<AdmissionError> for AppError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::RateLimited { retry_after_secs }
            | AdmissionError::AtCapacity { retry_after_secs } => AppError::TooManyRequests {
                message: err.to_string(),
                retry_after_secs,
            },
            AdmissionError::InvalidRequest(msg) => AppError::BadRequest(msg),
        }
    }
}

/// Upstream data failure. `unit` names what was being fetched
/// (`symbol AAPL`, `day 2024-01-05`, `universe`).
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("network error fetching {unit}: {source}")]
    Network {
        unit: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("upstream returned {status} for {unit}")]
    Upstream { unit: String, status: u16 },

    #[error("upstream rejected credentials for {unit}")]
    Auth { unit: String },

    #[error("upstream rate limit not lifted for {unit}")]
    RateLimitExhausted { unit: String },

    #[error("malformed response for {unit}: {message}")]
    DataFormat { unit: String, message: String },

    #[error("universe snapshot returned no symbols")]
    EmptyUniverse,
}

impl FetchError {
    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            FetchError::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Smart filter rejected its input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("malformed {field} for {symbol} on {date}")]
    MalformedRow {
        symbol: String,
        date: NaiveDate,
        field: &'static str,
    },
}

/// Per-symbol detector failure. Never fatal to a job.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectionError {
    #[error("detector failed: {0}")]
    Failed(String),

    #[error("insufficient data: need {needed} bars, got {got}")]
    InsufficientData { needed: usize, got: usize },
}

/// Why a running job stopped early.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("fetch stage failed ({strategy}): {source}")]
    Fetch {
        strategy: &'static str,
        #[source]
        source: FetchError,
    },

    #[error("filter stage failed: {0}")]
    Filter(#[from] FilterError),

    #[error("job exceeded its {0}s time budget")]
    Timeout(u64),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ScanError {
    /// Failure reason for a failed job; `None` for cancellation.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            ScanError::Fetch { .. } => Some(FailureReason::FetchError),
            ScanError::Filter(_) => Some(FailureReason::FilterError),
            ScanError::Timeout(_) => Some(FailureReason::Timeout),
            ScanError::Internal(_) => Some(FailureReason::Internal),
            ScanError::Cancelled => None,
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            ScanError::Fetch { .. } => "fetch_error",
            ScanError::Filter(_) => "filter_error",
            ScanError::Timeout(_) => "timeout",
            ScanError::Cancelled => "cancelled",
            ScanError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_error_maps_to_429() {
        let err: AppError = AdmissionError::RateLimited {
            retry_after_secs: 42,
        }
        .into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "42"
        );
    }

    #[test]
    fn test_invalid_request_maps_to_400() {
        let err: AppError = AdmissionError::InvalidRequest("bad dates".to_string()).into();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_not_ready_maps_to_409() {
        let err = AppError::NotReady {
            state: JobState::Running,
            reason: None,
        };
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_timeout_reason_distinct_from_fetch() {
        let timeout = ScanError::Timeout(60);
        let fetch = ScanError::Fetch {
            strategy: "per_symbol",
            source: FetchError::Upstream {
                unit: "symbol AAPL".to_string(),
                status: 503,
            },
        };
        assert_eq!(timeout.failure_reason(), Some(FailureReason::Timeout));
        assert_eq!(fetch.failure_reason(), Some(FailureReason::FetchError));
        assert_eq!(ScanError::Cancelled.failure_reason(), None);
    }

    #[test]
    fn test_fetch_error_transient_classification() {
        let server = FetchError::Upstream {
            unit: "day 2024-01-05".to_string(),
            status: 502,
        };
        let client = FetchError::Upstream {
            unit: "day 2024-01-05".to_string(),
            status: 404,
        };
        let format = FetchError::DataFormat {
            unit: "universe".to_string(),
            message: "missing results".to_string(),
        };
        assert!(server.is_transient());
        assert!(!client.is_transient());
        assert!(!format.is_transient());
    }
}

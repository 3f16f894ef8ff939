use super::{JobId, ProgressSnapshot};
use serde::{Deserialize, Serialize};

/// Incoming WebSocket message from client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving progress for a job.
    #[serde(rename_all = "camelCase")]
    Subscribe { job_id: JobId },
    /// Stop receiving progress for a job.
    #[serde(rename_all = "camelCase")]
    Unsubscribe { job_id: JobId },
}

/// Outgoing WebSocket message to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Subscribed { job_id: JobId },
    #[serde(rename_all = "camelCase")]
    Unsubscribed { job_id: JobId },
    Progress { data: ProgressSnapshot },
    /// The job reached a terminal state; no further progress follows.
    #[serde(rename_all = "camelCase")]
    Finished { job_id: JobId },
    Error { error: String },
}

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::services::ProgressReporter;
use crate::types::{ClientMessage, JobId, ServerMessage};
use crate::AppState;

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let client_id = Uuid::new_v4();
    info!("WebSocket client connected: {}", client_id);

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&msg) else {
                continue;
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let progress = state.scheduler.progress().clone();
    let mut feeds: HashMap<JobId, JoinHandle<()>> = HashMap::new();

    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                debug!("Received message from {}: {}", client_id, text);
                handle_message(&progress, &tx, &mut feeds, &text);
            }
            Ok(Message::Close(_)) => {
                info!("WebSocket client disconnecting: {}", client_id);
                break;
            }
            Err(e) => {
                error!("WebSocket error for {}: {}", client_id, e);
                break;
            }
            _ => {}
        }
        feeds.retain(|_, feed| !feed.is_finished());
    }

    for (_, feed) in feeds {
        feed.abort();
    }
    send_task.abort();
    info!("WebSocket client disconnected: {}", client_id);
}

fn handle_message(
    progress: &Arc<ProgressReporter>,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    feeds: &mut HashMap<JobId, JoinHandle<()>>,
    text: &str,
) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            let _ = tx.send(ServerMessage::Error {
                error: format!("Invalid message: {}", e),
            });
            return;
        }
    };

    match msg {
        ClientMessage::Subscribe { job_id } => {
            let Some(updates) = progress.subscribe(job_id) else {
                let _ = tx.send(ServerMessage::Error {
                    error: format!("Unknown scan job: {}", job_id),
                });
                return;
            };
            if let Some(previous) = feeds.remove(&job_id) {
                previous.abort();
            }
            let _ = tx.send(ServerMessage::Subscribed { job_id });
            feeds.insert(job_id, spawn_feed(job_id, updates, tx.clone()));
        }
        ClientMessage::Unsubscribe { job_id } => {
            if let Some(feed) = feeds.remove(&job_id) {
                feed.abort();
            }
            let _ = tx.send(ServerMessage::Unsubscribed { job_id });
        }
    }
}

/// Forward every progress update for one job until it is terminal.
fn spawn_feed(
    job_id: JobId,
    mut updates: tokio::sync::watch::Receiver<crate::types::ProgressSnapshot>,
    tx: mpsc::UnboundedSender<ServerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let snapshot = updates.borrow_and_update().clone();
            let terminal = snapshot.state.is_terminal();
            if tx.send(ServerMessage::Progress { data: snapshot }).is_err() {
                return;
            }
            if terminal {
                let _ = tx.send(ServerMessage::Finished { job_id });
                return;
            }
            if updates.changed().await.is_err() {
                // Record evicted; nothing more will arrive.
                let _ = tx.send(ServerMessage::Finished { job_id });
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobState, Stage};

    #[tokio::test]
    async fn test_feed_forwards_until_terminal() {
        let reporter = Arc::new(ProgressReporter::new());
        let id = Uuid::new_v4();
        reporter.register(id);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let feed = spawn_feed(id, reporter.subscribe(id).unwrap(), tx);

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ServerMessage::Progress { ref data } if data.state == JobState::Queued));

        reporter.set_state(id, JobState::Running, "Running");
        reporter.report(id, Stage::Fetch, 50.0, "half");
        reporter.set_state(id, JobState::Completed, "done");

        let mut last_percent = 0.0;
        loop {
            match rx.recv().await.unwrap() {
                ServerMessage::Progress { data } => {
                    assert!(data.overall_percent >= last_percent);
                    last_percent = data.overall_percent;
                }
                ServerMessage::Finished { job_id } => {
                    assert_eq!(job_id, id);
                    break;
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
        assert_eq!(last_percent, 100.0);
        feed.await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_unknown_job_reports_error() {
        let reporter = Arc::new(ProgressReporter::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut feeds = HashMap::new();
        let text = format!(r#"{{"type":"subscribe","jobId":"{}"}}"#, Uuid::new_v4());

        handle_message(&reporter, &tx, &mut feeds, &text);

        assert!(matches!(rx.recv().await, Some(ServerMessage::Error { .. })));
        assert!(feeds.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_message_reports_error() {
        let reporter = Arc::new(ProgressReporter::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut feeds = HashMap::new();

        handle_message(&reporter, &tx, &mut feeds, "not json");

        match rx.recv().await {
            Some(ServerMessage::Error { error }) => assert!(error.starts_with("Invalid message")),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

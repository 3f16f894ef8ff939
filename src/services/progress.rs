//! Live job progress.
//!
//! One authoritative [`ProgressSnapshot`] per job, held in a `watch` channel.
//! Readers either poll with [`ProgressReporter::get`] or follow every update
//! through [`ProgressReporter::subscribe`].

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::watch;

use crate::types::{JobId, JobState, ProgressSnapshot, Stage};

fn stage_rank(stage: Stage) -> u8 {
    match stage {
        Stage::Fetch => 0,
        Stage::Filter => 1,
        Stage::Detect => 2,
        Stage::Finalize => 3,
    }
}

pub struct ProgressReporter {
    channels: DashMap<JobId, watch::Sender<ProgressSnapshot>>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Create the record for a newly submitted job.
    pub fn register(&self, job_id: JobId) {
        let snapshot = ProgressSnapshot {
            job_id,
            state: JobState::Queued,
            stage: None,
            stage_percent: 0.0,
            overall_percent: 0.0,
            message: "Queued".to_string(),
            updated_at: Utc::now(),
        };
        let (tx, _rx) = watch::channel(snapshot);
        self.channels.insert(job_id, tx);
    }

    /// Record progress within `stage`.
    ///
    /// Updates that would move to an earlier stage or lower a percentage are
    /// clamped, so readers never observe progress going backwards. Terminal
    /// jobs ignore further reports.
    pub fn report(&self, job_id: JobId, stage: Stage, percent: f64, message: impl Into<String>) {
        let Some(tx) = self.channels.get(&job_id) else {
            return;
        };
        let message = message.into();
        let percent = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };

        tx.send_if_modified(|snap| {
            if snap.state.is_terminal() {
                return false;
            }
            let stage_percent = match snap.stage {
                Some(current) if stage_rank(stage) < stage_rank(current) => return false,
                Some(current) if current == stage => snap.stage_percent.max(percent),
                _ => percent,
            };
            let (lo, hi) = stage.weight_range();
            let overall = lo + (hi - lo) * stage_percent / 100.0;

            snap.stage = Some(stage);
            snap.stage_percent = stage_percent;
            snap.overall_percent = snap.overall_percent.max(overall);
            snap.message = message;
            snap.updated_at = Utc::now();
            true
        });
    }

    /// Record a lifecycle transition. Completion pins progress at 100%.
    pub fn set_state(&self, job_id: JobId, state: JobState, message: impl Into<String>) {
        let Some(tx) = self.channels.get(&job_id) else {
            return;
        };
        let message = message.into();
        tx.send_if_modified(|snap| {
            if snap.state.is_terminal() {
                return false;
            }
            snap.state = state;
            if state == JobState::Completed {
                snap.stage = Some(Stage::Finalize);
                snap.stage_percent = 100.0;
                snap.overall_percent = 100.0;
            }
            snap.message = message;
            snap.updated_at = Utc::now();
            true
        });
    }

    pub fn get(&self, job_id: JobId) -> Option<ProgressSnapshot> {
        self.channels.get(&job_id).map(|tx| tx.borrow().clone())
    }

    pub fn subscribe(&self, job_id: JobId) -> Option<watch::Receiver<ProgressSnapshot>> {
        self.channels.get(&job_id).map(|tx| tx.subscribe())
    }

    /// Drop the record. Open subscriptions see the channel close.
    pub fn remove(&self, job_id: JobId) {
        self.channels.remove(&job_id);
    }

    pub fn handle(self: &Arc<Self>, job_id: JobId) -> ProgressHandle {
        ProgressHandle {
            job_id,
            reporter: self.clone(),
        }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reporter bound to one job, handed to stage components.
#[derive(Clone)]
pub struct ProgressHandle {
    job_id: JobId,
    reporter: Arc<ProgressReporter>,
}

impl ProgressHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn report(&self, stage: Stage, percent: f64, message: impl Into<String>) {
        self.reporter.report(self.job_id, stage, percent, message);
    }
}

//! In-memory job records with TTL retention for terminal jobs.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::types::{JobId, JobSummary, ScanJob, ScanResult};

/// A job plus its result, once there is one.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job: ScanJob,
    pub result: Option<ScanResult>,
    /// Set when the job reaches a terminal state.
    expires_at: Option<Instant>,
}

impl JobRecord {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// Job map. Only the scheduler mutates it.
pub struct ResultStore {
    records: DashMap<JobId, JobRecord>,
    ttl: Duration,
}

impl ResultStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            ttl,
        }
    }

    pub fn insert(&self, job: ScanJob) {
        self.records.insert(
            job.id,
            JobRecord {
                job,
                result: None,
                expires_at: None,
            },
        );
    }

    /// Snapshot of a live record. Expired records read as absent even
    /// before the cleanup task evicts them.
    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        let record = self.records.get(&id)?;
        if record.is_expired(Instant::now()) {
            return None;
        }
        Some(record.clone())
    }

    pub fn job(&self, id: JobId) -> Option<ScanJob> {
        self.get(id).map(|r| r.job)
    }

    /// Mutate a record in place. Starts the retention clock when the job
    /// has become terminal.
    pub fn update<R>(&self, id: JobId, f: impl FnOnce(&mut JobRecord) -> R) -> Option<R> {
        let mut record = self.records.get_mut(&id)?;
        let out = f(&mut record);
        if record.job.state.is_terminal() && record.expires_at.is_none() {
            record.expires_at = Some(Instant::now() + self.ttl);
        }
        Some(out)
    }

    /// Summaries of live jobs, oldest first.
    pub fn list(&self) -> Vec<JobSummary> {
        let now = Instant::now();
        let mut out: Vec<JobSummary> = self
            .records
            .iter()
            .filter(|r| !r.is_expired(now))
            .map(|r| r.job.summary())
            .collect();
        out.sort_by_key(|s| s.submitted_at);
        out
    }

    /// Evict expired records, returning their ids.
    pub fn cleanup_expired(&self) -> Vec<JobId> {
        let now = Instant::now();
        let expired: Vec<JobId> = self
            .records
            .iter()
            .filter(|r| r.is_expired(now))
            .map(|r| *r.key())
            .collect();
        for id in &expired {
            self.records.remove(id);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "Evicted expired scan jobs");
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

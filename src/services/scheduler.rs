//! Scan job admission and lifecycle.
//!
//! Admission (client rate window, concurrency slot, queue bound) is decided
//! under one lock. Each admitted job then runs on its own task, holding a
//! slot permit from `running` until its terminal state has been recorded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::detector::DetectorRegistry;
use super::pipeline::ScanPipeline;
use super::progress::ProgressReporter;
use super::rate_limit::ClientRateLimiter;
use super::result_store::ResultStore;
use crate::config::{QueuePolicy, RetentionConfig, SchedulerConfig};
use crate::error::{AdmissionError, ScanError};
use crate::types::{
    JobFailure, JobId, JobState, JobSummary, ProgressSnapshot, ScanJob, ScanRequest, ScanResult,
    StageResult, UniverseSource, MAX_D0_SPAN_DAYS,
};

/// Retry hint handed out when every slot (and the queue) is full.
const CAPACITY_RETRY_AFTER_SECS: u64 = 5;

/// Outcome of a result query.
#[derive(Debug, Clone)]
pub enum ResultLookup {
    Ready(ScanResult),
    NotReady(JobState),
    Failed(JobFailure),
    NotFound,
}

struct Admission {
    limiter: ClientRateLimiter,
    queued: usize,
}

pub struct ScanScheduler {
    config: SchedulerConfig,
    pipeline: Arc<ScanPipeline>,
    registry: Arc<DetectorRegistry>,
    store: Arc<ResultStore>,
    progress: Arc<ProgressReporter>,
    slots: Arc<Semaphore>,
    admission: Mutex<Admission>,
    cancels: DashMap<JobId, CancellationToken>,
}

impl ScanScheduler {
    pub fn new(
        config: SchedulerConfig,
        retention: &RetentionConfig,
        pipeline: ScanPipeline,
        registry: Arc<DetectorRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            slots: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            admission: Mutex::new(Admission {
                limiter: ClientRateLimiter::new(config.submissions_per_window, config.rate_window),
                queued: 0,
            }),
            config,
            pipeline: Arc::new(pipeline),
            registry,
            store: Arc::new(ResultStore::new(retention.result_ttl)),
            progress: Arc::new(ProgressReporter::new()),
            cancels: DashMap::new(),
        })
    }

    pub fn registry(&self) -> &DetectorRegistry {
        &self.registry
    }

    pub fn progress(&self) -> &Arc<ProgressReporter> {
        &self.progress
    }

    /// Validate and admit a scan. Rejected submissions never create a job.
    pub async fn submit(
        self: &Arc<Self>,
        owner: &str,
        request: ScanRequest,
    ) -> Result<JobId, AdmissionError> {
        self.validate(&request)?;

        let (job_id, permit, cancel) = {
            let mut admission = self.admission.lock().await;
            let now = Instant::now();

            admission
                .limiter
                .check(owner, now)
                .map_err(|retry_after_secs| AdmissionError::RateLimited { retry_after_secs })?;

            let permit = match self.slots.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => match self.config.queue_policy {
                    QueuePolicy::Reject => {
                        return Err(AdmissionError::AtCapacity {
                            retry_after_secs: CAPACITY_RETRY_AFTER_SECS,
                        })
                    }
                    QueuePolicy::Queue if admission.queued >= self.config.max_queued => {
                        return Err(AdmissionError::AtCapacity {
                            retry_after_secs: CAPACITY_RETRY_AFTER_SECS,
                        })
                    }
                    QueuePolicy::Queue => {
                        admission.queued += 1;
                        None
                    }
                },
            };
            admission.limiter.record(owner, now);

            let job = ScanJob::new(owner, request);
            let job_id = job.id;
            let cancel = CancellationToken::new();
            self.store.insert(job);
            self.progress.register(job_id);
            self.cancels.insert(job_id, cancel.clone());
            (job_id, permit, cancel)
        };

        info!(
            job_id = %job_id,
            owner = %owner,
            queued = permit.is_none(),
            "Scan job admitted"
        );

        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_job(job_id, permit, cancel).await;
        });

        Ok(job_id)
    }

    fn validate(&self, request: &ScanRequest) -> Result<(), AdmissionError> {
        let Some(d0) = request.d0() else {
            return Err(AdmissionError::InvalidRequest(
                "startDate must not be after endDate".to_string(),
            ));
        };
        if (d0.end - d0.start).num_days() > MAX_D0_SPAN_DAYS {
            return Err(AdmissionError::InvalidRequest(format!(
                "date range must not exceed {MAX_D0_SPAN_DAYS} days"
            )));
        }
        request
            .thresholds
            .validate()
            .map_err(AdmissionError::InvalidRequest)?;
        if matches!(request.universe, UniverseSource::Symbols { .. })
            && request.universe.explicit_symbols().is_empty()
        {
            return Err(AdmissionError::InvalidRequest(
                "symbol list is empty".to_string(),
            ));
        }
        let detector = self.registry.get(&request.detector.name).ok_or_else(|| {
            AdmissionError::InvalidRequest(format!("unknown detector: {}", request.detector.name))
        })?;
        detector
            .validate_params(&request.detector.params)
            .map_err(|e| AdmissionError::InvalidRequest(format!("{}: {}", detector.name(), e)))?;
        let lookback = detector
            .lookback_days(&request.detector.params)
            .max(request.thresholds.lookback_rows());
        if d0.with_lookback(lookback).is_none() {
            return Err(AdmissionError::InvalidRequest(format!(
                "{}: lookback of {} trading days is out of range",
                detector.name(),
                lookback
            )));
        }
        Ok(())
    }

    async fn run_job(
        self: Arc<Self>,
        job_id: JobId,
        permit: Option<OwnedSemaphorePermit>,
        cancel: CancellationToken,
    ) {
        let permit = match permit {
            Some(permit) => permit,
            None => {
                let acquired = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = self.slots.clone().acquire_owned() => permit.ok(),
                };
                self.admission.lock().await.queued -= 1;
                match acquired {
                    Some(permit) => permit,
                    None => {
                        self.cancels.remove(&job_id);
                        return;
                    }
                }
            }
        };

        let request = match self.store.update(job_id, |r| {
            r.job
                .transition(JobState::Running)
                .map(|_| r.job.request.clone())
        }) {
            Some(Ok(request)) => request,
            _ => {
                // Cancelled while waiting for the slot.
                self.cancels.remove(&job_id);
                return;
            }
        };
        self.progress
            .set_state(job_id, JobState::Running, "Running");
        info!(job_id = %job_id, "Scan job started");

        let timed_out = Arc::new(AtomicBool::new(false));
        let timer = {
            let cancel = cancel.clone();
            let timed_out = timed_out.clone();
            let budget = self.config.job_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(budget).await;
                timed_out.store(true, Ordering::SeqCst);
                cancel.cancel();
            })
        };

        let task = {
            let pipeline = self.pipeline.clone();
            let store = self.store.clone();
            let handle = self.progress.handle(job_id);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let sink = move |stage: StageResult| {
                    store.update(job_id, |r| r.job.stage_results.push(stage));
                };
                pipeline.run(&request, &cancel, &handle, &sink).await
            })
        };

        let outcome = match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                error!(job_id = %job_id, "Scan pipeline panicked");
                Err(ScanError::Internal("pipeline task panicked".to_string()))
            }
            Err(e) => Err(ScanError::Internal(e.to_string())),
        };
        timer.abort();

        let outcome = match outcome {
            _ if timed_out.load(Ordering::SeqCst) => {
                Err(ScanError::Timeout(self.config.job_timeout.as_secs()))
            }
            // A stage failing after cancel() was asked for is still a cancel.
            _ if cancel.is_cancelled() => Err(ScanError::Cancelled),
            other => other,
        };

        self.record_outcome(job_id, outcome);
        self.cancels.remove(&job_id);
        drop(permit);
    }

    fn record_outcome(&self, job_id: JobId, outcome: Result<ScanResult, ScanError>) {
        match outcome {
            Ok(result) => {
                let signals = result.signals.len();
                let processed = result.diagnostics.symbols_processed;
                let errors = result.diagnostics.detection_errors;
                self.store.update(job_id, |r| {
                    if r.job.transition(JobState::Completed).is_ok() {
                        r.result = Some(result);
                    }
                });
                self.progress.set_state(
                    job_id,
                    JobState::Completed,
                    format!(
                        "Completed with {} signals, {} symbols processed, {} errors",
                        signals, processed, errors
                    ),
                );
                info!(job_id = %job_id, signals, processed, errors, "Scan job completed");
            }
            Err(ScanError::Cancelled) => {
                let _ = self
                    .store
                    .update(job_id, |r| r.job.transition(JobState::Cancelled));
                self.progress
                    .set_state(job_id, JobState::Cancelled, "Cancelled");
                info!(job_id = %job_id, "Scan job cancelled");
            }
            Err(e) => {
                let message = e.to_string();
                if let Some(reason) = e.failure_reason() {
                    self.store.update(job_id, |r| {
                        if r.job.transition(JobState::Failed).is_ok() {
                            r.job.failure = Some(JobFailure {
                                reason,
                                message: message.clone(),
                            });
                        }
                    });
                }
                self.progress
                    .set_state(job_id, JobState::Failed, message.clone());
                warn!(job_id = %job_id, reason = e.reason_code(), error = %message, "Scan job failed");
            }
        }
    }

    /// Latest progress; `None` once the job has expired or never existed.
    pub fn status(&self, job_id: JobId) -> Option<ProgressSnapshot> {
        self.store.get(job_id)?;
        self.progress.get(job_id)
    }

    pub fn result(&self, job_id: JobId) -> ResultLookup {
        let Some(record) = self.store.get(job_id) else {
            return ResultLookup::NotFound;
        };
        match (record.job.state, record.result, record.job.failure) {
            (JobState::Completed, Some(result), _) => ResultLookup::Ready(result),
            (JobState::Failed, _, Some(failure)) => ResultLookup::Failed(failure),
            (state, _, _) => ResultLookup::NotReady(state),
        }
    }

    pub fn job(&self, job_id: JobId) -> Option<ScanJob> {
        self.store.job(job_id)
    }

    /// Request cancellation. Accepted iff the job is queued or running.
    pub fn cancel(&self, job_id: JobId) -> bool {
        let previous = self.store.update(job_id, |r| {
            let state = r.job.state;
            if state == JobState::Queued {
                let _ = r.job.transition(JobState::Cancelled);
            }
            state
        });
        let accepted = matches!(previous, Some(JobState::Queued | JobState::Running));
        if !accepted {
            return false;
        }
        if previous == Some(JobState::Queued) {
            self.progress
                .set_state(job_id, JobState::Cancelled, "Cancelled while queued");
        }
        if let Some(token) = self.cancels.get(&job_id) {
            token.cancel();
        }
        info!(job_id = %job_id, "Scan job cancellation requested");
        true
    }

    pub fn list(&self) -> Vec<JobSummary> {
        self.store.list()
    }

    /// Evict expired terminal jobs and stale client windows.
    pub async fn cleanup_expired(&self) -> usize {
        let expired = self.store.cleanup_expired();
        for id in &expired {
            self.progress.remove(*id);
            self.cancels.remove(id);
        }
        self.admission.lock().await.limiter.prune(Instant::now());
        expired.len()
    }
}

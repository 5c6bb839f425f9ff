use dashmap::DashMap;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use super::{queue::JobQueue, sink::ResultSink};
use crate::{
    config::JudgerConfig, metrics::Metrics, prelude::CancellationToken, slot::SlotAllocator,
    tester::Evaluator,
};

/// Cancellation requests for jobs not seen yet, and the record of settled
/// jobs, are forgotten after this long.
const CANCEL_REQUEST_TTL: Duration = Duration::from_secs(3600);

/// Expired settled ids are swept once the record grows past this.
const SETTLED_SWEEP_AT: usize = 4096;

/// State shared by every worker of one pool.
pub struct SharedPoolData {
    /// Configuration of this judge, fixed for the pool's lifetime.
    pub cfg: Arc<JudgerConfig>,
    pub slots: Arc<SlotAllocator>,
    pub evaluator: Evaluator,
    pub queue: Arc<dyn JobQueue>,
    pub sink: Arc<dyn ResultSink>,
    pub metrics: Arc<dyn Metrics>,
    /// Cancellation handle of every job currently being handled, by
    /// submission id. Each is a child of `abort_handle`.
    pub job_handles: DashMap<String, CancellationToken>,
    /// Submission ids whose cancellation was requested.
    pub cancel_requests: DashMap<String, Instant>,
    /// Submission ids recently reported. Cancelling one of these is a no-op.
    pub settled: DashMap<String, Instant>,
    /// Stop taking new jobs. Jobs in flight keep running.
    pub stop_handle: CancellationToken,
    /// Force-kill everything still running.
    pub abort_handle: CancellationToken,
}

impl SharedPoolData {
    pub fn new(
        cfg: Arc<JudgerConfig>,
        slots: Arc<SlotAllocator>,
        evaluator: Evaluator,
        queue: Arc<dyn JobQueue>,
        sink: Arc<dyn ResultSink>,
        metrics: Arc<dyn Metrics>,
    ) -> SharedPoolData {
        SharedPoolData {
            cfg,
            slots,
            evaluator,
            queue,
            sink,
            metrics,
            job_handles: DashMap::new(),
            cancel_requests: DashMap::new(),
            settled: DashMap::new(),
            stop_handle: CancellationToken::new(),
            abort_handle: CancellationToken::new(),
        }
    }

    pub fn cfg(&self) -> &JudgerConfig {
        &self.cfg
    }

    /// Record a cancellation request and fire it if the job is running.
    /// Returns whether the job was running.
    ///
    /// A job already reported is left alone, so a duplicate delivery of it
    /// still gets its verdict.
    pub fn request_cancel(&self, submission_id: &str) -> bool {
        let now = Instant::now();
        self.cancel_requests
            .retain(|_, at| now.duration_since(*at) < CANCEL_REQUEST_TTL);
        if let Some(handle) = self.job_handles.get(submission_id) {
            self.cancel_requests.insert(submission_id.to_string(), now);
            handle.cancel();
            return true;
        }
        let recently_settled = self
            .settled
            .get(submission_id)
            .map_or(false, |at| now.duration_since(*at) < CANCEL_REQUEST_TTL);
        if recently_settled {
            tracing::debug!(%submission_id, "job already settled, ignoring cancellation");
        } else {
            self.cancel_requests.insert(submission_id.to_string(), now);
        }
        false
    }

    /// Note that a report for this job went out, dropping any cancellation
    /// request still pending for it.
    pub fn mark_settled(&self, submission_id: &str) {
        let now = Instant::now();
        self.cancel_requests.remove(submission_id);
        if self.settled.len() >= SETTLED_SWEEP_AT {
            self.settled
                .retain(|_, at| now.duration_since(*at) < CANCEL_REQUEST_TTL);
        }
        self.settled.insert(submission_id.to_string(), now);
    }

    /// Consume a pending cancellation request for this job.
    pub fn take_cancel_request(&self, submission_id: &str) -> bool {
        self.cancel_requests.remove(submission_id).is_some()
    }
}

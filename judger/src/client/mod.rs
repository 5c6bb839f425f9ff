//! Worker Pool: a fixed set of workers pulling jobs from a [`JobQueue`] and
//! judging each in its own leased slot.
//!
//! Every delivery ends in exactly one of: a report published and the job
//! acknowledged, or the job handed back to the queue (with or without
//! counting the attempt). Slot cleanup runs on every path, panics included.

pub mod config;
pub mod err;
pub mod model;
pub mod queue;
pub mod retry;
pub mod sink;

use futures::FutureExt;
use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::task::JoinHandle;
use tracing::info_span;
use tracing_futures::Instrument;

use self::{
    config::SharedPoolData,
    err::JobExecErr,
    model::{Delivery, JudgeReport, Priority, Requeue},
    retry::backoff_delay,
};
use crate::{
    metrics::{ACTIVE_SLOTS, JOBS_PROCESSED, JOB_DURATION_MS, JOB_RETRIES, QUEUE_DEPTH},
    prelude::{CancelFutureExt, CancellationToken},
    runner::model::SlotId,
    slot::SlotError,
    tester::Evaluation,
    util::AsyncTeardownCollector,
};

pub use queue::JobQueue;
pub use sink::ResultSink;

pub struct WorkerPool {
    data: Arc<SharedPoolData>,
}

impl WorkerPool {
    pub fn new(data: Arc<SharedPoolData>) -> Self {
        WorkerPool { data }
    }

    pub fn data(&self) -> &Arc<SharedPoolData> {
        &self.data
    }

    /// Force-clean every idle slot, as after a crash. Returns the slots that
    /// could not be cleaned; they stay dirty.
    pub async fn recover(&self) -> Vec<SlotId> {
        let sandbox = self.data.evaluator.sandbox().clone();
        self.data.slots.recover(sandbox.as_ref()).await
    }

    pub fn start(&self) -> PoolHandle {
        let workers = self.data.cfg().worker_count();
        tracing::info!(
            workers,
            slots = self.data.slots.size(),
            "starting worker pool"
        );
        let workers = (0..workers)
            .map(|i| {
                tokio::spawn(
                    worker_loop(self.data.clone()).instrument(info_span!("worker", id = i)),
                )
            })
            .collect();
        PoolHandle {
            data: self.data.clone(),
            workers,
        }
    }

    /// Cancel a job. A running job is stopped and reported cancelled; a job
    /// still queued is reported cancelled as soon as it is dequeued.
    pub fn cancel(&self, submission_id: &str) -> bool {
        let running = self.data.request_cancel(submission_id);
        tracing::info!(%submission_id, running, "cancellation requested");
        running
    }
}

pub struct PoolHandle {
    data: Arc<SharedPoolData>,
    workers: Vec<JoinHandle<()>>,
}

impl PoolHandle {
    /// Stop dequeuing and wait up to `grace` for jobs in flight to finish.
    /// Whatever still runs after that is killed and handed back to the queue.
    /// Returns whether everything finished within the grace period.
    pub async fn shutdown(self, grace: Duration) -> bool {
        tracing::info!(?grace, "shutting down worker pool");
        self.data.stop_handle.cancel();
        let all = futures::future::join_all(self.workers);
        tokio::pin!(all);
        match tokio::time::timeout(grace, &mut all).await {
            Ok(_) => {
                tracing::info!("worker pool drained");
                true
            }
            Err(_) => {
                tracing::warn!("grace period elapsed, aborting running jobs");
                self.data.abort_handle.cancel();
                all.await;
                false
            }
        }
    }

    /// Force-kill running jobs right away.
    pub fn abort(&self) {
        self.data.stop_handle.cancel();
        self.data.abort_handle.cancel();
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        futures::future::join_all(self.workers).await;
    }
}

async fn worker_loop(data: Arc<SharedPoolData>) {
    tracing::debug!("worker started");
    loop {
        if data.stop_handle.is_cancelled() {
            break;
        }
        report_queue_depth(&data);

        let timeout = data.cfg().queue.dequeue_timeout();
        let delivery = match data
            .queue
            .dequeue(timeout)
            .with_cancel(data.stop_handle.cancelled())
            .await
        {
            None => break,
            Some(Ok(Some(delivery))) => delivery,
            Some(Ok(None)) => continue,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "failed to dequeue");
                let pause = Duration::from_millis(data.cfg().queue.backoff_base_ms);
                if tokio::time::sleep(pause)
                    .with_cancel(data.stop_handle.cancelled())
                    .await
                    .is_none()
                {
                    break;
                }
                continue;
            }
        };

        let span = info_span!(
            "handle_job",
            submission_id = %delivery.job.id,
            attempt = delivery.attempt
        );
        handle_delivery(&data, delivery).instrument(span).await;
    }
    tracing::debug!("worker stopped");
}

fn report_queue_depth(data: &SharedPoolData) {
    for priority in Priority::ALL {
        data.metrics.set(
            QUEUE_DEPTH,
            &[("priority", priority.label())],
            data.queue.depth(priority) as f64,
        );
    }
}

enum Settlement {
    Report(JudgeReport),
    Requeue(Requeue),
}

async fn handle_delivery(data: &Arc<SharedPoolData>, delivery: Delivery) {
    let id = delivery.job.id.clone();
    if data.take_cancel_request(&id) {
        tracing::info!("job was cancelled before it started");
        let report = JudgeReport::cancelled(&delivery.job, delivery.attempt);
        settle(data, delivery, Settlement::Report(report)).await;
        return;
    }

    let job_handle = data.abort_handle.child_token();
    data.job_handles.insert(id.clone(), job_handle.clone());
    // A request may have landed between the check above and the insert.
    if data.cancel_requests.contains_key(&id) {
        job_handle.cancel();
    }

    let outcome = run_job(data, &delivery, &job_handle).await;
    data.job_handles.remove(&id);

    let settlement = resolve(data, &delivery, outcome);
    settle(data, delivery, settlement).await;
}

async fn run_job(
    data: &SharedPoolData,
    delivery: &Delivery,
    job_handle: &CancellationToken,
) -> Result<Evaluation, JobExecErr> {
    let cfg = data.cfg.clone();
    let lease = data
        .slots
        .acquire(cfg.slot_acquire_timeout(), job_handle)
        .await?;
    data.metrics
        .set(ACTIVE_SLOTS, &[], data.slots.active() as f64);
    let started = Instant::now();

    let submission = delivery.job.materialize(&cfg);
    let teardown_collector = AsyncTeardownCollector::new();
    let res = AssertUnwindSafe(data.evaluator.evaluate(
        &submission,
        &lease,
        &teardown_collector,
        job_handle,
    ))
    .catch_unwind()
    .await;

    teardown_collector.teardown_all().await;
    data.slots.release(lease);
    data.metrics
        .set(ACTIVE_SLOTS, &[], data.slots.active() as f64);
    data.metrics.observe(
        JOB_DURATION_MS,
        &[("language", submission.language.as_str())],
        started.elapsed().as_secs_f64() * 1000.0,
    );

    match res {
        Ok(res) => Ok(res?),
        Err(panic) => Err(JobExecErr::Panicked(panic_message(panic.as_ref()))),
    }
}

/// Decide what happens to a delivery given how its evaluation ended.
fn resolve(
    data: &SharedPoolData,
    delivery: &Delivery,
    outcome: Result<Evaluation, JobExecErr>,
) -> Settlement {
    let job = &delivery.job;
    let attempt = delivery.attempt;
    let err = match outcome {
        Ok(eval) => return Settlement::Report(JudgeReport::finished(eval, attempt)),
        Err(JobExecErr::Slot(SlotError::Cancelled)) => JobExecErr::Cancelled,
        Err(e) => e,
    };

    match err {
        JobExecErr::Cancelled => {
            if data.take_cancel_request(&job.id) {
                tracing::info!("job cancelled");
                Settlement::Report(JudgeReport::cancelled(job, attempt))
            } else {
                tracing::warn!("job aborted by shutdown, handing it back to the queue");
                Settlement::Requeue(Requeue::Return)
            }
        }
        JobExecErr::Slot(SlotError::PoolExhausted(waited)) => {
            tracing::warn!(?waited, "no free slot, handing the job back to the queue");
            Settlement::Requeue(Requeue::Return)
        }
        e if e.is_transient() && attempt < data.cfg().queue.max_attempts => {
            let delay = backoff_delay(&data.cfg().queue, attempt, &mut rand::thread_rng());
            tracing::warn!(error = %e, ?delay, "attempt failed, will retry");
            data.metrics.increment(JOB_RETRIES, &[], 1);
            Settlement::Requeue(Requeue::Retry { delay })
        }
        e => {
            tracing::error!(error = %e, "job failed");
            let message = if e.is_transient() {
                format!("{} (gave up after {} attempts)", e.public_message(), attempt)
            } else {
                e.public_message().to_string()
            };
            Settlement::Report(JudgeReport::internal_error(job, message, attempt))
        }
    }
}

async fn settle(data: &SharedPoolData, delivery: Delivery, settlement: Settlement) {
    let report = match settlement {
        Settlement::Requeue(requeue) => {
            if let Err(e) = data.queue.nack(delivery, requeue).await {
                tracing::error!(error = %e, "failed to hand job back to the queue");
            }
            return;
        }
        Settlement::Report(report) => report,
    };

    if let Err(e) = data.sink.publish(&report).await {
        // Left unacknowledged, so the job is judged again later.
        let e = JobExecErr::from(e);
        let delay = backoff_delay(&data.cfg().queue, delivery.attempt, &mut rand::thread_rng());
        tracing::warn!(error = %e, ?delay, "failed to publish report");
        data.metrics.increment(JOB_RETRIES, &[], 1);
        if let Err(e) = data.queue.nack(delivery, Requeue::Retry { delay }).await {
            tracing::error!(error = %e, "failed to hand job back to the queue");
        }
        return;
    }

    data.mark_settled(&report.submission_id);
    data.metrics
        .increment(JOBS_PROCESSED, &[("outcome", report.outcome())], 1);
    tracing::info!(outcome = report.outcome(), score = ?report.score, "job settled");
    if let Err(e) = data.queue.ack(&delivery).await {
        tracing::error!(error = %e, "failed to acknowledge job");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

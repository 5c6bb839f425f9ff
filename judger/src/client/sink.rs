//! Where judge reports go once a job is settled.

use async_trait::async_trait;
use err_derive::Error;
use std::{path::Path, sync::Mutex, time::Duration};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{Mutex as AsyncMutex, Notify},
};

use super::model::JudgeReport;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error(display = "IO error: {}", _0)]
    Io(#[error(source)] std::io::Error),

    #[error(display = "JSON error: {}", _0)]
    Json(#[error(source)] serde_json::Error),
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Deliver one report. Failing here leaves the job unacknowledged.
    async fn publish(&self, report: &JudgeReport) -> Result<(), SinkError>;
}

/// Appends one JSON object per line to a file or to stdout.
pub struct JsonLinesSink {
    out: AsyncMutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl JsonLinesSink {
    pub async fn append_to(path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self::new(Box::new(file)))
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(tokio::io::stdout()))
    }

    pub fn new(out: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        JsonLinesSink {
            out: AsyncMutex::new(out),
        }
    }
}

#[async_trait]
impl ResultSink for JsonLinesSink {
    async fn publish(&self, report: &JudgeReport) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(report)?;
        line.push(b'\n');
        let mut out = self.out.lock().await;
        out.write_all(&line).await?;
        out.flush().await?;
        Ok(())
    }
}

/// Keeps reports in memory.
#[derive(Default)]
pub struct MemorySink {
    reports: Mutex<Vec<JudgeReport>>,
    notify: Notify,
}

impl MemorySink {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn reports(&self) -> Vec<JudgeReport> {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Wait until at least `n` reports arrived, or `timeout` passed. Returns
    /// whatever is there.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> Vec<JudgeReport> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            let reports = self.reports();
            if reports.len() >= n {
                return reports;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.reports();
            }
        }
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn publish(&self, report: &JudgeReport) -> Result<(), SinkError> {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(report.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}

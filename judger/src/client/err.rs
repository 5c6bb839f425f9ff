use err_derive::Error;

use super::{queue::QueueError, sink::SinkError};
use crate::{runner::SandboxError, slot::SlotError};

#[derive(Debug, Error)]
pub enum JobExecErr {
    #[error(display = "Sandbox initialization failed: {}", _0)]
    SandboxInit(#[error(source, no_from)] SandboxError),

    #[error(display = "Sandbox error: {}", _0)]
    Sandbox(#[error(source, no_from)] SandboxError),

    #[error(display = "Slot error: {}", _0)]
    Slot(#[error(source)] SlotError),

    #[error(display = "Queue error: {}", _0)]
    Queue(#[error(source)] QueueError),

    #[error(display = "Result sink error: {}", _0)]
    Sink(#[error(source)] SinkError),

    #[error(display = "Evaluation panicked: {}", _0)]
    Panicked(String),

    /// The job's token fired, by request or by shutdown.
    #[error(display = "Job was cancelled")]
    Cancelled,
}

impl From<SandboxError> for JobExecErr {
    fn from(e: SandboxError) -> Self {
        match e {
            SandboxError::Cancelled => JobExecErr::Cancelled,
            e if e.is_init() => JobExecErr::SandboxInit(e),
            e => JobExecErr::Sandbox(e),
        }
    }
}

impl JobExecErr {
    /// Infrastructure hiccups worth another attempt. Everything else is
    /// final for this job.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            JobExecErr::SandboxInit(_) | JobExecErr::Queue(_) | JobExecErr::Sink(_)
        )
    }

    /// Message shown to the submitter in place of the raw error.
    pub fn public_message(&self) -> &'static str {
        match self {
            JobExecErr::SandboxInit(_) => "the judge could not prepare a sandbox",
            JobExecErr::Panicked(_) => "the judge crashed while evaluating this submission",
            _ => "internal judge error",
        }
    }
}

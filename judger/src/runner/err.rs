use err_derive::Error;

use super::model::SlotId;

/// Failures of the sandbox runtime itself, as opposed to failures of the
/// program running inside it.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The isolation mechanism could not allocate or configure the slot.
    #[error(display = "Failed to initialize slot {}: {}", _0, _1)]
    Init(SlotId, String),

    #[error(display = "Slot {} is not initialized", _0)]
    NotInitialized(SlotId),

    #[error(display = "Sandbox execution failed: {}", _0)]
    Exec(String),

    /// The outer container of a layered slot does not exist or is not
    /// running, so nothing can be executed in it.
    #[error(display = "No running container backs slot {}", _0)]
    SlotGone(SlotId),

    #[error(display = "Failed to clean up slot {}: {}", _0, _1)]
    Cleanup(SlotId, String),

    #[error(display = "Rejected path: {}", _0)]
    BadPath(String),

    #[error(display = "IO error: {}", _0)]
    Io(#[error(source)] std::io::Error),

    #[error(display = "Docker error: {}", _0)]
    Docker(#[error(source)] bollard::errors::Error),

    #[error(display = "Execution was cancelled")]
    Cancelled,
}

impl SandboxError {
    /// Initialization failures are the only sandbox errors worth retrying on
    /// a later attempt.
    pub fn is_init(&self) -> bool {
        matches!(self, SandboxError::Init(..))
    }
}

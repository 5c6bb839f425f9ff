//! Sandbox Runtime: executing one command at a time inside an isolated slot.
//!
//! This module is not responsible for interpreting submissions. See
//! [`crate::tester`] for that.

use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use drop_bomb::DropBomb;
use tokio_util::sync::CancellationToken;

use crate::{config::IsolationConfig, util::AsyncTeardown};

pub mod container;
pub mod err;
pub mod isolate;
pub mod launch;
pub mod layered;
pub mod model;
pub mod util;

pub use err::SandboxError;
use model::{ExecutionResult, ResourceLimits, RunRequest, SlotId};

/// The uniform interface over every isolation mechanism.
///
/// A slot goes through `initialize`, any number of `place_file` and
/// `execute` calls, and finally `cleanup`. `cleanup` must be idempotent and
/// must succeed on a slot that was never (or only partially) initialized, so
/// callers can run it unconditionally.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn name(&self) -> Cow<'static, str>;

    /// Number of stacked isolation layers.
    fn layers(&self) -> usize {
        1
    }

    /// Limits this mechanism imposes regardless of what a job asks for.
    fn ceiling(&self) -> Option<ResourceLimits> {
        None
    }

    /// Whether the underlying mechanism is reachable at all.
    async fn available(&self) -> Result<(), SandboxError>;

    async fn initialize(&self, slot: SlotId, limits: &ResourceLimits) -> Result<(), SandboxError>;

    /// Write `content` to `path`, relative to the slot's working directory.
    async fn place_file(&self, slot: SlotId, path: &str, content: Bytes)
        -> Result<(), SandboxError>;

    async fn execute(
        &self,
        slot: SlotId,
        req: &RunRequest,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError>;

    /// Adjust a result produced by a layer nested inside this one with what
    /// this layer observed about the same run.
    async fn reconcile(
        &self,
        _slot: SlotId,
        res: ExecutionResult,
    ) -> Result<ExecutionResult, SandboxError> {
        Ok(res)
    }

    async fn cleanup(&self, slot: SlotId) -> Result<(), SandboxError>;
}

/// `primary-only` or `dual-layer`, as shown in status reports.
pub fn sandbox_kind(sandbox: &dyn Sandbox) -> &'static str {
    if sandbox.layers() > 1 {
        "dual-layer"
    } else {
        "primary-only"
    }
}

/// Build the sandbox strategy selected by configuration.
pub async fn build_sandbox(cfg: &IsolationConfig) -> Result<Arc<dyn Sandbox>, SandboxError> {
    let opts = cfg.isolate_options();
    match &cfg.container {
        None => {
            tracing::info!("using isolate directly on the host");
            Ok(Arc::new(isolate::IsolateSandbox::new(
                opts,
                Arc::new(launch::HostLauncher),
            )))
        }
        Some(container_cfg) => {
            tracing::info!(image = %container_cfg.image, "using isolate inside per-slot containers");
            let docker = container_cfg.connect()?;
            let outer = Arc::new(container::ContainerLayer::new(docker, container_cfg.clone()));
            let inner = Arc::new(isolate::IsolateSandbox::new(opts, outer.clone()));
            Ok(Arc::new(layered::LayeredSandbox::new(outer, inner)))
        }
    }
}

/// Scoped ownership of an initialized slot.
///
/// Registered in the job's teardown collector before `initialize` is called,
/// so the slot is cleaned exactly once on every exit path: normal return,
/// error, cancellation or panic.
pub struct SandboxGuard {
    sandbox: Arc<dyn Sandbox>,
    slot: SlotId,
    done: AtomicBool,
    failed: Arc<AtomicBool>,
    bomb: Mutex<DropBomb>,
}

impl SandboxGuard {
    pub fn new(sandbox: Arc<dyn Sandbox>, slot: SlotId) -> Self {
        Self::with_failure_flag(sandbox, slot, Arc::new(AtomicBool::new(false)))
    }

    /// A guard that also raises `failed` when cleanup fails, typically a
    /// lease's dirty flag.
    pub fn with_failure_flag(sandbox: Arc<dyn Sandbox>, slot: SlotId, failed: Arc<AtomicBool>) -> Self {
        SandboxGuard {
            sandbox,
            slot,
            done: AtomicBool::new(false),
            failed,
            bomb: Mutex::new(DropBomb::new(
                "`SandboxGuard::teardown()` must be called before dropping!",
            )),
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Whether the cleanup attempt failed and the slot needs a forced reset
    /// before reuse.
    pub fn cleanup_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AsyncTeardown for SandboxGuard {
    async fn teardown(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.sandbox.cleanup(self.slot).await {
            tracing::error!(slot = self.slot, error = %e, "sandbox cleanup failed");
            self.failed.store(true, Ordering::SeqCst);
        }
        self.bomb
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .defuse();
    }
}

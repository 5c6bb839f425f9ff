//! Dual-layer isolation: one sandbox nested inside another.

use std::{borrow::Cow, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{
    err::SandboxError,
    model::{ExecutionResult, ResourceLimits, RunRequest, SlotId},
    Sandbox,
};

/// Runs every command through `inner`, which itself lives inside `outer`.
///
/// Both layers see the same slot. Limits handed to the inner layer are
/// clamped to the outer layer's ceiling, so the tighter of the two always
/// applies, and results come back through `outer.reconcile` so the outer
/// layer can override the classification with what it observed.
pub struct LayeredSandbox {
    outer: Arc<dyn Sandbox>,
    inner: Arc<dyn Sandbox>,
}

impl LayeredSandbox {
    pub fn new(outer: Arc<dyn Sandbox>, inner: Arc<dyn Sandbox>) -> Self {
        LayeredSandbox { outer, inner }
    }

    fn effective(&self, limits: &ResourceLimits) -> ResourceLimits {
        match self.outer.ceiling() {
            Some(ceiling) => limits.tighter(&ceiling),
            None => *limits,
        }
    }
}

#[async_trait]
impl Sandbox for LayeredSandbox {
    fn name(&self) -> Cow<'static, str> {
        format!("{} in {}", self.inner.name(), self.outer.name()).into()
    }

    fn layers(&self) -> usize {
        self.outer.layers() + self.inner.layers()
    }

    fn ceiling(&self) -> Option<ResourceLimits> {
        match (self.outer.ceiling(), self.inner.ceiling()) {
            (Some(a), Some(b)) => Some(a.tighter(&b)),
            (a, b) => a.or(b),
        }
    }

    /// Only the outer layer is asked. The inner one is reached through a
    /// slot container that exists only while the slot is in use, so its
    /// binaries are exercised by the readiness probe instead.
    async fn available(&self) -> Result<(), SandboxError> {
        self.outer.available().await
    }

    async fn initialize(&self, slot: SlotId, limits: &ResourceLimits) -> Result<(), SandboxError> {
        let limits = self.effective(limits);
        self.outer.initialize(slot, &limits).await?;
        if let Err(e) = self.inner.initialize(slot, &limits).await {
            if let Err(cleanup) = self.outer.cleanup(slot).await {
                tracing::warn!(slot, error = %cleanup, "outer layer cleanup after failed init");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn place_file(&self, slot: SlotId, path: &str, content: Bytes) -> Result<(), SandboxError> {
        self.inner.place_file(slot, path, content).await
    }

    async fn execute(
        &self,
        slot: SlotId,
        req: &RunRequest,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        let limits = self.effective(limits);
        let res = self.inner.execute(slot, req, &limits, cancel).await?;
        self.outer.reconcile(slot, res).await
    }

    async fn reconcile(
        &self,
        slot: SlotId,
        res: ExecutionResult,
    ) -> Result<ExecutionResult, SandboxError> {
        let res = self.inner.reconcile(slot, res).await?;
        self.outer.reconcile(slot, res).await
    }

    /// Both layers are cleaned even if the inner one fails; the first error
    /// is reported. Without an outer container there is nothing inside to
    /// clean.
    async fn cleanup(&self, slot: SlotId) -> Result<(), SandboxError> {
        let inner = match self.inner.cleanup(slot).await {
            Err(SandboxError::SlotGone(_)) => {
                tracing::debug!(slot, "no outer container, skipping inner cleanup");
                Ok(())
            }
            other => other,
        };
        let outer = self.outer.cleanup(slot).await;
        inner.and(outer)
    }
}

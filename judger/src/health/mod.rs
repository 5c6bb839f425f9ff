//! Health Monitor: liveness, readiness and a detailed status snapshot.
//!
//! Liveness only says the process answers. Readiness additionally requires
//! a full sandbox lifecycle to pass in the reserved probe slot, the isolation
//! mechanism to be reachable, the cache folder to be writable, enough free
//! memory, and the slot pool not to be saturated.

pub mod server;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{sync::Mutex, task::JoinHandle};

use crate::{
    config::JudgerConfig,
    prelude::{CancelFutureExt, CancellationToken},
    runner::{
        model::{ResourceLimits, RunRequest},
        sandbox_kind, Sandbox, SandboxGuard,
    },
    slot::SlotAllocator,
    util::AsyncTeardownCollector,
};

pub const CHECK_SANDBOX_PROBE: &str = "sandbox_probe";
pub const CHECK_BINARIES: &str = "binaries";
pub const CHECK_FILESYSTEM: &str = "filesystem";
pub const CHECK_MEMORY: &str = "memory";
pub const CHECK_SLOT_POOL: &str = "slot_pool";

/// Limits of the probe run. The probe command is trivial; anything slower
/// than this means the sandbox is not healthy.
fn probe_limits() -> ResourceLimits {
    ResourceLimits {
        wall_time_ms: 5_000,
        cpu_time_ms: 2_000,
        memory_kb: 64 * 1024,
        max_processes: 4,
        output_limit_kb: 64,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessReport {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub checks: BTreeMap<String, CheckResult>,
}

impl ReadinessReport {
    pub fn is_ready(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub os: String,
    pub arch: String,
    pub cpus: usize,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    pub kind: String,
    pub name: String,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolInfo {
    pub size: u32,
    pub active: usize,
    pub saturated: bool,
}

/// The detailed status snapshot served at `/status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub system: SystemInfo,
    pub sandbox: SandboxInfo,
    pub pool: PoolInfo,
    pub checks: BTreeMap<String, CheckResult>,
}

pub struct HealthMonitor {
    cfg: Arc<JudgerConfig>,
    sandbox: Arc<dyn Sandbox>,
    slots: Arc<SlotAllocator>,
    started: Instant,
    last: ArcSwapOption<ReadinessReport>,
    /// The probe slot is used by one probe at a time.
    probe_lock: Mutex<()>,
}

impl HealthMonitor {
    pub fn new(
        cfg: Arc<JudgerConfig>,
        sandbox: Arc<dyn Sandbox>,
        slots: Arc<SlotAllocator>,
    ) -> HealthMonitor {
        HealthMonitor {
            cfg,
            sandbox,
            slots,
            started: Instant::now(),
            last: ArcSwapOption::new(None),
            probe_lock: Mutex::new(()),
        }
    }

    /// The process is responsive. Never depends on sandbox health.
    pub fn is_live(&self) -> bool {
        true
    }

    /// Most recent readiness report, if any check ran yet.
    pub fn last_report(&self) -> Option<Arc<ReadinessReport>> {
        self.last.load_full()
    }

    /// The cached report while it is younger than the probe interval,
    /// otherwise a fresh one.
    pub async fn readiness_cached(&self) -> Arc<ReadinessReport> {
        if let Some(last) = self.last_report() {
            let age = Utc::now().signed_duration_since(last.checked_at);
            let interval = chrono::Duration::from_std(self.cfg.health.probe_interval())
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
            if age < interval {
                return last;
            }
        }
        self.check_readiness().await
    }

    /// Run every readiness check now and cache the outcome.
    #[tracing::instrument(skip_all)]
    pub async fn check_readiness(&self) -> Arc<ReadinessReport> {
        let mut checks = BTreeMap::new();

        let (binaries, sandbox_probe, filesystem, memory) = tokio::join!(
            timed(self.check_binaries()),
            timed(self.probe_sandbox()),
            timed(check_filesystem(&self.cfg.cache_folder)),
            timed(check_memory(self.cfg.health.min_free_memory_mb)),
        );
        checks.insert(CHECK_BINARIES.to_string(), binaries);
        checks.insert(CHECK_SANDBOX_PROBE.to_string(), sandbox_probe);
        checks.insert(CHECK_FILESYSTEM.to_string(), filesystem);
        checks.insert(CHECK_MEMORY.to_string(), memory);
        checks.insert(
            CHECK_SLOT_POOL.to_string(),
            timed(async { self.check_slot_pool() }).await,
        );

        let status = if checks.values().all(|c| c.passed) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        for (name, check) in checks.iter().filter(|(_, c)| !c.passed) {
            tracing::warn!(check = %name, detail = ?check.detail, "readiness check failed");
        }

        let report = Arc::new(ReadinessReport {
            status,
            checked_at: Utc::now(),
            checks,
        });
        self.last.store(Some(report.clone()));
        report
    }

    pub async fn status(&self) -> StatusReport {
        let readiness = self.readiness_cached().await;
        let available = readiness
            .checks
            .get(CHECK_BINARIES)
            .map_or(false, |c| c.passed);
        StatusReport {
            status: readiness.status,
            timestamp: Utc::now(),
            uptime_secs: self.started.elapsed().as_secs(),
            system: system_info().await,
            sandbox: SandboxInfo {
                kind: sandbox_kind(self.sandbox.as_ref()).to_string(),
                name: self.sandbox.name().into_owned(),
                available,
            },
            pool: PoolInfo {
                size: self.slots.size(),
                active: self.slots.active(),
                saturated: self.slots.is_saturated(),
            },
            checks: readiness.checks.clone(),
        }
    }

    /// Re-check readiness every `probe_interval` until `cancel` fires.
    pub fn spawn_periodic(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let interval = self.cfg.health.probe_interval();
            loop {
                let report = self.check_readiness().await;
                tracing::debug!(ready = report.is_ready(), "periodic readiness check");
                if tokio::time::sleep(interval)
                    .with_cancel(cancel.cancelled())
                    .await
                    .is_none()
                {
                    break;
                }
            }
        })
    }

    async fn check_binaries(&self) -> Result<(), String> {
        self.sandbox.available().await.map_err(|e| e.to_string())
    }

    fn check_slot_pool(&self) -> Result<(), String> {
        if self.slots.is_saturated() {
            Err(format!(
                "all {} slots stayed busy past the acquire timeout",
                self.slots.size()
            ))
        } else {
            Ok(())
        }
    }

    /// Full lifecycle in the probe slot: initialize, run the probe command,
    /// require exit status 0, clean up.
    async fn probe_sandbox(&self) -> Result<(), String> {
        let _probe = self.probe_lock.lock().await;
        let slot = self.cfg.probe_slot();
        let limits = probe_limits();
        let cancel = CancellationToken::new();
        let teardown = AsyncTeardownCollector::new();

        let run = async {
            // A previous probe may have died half way.
            self.sandbox
                .cleanup(slot)
                .await
                .map_err(|e| format!("reset failed: {}", e))?;
            teardown.add(Arc::new(SandboxGuard::new(self.sandbox.clone(), slot)));
            self.sandbox
                .initialize(slot, &limits)
                .await
                .map_err(|e| format!("initialize failed: {}", e))?;
            let req = RunRequest::new(self.cfg.health.probe_command.clone());
            let res = self
                .sandbox
                .execute(slot, &req, &limits, &cancel)
                .await
                .map_err(|e| format!("execute failed: {}", e))?;
            if res.is_success() {
                Ok(())
            } else {
                Err(format!(
                    "probe command `{}` failed: exit {:?}, signal {:?}, violation {:?}",
                    req.display(),
                    res.exit_code,
                    res.signal,
                    res.violation
                ))
            }
        };
        let res = run.await;
        teardown.teardown_all().await;
        res
    }
}

async fn timed<F>(fut: F) -> CheckResult
where
    F: std::future::Future<Output = Result<(), String>>,
{
    let started = Instant::now();
    let res = fut.await;
    CheckResult {
        passed: res.is_ok(),
        detail: res.err(),
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

async fn check_filesystem(dir: &Path) -> Result<(), String> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| format!("cannot create {}: {}", dir.display(), e))?;
    let file = dir.join(format!(".health_check_{}", std::process::id()));
    tokio::fs::write(&file, b"ok")
        .await
        .map_err(|e| format!("{} is not writable: {}", dir.display(), e))?;
    let _ = tokio::fs::remove_file(&file).await;
    Ok(())
}

async fn check_memory(min_free_mb: u64) -> Result<(), String> {
    let raw = match tokio::fs::read_to_string("/proc/meminfo").await {
        Ok(raw) => raw,
        // Not Linux; nothing to measure.
        Err(_) => return Ok(()),
    };
    let available_kb = parse_meminfo(&raw, "MemAvailable")
        .ok_or_else(|| "MemAvailable missing from /proc/meminfo".to_string())?;
    let min_kb = min_free_mb * 1024;
    if available_kb < min_kb {
        Err(format!(
            "{} MiB available, {} MiB required",
            available_kb / 1024,
            min_free_mb
        ))
    } else {
        Ok(())
    }
}

/// Value in kB of one `/proc/meminfo` field.
fn parse_meminfo(raw: &str, key: &str) -> Option<u64> {
    raw.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        if k.trim() != key {
            return None;
        }
        v.split_whitespace().next()?.parse().ok()
    })
}

async fn read_trimmed(path: &str) -> Option<String> {
    tokio::fs::read_to_string(path)
        .await
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

async fn system_info() -> SystemInfo {
    SystemInfo {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        cpus: std::thread::available_parallelism().map_or(1, |n| n.get()),
        version: env!("CARGO_PKG_VERSION").to_string(),
        hostname: read_trimmed("/proc/sys/kernel/hostname").await,
        kernel: read_trimmed("/proc/sys/kernel/osrelease").await,
    }
}

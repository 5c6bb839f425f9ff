//! Primary isolation layer: a wrapper around the `isolate` command line tool.
//!
//! Each slot maps to one isolate box (`--box-id`). The box is created on
//! [`Sandbox::initialize`], reused for every command of the same submission,
//! and destroyed on [`Sandbox::cleanup`]. Resource accounting comes from the
//! meta file isolate writes after each run; verdict-relevant limit kinds are
//! decided from those measurements, never from the exit code alone.

use std::{borrow::Cow, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use super::{
    err::SandboxError,
    launch::Launcher,
    model::{
        ExecutionResult, ExitStatus, LaunchOptions, LaunchOptionsBuilder, LimitViolation,
        ProcessOutput, ResourceLimits, RunRequest, SlotId,
    },
    Sandbox,
};
use crate::util::path_security::enforce_box_path;

/// `SIGXFSZ`: raised when a process writes past `--fsize`.
const SIGXFSZ: i32 = 25;

/// Timeout for the short bookkeeping commands (init, cleanup, meta reading).
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct IsolateOptions {
    /// Path or name of the isolate binary.
    pub binary: String,
    /// Use the cgroup-based memory accounting (`--cg`).
    pub use_cgroups: bool,
    /// Grace period after the wall-clock limit before the host kills isolate
    /// itself. Also passed as `--extra-time`.
    pub kill_grace: Duration,
    /// `PATH` inside the box.
    pub box_path_env: String,
}

impl Default for IsolateOptions {
    fn default() -> Self {
        IsolateOptions {
            binary: "isolate".into(),
            use_cgroups: true,
            kill_grace: Duration::from_millis(500),
            box_path_env: "/usr/local/bin:/usr/bin:/bin".into(),
        }
    }
}

pub struct IsolateSandbox {
    opts: IsolateOptions,
    launcher: Arc<dyn Launcher>,
    /// Box root directories reported by `isolate --init`, by slot.
    boxes: DashMap<SlotId, String>,
}

impl IsolateSandbox {
    pub fn new(opts: IsolateOptions, launcher: Arc<dyn Launcher>) -> Self {
        IsolateSandbox {
            opts,
            launcher,
            boxes: DashMap::new(),
        }
    }

    fn base_args(&self, slot: SlotId) -> Vec<String> {
        let mut args = vec![self.opts.binary.clone(), format!("--box-id={}", slot)];
        if self.opts.use_cgroups {
            args.push("--cg".into());
        }
        args
    }

    fn box_root(&self, slot: SlotId) -> Result<String, SandboxError> {
        self.boxes
            .get(&slot)
            .map(|r| r.value().clone())
            .ok_or(SandboxError::NotInitialized(slot))
    }

    /// Build the `isolate --run` command line for one request.
    pub fn run_args(
        &self,
        slot: SlotId,
        meta_path: &str,
        req: &RunRequest,
        limits: &ResourceLimits,
    ) -> Vec<String> {
        let mut args = self.base_args(slot);
        args.push("--silent".into());
        args.push(format!("--meta={}", meta_path));
        args.push(format!("--time={}", secs(limits.cpu_time_ms)));
        args.push(format!("--wall-time={}", secs(limits.wall_time_ms)));
        args.push(format!(
            "--extra-time={}",
            secs(self.opts.kill_grace.as_millis() as u64)
        ));
        if self.opts.use_cgroups {
            args.push(format!("--cg-mem={}", limits.memory_kb));
        } else {
            args.push(format!("--mem={}", limits.memory_kb));
        }
        args.push(format!("--processes={}", limits.max_processes));
        args.push(format!("--fsize={}", limits.output_limit_kb));
        args.push(format!("--env=PATH={}", self.opts.box_path_env));
        args.push("--run".into());
        args.push("--".into());
        args.extend(req.argv.iter().cloned());
        args
    }

    async fn control(
        &self,
        slot: SlotId,
        argv: &[String],
        stdin: Option<Bytes>,
    ) -> Result<ProcessOutput, SandboxError> {
        let opt = LaunchOptionsBuilder::default()
            .deadline(CONTROL_TIMEOUT)
            .build()
            .map_err(|e| SandboxError::Exec(e.to_string()))?;
        // Bookkeeping commands must not be interrupted halfway; the caller's
        // cancellation only applies to the sandboxed program itself.
        self.launcher
            .launch(slot, argv, stdin, &opt, &CancellationToken::new())
            .await
    }

    async fn read_meta(&self, slot: SlotId, meta_path: &str) -> Result<IsolateMeta, SandboxError> {
        let out = self
            .control(slot, &["cat".to_string(), meta_path.to_string()], None)
            .await?;
        if out.status != ExitStatus::ReturnCode(0) {
            return Err(SandboxError::Exec(format!(
                "meta file {} unreadable: {}",
                meta_path,
                out.stderr_lossy().trim()
            )));
        }
        out.stdout_lossy()
            .parse()
            .map_err(|e| SandboxError::Exec(format!("bad meta file: {}", e)))
    }
}

#[async_trait]
impl Sandbox for IsolateSandbox {
    fn name(&self) -> Cow<'static, str> {
        format!("isolate via {}", self.launcher.name()).into()
    }

    async fn available(&self) -> Result<(), SandboxError> {
        let argv = [self.opts.binary.clone(), "--version".to_string()];
        match self.control(0, &argv, None).await {
            Ok(out) if out.status == ExitStatus::ReturnCode(0) => Ok(()),
            Ok(out) => Err(SandboxError::Exec(format!(
                "`{} --version` exited with {:?}",
                self.opts.binary, out.status
            ))),
            Err(e) => Err(SandboxError::Exec(format!(
                "`{}` is not reachable: {}",
                self.opts.binary, e
            ))),
        }
    }

    async fn initialize(&self, slot: SlotId, limits: &ResourceLimits) -> Result<(), SandboxError> {
        limits
            .validate()
            .map_err(|e| SandboxError::Init(slot, e))?;
        let mut argv = self.base_args(slot);
        argv.push("--init".into());
        let out = self
            .control(slot, &argv, None)
            .await
            .map_err(|e| SandboxError::Init(slot, e.to_string()))?;
        if out.status != ExitStatus::ReturnCode(0) {
            return Err(SandboxError::Init(
                slot,
                format!("{:?}: {}", out.status, out.stderr_lossy().trim()),
            ));
        }
        let root = out.stdout_lossy().trim().to_string();
        if root.is_empty() {
            return Err(SandboxError::Init(slot, "isolate reported no box path".into()));
        }
        tracing::debug!(slot, %root, "isolate box initialized");
        self.boxes.insert(slot, root);
        Ok(())
    }

    async fn place_file(&self, slot: SlotId, path: &str, content: Bytes) -> Result<(), SandboxError> {
        enforce_box_path(path).map_err(SandboxError::BadPath)?;
        let target = format!("{}/box/{}", self.box_root(slot)?, path);
        let argv = [
            "sh".to_string(),
            "-c".to_string(),
            r#"mkdir -p "$(dirname "$1")" && cat > "$1""#.to_string(),
            "isojudge-place".to_string(),
            target.clone(),
        ];
        let out = self.control(slot, &argv, Some(content)).await?;
        if out.status != ExitStatus::ReturnCode(0) {
            return Err(SandboxError::Exec(format!(
                "failed to write {}: {}",
                target,
                out.stderr_lossy().trim()
            )));
        }
        Ok(())
    }

    async fn execute(
        &self,
        slot: SlotId,
        req: &RunRequest,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        let meta_path = format!("{}/meta", self.box_root(slot)?);
        let argv = self.run_args(slot, &meta_path, req, limits);

        // Isolate enforces the wall limit itself; the host deadline only
        // catches isolate hanging.
        let deadline = limits.wall_time() + self.opts.kill_grace * 2;
        let opt = LaunchOptions {
            stdout_size_limit: limits.output_limit_bytes(),
            stderr_size_limit: limits.output_limit_bytes().min(64 * 1024),
            deadline: Some(deadline),
        };

        tracing::debug!(slot, command = %req.display(), "running in isolate");
        let out = self
            .launcher
            .launch(slot, &argv, req.stdin.clone(), &opt, cancel)
            .await?;

        if out.status == ExitStatus::Timeout {
            tracing::warn!(slot, "isolate did not return before the host deadline");
            return Ok(ExecutionResult {
                wall_time_ms: out.wall_time.as_millis() as u64,
                violation: Some(LimitViolation::WallTime),
                ..Default::default()
            });
        }

        let meta = match self.read_meta(slot, &meta_path).await {
            Ok(meta) => meta,
            // Killed on output overflow before isolate could write its meta file.
            Err(_) if out.stdout_overflow => IsolateMeta::default(),
            Err(e) => return Err(e),
        };

        if meta.status == Some(MetaStatus::InternalError) || out.status.code().unwrap_or(0) > 1 {
            return Err(SandboxError::Exec(format!(
                "isolate internal error ({:?}): {}",
                out.status,
                meta.message.as_deref().unwrap_or("no message")
            )));
        }

        let violation = classify(&meta, limits, out.stdout_overflow);
        let exit_code = match (meta.exit_code, &meta.status, meta.exit_sig) {
            (Some(c), _, _) => Some(c),
            (None, None, None) => Some(0),
            _ => None,
        };

        Ok(ExecutionResult {
            exit_code,
            signal: meta.exit_sig,
            stdout: out.stdout.clone(),
            stderr: out.stderr_lossy(),
            stdout_truncated: out.stdout_overflow,
            wall_time_ms: meta.wall_ms,
            cpu_time_ms: meta.time_ms,
            memory_kb: meta.peak_memory_kb(),
            violation,
        })
    }

    async fn cleanup(&self, slot: SlotId) -> Result<(), SandboxError> {
        let mut argv = self.base_args(slot);
        argv.push("--cleanup".into());
        self.boxes.remove(&slot);
        let out = self.control(slot, &argv, None).await?;
        if out.status != ExitStatus::ReturnCode(0) {
            return Err(SandboxError::Cleanup(
                slot,
                format!("{:?}: {}", out.status, out.stderr_lossy().trim()),
            ));
        }
        Ok(())
    }
}

fn secs(ms: u64) -> String {
    format!("{}.{:03}", ms / 1000, ms % 1000)
}

/// Decide which ceiling, if any, a run hit.
///
/// Order matters: a program killed for writing too much is an output
/// violation even if it also ran long; a program that reached the memory
/// ceiling is a memory violation even if the kernel only reported a generic
/// kill signal.
pub fn classify(
    meta: &IsolateMeta,
    limits: &ResourceLimits,
    stdout_overflow: bool,
) -> Option<LimitViolation> {
    if stdout_overflow || meta.exit_sig == Some(SIGXFSZ) {
        return Some(LimitViolation::Output);
    }
    if meta.cg_oom_killed || meta.peak_memory_kb() >= limits.memory_kb {
        return Some(LimitViolation::Memory);
    }
    if meta.time_ms >= limits.cpu_time_ms {
        return Some(LimitViolation::CpuTime);
    }
    if meta.status == Some(MetaStatus::TimedOut) || meta.wall_ms >= limits.wall_time_ms {
        return Some(LimitViolation::WallTime);
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaStatus {
    /// `RE`: exited with a non-zero code.
    RuntimeError,
    /// `SG`: died on a signal.
    Signaled,
    /// `TO`: timed out.
    TimedOut,
    /// `XX`: isolate itself failed.
    InternalError,
}

/// Parsed contents of an isolate meta file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IsolateMeta {
    pub time_ms: u64,
    pub wall_ms: u64,
    pub max_rss_kb: u64,
    pub cg_mem_kb: Option<u64>,
    pub cg_oom_killed: bool,
    pub exit_code: Option<i32>,
    pub exit_sig: Option<i32>,
    pub killed: bool,
    pub status: Option<MetaStatus>,
    pub message: Option<String>,
}

impl IsolateMeta {
    /// Peak memory as measured by the best available source.
    pub fn peak_memory_kb(&self) -> u64 {
        self.cg_mem_kb.unwrap_or(self.max_rss_kb)
    }
}

fn parse_secs_as_ms(v: &str) -> Result<u64, String> {
    let secs: f64 = v.parse().map_err(|_| format!("bad duration `{}`", v))?;
    Ok((secs * 1000.0).round() as u64)
}

fn parse_num<T: FromStr>(key: &str, v: &str) -> Result<T, String> {
    v.parse()
        .map_err(|_| format!("bad value `{}` for `{}`", v, key))
}

impl FromStr for IsolateMeta {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut meta = IsolateMeta::default();
        for line in s.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| format!("malformed line `{}`", line))?;
            match key {
                "time" => meta.time_ms = parse_secs_as_ms(value)?,
                "time-wall" => meta.wall_ms = parse_secs_as_ms(value)?,
                "max-rss" => meta.max_rss_kb = parse_num(key, value)?,
                "cg-mem" => meta.cg_mem_kb = Some(parse_num(key, value)?),
                "cg-oom-killed" => meta.cg_oom_killed = value == "1",
                "exitcode" => meta.exit_code = Some(parse_num(key, value)?),
                "exitsig" => meta.exit_sig = Some(parse_num(key, value)?),
                "killed" => meta.killed = value == "1",
                "status" => {
                    meta.status = Some(match value {
                        "RE" => MetaStatus::RuntimeError,
                        "SG" => MetaStatus::Signaled,
                        "TO" => MetaStatus::TimedOut,
                        "XX" => MetaStatus::InternalError,
                        other => return Err(format!("unknown status `{}`", other)),
                    })
                }
                "message" => meta.message = Some(value.to_string()),
                // csw-voluntary, csw-forced and friends carry nothing we use.
                _ => {}
            }
        }
        Ok(meta)
    }
}

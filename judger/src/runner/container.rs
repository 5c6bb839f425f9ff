//! Secondary isolation layer: one Docker container per slot.
//!
//! The container is coarse. It caps memory, process count and CPU share of
//! everything running for the slot (including `isolate` itself) and cuts the
//! network, so a bug in the primary layer still lands inside a disposable
//! container. Commands reach the container through `docker exec`, which is
//! also how the primary layer is driven when the two are stacked.

use std::{borrow::Cow, collections::HashMap, time::Duration};

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
        StartContainerOptions,
    },
    exec::{CreateExecOptions, StartExecOptions, StartExecResults},
    service::HostConfig,
    Docker,
};
use bytes::Bytes;
use futures::StreamExt;
use tokio::{io::AsyncWriteExt, time::Instant};
use tokio_util::sync::CancellationToken;

use super::{
    err::SandboxError,
    launch::{bounded, Bounded, Launcher, SizeConstraintBytesMut},
    model::{
        ExecutionResult, ExitStatus, LaunchOptions, LaunchOptionsBuilder, LimitViolation,
        ProcessOutput, ResourceLimits, RunRequest, SlotId,
    },
    util::is_recoverable_error,
    Sandbox,
};
use crate::{config::ContainerConfig, util::path_security::enforce_box_path};

/// Working directory of commands run directly in the container.
const WORKDIR: &str = "/judge";

pub struct ContainerLayer {
    docker: Docker,
    cfg: ContainerConfig,
}

impl ContainerLayer {
    pub fn new(docker: Docker, cfg: ContainerConfig) -> Self {
        ContainerLayer { docker, cfg }
    }

    pub fn container_name(&self, slot: SlotId) -> String {
        format!("{}-slot-{}", self.cfg.name_prefix, slot)
    }

    async fn remove(&self, name: &str) -> Result<(), bollard::errors::Error> {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            other => other,
        }
    }

    /// Stop a running exec. Docker has no API for this, so the process is
    /// signalled through its host pid, falling back to killing the whole
    /// container when that is not possible (remote daemon, missing
    /// privileges). The container is recreated on the next `initialize`.
    async fn kill_exec(&self, container: &str, exec_id: &str) {
        let pid = match self.docker.inspect_exec(exec_id).await {
            Ok(res) if res.running == Some(true) => res.pid,
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(%container, error = %e, "failed to inspect exec before killing it");
                None
            }
        };
        if let Some(pid) = pid.filter(|p| *p > 0) {
            // SAFETY: plain syscall on a pid reported by the daemon.
            if unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) } == 0 {
                return;
            }
        }
        tracing::warn!(%container, "cannot signal exec directly, killing container");
        if let Err(e) = self
            .docker
            .kill_container(container, Some(KillContainerOptions { signal: "KILL" }))
            .await
        {
            tracing::warn!(%container, error = %e, "failed to kill container");
        }
    }

    async fn exec_status(&self, exec_id: &str) -> Result<ExitStatus, SandboxError> {
        // The attached stream may close slightly before the daemon records
        // the exit code.
        for _ in 0..20 {
            let res = self.docker.inspect_exec(exec_id).await?;
            if res.running != Some(true) {
                return Ok(res
                    .exit_code
                    .map_or(ExitStatus::Unknown, ExitStatus::ReturnCode));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        Ok(ExitStatus::Unknown)
    }
}

#[async_trait]
impl Launcher for ContainerLayer {
    fn name(&self) -> Cow<'static, str> {
        format!("container {}", self.cfg.image).into()
    }

    async fn launch(
        &self,
        slot: SlotId,
        argv: &[String],
        stdin: Option<Bytes>,
        opt: &LaunchOptions,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, SandboxError> {
        if argv.is_empty() {
            return Err(SandboxError::Exec("empty command line".into()));
        }
        let container = self.container_name(slot);
        let started = Instant::now();
        let deadline = opt.deadline.map(|d| started + d);

        let exec = self
            .docker
            .create_exec(
                &container,
                CreateExecOptions {
                    attach_stdin: Some(stdin.is_some()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(false),
                    cmd: Some(argv.to_vec()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404 | 409,
                    ..
                } => SandboxError::SlotGone(slot),
                e => SandboxError::from(e),
            })?;

        let (mut output, mut input) = match self
            .docker
            .start_exec(&exec.id, Some(StartExecOptions { detach: false }))
            .await?
        {
            StartExecResults::Attached { output, input } => (output, input),
            StartExecResults::Detached => {
                return Err(SandboxError::Exec("exec was started detached".into()))
            }
        };

        tokio::spawn(async move {
            if let Some(data) = stdin {
                let _ = input.write_all(&data).await;
            }
            let _ = input.shutdown().await;
        });

        let collect = async {
            let mut stdout = SizeConstraintBytesMut::new(opt.stdout_size_limit);
            let mut stderr = SizeConstraintBytesMut::new(opt.stderr_size_limit);
            while let Some(item) = output.next().await {
                match item {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.append(&message);
                        if stdout.is_overflowed() {
                            break;
                        }
                    }
                    Ok(LogOutput::StdErr { message }) => stderr.append(&message),
                    Ok(_) => {}
                    Err(e) if is_recoverable_error(&e) => continue,
                    Err(e) => return Err(SandboxError::from(e)),
                }
            }
            Ok((stdout, stderr))
        };

        let (stdout, stderr) = match bounded(collect, deadline, cancel).await {
            Bounded::Done(res) => res?,
            Bounded::Cancelled => {
                self.kill_exec(&container, &exec.id).await;
                return Err(SandboxError::Cancelled);
            }
            Bounded::TimedOut => {
                self.kill_exec(&container, &exec.id).await;
                return Ok(ProcessOutput {
                    status: ExitStatus::Timeout,
                    stdout: Bytes::new(),
                    stderr: Bytes::new(),
                    stdout_overflow: false,
                    wall_time: started.elapsed(),
                });
            }
        };

        let stdout_overflow = stdout.is_overflowed();
        if stdout_overflow {
            self.kill_exec(&container, &exec.id).await;
        }
        let status = self.exec_status(&exec.id).await?;

        Ok(ProcessOutput {
            status,
            stdout: stdout.into_bytes(),
            stderr: stderr.into_bytes(),
            stdout_overflow,
            wall_time: started.elapsed(),
        })
    }
}

#[async_trait]
impl Sandbox for ContainerLayer {
    fn name(&self) -> Cow<'static, str> {
        format!("docker ({})", self.cfg.image).into()
    }

    fn ceiling(&self) -> Option<ResourceLimits> {
        Some(self.cfg.ceiling())
    }

    /// The daemon answers and the slot image is present. Never touches a
    /// slot container.
    async fn available(&self) -> Result<(), SandboxError> {
        self.docker.ping().await?;
        self.docker
            .inspect_image(&self.cfg.image)
            .await
            .map_err(|e| SandboxError::Exec(format!("image {}: {}", self.cfg.image, e)))?;
        Ok(())
    }

    async fn initialize(&self, slot: SlotId, limits: &ResourceLimits) -> Result<(), SandboxError> {
        limits
            .validate()
            .map_err(|e| SandboxError::Init(slot, e))?;
        let name = self.container_name(slot);
        let init_err = |e: bollard::errors::Error| SandboxError::Init(slot, e.to_string());

        // A container surviving from an earlier run of this slot is stale.
        self.remove(&name).await.map_err(init_err)?;

        let memory = (self.cfg.memory_mb as i64).saturating_mul(1024 * 1024);
        let mut labels = HashMap::new();
        labels.insert("isojudge.slot".to_string(), slot.to_string());

        self.docker
            .create_container(
                Some(CreateContainerOptions { name: name.clone() }),
                Config {
                    image: Some(self.cfg.image.clone()),
                    entrypoint: Some(vec!["sh".into()]),
                    tty: Some(true),
                    open_stdin: Some(true),
                    working_dir: Some(WORKDIR.into()),
                    labels: Some(labels),
                    network_disabled: Some(!self.cfg.network_enabled),
                    host_config: Some(HostConfig {
                        memory: Some(memory),
                        // No swap on top of the memory ceiling.
                        memory_swap: Some(memory),
                        pids_limit: Some(self.cfg.pids_limit),
                        nano_cpus: Some((self.cfg.cpu_cores * 1e9) as i64),
                        privileged: Some(self.cfg.privileged),
                        init: Some(true),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .map_err(init_err)?;

        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(init_err)?;
        tracing::debug!(slot, container = %name, "slot container started");
        Ok(())
    }

    async fn place_file(&self, slot: SlotId, path: &str, content: Bytes) -> Result<(), SandboxError> {
        enforce_box_path(path).map_err(SandboxError::BadPath)?;
        let argv = [
            "sh".to_string(),
            "-c".to_string(),
            r#"mkdir -p "$(dirname "$1")" && cat > "$1""#.to_string(),
            "isojudge-place".to_string(),
            format!("{}/{}", WORKDIR, path),
        ];
        let out = self
            .launch(
                slot,
                &argv,
                Some(content),
                &LaunchOptions::default(),
                &CancellationToken::new(),
            )
            .await?;
        if out.status != ExitStatus::ReturnCode(0) {
            return Err(SandboxError::Exec(format!(
                "failed to write {}: {}",
                path,
                out.stderr_lossy().trim()
            )));
        }
        Ok(())
    }

    /// Runs directly in the container. Only wall time and output volume are
    /// measured at this level; memory is judged from the container's OOM
    /// state in `reconcile`.
    async fn execute(
        &self,
        slot: SlotId,
        req: &RunRequest,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        let opt = LaunchOptionsBuilder::default()
            .stdout_size_limit(limits.output_limit_bytes())
            .stderr_size_limit(limits.output_limit_bytes().min(64 * 1024))
            .deadline(limits.wall_time())
            .build()
            .map_err(|e| SandboxError::Exec(e.to_string()))?;
        let out = self
            .launch(slot, &req.argv, req.stdin.clone(), &opt, cancel)
            .await?;
        let wall_time_ms = out.wall_time.as_millis() as u64;
        let violation = if out.stdout_overflow {
            Some(LimitViolation::Output)
        } else if out.status == ExitStatus::Timeout {
            Some(LimitViolation::WallTime)
        } else {
            None
        };
        let (exit_code, signal) = match out.status {
            // Docker reports death by signal as 128 + signal.
            ExitStatus::ReturnCode(c) if c > 128 && c < 160 => (None, Some((c - 128) as i32)),
            ExitStatus::ReturnCode(c) => (Some(c as i32), None),
            _ => (None, None),
        };
        let res = ExecutionResult {
            exit_code,
            signal,
            stdout: out.stdout.clone(),
            stderr: out.stderr_lossy(),
            stdout_truncated: out.stdout_overflow,
            wall_time_ms,
            cpu_time_ms: 0,
            memory_kb: 0,
            violation,
        };
        self.reconcile(slot, res).await
    }

    /// Docker only records an OOM kill once it took the container down; when
    /// that happened the run is a memory violation regardless of what the
    /// inner layer measured before dying.
    async fn reconcile(
        &self,
        slot: SlotId,
        mut res: ExecutionResult,
    ) -> Result<ExecutionResult, SandboxError> {
        let name = self.container_name(slot);
        let info = self
            .docker
            .inspect_container(&name, None::<bollard::container::InspectContainerOptions>)
            .await?;
        let state = info.state.unwrap_or_default();
        if state.oom_killed == Some(true) {
            tracing::info!(slot, container = %name, "container was OOM-killed");
            if res.violation != Some(LimitViolation::Output) {
                res.violation = Some(LimitViolation::Memory);
                res.memory_kb = res.memory_kb.max(self.cfg.memory_mb * 1024);
            }
        } else if state.running == Some(false) {
            return Err(SandboxError::Exec(format!(
                "container {} stopped unexpectedly",
                name
            )));
        }
        Ok(res)
    }

    async fn cleanup(&self, slot: SlotId) -> Result<(), SandboxError> {
        self.remove(&self.container_name(slot))
            .await
            .map_err(|e| SandboxError::Cleanup(slot, e.to_string()))
    }
}

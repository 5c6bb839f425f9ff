//! Starting processes on behalf of a sandbox layer.
//!
//! A [`Launcher`] knows how to start one command line somewhere (on the host,
//! or inside a container that wraps a slot), feed its stdin, capture bounded
//! output and stop it on a deadline or on cancellation. Sandbox layers build
//! their own command lines and hand them to a launcher, so the same `isolate`
//! wrapper works both directly on the host and inside a container.

use std::{borrow::Cow, process::Stdio};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::Future;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::Command,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use super::{
    err::SandboxError,
    model::{ExitStatus, LaunchOptions, ProcessOutput, SlotId},
};

#[async_trait]
pub trait Launcher: Send + Sync {
    /// Name of this launcher, used in logs.
    fn name(&self) -> Cow<'static, str>;

    /// Run `argv` to completion, deadline or cancellation.
    ///
    /// Cancellation kills the process and returns [`SandboxError::Cancelled`].
    /// Hitting the deadline kills the process and returns
    /// [`ExitStatus::Timeout`].
    async fn launch(
        &self,
        slot: SlotId,
        argv: &[String],
        stdin: Option<Bytes>,
        opt: &LaunchOptions,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, SandboxError>;
}

/// Launches processes directly on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostLauncher;

#[async_trait]
impl Launcher for HostLauncher {
    fn name(&self) -> Cow<'static, str> {
        "host".into()
    }

    async fn launch(
        &self,
        _slot: SlotId,
        argv: &[String],
        stdin: Option<Bytes>,
        opt: &LaunchOptions,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, SandboxError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SandboxError::Exec("empty command line".into()))?;

        let started = Instant::now();
        let deadline = opt.deadline.map(|d| started + d);

        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let (Some(mut pipe), Some(data)) = (child.stdin.take(), stdin) {
            tokio::spawn(async move {
                // The program may exit without reading all of its input.
                let _ = pipe.write_all(&data).await;
                let _ = pipe.shutdown().await;
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Exec("stdout was not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Exec("stderr was not captured".into()))?;

        let io = async {
            tokio::join!(
                drain(stdout, opt.stdout_size_limit, true),
                drain(stderr, opt.stderr_size_limit, false)
            )
        };

        let (stdout, stderr) = match bounded(io, deadline, cancel).await {
            Bounded::Done((out, err)) => (out?, err?),
            Bounded::Cancelled => {
                let _ = child.kill().await;
                return Err(SandboxError::Cancelled);
            }
            Bounded::TimedOut => {
                let _ = child.kill().await;
                return Ok(timed_out(started));
            }
        };

        let stdout_overflow = stdout.is_overflowed();
        if stdout_overflow {
            tracing::debug!(%program, "stdout over limit, killing process");
            let _ = child.kill().await;
        }

        let status = match bounded(child.wait(), deadline, cancel).await {
            Bounded::Done(status) => status?,
            Bounded::Cancelled => {
                let _ = child.kill().await;
                return Err(SandboxError::Cancelled);
            }
            Bounded::TimedOut => {
                let _ = child.kill().await;
                return Ok(timed_out(started));
            }
        };

        Ok(ProcessOutput {
            status: exit_status(status),
            stdout: stdout.into_bytes(),
            stderr: stderr.into_bytes(),
            stdout_overflow,
            wall_time: started.elapsed(),
        })
    }
}

fn timed_out(started: Instant) -> ProcessOutput {
    ProcessOutput {
        status: ExitStatus::Timeout,
        stdout: Bytes::new(),
        stderr: Bytes::new(),
        stdout_overflow: false,
        wall_time: started.elapsed(),
    }
}

pub(crate) enum Bounded<T> {
    Done(T),
    TimedOut,
    Cancelled,
}

/// Wait for `fut` unless the deadline passes or `cancel` fires first.
pub(crate) async fn bounded<F: Future>(
    fut: F,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
) -> Bounded<F::Output> {
    let sleep = async move {
        match deadline {
            Some(d) => tokio::time::sleep_until(d).await,
            None => futures::future::pending::<()>().await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Bounded::Cancelled,
        _ = sleep => Bounded::TimedOut,
        v = fut => Bounded::Done(v),
    }
}

/// Read a stream to its end, keeping at most `limit` bytes. With
/// `stop_on_overflow` the read stops as soon as the limit is passed so the
/// caller can kill the writer.
async fn drain<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
    stop_on_overflow: bool,
) -> std::io::Result<SizeConstraintBytesMut> {
    let mut buf = SizeConstraintBytesMut::new(limit);
    let mut chunk = vec![0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.append(&chunk[..n]);
        if stop_on_overflow && buf.is_overflowed() {
            break;
        }
    }
    Ok(buf)
}

fn exit_status(status: std::process::ExitStatus) -> ExitStatus {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return ExitStatus::Signal(sig as u32);
        }
    }
    status
        .code()
        .map_or(ExitStatus::Unknown, |c| ExitStatus::ReturnCode(c as i64))
}

/// A byte buffer that silently stops growing at `size_limit`, remembering
/// whether anything was cut.
pub(crate) struct SizeConstraintBytesMut {
    size_limit: usize,
    bytes: BytesMut,
    overflowed: bool,
}

impl SizeConstraintBytesMut {
    pub fn new(size_limit: usize) -> Self {
        SizeConstraintBytesMut {
            size_limit,
            bytes: BytesMut::new(),
            overflowed: false,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        let room = self.size_limit.saturating_sub(self.bytes.len());
        if bytes.len() > room {
            self.bytes.extend_from_slice(&bytes[..room]);
            self.overflowed = true;
        } else {
            self.bytes.extend_from_slice(bytes);
        }
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes.freeze()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::runner::model::LaunchOptionsBuilder;
    use std::time::Duration;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[test]
    fn size_constraint_cuts_at_limit() {
        let mut buf = SizeConstraintBytesMut::new(5);
        buf.append(b"abc");
        assert!(!buf.is_overflowed());
        buf.append(b"defg");
        assert!(buf.is_overflowed());
        buf.append(b"hij");
        assert_eq!(&buf.into_bytes()[..], b"abcde");
    }

    #[tokio::test]
    async fn captures_stdout_stderr_and_exit_code() {
        let out = HostLauncher
            .launch(
                0,
                &sh("cat; echo oops >&2; exit 3"),
                Some(Bytes::from_static(b"0 1\n")),
                &LaunchOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.status, ExitStatus::ReturnCode(3));
        assert_eq!(out.stdout_lossy(), "0 1\n");
        assert_eq!(out.stderr_lossy(), "oops\n");
        assert!(!out.stdout_overflow);
    }

    #[tokio::test]
    async fn busy_loop_is_killed_at_deadline() {
        let opt = LaunchOptionsBuilder::default()
            .deadline(Duration::from_millis(300))
            .build()
            .unwrap();
        let started = std::time::Instant::now();
        let out = HostLauncher
            .launch(
                0,
                &sh("while :; do :; done"),
                None,
                &opt,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.status, ExitStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn runaway_output_is_cut_and_killed() {
        let opt = LaunchOptionsBuilder::default()
            .stdout_size_limit(1024usize)
            .deadline(Duration::from_secs(10))
            .build()
            .unwrap();
        let out = HostLauncher
            .launch(0, &sh("yes"), None, &opt, &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.stdout_overflow);
        assert_eq!(out.stdout.len(), 1024);
        assert_ne!(out.status, ExitStatus::Timeout);
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let res = HostLauncher
            .launch(0, &sh("sleep 30"), None, &LaunchOptions::default(), &token)
            .await;
        assert!(matches!(res, Err(SandboxError::Cancelled)), "{:?}", res);
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let res = HostLauncher
            .launch(
                0,
                &[],
                None,
                &LaunchOptions::default(),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(res, Err(SandboxError::Exec(_))));
    }
}

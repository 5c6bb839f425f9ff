use bytes::Bytes;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identifier of one sandbox slot.
pub type SlotId = u32;

/// Resource ceilings of a single sandboxed execution.
///
/// Every execution step receives an explicit instance; there is no global
/// fallback applied behind the caller's back.
///
/// Serialized in camelCase on the wire; configuration files may use the
/// snake_case names. Every field must be present.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// Wall-clock limit, in milliseconds.
    #[serde(alias = "wall_time_ms")]
    pub wall_time_ms: u64,
    /// CPU time limit, in milliseconds.
    #[serde(alias = "cpu_time_ms")]
    pub cpu_time_ms: u64,
    /// Memory ceiling, in KiB.
    #[serde(alias = "memory_kb")]
    pub memory_kb: u64,
    /// Maximum number of processes and threads.
    #[serde(alias = "max_processes")]
    pub max_processes: u32,
    /// Maximum size of captured stdout, in KiB. Also bounds files written.
    #[serde(alias = "output_limit_kb")]
    pub output_limit_kb: u64,
}

impl ResourceLimits {
    pub fn wall_time(&self) -> Duration {
        Duration::from_millis(self.wall_time_ms)
    }

    pub fn cpu_time(&self) -> Duration {
        Duration::from_millis(self.cpu_time_ms)
    }

    pub fn output_limit_bytes(&self) -> usize {
        (self.output_limit_kb as usize).saturating_mul(1024)
    }

    /// Component-wise minimum of two limit sets. Used when two isolation
    /// layers are stacked: the tighter ceiling always applies.
    pub fn tighter(&self, other: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            wall_time_ms: self.wall_time_ms.min(other.wall_time_ms),
            cpu_time_ms: self.cpu_time_ms.min(other.cpu_time_ms),
            memory_kb: self.memory_kb.min(other.memory_kb),
            max_processes: self.max_processes.min(other.max_processes),
            output_limit_kb: self.output_limit_kb.min(other.output_limit_kb),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let zero = [
            ("wallTimeMs", self.wall_time_ms == 0),
            ("cpuTimeMs", self.cpu_time_ms == 0),
            ("memoryKb", self.memory_kb == 0),
            ("maxProcesses", self.max_processes == 0),
            ("outputLimitKb", self.output_limit_kb == 0),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, z)| *z) {
            return Err(format!("resource limit `{}` must be non-zero", name));
        }
        Ok(())
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        ResourceLimits {
            wall_time_ms: 3_000,
            cpu_time_ms: 1_000,
            memory_kb: 256 * 1024,
            max_processes: 1,
            output_limit_kb: 64 * 1024,
        }
    }
}

/// Which ceiling a run has hit, decided from measured resource usage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum LimitViolation {
    WallTime,
    CpuTime,
    Memory,
    Output,
}

impl LimitViolation {
    pub fn is_time(&self) -> bool {
        matches!(self, LimitViolation::WallTime | LimitViolation::CpuTime)
    }
}

/// The structured result of one sandboxed invocation. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Exit code, if the program exited on its own.
    pub exit_code: Option<i32>,
    /// Terminating signal, if the program was killed.
    pub signal: Option<i32>,
    /// Captured stdout, byte for byte.
    pub stdout: Bytes,
    pub stderr: String,
    /// Whether stdout was cut at the output ceiling.
    pub stdout_truncated: bool,
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    /// Peak memory, in KiB.
    pub memory_kb: u64,
    pub violation: Option<LimitViolation>,
}

impl ExecutionResult {
    /// Exited with status 0 and no ceiling was hit.
    pub fn is_success(&self) -> bool {
        self.violation.is_none() && self.signal.is_none() && self.exit_code == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// A command to run inside an initialized slot.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    /// Data fed to the program's stdin.
    pub stdin: Option<Bytes>,
}

impl RunRequest {
    pub fn new(argv: Vec<String>) -> Self {
        RunRequest { argv, stdin: None }
    }

    pub fn stdin(mut self, data: impl Into<Bytes>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// How a launched host process ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub enum ExitStatus {
    ReturnCode(i64),
    Signal(u32),
    /// Killed by the launcher after its deadline.
    Timeout,
    Unknown,
}

impl ExitStatus {
    pub fn code(&self) -> Option<i64> {
        match self {
            ExitStatus::ReturnCode(c) => Some(*c),
            _ => None,
        }
    }
}

/// The raw result of a process started by a [`super::launch::Launcher`].
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Bytes,
    pub stderr: Bytes,
    /// Stdout went past the output limit and the process was killed.
    pub stdout_overflow: bool,
    pub wall_time: Duration,
}

impl ProcessOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct LaunchOptions {
    #[builder(default = "100*1024")]
    pub stdout_size_limit: usize,

    #[builder(default = "100*1024")]
    pub stderr_size_limit: usize,

    /// Hard deadline after which the launched process is killed.
    #[builder(default, setter(into, strip_option))]
    pub deadline: Option<Duration>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        LaunchOptions {
            stdout_size_limit: 100 * 1024,
            stderr_size_limit: 100 * 1024,
            deadline: None,
        }
    }
}

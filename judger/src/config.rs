//! Startup configuration, read once from a TOML file.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use bollard::Docker;
use err_derive::Error;
use serde::{Deserialize, Serialize};

use crate::runner::{
    isolate::IsolateOptions,
    model::{ResourceLimits, SlotId},
    SandboxError,
};

/// Largest slot pool a single host is allowed to run.
pub const MAX_POOL_SIZE: u32 = 256;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(display = "Failed to read config file: {}", _0)]
    Io(#[error(source)] std::io::Error),

    #[error(display = "Malformed config file: {}", _0)]
    Toml(#[error(source)] toml::de::Error),

    #[error(display = "Invalid configuration: {}", _0)]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgerConfig {
    /// Folder for the spool queue, result log and other local state.
    pub cache_folder: PathBuf,
    /// Number of sandbox slots, `0..pool_size`.
    pub pool_size: u32,
    /// Number of concurrent workers. Defaults to, and may not exceed,
    /// `pool_size`.
    pub worker_count: Option<u32>,
    /// Slot reserved for health probes. Defaults to `pool_size`.
    pub probe_slot: Option<SlotId>,
    pub slot_acquire_timeout_ms: u64,
    /// How long in-flight jobs may keep running after shutdown is requested.
    pub shutdown_grace_ms: u64,
    pub limits: LimitsConfig,
    pub isolation: IsolationConfig,
    pub queue: QueueConfig,
    pub health: HealthConfig,
    pub languages: BTreeMap<String, LanguageProfile>,
}

impl Default for JudgerConfig {
    fn default() -> Self {
        JudgerConfig {
            cache_folder: default_cache_folder(),
            pool_size: 4,
            worker_count: None,
            probe_slot: None,
            slot_acquire_timeout_ms: 5_000,
            shutdown_grace_ms: 30_000,
            limits: Default::default(),
            isolation: Default::default(),
            queue: Default::default(),
            health: Default::default(),
            languages: default_languages(),
        }
    }
}

fn default_cache_folder() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".isojudge"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/isojudge"))
}

impl JudgerConfig {
    /// `config.toml` in the default cache folder.
    pub fn default_path() -> PathBuf {
        default_cache_folder().join("config.toml")
    }

    /// Read and validate a config file. Without a path the built-in defaults
    /// are used.
    pub fn load(path: Option<&Path>) -> Result<JudgerConfig, ConfigError> {
        let cfg = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                Self::from_toml_str(&raw)?
            }
            None => JudgerConfig::default(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(raw: &str) -> Result<JudgerConfig, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.pool_size == 0 || self.pool_size > MAX_POOL_SIZE {
            return invalid(format!(
                "pool_size must be within 1..={}, got {}",
                MAX_POOL_SIZE, self.pool_size
            ));
        }
        if let Some(workers) = self.worker_count {
            if workers == 0 || workers > self.pool_size {
                return invalid(format!(
                    "worker_count must be within 1..={} (pool_size), got {}",
                    self.pool_size, workers
                ));
            }
        }
        if self.probe_slot() < self.pool_size {
            return invalid(format!(
                "probe_slot {} collides with the job slot range 0..{}",
                self.probe_slot(),
                self.pool_size
            ));
        }
        for (name, limits) in [("run", &self.limits.run), ("compile", &self.limits.compile)] {
            limits
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("limits.{}: {}", name, e)))?;
        }
        if self.languages.is_empty() {
            return invalid("at least one language must be configured".into());
        }
        for (name, lang) in &self.languages {
            if lang.run.is_empty() {
                return invalid(format!("languages.{}: `run` is empty", name));
            }
            if matches!(&lang.compile, Some(c) if c.is_empty()) {
                return invalid(format!("languages.{}: `compile` is empty", name));
            }
            crate::util::path_security::enforce_box_path(&lang.source_file)
                .map_err(|e| ConfigError::Invalid(format!("languages.{}: {}", name, e)))?;
            if let Some(limits) = &lang.compile_limits {
                limits.validate().map_err(|e| {
                    ConfigError::Invalid(format!("languages.{}.compile_limits: {}", name, e))
                })?;
            }
        }
        if self.queue.max_attempts == 0 {
            return invalid("queue.max_attempts must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.queue.backoff_jitter) {
            return invalid("queue.backoff_jitter must be within 0.0..=1.0".into());
        }
        if self.health.probe_command.is_empty() {
            return invalid("health.probe_command is empty".into());
        }
        Ok(())
    }

    pub fn worker_count(&self) -> u32 {
        self.worker_count
            .unwrap_or(self.pool_size)
            .min(self.pool_size)
    }

    pub fn probe_slot(&self) -> SlotId {
        self.probe_slot.unwrap_or(self.pool_size)
    }

    pub fn slot_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.slot_acquire_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.queue
            .spool_dir
            .clone()
            .unwrap_or_else(|| self.cache_folder.join("spool"))
    }

    pub fn results_file(&self) -> PathBuf {
        self.cache_folder.join("results.jsonl")
    }
}

/// Limits applied to jobs that do not carry their own. They are copied into
/// the submission when the job is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub run: ResourceLimits,
    pub compile: ResourceLimits,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            run: ResourceLimits::default(),
            compile: ResourceLimits {
                wall_time_ms: 15_000,
                cpu_time_ms: 10_000,
                memory_kb: 512 * 1024,
                max_processes: 32,
                output_limit_kb: 16 * 1024,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    pub isolate_binary: String,
    pub use_cgroups: bool,
    pub kill_grace_ms: u64,
    /// `PATH` inside the box.
    pub box_path_env: String,
    /// Wrap every slot in a container as well. Absent means primary-only.
    pub container: Option<ContainerConfig>,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        let opts = IsolateOptions::default();
        IsolationConfig {
            isolate_binary: opts.binary,
            use_cgroups: opts.use_cgroups,
            kill_grace_ms: opts.kill_grace.as_millis() as u64,
            box_path_env: opts.box_path_env,
            container: None,
        }
    }
}

impl IsolationConfig {
    pub fn isolate_options(&self) -> IsolateOptions {
        IsolateOptions {
            binary: self.isolate_binary.clone(),
            use_cgroups: self.use_cgroups,
            kill_grace: Duration::from_millis(self.kill_grace_ms),
            box_path_env: self.box_path_env.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Image with `isolate` installed.
    pub image: String,
    /// Docker daemon address; the local socket when absent.
    pub docker_host: Option<String>,
    pub name_prefix: String,
    pub memory_mb: u64,
    pub pids_limit: i64,
    pub cpu_cores: f64,
    pub network_enabled: bool,
    /// `isolate` needs to create namespaces and cgroups inside the container.
    pub privileged: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        ContainerConfig {
            image: "isojudge/isolate:latest".into(),
            docker_host: None,
            name_prefix: "isojudge".into(),
            memory_mb: 1024,
            pids_limit: 256,
            cpu_cores: 1.0,
            network_enabled: false,
            privileged: true,
        }
    }
}

impl ContainerConfig {
    /// Limits the container imposes on anything running inside it.
    pub fn ceiling(&self) -> ResourceLimits {
        ResourceLimits {
            wall_time_ms: u64::MAX,
            cpu_time_ms: u64::MAX,
            memory_kb: self.memory_mb.saturating_mul(1024),
            max_processes: self.pids_limit.clamp(1, u32::MAX as i64) as u32,
            output_limit_kb: u64::MAX,
        }
    }

    pub fn connect(&self) -> Result<Docker, SandboxError> {
        let docker = match &self.docker_host {
            None => Docker::connect_with_local_defaults()?,
            Some(host) => Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)?,
        };
        Ok(docker)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Fraction of the delay randomly added or subtracted, `0.0..=1.0`.
    pub backoff_jitter: f64,
    pub dequeue_timeout_ms: u64,
    /// Consecutive critical jobs served before one pending default job gets
    /// a turn.
    pub critical_burst: u32,
    /// Spool queue directory. Defaults to `<cache_folder>/spool`.
    pub spool_dir: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            backoff_jitter: 0.2,
            dequeue_timeout_ms: 1_000,
            critical_burst: 4,
            spool_dir: None,
        }
    }
}

impl QueueConfig {
    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub probe_interval_ms: u64,
    /// Trivial command run inside the probe slot; must exit with 0.
    pub probe_command: Vec<String>,
    pub min_free_memory_mb: u64,
    /// Address of the HTTP health surface. Disabled when absent.
    pub listen: Option<SocketAddr>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            probe_interval_ms: 30_000,
            probe_command: vec!["/bin/true".into()],
            min_free_memory_mb: 256,
            listen: Some(SocketAddr::from(([127, 0, 0, 1], 9100))),
        }
    }
}

impl HealthConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

/// How to build and run one language inside a box. Commands are literal
/// argv vectors, run with the box as working directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LanguageProfile {
    /// Name the submitted source is written to.
    pub source_file: String,
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    pub run: Vec<String>,
    #[serde(default)]
    pub compile_limits: Option<ResourceLimits>,
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn default_languages() -> BTreeMap<String, LanguageProfile> {
    let mut langs = BTreeMap::new();
    langs.insert(
        "c".to_string(),
        LanguageProfile {
            source_file: "main.c".into(),
            compile: Some(argv(&[
                "/usr/bin/gcc", "-O2", "-std=c11", "-o", "main", "main.c", "-lm",
            ])),
            run: argv(&["./main"]),
            compile_limits: None,
        },
    );
    langs.insert(
        "cpp".to_string(),
        LanguageProfile {
            source_file: "main.cpp".into(),
            compile: Some(argv(&[
                "/usr/bin/g++", "-O2", "-std=c++17", "-o", "main", "main.cpp",
            ])),
            run: argv(&["./main"]),
            compile_limits: None,
        },
    );
    langs.insert(
        "python3".to_string(),
        LanguageProfile {
            source_file: "main.py".into(),
            // Syntax errors surface before any test runs.
            compile: Some(argv(&["/usr/bin/python3", "-m", "py_compile", "main.py"])),
            run: argv(&["/usr/bin/python3", "main.py"]),
            compile_limits: None,
        },
    );
    langs
}

//! A scriptable in-memory [`Sandbox`] for exercising the evaluator, the
//! worker pool and the health monitor without `isolate`.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::{
    borrow::Cow,
    collections::{BTreeMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use crate::{
    config::{JudgerConfig, LanguageProfile},
    prelude::CancellationToken,
    runner::{
        model::{ExecutionResult, LimitViolation, ResourceLimits, RunRequest, SlotId},
        Sandbox, SandboxError,
    },
    tester::model::{Submission, TestCaseSpec},
};

#[derive(Debug, Clone)]
enum Behavior {
    Finish(ExecutionResult),
    /// Runs until cancelled.
    Hang,
    Panic(String),
}

#[derive(Debug, Clone)]
struct Rule {
    cmd: String,
    stdin: Option<String>,
    behavior: Behavior,
}

/// Counters observed by tests.
#[derive(Debug, Default)]
pub struct MockStats {
    pub initialized: AtomicUsize,
    pub cleanups: DashMap<SlotId, usize>,
    pub executed: Mutex<Vec<String>>,
    /// Commands currently executing.
    pub running: AtomicUsize,
}

impl MockStats {
    pub fn cleanups_of(&self, slot: SlotId) -> usize {
        self.cleanups.get(&slot).map_or(0, |c| *c)
    }

    pub fn total_cleanups(&self) -> usize {
        self.cleanups.iter().map(|c| *c.value()).sum()
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn count_executed(&self, cmd: &str) -> usize {
        self.executed().iter().filter(|c| *c == cmd).count()
    }
}

pub struct MockSandbox {
    rules: Vec<Rule>,
    pub stats: Arc<MockStats>,
    init_failures: AtomicU32,
    unavailable: AtomicBool,
    live: Mutex<HashSet<SlotId>>,
    files: DashMap<(SlotId, String), Bytes>,
}

impl MockSandbox {
    pub fn new() -> MockSandbox {
        MockSandbox {
            rules: vec![],
            stats: Default::default(),
            init_failures: AtomicU32::new(0),
            unavailable: AtomicBool::new(false),
            live: Mutex::new(HashSet::new()),
            files: DashMap::new(),
        }
    }

    /// Script the result of running `cmd` (argv joined by spaces).
    pub fn when(&mut self, cmd: &str) -> RuleBuilder<'_> {
        RuleBuilder {
            sandbox: self,
            rule: Rule {
                cmd: cmd.into(),
                stdin: None,
                behavior: Behavior::Finish(ExecutionResult {
                    exit_code: Some(0),
                    wall_time_ms: 10,
                    cpu_time_ms: 5,
                    memory_kb: 1024,
                    ..Default::default()
                }),
            },
        }
    }

    /// The next `n` initializations fail.
    pub fn fail_init(&self, n: u32) {
        self.init_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn file(&self, slot: SlotId, path: &str) -> Option<Bytes> {
        self.files
            .get(&(slot, path.to_string()))
            .map(|f| f.value().clone())
    }

    fn find(&self, cmd: &str, stdin: Option<&str>) -> Option<&Rule> {
        self.rules
            .iter()
            .filter(|r| r.cmd == cmd)
            .find(|r| match &r.stdin {
                Some(expected) => Some(expected.as_str()) == stdin,
                None => true,
            })
    }
}

pub struct RuleBuilder<'a> {
    sandbox: &'a mut MockSandbox,
    rule: Rule,
}

impl<'a> RuleBuilder<'a> {
    fn result(&mut self) -> &mut ExecutionResult {
        if !matches!(self.rule.behavior, Behavior::Finish(_)) {
            self.rule.behavior = Behavior::Finish(Default::default());
        }
        match &mut self.rule.behavior {
            Behavior::Finish(res) => res,
            _ => unreachable!(),
        }
    }

    /// Only match runs fed exactly this stdin. Rules with an input are
    /// listed before catch-all rules of the same command.
    pub fn with_input(mut self, stdin: &str) -> Self {
        self.rule.stdin = Some(stdin.into());
        self
    }

    pub fn returns(mut self, code: i32) -> Self {
        self.result().exit_code = Some(code);
        self
    }

    pub fn killed_by(mut self, signal: i32) -> Self {
        let res = self.result();
        res.exit_code = None;
        res.signal = Some(signal);
        self
    }

    pub fn violates(mut self, violation: LimitViolation) -> Self {
        self.result().violation = Some(violation);
        self
    }

    pub fn stdout(mut self, out: &str) -> Self {
        self.result().stdout = Bytes::copy_from_slice(out.as_bytes());
        self
    }

    pub fn stderr(mut self, err: &str) -> Self {
        self.result().stderr = err.into();
        self
    }

    pub fn memory_kb(mut self, kb: u64) -> Self {
        self.result().memory_kb = kb;
        self
    }

    pub fn hangs(mut self) -> Self {
        self.rule.behavior = Behavior::Hang;
        self
    }

    pub fn panics(mut self, msg: &str) -> Self {
        self.rule.behavior = Behavior::Panic(msg.into());
        self
    }

    pub fn finish(self) {
        let rule = self.rule;
        let rules = &mut self.sandbox.rules;
        // Input-specific rules take precedence over catch-alls.
        match rule.stdin {
            Some(_) => rules.insert(0, rule),
            None => rules.push(rule),
        }
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn name(&self) -> Cow<'static, str> {
        "mock".into()
    }

    async fn available(&self) -> Result<(), SandboxError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(SandboxError::Exec("isolate: command not found".into()))
        } else {
            Ok(())
        }
    }

    async fn initialize(&self, slot: SlotId, _limits: &ResourceLimits) -> Result<(), SandboxError> {
        let failing = self
            .init_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SandboxError::Init(slot, "cgroup controller busy".into()));
        }
        let fresh = self.live.lock().unwrap().insert(slot);
        assert!(fresh, "slot {} initialized twice without cleanup", slot);
        self.stats.initialized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn place_file(
        &self,
        slot: SlotId,
        path: &str,
        content: Bytes,
    ) -> Result<(), SandboxError> {
        if !self.live.lock().unwrap().contains(&slot) {
            return Err(SandboxError::NotInitialized(slot));
        }
        self.files.insert((slot, path.to_string()), content);
        Ok(())
    }

    async fn execute(
        &self,
        slot: SlotId,
        req: &RunRequest,
        _limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        if !self.live.lock().unwrap().contains(&slot) {
            return Err(SandboxError::NotInitialized(slot));
        }
        let cmd = req.argv.join(" ");
        let stdin = req
            .stdin
            .as_ref()
            .map(|s| String::from_utf8_lossy(s).into_owned());
        self.stats.executed.lock().unwrap().push(cmd.clone());

        let behavior = match self.find(&cmd, stdin.as_deref()) {
            Some(rule) => rule.behavior.clone(),
            None => Behavior::Finish(ExecutionResult {
                exit_code: Some(127),
                stderr: format!("{}: command not found", cmd),
                ..Default::default()
            }),
        };
        match behavior {
            Behavior::Finish(res) => {
                tokio::task::yield_now().await;
                Ok(res)
            }
            Behavior::Hang => {
                self.stats.running.fetch_add(1, Ordering::SeqCst);
                cancel.cancelled().await;
                self.stats.running.fetch_sub(1, Ordering::SeqCst);
                Err(SandboxError::Cancelled)
            }
            Behavior::Panic(msg) => panic!("{}", msg),
        }
    }

    async fn cleanup(&self, slot: SlotId) -> Result<(), SandboxError> {
        self.live.lock().unwrap().remove(&slot);
        self.files.retain(|(s, _), _| *s != slot);
        *self.stats.cleanups.entry(slot).or_insert(0) += 1;
        Ok(())
    }
}

/// `c`: `gcc main.c` then `./a.out`.
pub fn languages() -> BTreeMap<String, LanguageProfile> {
    let mut langs = BTreeMap::new();
    langs.insert(
        "c".to_string(),
        LanguageProfile {
            source_file: "main.c".into(),
            compile: Some(vec!["gcc".into(), "main.c".into()]),
            run: vec!["./a.out".into()],
            compile_limits: None,
        },
    );
    langs
}

pub fn submission(id: &str, tests: Vec<TestCaseSpec>) -> Submission {
    Submission {
        id: id.into(),
        source: "int main() { return 0; }".into(),
        language: "c".into(),
        problem_id: "two-sum".into(),
        tests,
        limits: ResourceLimits::default(),
        compile_limits: ResourceLimits::default(),
        policy: Default::default(),
    }
}

/// Configuration tuned for fast tests.
pub fn test_config(pool_size: u32) -> JudgerConfig {
    let mut cfg = JudgerConfig {
        pool_size,
        slot_acquire_timeout_ms: 2_000,
        shutdown_grace_ms: 1_000,
        languages: languages(),
        ..Default::default()
    };
    cfg.queue.backoff_base_ms = 1;
    cfg.queue.backoff_max_ms = 5;
    cfg.queue.backoff_jitter = 0.0;
    cfg.queue.dequeue_timeout_ms = 20;
    cfg.health.min_free_memory_mb = 0;
    cfg
}

/// Poll `cond` every few milliseconds until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

//! The evaluation state machine:
//! `Queued -> Compiling -> Running(i) -> Comparing(i) -> { next | Terminal }`.

use std::{collections::BTreeMap, sync::Arc};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::model::{
    CompileReport, Evaluation, ScoringMode, Stage, Submission, TestReport, Usage, Verdict,
};
use crate::{
    config::LanguageProfile,
    prelude::CancelFutureExt,
    runner::{
        model::{ExecutionResult, LimitViolation, RunRequest},
        util::{strsignal, truncate_message},
        Sandbox, SandboxError, SandboxGuard,
    },
    slot::SlotLease,
    util::AsyncTeardownCollector,
};

/// Compiler output and program stderr kept in reports.
const MAX_MESSAGE_LEN: usize = 4096;

/// Drives submissions through a sandbox. Cheap to clone and share between
/// workers; all per-submission state lives in [`Evaluator::evaluate`].
#[derive(Clone)]
pub struct Evaluator {
    sandbox: Arc<dyn Sandbox>,
    languages: Arc<BTreeMap<String, LanguageProfile>>,
}

impl Evaluator {
    pub fn new(sandbox: Arc<dyn Sandbox>, languages: Arc<BTreeMap<String, LanguageProfile>>) -> Self {
        Evaluator { sandbox, languages }
    }

    pub fn sandbox(&self) -> &Arc<dyn Sandbox> {
        &self.sandbox
    }

    /// Evaluate `sub` in the leased slot.
    ///
    /// The slot is registered for cleanup in `teardown` before it is
    /// initialized; the caller runs the collector on every exit path. An
    /// `Err` is always a judge-side failure and never a verdict about the
    /// submission.
    #[tracing::instrument(skip_all, fields(submission_id = %sub.id, slot = lease.id()))]
    pub async fn evaluate(
        &self,
        sub: &Submission,
        lease: &SlotLease,
        teardown: &AsyncTeardownCollector,
        cancel: &CancellationToken,
    ) -> Result<Evaluation, SandboxError> {
        let slot = lease.id();
        let mut run = EvalRun::new(sub);

        let profile = match self.languages.get(&sub.language) {
            Some(p) => p,
            None => {
                tracing::warn!(language = %sub.language, "no profile for language");
                return Ok(run.finish_early(
                    Verdict::JudgeUnavailable,
                    format!("language `{}` is not supported", sub.language),
                ));
            }
        };

        if lease.needs_reset() {
            tracing::info!("slot left dirty by a previous holder, resetting");
            self.sandbox
                .cleanup(slot)
                .await
                .map_err(|e| SandboxError::Init(slot, format!("forced reset failed: {}", e)))?;
        }

        let guard = Arc::new(SandboxGuard::with_failure_flag(
            self.sandbox.clone(),
            slot,
            lease.dirty_flag(),
        ));
        teardown.add(guard);

        self.sandbox
            .initialize(slot, &sub.limits)
            .with_cancel(cancel.cancelled())
            .await
            .ok_or(SandboxError::Cancelled)??;
        self.sandbox
            .place_file(slot, &profile.source_file, Bytes::from(sub.source.clone()))
            .await?;

        if let Some(compile) = &profile.compile {
            run.enter(Stage::Compiling);
            check_cancel(cancel)?;
            let res = self
                .sandbox
                .execute(slot, &RunRequest::new(compile.clone()), &sub.compile_limits, cancel)
                .await?;
            let report = compile_report(&res);
            let verdict = report.verdict;
            run.compile = Some(report);
            if verdict != Verdict::Accepted {
                tracing::debug!(?verdict, "compilation failed");
                return Ok(run.finish(verdict));
            }
        }

        let comparator = sub.policy.comparator.build();
        let mut terminal = None;
        for (i, test) in sub.tests.iter().enumerate() {
            if terminal.is_some() {
                run.tests.push(TestReport::skipped(&test.name));
                continue;
            }
            run.enter(Stage::Running(i));
            check_cancel(cancel)?;

            let req = RunRequest::new(profile.run.clone()).stdin(test.input.clone());
            let res = self.sandbox.execute(slot, &req, &sub.limits, cancel).await?;
            let usage = Usage::from(&res);
            run.usage = run.usage.peak(usage);

            let mut report = TestReport {
                name: test.name.clone(),
                verdict: None,
                usage,
                message: None,
                diff: None,
            };
            let verdict = match run_failure(&res) {
                Some((verdict, message)) => {
                    report.message = Some(message);
                    verdict
                }
                None => {
                    run.enter(Stage::Comparing(i));
                    match comparator.compare(&res.stdout, &test.expected) {
                        None => Verdict::Accepted,
                        Some(diff) => {
                            report.diff = Some(diff);
                            Verdict::WrongAnswer
                        }
                    }
                }
            };
            tracing::debug!(test = %test.name, ?verdict, "test judged");
            report.verdict = Some(verdict);
            run.tests.push(report);

            if verdict != Verdict::Accepted && sub.policy.scoring == ScoringMode::FailFast {
                terminal = Some(verdict);
            }
        }

        let verdict = match sub.policy.scoring {
            ScoringMode::FailFast => terminal.unwrap_or(Verdict::Accepted),
            ScoringMode::Partial => run
                .tests
                .iter()
                .filter_map(|t| t.verdict)
                .fold(Verdict::Accepted, Verdict::worst),
        };
        Ok(run.finish(verdict))
    }
}

fn check_cancel(cancel: &CancellationToken) -> Result<(), SandboxError> {
    if cancel.is_cancelled() {
        Err(SandboxError::Cancelled)
    } else {
        Ok(())
    }
}

/// Bookkeeping of one evaluation in progress.
struct EvalRun<'a> {
    sub: &'a Submission,
    trace: Vec<Stage>,
    compile: Option<CompileReport>,
    tests: Vec<TestReport>,
    usage: Usage,
}

impl<'a> EvalRun<'a> {
    fn new(sub: &'a Submission) -> Self {
        EvalRun {
            sub,
            trace: vec![Stage::Queued],
            compile: None,
            tests: vec![],
            usage: Usage::default(),
        }
    }

    fn enter(&mut self, stage: Stage) {
        self.trace.push(stage);
    }

    fn score(&self) -> f64 {
        let total: f64 = self.sub.tests.iter().map(|t| t.weight).sum();
        if self.sub.tests.is_empty() {
            return 1.0;
        }
        if total <= 0.0 {
            return 0.0;
        }
        let accepted: f64 = self
            .sub
            .tests
            .iter()
            .zip(&self.tests)
            .filter(|(_, r)| r.verdict == Some(Verdict::Accepted))
            .map(|(t, _)| t.weight)
            .sum();
        accepted / total
    }

    /// Terminate before any test ran: every test is reported skipped.
    fn finish_early(mut self, verdict: Verdict, message: String) -> Evaluation {
        self.compile = Some(CompileReport {
            verdict,
            usage: Usage::default(),
            message: Some(message),
        });
        self.finish(verdict)
    }

    fn finish(mut self, verdict: Verdict) -> Evaluation {
        for test in self.sub.tests.iter().skip(self.tests.len()) {
            self.tests.push(TestReport::skipped(&test.name));
        }
        let score = match &self.compile {
            Some(c) if c.verdict != Verdict::Accepted => 0.0,
            _ => self.score(),
        };
        self.trace.push(Stage::Terminal(verdict));
        Evaluation {
            submission_id: self.sub.id.clone(),
            verdict,
            score,
            compile: self.compile,
            tests: self.tests,
            usage: self.usage,
            trace: self.trace,
        }
    }
}

fn compile_report(res: &ExecutionResult) -> CompileReport {
    let verdict = match res.violation {
        Some(v) if v.is_time() => Verdict::TimeLimitExceeded,
        Some(LimitViolation::Memory) => Verdict::MemoryLimitExceeded,
        Some(_) => Verdict::CompileError,
        None if res.is_success() => Verdict::Accepted,
        None => Verdict::CompileError,
    };
    let message = if verdict == Verdict::Accepted {
        None
    } else {
        let text = if res.stderr.trim().is_empty() {
            res.stdout_lossy()
        } else {
            res.stderr.clone()
        };
        Some(truncate_message(&text, MAX_MESSAGE_LEN))
    };
    CompileReport {
        verdict,
        usage: Usage::from(res),
        message,
    }
}

/// Verdict of a test run that failed before its output could be compared.
/// Measured limit violations decide first; exit status only afterwards.
fn run_failure(res: &ExecutionResult) -> Option<(Verdict, String)> {
    if let Some(v) = res.violation {
        let (verdict, msg) = match v {
            LimitViolation::Output => (Verdict::OutputLimitExceeded, "output limit exceeded"),
            LimitViolation::Memory => (Verdict::MemoryLimitExceeded, "memory limit exceeded"),
            LimitViolation::CpuTime => (Verdict::TimeLimitExceeded, "CPU time limit exceeded"),
            LimitViolation::WallTime => {
                (Verdict::TimeLimitExceeded, "wall-clock time limit exceeded")
            }
        };
        return Some((verdict, msg.to_string()));
    }
    if let Some(sig) = res.signal {
        return Some((
            Verdict::RuntimeError,
            format!("killed by signal {} ({})", sig, strsignal(sig)),
        ));
    }
    match res.exit_code {
        Some(0) => None,
        Some(code) => Some((
            Verdict::RuntimeError,
            format!(
                "exited with code {}\n{}",
                code,
                truncate_message(&res.stderr, MAX_MESSAGE_LEN)
            )
            .trim_end()
            .to_string(),
        )),
        None => Some((Verdict::RuntimeError, "terminated abnormally".into())),
    }
}

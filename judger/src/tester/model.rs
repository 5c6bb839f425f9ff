use serde::{Deserialize, Serialize};

use super::compare::ComparatorKind;
use crate::runner::model::{ExecutionResult, ResourceLimits};

/// One submission, fully materialized: every limit it will run under is
/// already attached. Never mutated while being evaluated; a re-judge builds
/// a new one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: String,
    pub source: String,
    pub language: String,
    pub problem_id: String,
    /// Run in this order.
    pub tests: Vec<TestCaseSpec>,
    pub limits: ResourceLimits,
    pub compile_limits: ResourceLimits,
    #[serde(default)]
    pub policy: JudgePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseSpec {
    pub name: String,
    pub input: String,
    pub expected: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl TestCaseSpec {
    pub fn new(name: impl Into<String>, input: impl Into<String>, expected: impl Into<String>) -> Self {
        TestCaseSpec {
            name: name.into(),
            input: input.into(),
            expected: expected.into(),
            weight: 1.0,
        }
    }
}

/// Per-problem judging policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JudgePolicy {
    #[serde(default)]
    pub comparator: ComparatorKind,
    #[serde(default)]
    pub scoring: ScoringMode,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ScoringMode {
    /// Stop at the first test that is not accepted; its verdict is final.
    FailFast,
    /// Run every test; report a weighted score and the worst verdict seen.
    Partial,
}

impl Default for ScoringMode {
    fn default() -> Self {
        ScoringMode::FailFast
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Verdict {
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    CompileError,
    OutputLimitExceeded,
    InternalError,
    JudgeUnavailable,
}

impl Verdict {
    /// Ranking used to pick the worst verdict in partial scoring.
    pub fn severity(&self) -> u8 {
        match self {
            Verdict::Accepted => 0,
            Verdict::WrongAnswer => 1,
            Verdict::OutputLimitExceeded => 2,
            Verdict::RuntimeError => 3,
            Verdict::MemoryLimitExceeded => 4,
            Verdict::TimeLimitExceeded => 5,
            Verdict::CompileError => 6,
            Verdict::JudgeUnavailable => 7,
            Verdict::InternalError => 8,
        }
    }

    /// Caused by the submitted program rather than by the judge.
    pub fn is_submitter_caused(&self) -> bool {
        !matches!(self, Verdict::InternalError | Verdict::JudgeUnavailable)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Accepted => "accepted",
            Verdict::WrongAnswer => "wrong_answer",
            Verdict::TimeLimitExceeded => "time_limit_exceeded",
            Verdict::MemoryLimitExceeded => "memory_limit_exceeded",
            Verdict::RuntimeError => "runtime_error",
            Verdict::CompileError => "compile_error",
            Verdict::OutputLimitExceeded => "output_limit_exceeded",
            Verdict::InternalError => "internal_error",
            Verdict::JudgeUnavailable => "judge_unavailable",
        }
    }

    pub fn worst(self, other: Verdict) -> Verdict {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

/// Resources used by a run, or the peak over several runs.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    pub memory_kb: u64,
}

impl Usage {
    pub fn peak(self, other: Usage) -> Usage {
        Usage {
            wall_time_ms: self.wall_time_ms.max(other.wall_time_ms),
            cpu_time_ms: self.cpu_time_ms.max(other.cpu_time_ms),
            memory_kb: self.memory_kb.max(other.memory_kb),
        }
    }
}

impl From<&ExecutionResult> for Usage {
    fn from(r: &ExecutionResult) -> Self {
        Usage {
            wall_time_ms: r.wall_time_ms,
            cpu_time_ms: r.cpu_time_ms,
            memory_kb: r.memory_kb,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
    pub name: String,
    /// `None` when the test was skipped after an earlier failure.
    pub verdict: Option<Verdict>,
    pub usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

impl TestReport {
    pub fn skipped(name: impl Into<String>) -> Self {
        TestReport {
            name: name.into(),
            verdict: None,
            usage: Usage::default(),
            message: None,
            diff: None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.verdict.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompileReport {
    /// `Accepted` when an artifact was produced.
    pub verdict: Verdict,
    pub usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Steps of the evaluation state machine, recorded in order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "stage", content = "at", rename_all = "camelCase")]
pub enum Stage {
    Queued,
    Compiling,
    Running(usize),
    Comparing(usize),
    Terminal(Verdict),
}

/// Outcome of evaluating one submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub submission_id: String,
    pub verdict: Verdict,
    /// Weighted share of accepted tests, `0.0..=1.0`.
    pub score: f64,
    pub compile: Option<CompileReport>,
    pub tests: Vec<TestReport>,
    /// Peak usage over all test runs.
    pub usage: Usage,
    #[serde(skip)]
    pub trace: Vec<Stage>,
}

impl Evaluation {
    pub fn test_verdicts(&self) -> Vec<Option<Verdict>> {
        self.tests.iter().map(|t| t.verdict).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_follows_severity() {
        use Verdict::*;
        let seen = [Accepted, WrongAnswer, TimeLimitExceeded, RuntimeError, Accepted];
        let worst = seen.iter().fold(Accepted, |acc, v| acc.worst(*v));
        assert_eq!(worst, TimeLimitExceeded);
        assert_eq!(WrongAnswer.worst(Accepted), WrongAnswer);
        assert!(!InternalError.is_submitter_caused());
        assert!(MemoryLimitExceeded.is_submitter_caused());
    }

    #[test]
    fn submission_defaults_policy_and_weight() {
        let sub: Submission = serde_json::from_str(
            r#"{
                "id": "s1", "source": "", "language": "c", "problemId": "p",
                "tests": [{"name": "1", "input": "1\n", "expected": "1\n"}],
                "limits": {"wallTimeMs": 1000, "cpuTimeMs": 500, "memoryKb": 1024,
                           "maxProcesses": 1, "outputLimitKb": 64},
                "compileLimits": {"wallTimeMs": 1000, "cpuTimeMs": 500, "memoryKb": 1024,
                                  "maxProcesses": 8, "outputLimitKb": 64}
            }"#,
        )
        .unwrap();
        assert_eq!(sub.policy, JudgePolicy::default());
        assert_eq!(sub.policy.scoring, ScoringMode::FailFast);
        assert_eq!(sub.tests[0].weight, 1.0);
    }
}

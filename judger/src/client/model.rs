use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{
    config::JudgerConfig,
    runner::model::ResourceLimits,
    tester::model::{
        CompileReport, Evaluation, JudgePolicy, Submission, TestCaseSpec, TestReport, Usage,
        Verdict,
    },
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Priority {
    Default,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Default
    }
}

impl Priority {
    pub const ALL: [Priority; 2] = [Priority::Critical, Priority::Default];

    pub fn label(&self) -> &'static str {
        match self {
            Priority::Default => "default",
            Priority::Critical => "critical",
        }
    }
}

/// A job as delivered by the queue, in its wire form.
///
/// Limits are optional here; missing ones are filled from configuration
/// exactly once, in [`Job::materialize`], when a worker accepts the job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub source: String,
    pub language: String,
    pub problem_id: String,
    pub tests: Vec<TestCaseSpec>,
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
    #[serde(default)]
    pub compile_limits: Option<ResourceLimits>,
    #[serde(default)]
    pub policy: JudgePolicy,
    #[serde(default)]
    pub priority: Priority,
}

impl Job {
    /// Build the immutable submission this job will be evaluated as.
    pub fn materialize(&self, cfg: &JudgerConfig) -> Submission {
        let compile_limits = self.compile_limits.unwrap_or_else(|| {
            cfg.languages
                .get(&self.language)
                .and_then(|l| l.compile_limits)
                .unwrap_or(cfg.limits.compile)
        });
        Submission {
            id: self.id.clone(),
            source: self.source.clone(),
            language: self.language.clone(),
            problem_id: self.problem_id.clone(),
            tests: self.tests.clone(),
            limits: self.limits.unwrap_or(cfg.limits.run),
            compile_limits,
            policy: self.policy.clone(),
        }
    }
}

/// One delivery of a job. `attempt` starts at 1.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: Job,
    pub attempt: u32,
    /// Identifies this delivery to the queue when settling it.
    pub tag: u64,
}

/// How a delivery that is not acknowledged goes back to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// A failed attempt: redeliver after `delay`, counting the attempt.
    Retry { delay: Duration },
    /// The job never really ran (no free slot, forced shutdown): redeliver
    /// without counting the attempt.
    Return,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ReportStatus {
    Finished,
    Cancelled,
}

/// What the result sink receives for every settled job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JudgeReport {
    pub submission_id: String,
    pub status: ReportStatus,
    /// Absent for cancelled jobs.
    pub verdict: Option<Verdict>,
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub compile: Option<CompileReport>,
    pub tests: Vec<TestReport>,
    pub usage: Usage,
    pub attempt: u32,
    pub finished_at: DateTime<Utc>,
}

impl JudgeReport {
    pub fn finished(eval: Evaluation, attempt: u32) -> JudgeReport {
        JudgeReport {
            submission_id: eval.submission_id,
            status: ReportStatus::Finished,
            verdict: Some(eval.verdict),
            score: Some(eval.score),
            message: None,
            compile: eval.compile,
            tests: eval.tests,
            usage: eval.usage,
            attempt,
            finished_at: Utc::now(),
        }
    }

    /// A judge-side failure. `message` is shown to the submitter and must not
    /// carry raw sandbox detail.
    pub fn internal_error(job: &Job, message: impl Into<String>, attempt: u32) -> JudgeReport {
        JudgeReport {
            submission_id: job.id.clone(),
            status: ReportStatus::Finished,
            verdict: Some(Verdict::InternalError),
            score: Some(0.0),
            message: Some(message.into()),
            compile: None,
            tests: job.tests.iter().map(|t| TestReport::skipped(&t.name)).collect(),
            usage: Usage::default(),
            attempt,
            finished_at: Utc::now(),
        }
    }

    pub fn cancelled(job: &Job, attempt: u32) -> JudgeReport {
        JudgeReport {
            submission_id: job.id.clone(),
            status: ReportStatus::Cancelled,
            verdict: None,
            score: None,
            message: Some("cancelled".into()),
            compile: None,
            tests: vec![],
            usage: Usage::default(),
            attempt,
            finished_at: Utc::now(),
        }
    }

    /// Label used for the processed-jobs counter.
    pub fn outcome(&self) -> &'static str {
        match (self.status, self.verdict) {
            (ReportStatus::Cancelled, _) => "cancelled",
            (_, Some(v)) => v.label(),
            (_, None) => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LanguageProfile;

    fn job() -> Job {
        Job {
            id: "42".into(),
            source: "int main(){}".into(),
            language: "c".into(),
            problem_id: "two-sum".into(),
            tests: vec![TestCaseSpec::new("1", "1\n", "1\n")],
            limits: None,
            compile_limits: None,
            policy: Default::default(),
            priority: Priority::Default,
        }
    }

    #[test]
    fn materialize_fills_limits_from_config() {
        let cfg = JudgerConfig::default();
        let sub = job().materialize(&cfg);
        assert_eq!(sub.limits, cfg.limits.run);
        assert_eq!(sub.compile_limits, cfg.limits.compile);

        let explicit = ResourceLimits {
            memory_kb: 1024,
            ..cfg.limits.run
        };
        let sub = Job {
            limits: Some(explicit),
            ..job()
        }
        .materialize(&cfg);
        assert_eq!(sub.limits, explicit);
    }

    #[test]
    fn language_compile_limits_take_precedence_over_defaults() {
        let mut cfg = JudgerConfig::default();
        let special = ResourceLimits {
            wall_time_ms: 60_000,
            ..cfg.limits.compile
        };
        cfg.languages.insert(
            "c".into(),
            LanguageProfile {
                source_file: "main.c".into(),
                compile: Some(vec!["gcc".into(), "main.c".into()]),
                run: vec!["./a.out".into()],
                compile_limits: Some(special),
            },
        );
        assert_eq!(job().materialize(&cfg).compile_limits, special);
    }

    #[test]
    fn wire_form_defaults() {
        let job: Job = serde_json::from_str(
            r#"{"id":"1","source":"","language":"c","problemId":"p","tests":[]}"#,
        )
        .unwrap();
        assert_eq!(job.priority, Priority::Default);
        assert!(job.limits.is_none());
    }
}

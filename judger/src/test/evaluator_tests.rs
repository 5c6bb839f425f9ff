//! Tests to verify that [`crate::tester::Evaluator`] reaches the right verdicts.

use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq;
use test_env_log::test;

use super::util::{languages, submission, MockSandbox};
use crate::{
    config::JudgerConfig,
    prelude::CancellationToken,
    runner::{model::LimitViolation, SandboxError},
    slot::SlotAllocator,
    tester::{
        model::{Evaluation, JudgePolicy, ScoringMode, Stage, Submission, TestCaseSpec, Verdict},
        Evaluator,
    },
    util::AsyncTeardownCollector,
};

const TWO_SUM_INPUT: &str = "2 7 11 15\n9\n";

fn evaluator(sandbox: MockSandbox) -> (Evaluator, Arc<MockSandbox>) {
    let sandbox = Arc::new(sandbox);
    (
        Evaluator::new(sandbox.clone(), Arc::new(languages())),
        sandbox,
    )
}

/// Run one evaluation on a fresh single-slot pool, tearing down afterwards
/// the way a worker does.
async fn evaluate_with(
    evaluator: &Evaluator,
    sub: &Submission,
    cancel: &CancellationToken,
) -> Result<Evaluation, SandboxError> {
    let pool = SlotAllocator::new(1);
    let lease = pool
        .acquire(Duration::from_secs(1), &CancellationToken::new())
        .await
        .expect("slot");
    let teardown = AsyncTeardownCollector::new();
    let res = evaluator.evaluate(sub, &lease, &teardown, cancel).await;
    teardown.teardown_all().await;
    pool.release(lease);
    res
}

async fn evaluate(evaluator: &Evaluator, sub: &Submission) -> Evaluation {
    evaluate_with(evaluator, sub, &CancellationToken::new())
        .await
        .expect("evaluation should not fail")
}

fn two_sum_program(stdout: &str) -> MockSandbox {
    let mut sandbox = MockSandbox::new();
    sandbox.when("gcc main.c").returns(0).finish();
    sandbox
        .when("./a.out")
        .with_input(TWO_SUM_INPUT)
        .returns(0)
        .stdout(stdout)
        .finish();
    sandbox
}

#[test(tokio::test)]
async fn two_sum_is_accepted() {
    let (evaluator, sandbox) = evaluator(two_sum_program("0 1\n"));
    let sub = submission("s1", vec![TestCaseSpec::new("1", TWO_SUM_INPUT, "0 1")]);

    let eval = evaluate(&evaluator, &sub).await;
    assert_eq!(eval.verdict, Verdict::Accepted);
    assert_eq!(eval.score, 1.0);
    assert_eq!(eval.test_verdicts(), vec![Some(Verdict::Accepted)]);
    assert_eq!(
        eval.trace,
        vec![
            Stage::Queued,
            Stage::Compiling,
            Stage::Running(0),
            Stage::Comparing(0),
            Stage::Terminal(Verdict::Accepted)
        ]
    );
    assert_eq!(sandbox.stats.executed(), vec!["gcc main.c", "./a.out"]);
    assert_eq!(sandbox.stats.cleanups_of(0), 1);
}

#[test(tokio::test)]
async fn wrong_answer_short_circuits_under_fail_fast() {
    let (evaluator, sandbox) = evaluator(two_sum_program("0 1\n"));
    let sub = submission(
        "s2",
        vec![
            TestCaseSpec::new("1", TWO_SUM_INPUT, "1 2"),
            TestCaseSpec::new("2", TWO_SUM_INPUT, "0 1"),
            TestCaseSpec::new("3", TWO_SUM_INPUT, "0 1"),
        ],
    );

    let eval = evaluate(&evaluator, &sub).await;
    assert_eq!(eval.verdict, Verdict::WrongAnswer);
    assert_eq!(
        eval.test_verdicts(),
        vec![Some(Verdict::WrongAnswer), None, None]
    );
    assert!(eval.tests[0].diff.as_deref().unwrap().contains("+ 1 2"));
    assert!(eval.tests[1].is_skipped());
    assert_eq!(sandbox.stats.count_executed("./a.out"), 1);
    assert_eq!(eval.score, 0.0);
}

#[test(tokio::test)]
async fn syntax_error_never_reaches_tests() {
    let mut sandbox = MockSandbox::new();
    sandbox
        .when("gcc main.c")
        .returns(1)
        .stderr("main.c:1:13: error: expected ';' before '}' token")
        .finish();
    sandbox.when("./a.out").returns(0).stdout("0 1").finish();
    let (evaluator, sandbox) = evaluator(sandbox);
    let sub = submission("s3", vec![TestCaseSpec::new("1", TWO_SUM_INPUT, "0 1")]);

    let eval = evaluate(&evaluator, &sub).await;
    assert_eq!(eval.verdict, Verdict::CompileError);
    assert_eq!(eval.test_verdicts(), vec![None]);
    assert!(eval
        .compile
        .as_ref()
        .and_then(|c| c.message.as_deref())
        .unwrap()
        .contains("expected ';'"));
    assert_eq!(sandbox.stats.count_executed("./a.out"), 0);
    assert!(!eval.trace.iter().any(|s| matches!(s, Stage::Running(_))));
}

#[test(tokio::test)]
async fn interpreted_syntax_error_is_compile_error() {
    let mut sandbox = MockSandbox::new();
    sandbox
        .when("/usr/bin/python3 -m py_compile main.py")
        .returns(1)
        .stderr("  File \"main.py\", line 1\n    print(\nSyntaxError: unexpected EOF while parsing")
        .finish();
    sandbox.when("/usr/bin/python3 main.py").returns(1).finish();
    let sandbox = Arc::new(sandbox);
    let evaluator = Evaluator::new(sandbox.clone(), Arc::new(JudgerConfig::default().languages));

    let mut sub = submission("py", vec![TestCaseSpec::new("1", TWO_SUM_INPUT, "0 1")]);
    sub.language = "python3".into();
    sub.source = "print(".into();

    let eval = evaluate(&evaluator, &sub).await;
    assert_eq!(eval.verdict, Verdict::CompileError);
    assert_eq!(eval.test_verdicts(), vec![None]);
    assert_eq!(sandbox.stats.count_executed("/usr/bin/python3 main.py"), 0);
}

#[test(tokio::test)]
async fn duplicate_delivery_yields_the_same_verdict() {
    let (evaluator, sandbox) = evaluator(two_sum_program("0 1\n"));
    let sub = submission(
        "dup",
        vec![
            TestCaseSpec::new("1", TWO_SUM_INPUT, "0 1"),
            TestCaseSpec::new("2", TWO_SUM_INPUT, "1 0"),
        ],
    );

    let first = evaluate(&evaluator, &sub).await;
    let second = evaluate(&evaluator, &sub).await;
    assert_eq!(first.verdict, Verdict::WrongAnswer);
    assert_eq!(first.verdict, second.verdict);
    assert_eq!(first.test_verdicts(), second.test_verdicts());
    assert_eq!(sandbox.stats.total_cleanups(), 2);
}

#[test(tokio::test)]
async fn memory_ceiling_beats_kill_signal() {
    let mut sandbox = MockSandbox::new();
    sandbox.when("gcc main.c").returns(0).finish();
    sandbox
        .when("./a.out")
        .killed_by(9)
        .violates(LimitViolation::Memory)
        .memory_kb(262_144)
        .finish();
    let (evaluator, _) = evaluator(sandbox);
    let sub = submission("mle", vec![TestCaseSpec::new("1", "", "")]);

    let eval = evaluate(&evaluator, &sub).await;
    assert_eq!(eval.verdict, Verdict::MemoryLimitExceeded);
    assert_eq!(eval.usage.memory_kb, 262_144);
}

#[test(tokio::test)]
async fn busy_loop_is_time_limit_exceeded() {
    let mut sandbox = MockSandbox::new();
    sandbox.when("gcc main.c").returns(0).finish();
    sandbox
        .when("./a.out")
        .killed_by(9)
        .violates(LimitViolation::WallTime)
        .finish();
    let (evaluator, _) = evaluator(sandbox);
    let sub = submission("tle", vec![TestCaseSpec::new("1", "", "")]);

    let eval = evaluate(&evaluator, &sub).await;
    assert_eq!(eval.verdict, Verdict::TimeLimitExceeded);
    assert!(eval.tests[0]
        .message
        .as_deref()
        .unwrap()
        .contains("wall-clock"));
}

#[test(tokio::test)]
async fn partial_scoring_runs_everything() {
    let mut sandbox = MockSandbox::new();
    sandbox.when("gcc main.c").returns(0).finish();
    sandbox.when("./a.out").with_input("a").stdout("A").finish();
    sandbox.when("./a.out").with_input("b").stdout("wrong").finish();
    sandbox
        .when("./a.out")
        .with_input("c")
        .violates(LimitViolation::CpuTime)
        .finish();
    let (evaluator, sandbox) = evaluator(sandbox);

    let mut sub = submission(
        "partial",
        vec![
            TestCaseSpec::new("a", "a", "A"),
            TestCaseSpec::new("b", "b", "B"),
            TestCaseSpec::new("c", "c", "C"),
        ],
    );
    sub.tests[0].weight = 2.0;
    sub.policy = JudgePolicy {
        scoring: ScoringMode::Partial,
        ..Default::default()
    };

    let eval = evaluate(&evaluator, &sub).await;
    assert_eq!(
        eval.test_verdicts(),
        vec![
            Some(Verdict::Accepted),
            Some(Verdict::WrongAnswer),
            Some(Verdict::TimeLimitExceeded)
        ]
    );
    assert_eq!(eval.verdict, Verdict::TimeLimitExceeded);
    assert_eq!(eval.score, 0.5);
    assert_eq!(sandbox.stats.count_executed("./a.out"), 3);
}

#[test(tokio::test)]
async fn unsupported_language_never_touches_the_sandbox() {
    let (evaluator, sandbox) = evaluator(MockSandbox::new());
    let mut sub = submission("cobol", vec![TestCaseSpec::new("1", "", "")]);
    sub.language = "cobol".into();

    let eval = evaluate(&evaluator, &sub).await;
    assert_eq!(eval.verdict, Verdict::JudgeUnavailable);
    assert!(!eval.verdict.is_submitter_caused());
    assert_eq!(sandbox.stats.initialized.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[test(tokio::test)]
async fn source_is_placed_in_the_box() {
    let (evaluator, sandbox) = evaluator(two_sum_program("0 1\n"));
    let sub = submission("src", vec![]);
    let pool = SlotAllocator::new(1);
    let lease = pool
        .acquire(Duration::from_secs(1), &CancellationToken::new())
        .await
        .unwrap();
    let teardown = AsyncTeardownCollector::new();
    let eval = evaluator
        .evaluate(&sub, &lease, &teardown, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(eval.verdict, Verdict::Accepted);
    assert_eq!(
        sandbox.file(0, "main.c").unwrap(),
        bytes::Bytes::from(sub.source.clone())
    );
    teardown.teardown_all().await;
    assert!(sandbox.file(0, "main.c").is_none());
    pool.release(lease);
}

#[test(tokio::test)]
async fn cancellation_interrupts_a_run_and_still_cleans_up() {
    let mut sandbox = MockSandbox::new();
    sandbox.when("gcc main.c").returns(0).finish();
    sandbox.when("./a.out").hangs().finish();
    let (evaluator, sandbox) = evaluator(sandbox);
    let sub = submission("hang", vec![TestCaseSpec::new("1", "", "")]);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        let stats = sandbox.stats.clone();
        tokio::spawn(async move {
            while stats.running.load(std::sync::atomic::Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            cancel.cancel();
        });
    }

    let res = tokio::time::timeout(Duration::from_secs(5), evaluate_with(&evaluator, &sub, &cancel))
        .await
        .expect("cancellation must unblock the run");
    assert!(matches!(res, Err(SandboxError::Cancelled)), "{:?}", res);
    assert_eq!(sandbox.stats.cleanups_of(0), 1);
}

#[test(tokio::test)]
async fn dirty_slot_is_reset_before_use() {
    let (evaluator, sandbox) = evaluator(two_sum_program("0 1\n"));
    let sub = submission("reset", vec![]);
    let pool = SlotAllocator::new(1);
    let cancel = CancellationToken::new();
    drop(pool.acquire(Duration::from_secs(1), &cancel).await.unwrap());

    let lease = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap();
    assert!(lease.needs_reset());
    let teardown = AsyncTeardownCollector::new();
    evaluator
        .evaluate(&sub, &lease, &teardown, &cancel)
        .await
        .unwrap();
    teardown.teardown_all().await;
    pool.release(lease);
    // One forced reset, one regular cleanup.
    assert_eq!(sandbox.stats.cleanups_of(0), 2);
}

use std::sync::Arc;

use hyper::{Body, Method, Request, StatusCode};
use pretty_assertions::assert_eq;
use test_env_log::test;

use super::util::{test_config, MockSandbox};
use crate::{
    health::{
        server::{route, HealthServerState},
        HealthMonitor, HealthStatus, CHECK_BINARIES, CHECK_FILESYSTEM, CHECK_SANDBOX_PROBE,
        CHECK_SLOT_POOL,
    },
    metrics::{MemoryMetrics, Metrics, JOBS_PROCESSED},
    slot::SlotAllocator,
};

struct Fixture {
    monitor: Arc<HealthMonitor>,
    sandbox: Arc<MockSandbox>,
    _cache: tempfile::TempDir,
}

fn fixture(sandbox: MockSandbox) -> Fixture {
    let cache = tempfile::tempdir().unwrap();
    let mut cfg = test_config(2);
    cfg.cache_folder = cache.path().to_path_buf();
    let cfg = Arc::new(cfg);
    let sandbox = Arc::new(sandbox);
    let monitor = Arc::new(HealthMonitor::new(
        cfg.clone(),
        sandbox.clone(),
        SlotAllocator::new(cfg.pool_size),
    ));
    Fixture {
        monitor,
        sandbox,
        _cache: cache,
    }
}

fn healthy_sandbox() -> MockSandbox {
    let mut sandbox = MockSandbox::new();
    sandbox.when("/bin/true").returns(0).finish();
    sandbox
}

async fn get(state: &HealthServerState, path: &str) -> (StatusCode, String) {
    let req = Request::builder()
        .method(Method::GET)
        .uri(path)
        .body(Body::empty())
        .unwrap();
    let res = route(state, req).await;
    let code = res.status();
    let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
    (code, String::from_utf8(body.to_vec()).unwrap())
}

#[test(tokio::test)]
async fn healthy_sandbox_is_ready() {
    let f = fixture(healthy_sandbox());
    let report = f.monitor.check_readiness().await;
    assert!(report.is_ready(), "{:#?}", report);
    for check in [
        CHECK_BINARIES,
        CHECK_SANDBOX_PROBE,
        CHECK_FILESYSTEM,
        CHECK_SLOT_POOL,
    ] {
        assert!(report.checks[check].passed, "{} failed", check);
    }

    // The probe runs in the reserved slot, never in a pool slot.
    assert_eq!(f.sandbox.stats.count_executed("/bin/true"), 1);
    assert_eq!(f.sandbox.stats.cleanups_of(2), 2);
    assert_eq!(f.sandbox.stats.cleanups_of(0), 0);
    assert_eq!(f.monitor.last_report(), Some(report));
}

#[test(tokio::test)]
async fn failing_probe_makes_the_judge_unready_but_alive() {
    let mut sandbox = MockSandbox::new();
    sandbox.when("/bin/true").returns(1).finish();
    let f = fixture(sandbox);

    let report = f.monitor.check_readiness().await;
    assert_eq!(report.status, HealthStatus::Unhealthy);
    let probe = &report.checks[CHECK_SANDBOX_PROBE];
    assert!(!probe.passed);
    assert!(probe.detail.as_deref().unwrap().contains("/bin/true"));
    assert!(report.checks[CHECK_BINARIES].passed);
    assert!(f.monitor.is_live());
}

#[test(tokio::test)]
async fn missing_isolation_binaries_fail_readiness() {
    let sandbox = healthy_sandbox();
    sandbox.set_unavailable(true);
    let f = fixture(sandbox);

    let report = f.monitor.check_readiness().await;
    assert!(!report.is_ready());
    assert!(!report.checks[CHECK_BINARIES].passed);

    let status = f.monitor.status().await;
    assert!(!status.sandbox.available);
    assert_eq!(status.sandbox.kind, "primary-only");
    assert_eq!(status.pool.size, 2);
    assert_eq!(status.pool.active, 0);
}

#[test(tokio::test)]
async fn http_endpoints() {
    let mut sandbox = MockSandbox::new();
    sandbox.when("/bin/true").returns(1).finish();
    let f = fixture(sandbox);
    let metrics = Arc::new(MemoryMetrics::new());
    metrics.increment(JOBS_PROCESSED, &[("outcome", "accepted")], 5);
    let state = HealthServerState {
        monitor: f.monitor.clone(),
        metrics,
    };

    let (code, body) = get(&state, "/healthz").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body, r#"{"status":"alive"}"#);

    let (code, body) = get(&state, "/readyz").await;
    assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
    let report: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(report["status"], "unhealthy");
    assert_eq!(report["checks"][CHECK_SANDBOX_PROBE]["passed"], false);

    let (code, body) = get(&state, "/status").await;
    assert_eq!(code, StatusCode::OK);
    let status: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(status["sandbox"]["kind"], "primary-only");

    let (code, body) = get(&state, "/metrics").await;
    assert_eq!(code, StatusCode::OK);
    assert!(body.contains("judge_jobs_processed_total{outcome=\"accepted\"} 5"));

    let (code, _) = get(&state, "/nope").await;
    assert_eq!(code, StatusCode::NOT_FOUND);

    let req = Request::builder()
        .method(Method::POST)
        .uri("/readyz")
        .body(Body::empty())
        .unwrap();
    assert_eq!(route(&state, req).await.status(), StatusCode::METHOD_NOT_ALLOWED);
}

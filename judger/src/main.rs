use anyhow::{bail, Context};
use clap::Parser;
use isojudge::{
    client::{
        config::SharedPoolData,
        model::{Job, JudgeReport},
        queue::{JobQueue, MemoryQueue, SpoolQueue},
        sink::{JsonLinesSink, MemorySink, ResultSink},
        WorkerPool,
    },
    config::JudgerConfig,
    health::{
        server::{self, HealthServerState},
        HealthMonitor,
    },
    metrics::{MemoryMetrics, NoopMetrics},
    prelude::CancellationToken,
    runner::{build_sandbox, Sandbox},
    slot::SlotAllocator,
    tester::Evaluator,
};
use once_cell::sync::Lazy;
use std::{
    path::Path,
    process::exit,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing_subscriber::EnvFilter;

mod opt;

static CTRL_C: AtomicBool = AtomicBool::new(false);
static CTRL_C_TWICE: AtomicBool = AtomicBool::new(false);
/// Fired by the first Ctrl-C.
static SHUTDOWN: Lazy<CancellationToken> = Lazy::new(CancellationToken::new);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = opt::Opts::parse();
    init_logging(opt.opt.log.as_deref());

    ctrlc::set_handler(handle_ctrl_c).context("Failed to set termination handler")?;

    let cfg = Arc::new(load_config(opt.opt.config.as_deref())?);
    match opt.cmd {
        opt::SubCmd::Serve(cmd) => serve(cfg, cmd).await,
        opt::SubCmd::Judge(cmd) => judge(cfg, cmd).await,
        opt::SubCmd::Probe => probe(cfg).await,
        opt::SubCmd::Sweep => sweep(cfg).await,
    }
}

fn init_logging(filter: Option<&str>) {
    let filter = match filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    // Reports go to stdout; keep logs out of their way.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<JudgerConfig> {
    let default_path = JudgerConfig::default_path();
    let path = match path {
        Some(p) => Some(p),
        None if default_path.is_file() => Some(default_path.as_path()),
        None => None,
    };
    match path {
        Some(p) => tracing::info!(path = %p.display(), "loading configuration"),
        None => tracing::info!("no configuration file, using defaults"),
    }
    JudgerConfig::load(path).context("Failed to load configuration")
}

async fn sandbox_for(cfg: &JudgerConfig) -> anyhow::Result<Arc<dyn Sandbox>> {
    let sandbox = build_sandbox(&cfg.isolation)
        .await
        .context("Failed to set up the sandbox")?;
    if let Err(e) = sandbox.available().await {
        tracing::warn!(error = %e, "isolation mechanism is not reachable");
    }
    Ok(sandbox)
}

async fn serve(cfg: Arc<JudgerConfig>, cmd: opt::ServeSubCmd) -> anyhow::Result<()> {
    let cfg = match cmd.spool_dir {
        Some(dir) => {
            let mut cfg = (*cfg).clone();
            cfg.queue.spool_dir = Some(dir);
            Arc::new(cfg)
        }
        None => cfg,
    };

    let sandbox = sandbox_for(&cfg).await?;
    let slots = SlotAllocator::new(cfg.pool_size);
    let metrics = Arc::new(MemoryMetrics::default());
    let queue = SpoolQueue::open(cfg.spool_dir(), cfg.queue.critical_burst)
        .await
        .context("Failed to open the spool queue")?;
    tracing::info!(spool = %queue.root().display(), "spool queue opened");
    let sink: Arc<dyn ResultSink> = match cmd.results {
        Some(p) if p == Path::new("-") => Arc::new(JsonLinesSink::stdout()),
        Some(p) => Arc::new(JsonLinesSink::append_to(&p).await?),
        None => Arc::new(JsonLinesSink::append_to(&cfg.results_file()).await?),
    };

    let evaluator = Evaluator::new(sandbox.clone(), Arc::new(cfg.languages.clone()));
    let pool = WorkerPool::new(Arc::new(SharedPoolData::new(
        cfg.clone(),
        slots.clone(),
        evaluator,
        Arc::new(queue),
        sink,
        metrics.clone(),
    )));
    let failed = pool.recover().await;
    if !failed.is_empty() {
        tracing::warn!(?failed, "some slots could not be cleaned and will be reset before use");
    }

    let background = CancellationToken::new();
    let monitor = Arc::new(HealthMonitor::new(cfg.clone(), sandbox, slots));
    let periodic = monitor.clone().spawn_periodic(background.clone());
    let http = cfg.health.listen.map(|addr| {
        let state = HealthServerState {
            monitor: monitor.clone(),
            metrics: metrics.clone(),
        };
        let token = background.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve(addr, state, token).await {
                tracing::error!(error = %e, "health endpoint failed");
            }
        })
    });

    let handle = pool.start();
    SHUTDOWN.cancelled().await;
    let drained = handle.shutdown(cfg.shutdown_grace()).await;

    background.cancel();
    let _ = periodic.await;
    if let Some(http) = http {
        let _ = http.await;
    }
    tracing::info!(drained, "judge stopped");
    Ok(())
}

async fn judge(cfg: Arc<JudgerConfig>, cmd: opt::JudgeSubCmd) -> anyhow::Result<()> {
    let raw = tokio::fs::read(&cmd.job)
        .await
        .with_context(|| format!("Failed to read {}", cmd.job.display()))?;
    let job: Job = serde_json::from_slice(&raw).context("Malformed job file")?;

    // One worker on slot 0.
    let mut local = (*cfg).clone();
    local.pool_size = 1;
    local.worker_count = Some(1);
    let local = Arc::new(local);

    let sandbox = sandbox_for(&local).await?;
    let queue = Arc::new(MemoryQueue::new(local.queue.critical_burst));
    queue.enqueue(job).await?;
    let sink = Arc::new(MemorySink::new());
    let evaluator = Evaluator::new(sandbox, Arc::new(local.languages.clone()));
    let pool = WorkerPool::new(Arc::new(SharedPoolData::new(
        local.clone(),
        SlotAllocator::new(1),
        evaluator,
        queue,
        sink.clone(),
        Arc::new(NoopMetrics),
    )));
    pool.recover().await;
    let handle = pool.start();

    let report = tokio::select! {
        report = first_report(&sink) => Some(report),
        _ = SHUTDOWN.cancelled() => None,
    };
    handle.shutdown(local.shutdown_grace()).await;
    match report {
        Some(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        None => bail!("Interrupted before the submission was judged"),
    }
}

async fn first_report(sink: &MemorySink) -> JudgeReport {
    loop {
        if let Some(report) = sink
            .wait_for(1, Duration::from_secs(3600))
            .await
            .into_iter()
            .next()
        {
            return report;
        }
    }
}

async fn probe(cfg: Arc<JudgerConfig>) -> anyhow::Result<()> {
    let sandbox = sandbox_for(&cfg).await?;
    let monitor = HealthMonitor::new(cfg.clone(), sandbox, SlotAllocator::new(cfg.pool_size));
    let report = monitor.check_readiness().await;
    let status = monitor.status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    if !report.is_ready() {
        bail!("Judge is not ready");
    }
    Ok(())
}

async fn sweep(cfg: Arc<JudgerConfig>) -> anyhow::Result<()> {
    let sandbox = sandbox_for(&cfg).await?;
    let slots = SlotAllocator::new(cfg.pool_size);
    let mut failed = slots.recover(sandbox.as_ref()).await;
    if let Err(e) = sandbox.cleanup(cfg.probe_slot()).await {
        tracing::warn!(slot = cfg.probe_slot(), error = %e, "force cleanup failed");
        failed.push(cfg.probe_slot());
    }
    if !failed.is_empty() {
        bail!("Failed to clean slots {:?}", failed);
    }
    tracing::info!(slots = cfg.pool_size, "all slots clean");
    Ok(())
}

fn handle_ctrl_c() {
    if !CTRL_C.load(Ordering::SeqCst) {
        tracing::warn!("Waiting for running jobs to complete... Press Ctrl-C again to force quit.");
        CTRL_C.store(true, Ordering::SeqCst);
        SHUTDOWN.cancel();
    } else if !CTRL_C_TWICE.load(Ordering::SeqCst) {
        tracing::error!("Force quit!");
        CTRL_C_TWICE.store(true, Ordering::SeqCst);
        exit(101);
    }
}

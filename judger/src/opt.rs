use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[clap(version, about)]
pub struct Opts {
    #[clap(subcommand)]
    pub cmd: SubCmd,

    #[clap(flatten)]
    pub opt: GlobalOpts,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalOpts {
    /// Configuration file, defaults to `~/.isojudge/config.toml` when present
    #[clap(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter, in `RUST_LOG` syntax. Overrides the environment.
    #[clap(long, global = true)]
    pub log: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCmd {
    /// Run the worker pool against the spool queue
    #[clap(name = "serve")]
    Serve(ServeSubCmd),

    /// Judge a single submission locally and print the report
    #[clap(name = "judge")]
    Judge(JudgeSubCmd),

    /// Run the readiness checks once and print the status report
    #[clap(name = "probe")]
    Probe,

    /// Force-clean every slot of the pool
    #[clap(name = "sweep")]
    Sweep,
}

#[derive(Args, Debug, Clone)]
pub struct ServeSubCmd {
    /// Spool directory, overriding `queue.spool_dir`
    #[clap(long, name = "spool-dir")]
    pub spool_dir: Option<PathBuf>,

    /// Append reports to this file instead of `<cache_folder>/results.jsonl`.
    /// `-` writes to stdout.
    #[clap(long, short, name = "results-path")]
    pub results: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct JudgeSubCmd {
    /// A job file in the queue's JSON wire form
    #[clap(required = true, name = "job-path")]
    pub job: PathBuf,
}

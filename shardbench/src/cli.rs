//! Command line entry point.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use argh::FromArgs;
use tokio_util::sync::CancellationToken;

use crate::bench::{self, RunOptions, RunReport};
use crate::config::{Config, Output};
use crate::corpus::Corpus;
use crate::http::ShardRemote;
use crate::{observability, report};

/// Load generator for shard storage services.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Run(RunCommand),
    Upload(UploadCommand),
    Metrics(MetricsCommand),
    Version(VersionCommand),
}

/// upload the corpus, read every object back and report latencies
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "run")]
struct RunCommand {}

/// only upload the corpus and report latencies
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "upload")]
struct UploadCommand {}

/// print the server-side timers without issuing any requests
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "metrics")]
struct MetricsCommand {}

/// print the shardbench version
#[derive(Default, Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();

    if let Command::Version(_) = args.command {
        println!("shardbench {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("shardbench")
        .enable_all()
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config.logging);
    tracing::debug!(?config);

    runtime.block_on(async move {
        match args.command {
            Command::Run(RunCommand {}) => workload(config, true).await,
            Command::Upload(UploadCommand {}) => workload(config, false).await,
            Command::Metrics(MetricsCommand {}) => metrics(config).await,
            Command::Version(VersionCommand {}) => unreachable!(),
        }
    })
}

async fn workload(config: Config, download: bool) -> Result<()> {
    config.validate_workload()?;

    let remote = ShardRemote::from_config(&config)?;
    let corpus = Corpus::load(&config).await?;
    tracing::info!(
        samples = corpus.len(),
        bytes = corpus.total_size(),
        remotes = remote.remotes().len(),
        "loaded corpus"
    );

    let options = RunOptions {
        cancel: shutdown_token(),
        ..RunOptions::from_config(&config)
    };

    let report = if download {
        bench::run(remote, corpus, options).await?
    } else {
        bench::upload_only(remote, corpus, options).await?
    };

    print_report(&config, &report)?;

    if report.all_failed() {
        bail!("every request of a phase failed");
    }
    Ok(())
}

async fn metrics(config: Config) -> Result<()> {
    let remote = ShardRemote::from_config(&config)?;
    let servers = bench::scrape(&remote, &config.timers).await;

    match config.output {
        Output::Text => report::print_servers(&servers),
        Output::Json => println!("{}", serde_json::to_string_pretty(&servers)?),
    }
    Ok(())
}

fn print_report(config: &Config, report: &RunReport) -> Result<()> {
    match config.output {
        Output::Text => report::print_text(report),
        Output::Json => report::print_json(report)?,
    }
    Ok(())
}

/// Returns a token that is cancelled on the first Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, finishing requests in flight");
            cancel.cancel();
        }
    });
    token
}

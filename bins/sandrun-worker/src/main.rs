mod barrier;
mod config;
mod docker;
mod launcher;
mod lifecycle;
mod relay;
mod volume;


use anyhow::{Context, Result};
use clap::Parser;
use config::{Config, StoreBackend};
use docker::DockerCli;
use launcher::{Echo, Sandbox, SandboxLauncher};
use lifecycle::RunLifecycle;
use sandrun_common::memory::MemoryRunStore;
use sandrun_common::redis::RedisRunStore;
use sandrun_common::store::RunStore;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "sandrun-worker")]
#[command(about = "Run submitted code in a sandbox, optionally against a test harness, and record the run", long_about = None)]
struct Cli {
    /// User who submitted the code
    user: String,

    /// Challenge the submission belongs to
    challenge: String,

    /// Commit or submission identifier
    commit: String,

    /// Staged working directory of the user sandbox
    workdir: PathBuf,

    /// Staged working directory of the test harness (enables dual mode)
    test_dir: Option<PathBuf>,

    /// Config file (defaults to config/sandrun.json when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Sandbox image override
    #[arg(long)]
    image: Option<String>,

    /// Wall-clock limit for the whole run
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Persistence backend override
    #[arg(long, value_enum)]
    store: Option<StoreBackend>,

    /// Do not mirror sandbox output to the console
    #[arg(short, long)]
    quiet: bool,
}

/// Printed to stdout once the run is recorded
#[derive(Debug, Serialize)]
struct RunSummary {
    build: String,
    status: String,
    run: String,
    err: String,
    cpu_time_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries sandbox output and the summary
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    info!("Sandrun worker booting...");

    let config = load_config(&cli)?;
    info!(
        image = %config.image,
        mount_target = %config.mount_target,
        timeout_ms = ?config.run_timeout_ms,
        store = ?config.store,
        "Configuration loaded"
    );

    let echo = if config.echo && !cli.quiet {
        Echo::Console
    } else {
        Echo::Silent
    };
    let sandbox = DockerCli::from_config(&config).context("Failed to connect to Docker")?;
    let launcher = SandboxLauncher::new(sandbox)
        .with_echo(echo)
        .with_timeout(config.run_timeout());

    match config.store {
        StoreBackend::Redis => {
            let store = RedisRunStore::connect(&config.redis_url, config.key_prefix.clone())
                .await
                .context("Failed to connect to Redis")?;
            info!("Connected to Redis");

            execute(&cli, &launcher, RunLifecycle::new(store)).await
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store, records are dropped on exit");
            execute(&cli, &launcher, RunLifecycle::new(MemoryRunStore::new())).await
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env()?;

    if let Some(image) = &cli.image {
        config.image = image.clone();
    }
    if let Some(ms) = cli.timeout_ms {
        config.run_timeout_ms = Some(ms);
    }
    if let Some(store) = cli.store {
        config.store = store;
    }
    Ok(config)
}

async fn execute<S, X>(cli: &Cli, launcher: &SandboxLauncher<X>, lifecycle: RunLifecycle<S>) -> Result<()>
where
    S: RunStore,
    X: Sandbox,
{
    let handle = lifecycle
        .begin_run(&cli.challenge, &cli.commit, &cli.user)
        .await?;
    let key = handle.key().clone();

    let result = match &cli.test_dir {
        None => launcher.run_single(&cli.workdir).await,
        Some(test_dir) => launcher.run_dual(&cli.workdir, test_dir).await,
    };

    let output = match result {
        Ok(output) => output,
        Err(e) => {
            error!(build = %key, error = %e, "Run aborted, build stays in Started state");
            return Err(e).context("Sandbox run failed");
        }
    };

    let run = String::from_utf8_lossy(&output.transcripts.out_log).into_owned();
    let err = String::from_utf8_lossy(&output.transcripts.extra_log).into_owned();
    let cpu_time_ms = output.usage.cpu_time().as_millis() as u64;

    let completed = lifecycle
        .complete_run(handle, output.transcripts, &output.exit, output.usage)
        .await?;
    info!(build = %completed.key, log = %completed.log_key, "Run recorded");

    let summary = RunSummary {
        build: completed.key.to_string(),
        status: completed.record.status.to_string(),
        run,
        err,
        cpu_time_ms,
    };
    println!("{}", serde_json::to_string(&summary)?);

    Ok(())
}

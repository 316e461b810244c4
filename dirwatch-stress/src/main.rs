//! `dirwatch-stress`: run the directory churn harness against a watch backend and report a
//! verdict through the exit code (0 passed, 1 failed, 2 inconclusive).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dirwatch_core::{
    ChangeNotifier, RunMode, ScriptedNotifier, StressConfig, StressHarness, StressSettings,
};
use dirwatch_stress::SettingsSource;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "dirwatch-stress",
    about = "Churn watched directories and check that the watch poller never hangs"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register, delete and recreate one directory in turn
    Sequential(RunArgs),
    /// Register and churn a shared directory from two concurrent drivers
    Concurrent(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Iterations per driver
    #[arg(long)]
    iterations: Option<usize>,
    /// Hard wall-clock bound for the whole run
    #[arg(long)]
    deadline_secs: Option<u64>,
    /// Parent directory for the run's scratch directory (default: system temp dir)
    #[arg(long)]
    dir: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "notify")]
    backend: BackendArg,
    /// Scripted backend only: refuse every N-th read with access denied (0 disables)
    #[arg(long, default_value_t = 8)]
    fail_every: u64,
    /// Print the run report as JSON on stdout
    #[arg(long)]
    json: bool,
    /// Settings file (TOML or JSON); overrides DIRWATCH_CONFIG_PATH
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendArg {
    /// Real change notifications
    Notify,
    /// In-memory notifier with injected failures, for dry runs
    Scripted,
}

impl RunArgs {
    fn settings(&self) -> Result<StressSettings> {
        let source = SettingsSource::resolve(self.config.as_deref());
        let mut settings = source.load()?;
        if source != SettingsSource::Defaults {
            info!(%source, "settings loaded");
        }

        if let Some(iterations) = self.iterations {
            settings.iterations = iterations;
        }
        if let Some(deadline_secs) = self.deadline_secs {
            settings.deadline_secs = deadline_secs;
        }
        settings.validate().context("invalid settings")?;
        Ok(settings)
    }

    fn notifier(&self) -> Result<Arc<dyn ChangeNotifier>> {
        match self.backend {
            BackendArg::Notify => notify_backend(),
            BackendArg::Scripted => {
                let notifier = ScriptedNotifier::new().without_path_checks();
                notifier.fail_every(self.fail_every);
                Ok(Arc::new(notifier))
            }
        }
    }
}

#[cfg(feature = "notify-backend")]
fn notify_backend() -> Result<Arc<dyn ChangeNotifier>> {
    Ok(Arc::new(dirwatch_core::NotifyBackend::new()))
}

#[cfg(not(feature = "notify-backend"))]
fn notify_backend() -> Result<Arc<dyn ChangeNotifier>> {
    anyhow::bail!("built without the notify backend; use --backend scripted")
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,dirwatch::poller=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let (mode, args) = match cli.command {
        Command::Sequential(args) => (RunMode::Sequential, args),
        Command::Concurrent(args) => (RunMode::Concurrent, args),
    };

    let config = StressConfig::from(args.settings()?);
    let notifier = args.notifier()?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; stopping drivers");
            interrupt.cancel();
        }
    });

    let harness = StressHarness::new(notifier, config).with_cancellation(cancel);
    let dir = args.dir.clone();
    let report = tokio::task::spawn_blocking(move || harness.run(mode, dir.as_deref()))
        .await
        .context("stress run task failed")?
        .context("stress run aborted")?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to encode report")?
        );
    } else {
        println!("{}", report.summary());
    }

    Ok(ExitCode::from(report.exit_code() as u8))
}

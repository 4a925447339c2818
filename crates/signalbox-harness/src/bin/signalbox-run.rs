//! signalbox scenario runner

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use signalbox_harness::{HarnessConfig, TestHarness, scenarios};

/// signalbox-run - Run the built-in event loop scenarios under the test harness
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Guard timeout per test, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Exit code the guard stops the loop with
    #[arg(long, allow_hyphen_values = true)]
    failure_exit_code: Option<i32>,

    /// Only run scenarios whose name contains this substring
    #[arg(short, long)]
    filter: Option<String>,

    /// List the scenarios and exit
    #[arg(long)]
    list: bool,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn run() -> Result<bool> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "signalbox_run={level},signalbox_core={level},signalbox_harness={level}",
                    level = args.log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if args.list {
        for scenario in scenarios::SCENARIOS {
            println!("{:<24} {}", scenario.name, scenario.description);
        }
        return Ok(true);
    }

    let config = load_config(&args)?;
    info!(?config, "harness configured");

    let selected = scenarios::select(args.filter.as_deref());
    if selected.is_empty() {
        anyhow::bail!("no scenario matches filter {:?}", args.filter.unwrap_or_default());
    }

    let harness = TestHarness::new(config);
    let mut failed = 0;
    for scenario in &selected {
        let result = scenarios::run_scenario(&harness, scenario);
        match &result.outcome {
            Ok(reports) => {
                println!("PASS {} ({:.1?})", result.name, result.elapsed);
                for report in reports {
                    println!("     {} exit={} ({:.1?})", report.name, report.exit_code, report.elapsed);
                }
            }
            Err(e) => {
                failed += 1;
                println!("FAIL {} ({:.1?}): {e}", result.name, result.elapsed);
            }
        }
    }

    println!(
        "\n{} passed, {} failed",
        selected.len() - failed,
        failed
    );
    Ok(failed == 0)
}

fn load_config(args: &Args) -> Result<HarnessConfig> {
    let mut config = match &args.config {
        Some(path) => HarnessConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => HarnessConfig::default(),
    };
    config = config
        .with_env_overrides()
        .context("applying environment overrides")?;

    if let Some(timeout_ms) = args.timeout_ms {
        config.timeout_ms = timeout_ms;
    }
    if let Some(code) = args.failure_exit_code {
        config.failure_exit_code = code;
    }
    config.validate().context("invalid command-line overrides")?;
    Ok(config)
}

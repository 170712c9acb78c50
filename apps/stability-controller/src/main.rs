mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use stability_controller::config::ControllerConfig;
use stability_controller::replay::{analyze_trace, read_trace_file, run_replay};

use crate::cli::{AnalyzeArgs, Cli, Commands, ReplayArgs};

fn init_tracing() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,stability_controller=info".into());
    // Reports go to stdout, so logs stay on stderr.
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

fn load_config(cli: &Cli) -> Result<ControllerConfig> {
    ControllerConfig::load(cli.config.as_deref()).context("load controller configuration")
}

async fn replay(config: ControllerConfig, args: ReplayArgs) -> Result<()> {
    let mut config = config;
    if let Some(minutes) = args.utc_offset_minutes {
        config.runtime.utc_offset_minutes = Some(minutes);
        config = config.validated();
    }
    let trace = read_trace_file(&args.trace)?;
    let report = run_replay(config, trace, args.history_hours).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn analyze(config: &ControllerConfig, args: AnalyzeArgs) -> Result<()> {
    let trace = read_trace_file(&args.trace)?;
    let report = analyze_trace(config, &trace);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Replay(args) => {
            tokio::select! {
                res = replay(config, args) => res?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown signal received");
                }
            }
        }
        Commands::Analyze(args) => analyze(&config, args)?,
    }
    Ok(())
}

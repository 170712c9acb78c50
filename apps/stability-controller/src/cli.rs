use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "stability-controller",
    version,
    about = "Anti-cycling controller for heat-pump compressors"
)]
pub struct Cli {
    /// JSON configuration file; falls back to STABILITY_CONFIG_PATH, then defaults.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Discover regions on the head of a trace, then run the control loop over the rest.
    Replay(ReplayArgs),
    /// Cycling report and region discovery over a whole trace.
    Analyze(AnalyzeArgs),
}

#[derive(Args)]
pub struct ReplayArgs {
    /// CSV with `timestamp,watts` rows, RFC 3339 timestamps.
    #[arg(long)]
    pub trace: PathBuf,
    #[arg(long, default_value_t = 48)]
    pub history_hours: i64,
    /// Offset used for night windows and daily counters; overrides the configuration.
    #[arg(long, allow_hyphen_values = true)]
    pub utc_offset_minutes: Option<i32>,
}

#[derive(Args)]
pub struct AnalyzeArgs {
    #[arg(long)]
    pub trace: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_defaults_and_global_config() {
        let cli = Cli::try_parse_from([
            "stability-controller",
            "replay",
            "--trace",
            "power.csv",
            "--config",
            "cfg.json",
            "--utc-offset-minutes",
            "-60",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("cfg.json")));
        match cli.command {
            Commands::Replay(args) => {
                assert_eq!(args.trace, PathBuf::from("power.csv"));
                assert_eq!(args.history_hours, 48);
                assert_eq!(args.utc_offset_minutes, Some(-60));
            }
            Commands::Analyze(_) => panic!("expected replay"),
        }
    }

    #[test]
    fn analyze_requires_trace() {
        assert!(Cli::try_parse_from(["stability-controller", "analyze"]).is_err());
    }
}

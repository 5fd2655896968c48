use clap::Parser;
use std::path::PathBuf;

/// Watch a log file and fire triggers on matching lines.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Directory holding config.toml
    #[arg(long, env = "TRIGGERWATCH_CONFIG_DIR", default_value = ".")]
    config_dir: PathBuf,

    /// Log file or directory to follow (overrides log_path)
    #[arg(long)]
    log: Option<PathBuf>,

    /// Trigger definitions file (overrides triggers_path)
    #[arg(long)]
    triggers: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    triggerwatch_lib::run(triggerwatch_lib::Options {
        config_dir:        cli.config_dir,
        log_override:      cli.log,
        triggers_override: cli.triggers,
    })
}

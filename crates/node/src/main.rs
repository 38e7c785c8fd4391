use anyhow::Context;
use clap::{Parser, Subcommand};
use echobeats::SchedulerConfig;
use echobeats::logging::init_logging;
use std::path::{Path, PathBuf};
use tracing::info;

mod runtime;

use runtime::NodeRuntime;

#[derive(Parser, Debug)]
#[command(name = "echobeats-node")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
    #[arg(long, default_value = "echobeats.json")]
    config: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default config file.
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Run the scheduler until ctrl-c or the cycle budget is spent.
    Run {
        #[arg(long)]
        cycles: Option<u64>,
        #[arg(long)]
        step_period_ms: Option<u64>,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = PathBuf::from(&args.config);
    match args.command {
        Some(Command::Init { force }) => {
            let config = init_config(&config_path, force)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Command::Run {
            cycles,
            step_period_ms,
        }) => run_node(&config_path, cycles, step_period_ms),
        None => run_node(&config_path, None, None),
    }
}

fn run_node(
    config_path: &Path,
    cycles: Option<u64>,
    step_period_ms: Option<u64>,
) -> anyhow::Result<()> {
    let mut config = load_or_create_config(config_path)?;
    if let Some(period) = step_period_ms {
        config.step_period_ms = period;
        config.validate()?;
    }
    init_logging(&config.logging)?;
    info!(
        target: "echobeats::node",
        config = %config_path.display(),
        "loaded scheduler config"
    );
    let runtime = NodeRuntime::new(config)?;
    let snapshot = runtime.run_until_shutdown(cycles)?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn init_config(config_path: &Path, force: bool) -> anyhow::Result<SchedulerConfig> {
    if config_path.exists() && !force {
        return SchedulerConfig::load(config_path);
    }
    let config = SchedulerConfig::default();
    config
        .save(config_path)
        .with_context(|| format!("failed to initialize {}", config_path.display()))?;
    Ok(config)
}

fn load_or_create_config(config_path: &Path) -> anyhow::Result<SchedulerConfig> {
    if config_path.exists() {
        return SchedulerConfig::load(config_path);
    }
    init_config(config_path, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn init_writes_a_loadable_default() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("echobeats.json");
        let written = init_config(&path, false).expect("init");
        let loaded = SchedulerConfig::load(&path).expect("load");
        assert_eq!(loaded.steps, written.steps);
        assert_eq!(loaded.stream_count, 3);
    }

    #[test]
    fn init_keeps_existing_config_unless_forced() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("echobeats.json");
        let mut custom = SchedulerConfig::default();
        custom.history_capacity = 7;
        custom.save(&path).expect("save");

        let kept = init_config(&path, false).expect("init");
        assert_eq!(kept.history_capacity, 7);
        let reset = init_config(&path, true).expect("forced init");
        assert_eq!(reset.history_capacity, SchedulerConfig::default().history_capacity);
    }

    #[test]
    fn args_parse_run_budget() {
        let args =
            Args::parse_from(["echobeats-node", "--config", "x.json", "run", "--cycles", "3"]);
        assert_eq!(args.config, "x.json");
        match args.command {
            Some(Command::Run { cycles, .. }) => assert_eq!(cycles, Some(3)),
            other => panic!("unexpected command {other:?}"),
        }
    }
}

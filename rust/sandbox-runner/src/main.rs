//! runner-stats - inspect the memory stats recorded by a sandbox runner

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};

use shannon_sandbox_runner::config::Config;
use shannon_sandbox_runner::logging;
use shannon_sandbox_runner::stats_store::StatsStore;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "runner-stats")]
#[command(about = "Inspect memory statistics recorded by the sandbox runner")]
#[command(version)]
struct Args {
    /// Config file path.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding memory_stats.db, overrides the config.
    #[arg(long)]
    data_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print samples as JSON.
    Query {
        /// Only this VM.
        #[arg(long)]
        vm: Option<String>,

        /// How far back to look.
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },
    /// List VMs with recorded samples.
    Vms,
    /// Latest sample of every VM as JSON.
    Latest,
    /// Number of stored samples.
    Count,
    /// Print the effective configuration as YAML.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init_tracing()?;

    let mut config = match &args.config {
        Some(path) => {
            let config = Config::from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            let config = Config::from_env(config);
            config.validate()?;
            config
        }
        None => Config::load().context("Failed to load configuration")?,
    };
    if let Some(data_path) = args.data_path {
        config.stats.data_path = data_path;
    }

    if let Command::Config = args.command {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let store = StatsStore::open(config.stats.clone())
        .await
        .with_context(|| format!("Failed to open {}", config.stats.db_path().display()))?;

    match args.command {
        Command::Query { vm, hours } => {
            let to = Utc::now();
            let from = to - Duration::hours(i64::from(hours));
            let records = store.query(vm.as_deref(), from, to).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Command::Vms => {
            for name in store.vm_names().await? {
                println!("{name}");
            }
        }
        Command::Latest => {
            let latest = store.latest_per_vm().await?;
            let mut records: Vec<_> = latest.into_values().collect();
            records.sort_by(|a, b| a.vm_name.cmp(&b.vm_name));
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Command::Count => println!("{}", store.count().await?),
        Command::Config => {}
    }

    Ok(())
}

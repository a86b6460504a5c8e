use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use data_or_timer::config::DataOrTimerConfig;
use data_or_timer::providers::HistoryStore;
use data_or_timer::providers::fs::FsHistoryStore;
use data_or_timer::providers::in_memory::InMemoryHistoryStore;
use data_or_timer::runtime::Runtime;
use data_or_timer::workflow::{self, SingletonClient};
use tokio::time::{Duration, sleep};
use tracing::info;

/// Signal the data-or-timer singleton, creating it if needed.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// JSON configuration file. Built-in defaults are used when omitted.
    #[arg(long, env = "DATA_OR_TIMER_CONFIG")]
    config: Option<PathBuf>,

    /// Keep history in this directory instead of in memory. Unfinished
    /// instances found there are resumed.
    #[arg(long)]
    store_dir: Option<PathBuf>,

    #[arg(long)]
    instance_key: Option<String>,

    #[arg(long)]
    min_delay_ms: Option<u64>,

    #[arg(long)]
    max_delay_ms: Option<u64>,

    #[arg(long)]
    lifetime_ms: Option<u64>,

    #[arg(long)]
    activity_delay_ms: Option<u64>,

    /// Number of signals to send.
    #[arg(long, default_value_t = 1)]
    signals: u32,

    /// Pause between consecutive signals.
    #[arg(long, default_value_t = 1000)]
    signal_interval_ms: u64,

    /// Keep running until the instance expires.
    #[arg(long)]
    wait: bool,
}

fn load_config(cli: &Cli) -> Result<DataOrTimerConfig> {
    let mut config = match &cli.config {
        Some(path) => DataOrTimerConfig::from_json_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => DataOrTimerConfig::default(),
    };
    if let Some(key) = &cli.instance_key {
        config.instance_key = key.clone();
    }
    if let Some(ms) = cli.min_delay_ms {
        config.wait.min_delay_ms = ms;
    }
    if let Some(ms) = cli.max_delay_ms {
        config.wait.max_delay_ms = ms;
    }
    if let Some(ms) = cli.lifetime_ms {
        config.lifetime_ms = ms;
    }
    if let Some(ms) = cli.activity_delay_ms {
        config.activity_delay_ms = ms;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let store: Arc<dyn HistoryStore> = match &cli.store_dir {
        Some(dir) => Arc::new(FsHistoryStore::new(dir, false)),
        None => Arc::new(InMemoryHistoryStore::default()),
    };
    let rt = Runtime::start_with_store(
        store,
        workflow::activity_registry(&config),
        workflow::orchestration_registry(&config),
    )
    .await;
    let client = SingletonClient::new(rt.clone(), config.clone());

    let mut last = None;
    for i in 0..cli.signals {
        if i > 0 {
            sleep(Duration::from_millis(cli.signal_interval_ms)).await;
        }
        let handle = client.start_or_signal().await.context("admission failed")?;
        info!(
            instance = %handle.instance,
            created = handle.created,
            disposition = ?handle.disposition,
            "signal sent"
        );
        println!("{} {} {:?}", handle.instance, handle.payload, handle.disposition);
        last = Some(handle);
    }

    if cli.wait
        && let Some(handle) = last
    {
        let budget = config.lifetime() + config.wait.max_delay() * 2 + config.activity_delay() * (cli.signals + 1);
        let status = handle
            .status_query
            .wait(budget)
            .await
            .map_err(|e| anyhow!("instance did not finish: {e:?}"))?;
        println!("{} {status:?}", handle.instance);
    }

    rt.shutdown().await;
    Ok(())
}

use anyhow::Result;
use clap::{Parser, Subcommand};
use logpool::{config, Core};
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "logpool")]
#[command(version, about = "Forward sharded queue logs to a pool of collectors", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (falls back to LOGPOOL_* environment variables)
    #[arg(long, global = true, env = "LOGPOOL_CONFIG")]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every business stream and forward until Ctrl-C
    Run {
        /// Seconds between throughput log lines (overrides config, 0 = off)
        #[arg(long)]
        monitor_interval: Option<u64>,
    },

    /// Push one envelope onto a shard queue
    Push {
        /// Business stream name
        stream: String,

        /// Shard queue key
        shard: String,

        /// Raw envelope JSON (a sample envelope is generated when omitted)
        payload: Option<String>,
    },

    /// Validate configuration and print it resolved
    Check,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // The forwarder needs worker threads; one-shot commands do not
    let runtime = if matches!(cli.command, Commands::Run { .. }) {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
    } else {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
    };

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { monitor_interval } => {
            let interval = monitor_interval.unwrap_or(config.monitor.interval_secs);
            run(Core::new(config)?, interval).await?;
        }
        Commands::Push {
            stream,
            shard,
            payload,
        } => {
            let core = Core::new(config)?;
            let payload = payload.unwrap_or_else(|| sample_envelope(&stream));
            core.push(&stream, &shard, payload.as_bytes()).await?;
            println!("pushed {} bytes to {}/{}", payload.len(), stream, shard);
        }
        Commands::Check => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
    }

    Ok(())
}

async fn run(core: Core, monitor_interval: u64) -> Result<()> {
    core.run_until(Duration::from_secs(monitor_interval), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C, stopping");
        }
    })
    .await
}

fn sample_envelope(business: &str) -> String {
    let id: u64 = rand::random();
    serde_json::json!({
        "type": "log",
        "params": {
            "momoid": id.to_string(),
            "businessName": business,
            "type": "test",
            "body": { "msg": "logpool test push" },
        },
    })
    .to_string()
}

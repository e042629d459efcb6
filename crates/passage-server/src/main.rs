use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use passage_config::{validate_config, Config, EnvConfig, ProxyMode};
use passage_metrics::init_prometheus;
use passage_server::{supervisor, CancellationToken};

#[derive(Parser, Debug)]
#[command(name = "passage-server", version, about = "Multi-mode forward proxy")]
struct Args {
    /// Config file path (JSON)
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,
    /// Override PROXY_MODE (signal, https, general, http)
    #[arg(long)]
    mode: Option<String>,
    /// Override log level (trace/debug/info/warn/error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut env = EnvConfig::from_env();
    if let Some(mode) = &args.mode {
        env.proxy_mode = ProxyMode::parse(mode);
    }
    if let Some(level) = &args.log_level {
        env.log_level = level.clone();
    }

    let filter =
        EnvFilter::try_new(&env.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Configuration or bind failures exit 1; everything else is the
    // engines' problem.
    let config = Config::load(&args.config)?;
    validate_config(&config, env.proxy_mode)?;

    if let Some(listen) = &config.metrics_listen {
        match init_prometheus(listen) {
            Ok(()) => info!(address = %listen, "prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to start metrics exporter"),
        }
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(supervisor::shutdown_on_signal(shutdown.clone()));

    supervisor::run(config, env, shutdown).await?;

    info!("goodbye");
    Ok(())
}

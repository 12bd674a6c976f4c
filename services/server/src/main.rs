// pesit-server daemon entry point.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "pesit-server", about = "PeSIT-E Hors-SIT file-transfer server")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "/etc/pesit/server.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), config = %args.config.display(), "pesit-server starting");

    let config = match pesit_server::config::load_config_from_path(&args.config) {
        Ok(cfg) => {
            info!(
                node = %cfg.node_id,
                listeners = cfg.listeners.len(),
                partners = cfg.partners.len(),
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let supervisor = match pesit_server::bootstrap(&config, None).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("FATAL: bootstrap failed: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = supervisor.startup().await {
        error!(error = %e, "startup failed");
        std::process::exit(1);
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "signal handler failed"),
    }
    supervisor.stop_all().await;
    info!("pesit-server stopped");
}

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;

use payment_orchestrator::bus::KafkaBus;
use payment_orchestrator::repositories::{HttpBaasGateway, PgLedger};
use payment_orchestrator::services::{self, Dependencies};
use payment_orchestrator::settings::Settings;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// Overrides `http.listen`.
    #[arg(short, long)]
    listen: Option<String>,
    #[arg(long, default_value = "log4rs.yaml")]
    log4rs: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    let settings = Settings::new(&args.config)?;

    init_logging(&args.log4rs)?;
    info!("Starting payment orchestrator.");

    let conn = PgPoolOptions::new()
        .max_connections(settings.postgres.max_connections)
        .connect(&settings.postgres.url)
        .await?;
    let ledger = PgLedger::new(conn);
    ledger.migrate().await?;

    let gateway = HttpBaasGateway::new(
        settings.baas.api_key.clone(),
        settings.baas.url.clone(),
        Duration::from_secs(settings.baas.timeout_secs),
    )?;
    let bus = KafkaBus::new(&settings.broker)?;

    let deps = Dependencies {
        ledger: Arc::new(ledger),
        gateway: Arc::new(gateway),
        bus: Arc::new(bus),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested."),
            Err(e) => error!("Could not listen for shutdown signal: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    let listen = args.listen.unwrap_or_else(|| settings.http.listen.clone());
    services::start_services(deps, settings, listen, shutdown_rx).await
}

fn init_logging(path: &str) -> Result<(), anyhow::Error> {
    if !Path::new("logs").exists() {
        fs::create_dir("logs")?;
    }

    match log4rs::init_file(path, Default::default()) {
        Ok(_) => {
            println!("[*] Logging initialized successfully.");
            Ok(())
        }
        Err(e) => {
            println!("[ERROR] Failed to initialize logging: {}", e);
            Err(anyhow::anyhow!("Could not initialize logging: {}", e))
        }
    }
}

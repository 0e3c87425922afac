mod classifier;
mod config;
mod resolver;
mod session;
mod slack;
mod store;
mod transport;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

use config::Config;
use session::Session;
use slack::SlackTransport;
use store::Store;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "scraperbot.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("scraperbot.log"))
        .expect("Failed to open log file");
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("Starting scraperbot (config: {config_path})");

    // Startup validation: a responder without its backing store has no
    // useful degraded mode.
    let store = match Store::open(&config.db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let transport =
        match SlackTransport::connect(config.slack_bot_token.clone(), config.poll_interval).await {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                error!("failed to connect to Slack: {e}");
                std::process::exit(1);
            }
        };

    let (tx, rx) = mpsc::channel(64);
    let listener = transport.clone().spawn_listener(tx);

    let mut session = Session::new(config.bot_name.clone(), transport, store);
    session::drive(rx, &mut session).await;

    listener.abort();
    info!("session ended");
}

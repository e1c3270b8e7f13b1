//! Duet server -- direct-messaging backend.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9100 with an in-memory store
//! cargo run --bin duet-server
//!
//! # Persist conversations and messages to a journal
//! cargo run --bin duet-server -- --bind 127.0.0.1:8080 --log-path ./duet.jsonl
//!
//! # Or via environment variables
//! DUET_ADDR=127.0.0.1:8080 DUET_LOG=debug cargo run --bin duet-server
//! ```

use std::sync::Arc;

use clap::Parser;
use duet_server::config::{ServerCliArgs, ServerConfig};
use duet_server::directory::MemoryDirectory;
use duet_server::durable::LogStore;
use duet_server::messenger::Messenger;
use duet_server::server;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    let cli = ServerCliArgs::parse();

    let config = match ServerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, users = config.users.len(), "starting duet server");

    let store = match &config.log_path {
        Some(path) => match LogStore::open(path).await {
            Ok(store) => store,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to open message log");
                std::process::exit(1);
            }
        },
        None => {
            tracing::warn!("no log path configured, messages are kept in memory only");
            LogStore::in_memory()
        }
    };
    let directory = MemoryDirectory::with_users(config.users.clone());
    let messenger = Arc::new(Messenger::new(
        Arc::new(store),
        Arc::new(directory),
        config.messenger_settings(),
    ));

    let (sync_stop, sync_rx) = watch::channel(false);
    let sync_task = config
        .sync_enabled
        .then(|| Arc::clone(messenger.sync_job()).spawn(config.sync_interval, sync_rx));

    let (server_stop, mut server_rx) = watch::channel(false);
    let stop_accepting = async move {
        let _ = server_rx.wait_for(|stop| *stop).await;
    };

    let (bound_addr, handle) = match server::start_server_with_shutdown(
        &config.bind_addr,
        Arc::clone(&messenger),
        stop_accepting,
    )
    .await
    {
        Ok(started) => started,
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };
    tracing::info!(addr = %bound_addr, "server listening");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");

    let report = server::drain(&messenger, &server_stop, handle, &sync_stop, sync_task).await;
    tracing::info!(
        inserted = report.messages_inserted,
        failures = report.failures,
        "hot cache flushed"
    );
}

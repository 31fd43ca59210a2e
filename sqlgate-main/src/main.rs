// Copyright 2025 Apache Doris Community
// Licensed under the Apache License, Version 2.0

//! sqlgate Main Entry Point

mod driver;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use sqlgate_common::Config;
use sqlgate_mysql::{
    Authenticator, MysqlServer, NativePasswordAuthenticator, Services, TrustAuthenticator,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::driver::AckDriver;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "conf/sqlgate.toml")]
    config: PathBuf,

    /// Log level, overrides the configuration file
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(&args.config)?;
    config.apply_env_overrides();
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    init_logging(&config.log_level)?;
    config.validate()?;

    info!("Starting sqlgate {}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", args.config);
    info!("Server version: {}", config.server_version);
    info!("Auth plugin: {}", config.auth.plugin);

    let authenticator: Arc<dyn Authenticator> = if config.auth.allow_all {
        warn!("auth.allow_all is set, every login is accepted");
        Arc::new(TrustAuthenticator)
    } else {
        Arc::new(NativePasswordAuthenticator::new(config.auth.users.clone()))
    };

    let services = Services::from_config(&config, Arc::new(AckDriver), authenticator);
    let server = Arc::new(MysqlServer::new(config.bind_addr(), services));
    let cancel = CancellationToken::new();

    info!("Starting MySQL protocol server on {}", config.bind_addr());
    let mut server_task = tokio::spawn({
        let server = Arc::clone(&server);
        let cancel = cancel.clone();
        async move { server.start(cancel).await }
    });

    info!("sqlgate is ready to serve");

    tokio::select! {
        _ = wait_for_shutdown() => {}
        result = &mut server_task => {
            // The listener only stops on its own when it fails
            result??;
            return Ok(());
        }
    }

    info!("Shutting down sqlgate, {} open connections", server.registry().len());
    cancel.cancel();
    server_task.await??;

    info!("sqlgate shut down complete");
    Ok(())
}

/// Initialize logging
fn init_logging(log_level: &str) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    Ok(())
}

/// Load configuration from file
fn load_config(config_path: &Path) -> anyhow::Result<Config> {
    if config_path.exists() {
        Config::from_file(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
    } else {
        eprintln!("Config file not found: {:?}, using defaults", config_path);
        Ok(Config::default())
    }
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

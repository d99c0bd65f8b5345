// Copyright 2025 SqlBridge Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

mod logger;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlbridge_common::ProxyConfig;
use sqlbridge_proxy::{ProxyEnv, SessionManagerImpl};
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "sqlbridge", version, about = "MySQL-protocol proxy for restricted backends")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the proxy.
    Serve {
        /// Path to the YAML configuration file.
        #[arg(long, default_value = "config/sqlbridge.yaml")]
        config: PathBuf,
        /// Override `logging.level` from the configuration.
        #[arg(long)]
        log_level: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config, log_level } => {
            if let Err(e) = run_serve(config, log_level) {
                eprintln!("sqlbridge: {e:#}");
                std::process::exit(1);
            }
        }
    }
}

fn run_serve(config_path: PathBuf, log_level: Option<String>) -> anyhow::Result<()> {
    let mut config = ProxyConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(level) = log_level {
        config.logging.level = level;
    }
    let _log_guard = logger::init(&config.logging);

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Ok(worker_threads) = std::env::var("SQLBRIDGE_WORKER_THREADS") {
        let worker_threads = worker_threads
            .parse()
            .context("SQLBRIDGE_WORKER_THREADS must be a number")?;
        builder.worker_threads(worker_threads);
    }
    builder
        .enable_all()
        .build()
        .context("building runtime")?
        .block_on(serve(config))
}

async fn serve(config: ProxyConfig) -> anyhow::Result<()> {
    let env = ProxyEnv::connect(config.clone())
        .await
        .context("connecting to backend")?;
    let session_mgr = Arc::new(SessionManagerImpl::new(env));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    sqlbridge_wire::serve(
        &config.proxy.listen_addr(),
        config.proxy.max_connections,
        session_mgr,
        shutdown_rx,
    )
    .await
    .context("serving")?;
    info!("clean shutdown");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

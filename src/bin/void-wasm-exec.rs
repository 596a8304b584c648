//! Void WASM executor daemon
//!
//! Usage:
//!   void-wasm-exec --config exec.toml [--listen 0.0.0.0:8787] [--dry-run]

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use void_wasm_exec::config::ExecConfig;
use void_wasm_exec::module::manager::ExecutionManager;
use void_wasm_exec::rpc::ExecServer;
use void_wasm_exec::utils::{create_shutdown_receiver, init_logging_from_config};

#[derive(Parser, Debug)]
#[command(name = "void-wasm-exec", version, about = "Capability-gated wasm executor")]
struct Args {
    /// Configuration file (.toml or .json); defaults apply when omitted
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Override the configured listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Admit runs without executing them
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match args.config {
        Some(ref path) => ExecConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ExecConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if args.dry_run {
        config.dry_run = true;
    }
    config.validate().context("Invalid configuration")?;

    init_logging_from_config(config.logging.as_ref());
    info!("void-wasm-exec {} starting", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(config);
    let manager = Arc::new(
        ExecutionManager::from_config(Arc::clone(&config)).context("Failed to build executor")?,
    );
    let server = ExecServer::new(config.listen_addr, Arc::clone(&manager));

    let shutdown = create_shutdown_receiver();
    server.start(shutdown).await?;

    manager.shutdown();
    info!("void-wasm-exec stopped");
    Ok(())
}

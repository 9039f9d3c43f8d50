//! cadenced - Cadence scheduling daemon

mod logging;
mod server;

use anyhow::{Context, Result};
use cadence_foundation::{Conf, Storage, CONF_FILE};
use cadence_task::{Cadence, Directive};
use clap::Parser;
use server::ControlServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Cadence - distributed task scheduler daemon
#[derive(Parser, Debug)]
#[command(name = "cadenced")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = CONF_FILE)]
    config: PathBuf,

    /// Control-channel port (overrides client_port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut conf = Conf::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(port) = args.port {
        conf.client_port = port;
    }

    let _log_guard = logging::init(&conf.log_file, args.debug)?;
    info!(config = %args.config.display(), host = %conf.self_host, "Starting cadenced");

    let storage = Storage::open(&conf.records_file)?;
    let cadence = Cadence::builder(conf.clone())
        .conf_path(&args.config)
        .sink(Arc::new(storage))
        .build()?;
    let mut directives = cadence
        .take_directives()
        .context("Directive channel already taken")?;

    let server = ControlServer::bind(("0.0.0.0", conf.client_port), Arc::clone(&cadence)).await?;
    info!(addr = %server.local_addr()?, "Listening for clients");
    let listener = tokio::spawn(server.serve());

    loop {
        tokio::select! {
            directive = directives.recv() => match directive {
                Some(Directive::Shutdown) | None => {
                    info!("Shutdown requested");
                    break;
                }
                Some(Directive::ReloadConfig) => {
                    if let Err(e) = cadence.reload() {
                        error!("Failed to reload configuration: {}", e);
                    }
                }
                Some(Directive::Unknown) => debug!("Ignoring unknown directive"),
            },
            _ = terminated() => {
                info!("Signal received");
                break;
            }
        }
    }

    listener.abort();
    cadence.shutdown();
    info!("cadenced stopped");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix
async fn terminated() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

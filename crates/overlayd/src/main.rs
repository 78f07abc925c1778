//! overlayd - overlay node daemon
//!
//! Runs a node's transport channels from a configuration file and command
//! line overrides, logs lifecycle events and prints inbound messages.

mod config;

use clap::Parser;
use config::Config;
use std::process::ExitCode;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();

    // Initialize logging
    let directive = if config.verbose {
        "overlayd=debug,overlay_net=debug"
    } else {
        "overlayd=info,overlay_net=info"
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive)))
        .init();

    info!("overlayd v{} - overlay node", env!("CARGO_PKG_VERSION"));

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let keypair = config.keypair()?;
    let transport_config = config.transport_config()?;
    info!("Node identity: {}", keypair.identity().to_hex());

    let transport = transport_config.build(keypair, None)?;

    // Log lifecycle events
    let mut events = transport.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if event.level() == Level::ERROR => warn!("Transport event: {}", event),
                Ok(event) => debug!("Transport event: {}", event),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} transport events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    transport.start().await?;

    if let Some(recipient) = config.send_to {
        match transport.send(recipient, config.message.clone().into_bytes()) {
            Ok(delivery) => {
                tokio::spawn(async move {
                    match delivery.wait().await {
                        Ok(()) => info!("Message to {} delivered", recipient),
                        Err(e) => warn!("Message to {} failed: {}", recipient, e),
                    }
                });
            }
            Err(e) => warn!("Cannot send to {}: {}", recipient, e),
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            inbound = transport.recv() => match inbound {
                Some(envelope) => println!(
                    "{} {}: {}",
                    envelope.id,
                    envelope.sender.to_hex(),
                    String::from_utf8_lossy(&envelope.payload)
                ),
                None => break,
            },
        }
    }

    transport.shutdown().await?;
    Ok(())
}

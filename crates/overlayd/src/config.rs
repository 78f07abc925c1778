//! overlayd configuration

use anyhow::Context;
use clap::Parser;
use overlay_core::{Identity, KeyPair};
use overlay_net::config::{DirectSettings, RelaySettings};
use overlay_net::TransportConfig;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Overlay node daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "overlayd")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Transport configuration file (JSON)
    #[arg(short, long, env = "OVERLAYD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Hex-encoded 32-byte key seed; a fresh identity is generated if absent
    #[arg(long, env = "OVERLAYD_SEED")]
    pub seed: Option<String>,

    /// Name announced to peers
    #[arg(long)]
    pub system_name: Option<String>,

    /// Listen address for direct connections
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Peers to dial directly (comma-separated addresses)
    #[arg(long, value_delimiter = ',')]
    pub peer: Vec<SocketAddr>,

    /// Relay to join, e.g. tcp://relay.example.org:22528
    #[arg(long)]
    pub relay: Option<String>,

    /// Send a message to this identity once started
    #[arg(long)]
    pub send_to: Option<Identity>,

    /// Payload for --send-to
    #[arg(long, default_value = "hello")]
    pub message: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Config {
    /// Node keypair from the seed, or a generated one
    pub fn keypair(&self) -> anyhow::Result<KeyPair> {
        let Some(seed) = &self.seed else {
            return Ok(KeyPair::generate());
        };
        let bytes = hex::decode(seed.trim()).context("Seed is not valid hex")?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("Seed must be 32 bytes"))?;
        Ok(KeyPair::from_seed(&seed))
    }

    /// Configuration file merged with command line overrides
    pub fn transport_config(&self) -> anyhow::Result<TransportConfig> {
        let mut transport = match &self.config {
            Some(path) => TransportConfig::from_json_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => TransportConfig::default(),
        };

        if let Some(name) = &self.system_name {
            transport.system_name = name.clone();
        }
        if self.listen.is_some() || !self.peer.is_empty() {
            let direct = transport.direct.get_or_insert_with(DirectSettings::default);
            if let Some(listen) = self.listen {
                direct.listen = listen;
            }
            direct.peers.extend(self.peer.iter().copied());
        }
        if let Some(url) = &self.relay {
            transport.relay.get_or_insert_with(RelaySettings::default).url = url.clone();
        }

        transport.validate()?;
        Ok(transport)
    }
}

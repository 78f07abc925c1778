//! Configuration for relayd

use clap::Parser;
use overlay_net::dedup::DEFAULT_DEDUP_CAPACITY;
use overlay_net::relay::protocol::DEFAULT_MAX_LINE_LENGTH;
use std::net::SocketAddr;
use std::time::Duration;

/// relayd - overlay super-peer relay
#[derive(Parser, Debug, Clone)]
#[command(name = "relayd")]
#[command(about = "Relays overlay messages between joined clients")]
pub struct Config {
    /// Listen address for client sessions
    #[arg(short, long, env = "RELAYD_LISTEN", default_value = "0.0.0.0:22528")]
    pub listen: SocketAddr,

    /// Seconds a new connection has to send its join
    #[arg(long, default_value = "10")]
    pub join_timeout_secs: u64,

    /// Maximum length of one JSON line
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_LENGTH)]
    pub max_line_length: usize,

    /// Message ids remembered per session for duplicate detection
    #[arg(long, default_value_t = DEFAULT_DEDUP_CAPACITY)]
    pub dedup_capacity: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.join_timeout_secs == 0 {
            anyhow::bail!("Join timeout must be at least one second");
        }
        if self.max_line_length < 256 {
            anyhow::bail!("Maximum line length is too small to carry a join");
        }
        if self.dedup_capacity == 0 {
            anyhow::bail!("Dedup capacity must be positive");
        }
        Ok(())
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse_from(["relayd"]);
        assert_eq!(config.listen.port(), 22528);
        assert_eq!(config.join_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_join_timeout() {
        let config = Config::parse_from(["relayd", "--join-timeout-secs", "0"]);
        assert!(config.validate().is_err());
    }
}

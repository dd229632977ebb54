use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub queue_depth: usize,
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            queue_depth: 256,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "rendezvous-relay",
    author,
    version,
    about = "Forwards every signaling frame to all other connected peers"
)]
pub struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(
        long,
        env = "RENDEZVOUS_RELAY_LISTEN_ADDR",
        default_value = "0.0.0.0:3001"
    )]
    pub listen_addr: String,

    /// Frames buffered per receiving connection before it is evicted as too slow.
    #[arg(long, env = "RENDEZVOUS_RELAY_QUEUE_DEPTH", default_value_t = 256)]
    pub queue_depth: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "RENDEZVOUS_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.queue_depth == 0 {
            bail!("queue depth must be at least 1");
        }
        Ok(RelayConfig {
            listen_addr,
            queue_depth: cli.queue_depth,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn defaults_match_cli_defaults() {
        let cli = Cli::try_parse_from(["rendezvous-relay"]).expect("parse");
        let config = RelayConfig::try_from(cli).expect("config");
        let defaults = RelayConfig::default();
        assert_eq!(config.listen_addr, defaults.listen_addr);
        assert_eq!(config.queue_depth, defaults.queue_depth);
        assert_eq!(config.shutdown_grace, defaults.shutdown_grace);
    }

    #[test_timeout::timeout]
    fn rejects_bad_values() {
        let cli = Cli::try_parse_from(["rendezvous-relay", "--listen-addr", "nowhere"])
            .expect("parse");
        assert!(RelayConfig::try_from(cli).is_err());

        let cli = Cli::try_parse_from(["rendezvous-relay", "--queue-depth", "0"]).expect("parse");
        assert!(RelayConfig::try_from(cli).is_err());
    }
}

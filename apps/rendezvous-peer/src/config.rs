use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use rendezvous_agent::relay_client::relay_url;
use rendezvous_agent::GlarePolicy;

pub const DEFAULT_STUN_URL: &str = "stun:stun.webrtc.ecl.ntt.com:3478";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EngineKind {
    /// webrtc-rs peer connection.
    Webrtc,
    /// In-process engine; negotiates without opening any media transport.
    Memory,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub relay_url: String,
    pub initiate: bool,
    pub glare: GlarePolicy,
    pub ice_servers: Vec<String>,
    pub media: bool,
    pub engine: EngineKind,
}

#[derive(Debug, Parser)]
#[command(
    name = "rendezvous-peer",
    author,
    version,
    about = "Negotiates a peer-to-peer session through a rendezvous relay"
)]
pub struct Cli {
    /// WebSocket URL of the relay.
    #[arg(long, env = "RENDEZVOUS_RELAY_URL", default_value = "ws://localhost:3001")]
    pub relay_url: String,

    /// Send an offer as soon as the relay link is up.
    #[arg(long)]
    pub initiate: bool,

    /// Give way when both sides offer at the same time.
    #[arg(long)]
    pub polite: bool,

    /// STUN/TURN server URL; may be repeated.
    #[arg(
        long = "stun",
        env = "RENDEZVOUS_STUN_URLS",
        value_delimiter = ',',
        default_value = DEFAULT_STUN_URL
    )]
    pub stun: Vec<String>,

    /// Do not offer a local video track.
    #[arg(long)]
    pub no_media: bool,

    #[arg(long, value_enum, default_value_t = EngineKind::Webrtc)]
    pub engine: EngineKind,
}

impl TryFrom<Cli> for PeerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        relay_url(&cli.relay_url)
            .with_context(|| format!("invalid relay url: {}", cli.relay_url))?;
        let mut ice_servers = Vec::with_capacity(cli.stun.len());
        for url in cli.stun {
            let url = url.trim();
            if url.is_empty() {
                continue;
            }
            if !["stun:", "turn:", "turns:"]
                .iter()
                .any(|scheme| url.starts_with(scheme))
            {
                bail!("ice server url must start with stun:, turn: or turns:, got `{url}`");
            }
            ice_servers.push(url.to_string());
        }
        Ok(PeerConfig {
            relay_url: cli.relay_url,
            initiate: cli.initiate,
            glare: if cli.polite {
                GlarePolicy::Yield
            } else {
                GlarePolicy::Reject
            },
            ice_servers,
            media: !cli.no_media,
            engine: cli.engine,
        })
    }
}

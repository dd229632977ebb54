use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rendezvous_agent::{
    acquire_local_media, connect, Agent, AgentConfig, EngineFactory, MemoryEngineFactory,
};
use tokio::signal;
use tracing::{info, warn};

mod config;
mod engine;
mod media;
mod telemetry;

use config::{Cli, EngineKind, PeerConfig};
use engine::WebRtcEngineFactory;
use media::{LocalVideo, LoggingPlayback, SyntheticCamera};

const HANGUP_GRACE: Duration = Duration::from_millis(500);
const LINK_GRACE: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init()?;

    let cli = Cli::parse();
    let config = PeerConfig::try_from(cli)?;
    info!(
        relay_url = %config.relay_url,
        initiate = config.initiate,
        glare = ?config.glare,
        engine = ?config.engine,
        "starting rendezvous peer"
    );

    match config.engine {
        EngineKind::Webrtc => {
            let camera = SyntheticCamera::new(config.media);
            let local: Option<LocalVideo> = acquire_local_media(&camera).await;
            let factory = WebRtcEngineFactory::new(
                config.ice_servers.clone(),
                local.as_ref().map(LocalVideo::track),
            )
            .context("failed to build webrtc engine")?;
            run(config, factory).await
        }
        EngineKind::Memory => run(config, MemoryEngineFactory::new("peer")).await,
    }
}

async fn run<F: EngineFactory + 'static>(config: PeerConfig, factory: F) -> Result<()> {
    let (agent, handle, outbound) = Agent::new(
        AgentConfig {
            glare: config.glare,
        },
        factory,
        Arc::new(LoggingPlayback),
    );
    let agent_task = tokio::spawn(agent.run());

    let mut link = connect(&config.relay_url, handle.clone(), outbound)
        .await
        .context("failed to connect to relay")?;
    info!(relay_url = %config.relay_url, "connected to relay");

    if config.initiate {
        handle.start();
    }

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("interrupt received; hanging up");
            handle.hang_up();
            let _ = tokio::time::timeout(
                HANGUP_GRACE,
                handle.wait_for_state(|state| !state.is_active()),
            )
            .await;
        }
        _ = link.wait_disconnected() => {
            warn!("relay link lost");
        }
    }

    handle.shutdown();
    agent_task.await.context("agent task failed")?;
    link.finish(LINK_GRACE).await;

    info!("peer stopped");
    Ok(())
}

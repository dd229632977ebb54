//! Client side of rendezvous signaling.
//!
//! A [`Negotiator`] decides, an [`Agent`] executes: the agent feeds relay
//! messages, engine events and local requests into the negotiator and carries
//! out the commands it returns against a [`PeerEngine`] and the relay link.

pub mod agent;
pub mod engine;
pub mod error;
pub mod media;
pub mod memory;
pub mod negotiator;
pub mod relay_client;
pub mod session;

pub use agent::{Agent, AgentConfig, AgentHandle};
pub use engine::{
    ConnectivityState, DescriptionKind, EngineEvents, EngineFactory, PeerEngine, RemoteStream,
};
pub use error::{EngineError, MediaError, NegotiationError, Step, Violation};
pub use media::{acquire_local_media, MediaSource, NoPlayback, Playback};
pub use memory::{EngineCall, MemoryEngineFactory, MemoryProbe};
pub use negotiator::{
    Command, Completion, EngineOp, GlarePolicy, Input, NegotiationState, Negotiator,
};
pub use relay_client::{connect, RelayClientError, RelayLink};
pub use session::{Role, Session, SessionId};

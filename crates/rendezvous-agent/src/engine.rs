//! Contract between the agent and the peer-connection engine that owns the
//! actual media transport. Descriptions and candidates are opaque here.

use std::fmt;

use async_trait::async_trait;
use rendezvous_proto::IceCandidate;
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::negotiator::Input;
use crate::session::{Role, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptionKind {
    Offer,
    Answer,
}

impl fmt::Display for DescriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptionKind::Offer => f.write_str("offer"),
            DescriptionKind::Answer => f.write_str("answer"),
        }
    }
}

/// Connectivity of the underlying engine, as reported by its ICE agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    /// `disconnected` may recover on its own; only these two end a session.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectivityState::Failed | ConnectivityState::Closed)
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectivityState::New => "new",
            ConnectivityState::Checking => "checking",
            ConnectivityState::Connected => "connected",
            ConnectivityState::Completed => "completed",
            ConnectivityState::Disconnected => "disconnected",
            ConnectivityState::Failed => "failed",
            ConnectivityState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Descriptor of a remote stream that started arriving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub stream_id: String,
    pub track_id: String,
    pub kind: String,
}

/// Sink the engine reports its asynchronous events into. Each sink is bound
/// to one session; events from an engine whose session is gone are dropped by
/// the agent.
#[derive(Debug, Clone)]
pub struct EngineEvents {
    session: SessionId,
    inputs: mpsc::UnboundedSender<Input>,
}

impl EngineEvents {
    pub fn new(session: SessionId, inputs: mpsc::UnboundedSender<Input>) -> Self {
        Self { session, inputs }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// `None` signals that candidate discovery has completed.
    pub fn local_candidate(&self, candidate: Option<IceCandidate>) {
        self.emit(Input::LocalCandidate {
            session: self.session,
            candidate,
        });
    }

    pub fn remote_stream(&self, stream: RemoteStream) {
        self.emit(Input::RemoteStream {
            session: self.session,
            stream,
        });
    }

    pub fn connectivity(&self, state: ConnectivityState) {
        self.emit(Input::Connectivity {
            session: self.session,
            state,
        });
    }

    fn emit(&self, input: Input) {
        if self.inputs.send(input).is_err() {
            tracing::trace!(
                target = "rendezvous::engine",
                session = %self.session,
                "agent gone; dropping engine event"
            );
        }
    }
}

/// One peer connection. Every method may take arbitrarily long; the agent
/// never awaits them on its event path.
#[async_trait]
pub trait PeerEngine: Send + Sync {
    async fn generate_offer(&self) -> Result<String, EngineError>;
    async fn generate_answer(&self) -> Result<String, EngineError>;
    async fn set_local_description(
        &self,
        kind: DescriptionKind,
        sdp: &str,
    ) -> Result<(), EngineError>;
    async fn set_remote_description(
        &self,
        kind: DescriptionKind,
        sdp: &str,
    ) -> Result<(), EngineError>;
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;
    async fn close(&self) -> Result<(), EngineError>;
}

/// Builds a fresh engine for each session.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    type Engine: PeerEngine + 'static;

    async fn create(&self, role: Role, events: EngineEvents) -> Result<Self::Engine, EngineError>;
}

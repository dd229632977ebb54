use rendezvous_proto::MessageKind;
use thiserror::Error;

use crate::engine::ConnectivityState;
use crate::negotiator::NegotiationState;

/// Everything that can go wrong while negotiating. None of these ever reach a
/// human; they are logged and mapped onto state transitions.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("local media access was denied")]
    UserDenied,
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] Violation),
    #[error("session description rejected while {step}: {reason}")]
    DescriptionRejected { step: Step, reason: String },
    #[error("relay transport failed")]
    TransportFailure,
    #[error("connectivity reached {0}")]
    ConnectivityFailure(ConnectivityState),
}

/// An event that the current state does not permit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("a session is already active ({0})")]
    SessionActive(NegotiationState),
    #[error("received {0} without an active session")]
    NoSession(MessageKind),
    #[error("received an offer while our own offer is outstanding (glare)")]
    Glare,
    #[error("received an answer while {0}")]
    UnexpectedAnswer(NegotiationState),
}

/// The engine operation that was running when a failure was reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    CreateEngine,
    GenerateOffer,
    GenerateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Step::CreateEngine => "creating the engine",
            Step::GenerateOffer => "generating the offer",
            Step::GenerateAnswer => "generating the answer",
            Step::SetLocalDescription => "setting the local description",
            Step::SetRemoteDescription => "setting the remote description",
        };
        f.write_str(label)
    }
}

/// Failures reported by a [`crate::PeerEngine`].
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("engine setup failed: {0}")]
    Setup(String),
    #[error("description rejected: {0}")]
    Rejected(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("engine already closed")]
    Closed,
}

/// Failures reported by a [`crate::MediaSource`].
#[derive(Debug, Clone, Error)]
pub enum MediaError {
    #[error("access to local media was denied")]
    Denied,
    #[error("no capture device available")]
    Unavailable,
    #[error("media capture failed: {0}")]
    Capture(String),
}

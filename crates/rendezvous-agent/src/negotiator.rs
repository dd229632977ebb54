//! The negotiation state machine.
//!
//! [`Negotiator`] is synchronous and performs no I/O: it consumes one
//! [`Input`] at a time and answers with the [`Command`]s the runtime has to
//! carry out. Engine work is asynchronous, so its results come back later as
//! [`Input::Completed`] events tagged with the session that issued them.

use std::fmt;

use rendezvous_proto::{IceCandidate, MessageKind, SignalMessage};
use tracing::{debug, info, trace, warn};

use crate::engine::{ConnectivityState, DescriptionKind, RemoteStream};
use crate::error::{NegotiationError, Step, Violation};
use crate::session::{Role, Session, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    Negotiating(Role),
    Exchanging,
    Closed,
}

impl NegotiationState {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            NegotiationState::Negotiating(_) | NegotiationState::Exchanging
        )
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::Idle => f.write_str("idle"),
            NegotiationState::Negotiating(role) => write!(f, "negotiating as {role}"),
            NegotiationState::Exchanging => f.write_str("exchanging"),
            NegotiationState::Closed => f.write_str("closed"),
        }
    }
}

/// What to do when an offer arrives while our own offer is outstanding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GlarePolicy {
    /// Drop the remote offer as a protocol violation and keep our session.
    #[default]
    Reject,
    /// Abandon our own offer and answer the remote one.
    Yield,
}

#[derive(Debug, Clone)]
pub enum Input {
    /// Local request to start a negotiation as initiator.
    Start,
    /// Local hang-up.
    Hangup,
    /// The runtime is stopping; release the session without telling the peer.
    Shutdown,
    Remote(SignalMessage),
    LocalCandidate {
        session: SessionId,
        candidate: Option<IceCandidate>,
    },
    Connectivity {
        session: SessionId,
        state: ConnectivityState,
    },
    RemoteStream {
        session: SessionId,
        stream: RemoteStream,
    },
    Completed {
        session: SessionId,
        completion: Completion,
    },
    TransportFailed,
}

/// Outcome of one [`EngineOp`].
#[derive(Debug, Clone)]
pub enum Completion {
    DescriptionGenerated { kind: DescriptionKind, sdp: String },
    LocalDescriptionSet { kind: DescriptionKind, sdp: String },
    RemoteDescriptionSet,
    Failed { step: Step, error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineOp {
    GenerateOffer,
    GenerateAnswer,
    SetLocal { kind: DescriptionKind, sdp: String },
    SetRemote { kind: DescriptionKind, sdp: String },
    AddCandidate(IceCandidate),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Create the engine for a new session and start its worker.
    OpenSession { session: SessionId, role: Role },
    /// Queue an operation on the session's engine. Operations run in order.
    Engine { session: SessionId, op: EngineOp },
    Send(SignalMessage),
    /// Close the session's engine and detach any playback.
    CloseSession { session: SessionId },
    Attach(RemoteStream),
}

pub struct Negotiator {
    state: NegotiationState,
    session: Option<Session>,
    next_session: u64,
    glare: GlarePolicy,
}

impl Negotiator {
    pub fn new(glare: GlarePolicy) -> Self {
        Self {
            state: NegotiationState::Idle,
            session: None,
            next_session: 1,
            glare,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Applies one input. An `Err` means the input was not permitted in the
    /// current state and there is nothing to execute; the only trace it leaves
    /// is a rejected colliding offer being remembered on the session.
    pub fn handle(&mut self, input: Input) -> Result<Vec<Command>, NegotiationError> {
        match input {
            Input::Start => self.start(),
            Input::Hangup => Ok(self.hang_up()),
            Input::Shutdown => Ok(self.shutdown()),
            Input::TransportFailed => Ok(self.fail_transport()),
            Input::Remote(message) => self.remote(message),
            Input::LocalCandidate { session, candidate } => {
                Ok(self.local_candidate(session, candidate))
            }
            Input::Connectivity { session, state } => Ok(self.connectivity(session, state)),
            Input::RemoteStream { session, stream } => {
                if !self.is_current(session) {
                    trace!(target = "rendezvous::negotiator", session = %session, "stale remote stream");
                    return Ok(Vec::new());
                }
                Ok(vec![Command::Attach(stream)])
            }
            Input::Completed {
                session,
                completion,
            } => Ok(self.completed(session, completion)),
        }
    }

    fn start(&mut self) -> Result<Vec<Command>, NegotiationError> {
        if self.state.is_active() {
            return Err(Violation::SessionActive(self.state).into());
        }
        let id = self.open(Role::Initiator);
        Ok(vec![
            Command::OpenSession {
                session: id,
                role: Role::Initiator,
            },
            Command::Engine {
                session: id,
                op: EngineOp::GenerateOffer,
            },
        ])
    }

    fn remote(&mut self, message: SignalMessage) -> Result<Vec<Command>, NegotiationError> {
        match message {
            SignalMessage::Offer { sdp } => self.remote_offer(sdp),
            SignalMessage::Answer { sdp } => self.remote_answer(sdp),
            SignalMessage::Candidate { ice } => self.remote_candidate(ice),
            SignalMessage::Close => Ok(self.remote_close()),
        }
    }

    fn remote_offer(&mut self, sdp: String) -> Result<Vec<Command>, NegotiationError> {
        let mut commands = Vec::new();
        match self.state {
            NegotiationState::Idle | NegotiationState::Closed => {}
            NegotiationState::Negotiating(Role::Initiator) => match self.glare {
                GlarePolicy::Reject => {
                    // Candidates the peer trickles for this offer must never
                    // reach our own session.
                    if let Some(session) = self.session.as_mut() {
                        session.mark_remote_offer_rejected();
                    }
                    return Err(Violation::Glare.into());
                }
                GlarePolicy::Yield => {
                    if let Some(abandoned) = self.session.take() {
                        info!(
                            target = "rendezvous::negotiator",
                            session = %abandoned.id(),
                            "offer collision; abandoning local offer"
                        );
                        commands.push(Command::CloseSession {
                            session: abandoned.id(),
                        });
                    }
                }
            },
            state => return Err(Violation::SessionActive(state).into()),
        }

        let id = self.open(Role::Responder);
        if let Some(session) = self.session.as_mut() {
            session.mark_remote_description_requested();
        }
        commands.push(Command::OpenSession {
            session: id,
            role: Role::Responder,
        });
        commands.push(Command::Engine {
            session: id,
            op: EngineOp::SetRemote {
                kind: DescriptionKind::Offer,
                sdp,
            },
        });
        Ok(commands)
    }

    fn remote_answer(&mut self, sdp: String) -> Result<Vec<Command>, NegotiationError> {
        match self.state {
            NegotiationState::Idle => Err(Violation::NoSession(MessageKind::Answer).into()),
            NegotiationState::Negotiating(Role::Initiator) => {
                let Some(session) = self.session.as_mut() else {
                    return Err(Violation::NoSession(MessageKind::Answer).into());
                };
                // An answer can only be for an offer that already went out.
                if !session.local_description_sent() || session.remote_description_requested() {
                    return Err(Violation::UnexpectedAnswer(self.state).into());
                }
                if session.rejected_remote_offer() {
                    // Each peer sends its description before its candidates
                    // and the relay keeps per-sender order, so everything
                    // buffered so far was meant for the rejected offer.
                    let discarded = session.discard_pending_remote();
                    if discarded > 0 {
                        debug!(
                            target = "rendezvous::negotiator",
                            session = %session.id(),
                            discarded,
                            "dropping candidates of the rejected offer"
                        );
                    }
                }
                session.mark_remote_description_requested();
                let id = session.id();
                self.transition(NegotiationState::Exchanging);
                Ok(vec![Command::Engine {
                    session: id,
                    op: EngineOp::SetRemote {
                        kind: DescriptionKind::Answer,
                        sdp,
                    },
                }])
            }
            NegotiationState::Negotiating(Role::Responder) => {
                Err(Violation::UnexpectedAnswer(self.state).into())
            }
            NegotiationState::Exchanging | NegotiationState::Closed => {
                debug!(
                    target = "rendezvous::negotiator",
                    state = %self.state,
                    "ignoring answer"
                );
                Ok(Vec::new())
            }
        }
    }

    fn remote_candidate(&mut self, ice: IceCandidate) -> Result<Vec<Command>, NegotiationError> {
        match self.state {
            NegotiationState::Idle => Err(Violation::NoSession(MessageKind::Candidate).into()),
            NegotiationState::Closed => {
                trace!(target = "rendezvous::negotiator", "dropping candidate after close");
                Ok(Vec::new())
            }
            _ => {
                let Some(session) = self.session.as_mut() else {
                    return Err(Violation::NoSession(MessageKind::Candidate).into());
                };
                match session.offer_remote_candidate(ice) {
                    Some(ice) => Ok(vec![Command::Engine {
                        session: session.id(),
                        op: EngineOp::AddCandidate(ice),
                    }]),
                    None => {
                        debug!(
                            target = "rendezvous::negotiator",
                            session = %session.id(),
                            buffered = session.pending_remote(),
                            "remote description pending; buffering candidate"
                        );
                        Ok(Vec::new())
                    }
                }
            }
        }
    }

    fn remote_close(&mut self) -> Vec<Command> {
        if !self.state.is_active() {
            debug!(target = "rendezvous::negotiator", state = %self.state, "close without session");
            return Vec::new();
        }
        info!(target = "rendezvous::negotiator", "peer closed the session");
        self.teardown(NegotiationState::Closed, false)
    }

    fn hang_up(&mut self) -> Vec<Command> {
        if !self.state.is_active() {
            return Vec::new();
        }
        info!(target = "rendezvous::negotiator", "hanging up");
        self.teardown(NegotiationState::Closed, true)
    }

    fn shutdown(&mut self) -> Vec<Command> {
        match self.session.take() {
            Some(session) => {
                self.transition(NegotiationState::Closed);
                vec![Command::CloseSession {
                    session: session.id(),
                }]
            }
            None => Vec::new(),
        }
    }

    fn fail_transport(&mut self) -> Vec<Command> {
        if !self.state.is_active() {
            return Vec::new();
        }
        warn!(
            target = "rendezvous::negotiator",
            error = %NegotiationError::TransportFailure,
            "tearing down session"
        );
        self.teardown(NegotiationState::Closed, true)
    }

    fn local_candidate(
        &mut self,
        session_id: SessionId,
        candidate: Option<IceCandidate>,
    ) -> Vec<Command> {
        if !self.is_current(session_id) {
            trace!(target = "rendezvous::negotiator", session = %session_id, "stale local candidate");
            return Vec::new();
        }
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        let Some(candidate) = candidate else {
            info!(
                target = "rendezvous::negotiator",
                session = %session_id,
                "candidate discovery complete"
            );
            return Vec::new();
        };
        match session.offer_local_candidate(candidate) {
            Some(ice) => vec![Command::Send(SignalMessage::Candidate { ice })],
            None => {
                debug!(
                    target = "rendezvous::negotiator",
                    session = %session_id,
                    queued = session.pending_local(),
                    "local description not sent yet; queueing candidate"
                );
                Vec::new()
            }
        }
    }

    fn connectivity(&mut self, session: SessionId, state: ConnectivityState) -> Vec<Command> {
        if !self.is_current(session) {
            trace!(target = "rendezvous::negotiator", session = %session, %state, "stale connectivity");
            return Vec::new();
        }
        if !state.is_terminal() {
            info!(target = "rendezvous::negotiator", session = %session, %state, "connectivity changed");
            return Vec::new();
        }
        warn!(
            target = "rendezvous::negotiator",
            session = %session,
            error = %NegotiationError::ConnectivityFailure(state),
            "tearing down session"
        );
        self.teardown(NegotiationState::Closed, true)
    }

    fn completed(&mut self, session_id: SessionId, completion: Completion) -> Vec<Command> {
        if !self.is_current(session_id) {
            debug!(
                target = "rendezvous::negotiator",
                session = %session_id,
                ?completion,
                "dropping completion for a closed session"
            );
            return Vec::new();
        }
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };

        match completion {
            Completion::DescriptionGenerated { kind, sdp } => vec![Command::Engine {
                session: session_id,
                op: EngineOp::SetLocal { kind, sdp },
            }],
            Completion::LocalDescriptionSet { kind, sdp } => {
                let message = match kind {
                    DescriptionKind::Offer => SignalMessage::Offer { sdp },
                    DescriptionKind::Answer => SignalMessage::Answer { sdp },
                };
                let mut commands = vec![Command::Send(message)];
                commands.extend(
                    session
                        .mark_local_description_sent()
                        .into_iter()
                        .map(|ice| Command::Send(SignalMessage::Candidate { ice })),
                );
                if session.role() == Role::Responder {
                    self.transition(NegotiationState::Exchanging);
                }
                commands
            }
            Completion::RemoteDescriptionSet => {
                let mut commands: Vec<Command> = session
                    .mark_remote_description_set()
                    .into_iter()
                    .map(|ice| Command::Engine {
                        session: session_id,
                        op: EngineOp::AddCandidate(ice),
                    })
                    .collect();
                if session.role() == Role::Responder {
                    commands.push(Command::Engine {
                        session: session_id,
                        op: EngineOp::GenerateAnswer,
                    });
                }
                commands
            }
            Completion::Failed { step, error } => {
                warn!(
                    target = "rendezvous::negotiator",
                    session = %session_id,
                    error = %NegotiationError::DescriptionRejected { step, reason: error },
                    "aborting session"
                );
                self.teardown(NegotiationState::Idle, true)
            }
        }
    }

    fn open(&mut self, role: Role) -> SessionId {
        let id = SessionId(self.next_session);
        self.next_session += 1;
        self.session = Some(Session::new(id, role));
        debug!(target = "rendezvous::negotiator", session = %id, %role, "session created");
        self.transition(NegotiationState::Negotiating(role));
        id
    }

    fn teardown(&mut self, next: NegotiationState, notify_peer: bool) -> Vec<Command> {
        let mut commands = Vec::new();
        if let Some(session) = self.session.take() {
            commands.push(Command::CloseSession {
                session: session.id(),
            });
        }
        if notify_peer {
            commands.push(Command::Send(SignalMessage::Close));
        }
        self.transition(next);
        commands
    }

    fn transition(&mut self, next: NegotiationState) {
        if self.state != next {
            info!(
                target = "rendezvous::negotiator",
                from = %self.state,
                to = %next,
                "state changed"
            );
            self.state = next;
        }
    }

    fn is_current(&self, session: SessionId) -> bool {
        self.session.as_ref().map(Session::id) == Some(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sent(commands: &[Command]) -> Vec<SignalMessage> {
        commands
            .iter()
            .filter_map(|command| match command {
                Command::Send(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    fn ops(commands: &[Command]) -> Vec<EngineOp> {
        commands
            .iter()
            .filter_map(|command| match command {
                Command::Engine { op, .. } => Some(op.clone()),
                _ => None,
            })
            .collect()
    }

    fn current(negotiator: &Negotiator) -> SessionId {
        negotiator.session().expect("live session").id()
    }

    fn complete(negotiator: &mut Negotiator, completion: Completion) -> Vec<Command> {
        let session = current(negotiator);
        negotiator
            .handle(Input::Completed {
                session,
                completion,
            })
            .expect("completion accepted")
    }

    fn remote(negotiator: &mut Negotiator, message: SignalMessage) -> Vec<Command> {
        negotiator
            .handle(Input::Remote(message))
            .expect("message accepted")
    }

    fn offer(sdp: &str) -> SignalMessage {
        SignalMessage::Offer { sdp: sdp.into() }
    }

    fn answer(sdp: &str) -> SignalMessage {
        SignalMessage::Answer { sdp: sdp.into() }
    }

    fn candidate(name: &str) -> SignalMessage {
        SignalMessage::Candidate {
            ice: IceCandidate::new(name),
        }
    }

    /// Drives an initiator up to the point where its offer is on the wire.
    fn initiator_with_offer_sent() -> Negotiator {
        let mut negotiator = Negotiator::new(GlarePolicy::Reject);
        negotiator.handle(Input::Start).expect("start");
        complete(
            &mut negotiator,
            Completion::DescriptionGenerated {
                kind: DescriptionKind::Offer,
                sdp: "offer-sdp".into(),
            },
        );
        complete(
            &mut negotiator,
            Completion::LocalDescriptionSet {
                kind: DescriptionKind::Offer,
                sdp: "offer-sdp".into(),
            },
        );
        negotiator
    }

    #[test_timeout::timeout]
    fn initiator_happy_path_reaches_exchanging() {
        let mut negotiator = Negotiator::new(GlarePolicy::Reject);
        let commands = negotiator.handle(Input::Start).expect("start");
        let id = current(&negotiator);
        assert_eq!(
            commands,
            vec![
                Command::OpenSession {
                    session: id,
                    role: Role::Initiator
                },
                Command::Engine {
                    session: id,
                    op: EngineOp::GenerateOffer
                },
            ]
        );
        assert_eq!(
            negotiator.state(),
            NegotiationState::Negotiating(Role::Initiator)
        );

        let commands = complete(
            &mut negotiator,
            Completion::DescriptionGenerated {
                kind: DescriptionKind::Offer,
                sdp: "X".into(),
            },
        );
        assert_eq!(
            ops(&commands),
            vec![EngineOp::SetLocal {
                kind: DescriptionKind::Offer,
                sdp: "X".into()
            }]
        );
        assert!(sent(&commands).is_empty());

        let commands = complete(
            &mut negotiator,
            Completion::LocalDescriptionSet {
                kind: DescriptionKind::Offer,
                sdp: "X".into(),
            },
        );
        assert_eq!(sent(&commands), vec![offer("X")]);
        assert_eq!(
            negotiator.state(),
            NegotiationState::Negotiating(Role::Initiator)
        );

        let commands = remote(&mut negotiator, answer("Y"));
        assert_eq!(
            ops(&commands),
            vec![EngineOp::SetRemote {
                kind: DescriptionKind::Answer,
                sdp: "Y".into()
            }]
        );
        assert_eq!(negotiator.state(), NegotiationState::Exchanging);
    }

    #[test_timeout::timeout]
    fn responder_answers_after_remote_description_is_accepted() {
        let mut negotiator = Negotiator::new(GlarePolicy::Reject);
        let commands = remote(&mut negotiator, offer("X"));
        let id = current(&negotiator);
        assert_eq!(
            commands,
            vec![
                Command::OpenSession {
                    session: id,
                    role: Role::Responder
                },
                Command::Engine {
                    session: id,
                    op: EngineOp::SetRemote {
                        kind: DescriptionKind::Offer,
                        sdp: "X".into()
                    }
                },
            ]
        );
        assert_eq!(
            negotiator.state(),
            NegotiationState::Negotiating(Role::Responder)
        );

        let commands = complete(&mut negotiator, Completion::RemoteDescriptionSet);
        assert_eq!(ops(&commands), vec![EngineOp::GenerateAnswer]);

        complete(
            &mut negotiator,
            Completion::DescriptionGenerated {
                kind: DescriptionKind::Answer,
                sdp: "Y".into(),
            },
        );
        assert_eq!(
            negotiator.state(),
            NegotiationState::Negotiating(Role::Responder)
        );

        let commands = complete(
            &mut negotiator,
            Completion::LocalDescriptionSet {
                kind: DescriptionKind::Answer,
                sdp: "Y".into(),
            },
        );
        assert_eq!(sent(&commands), vec![answer("Y")]);
        assert_eq!(negotiator.state(), NegotiationState::Exchanging);
    }

    #[test_timeout::timeout]
    fn early_remote_candidates_apply_in_order_after_description() {
        let mut negotiator = Negotiator::new(GlarePolicy::Reject);
        remote(&mut negotiator, offer("X"));

        assert!(remote(&mut negotiator, candidate("c1")).is_empty());
        assert!(remote(&mut negotiator, candidate("c2")).is_empty());

        let commands = complete(&mut negotiator, Completion::RemoteDescriptionSet);
        assert_eq!(
            ops(&commands),
            vec![
                EngineOp::AddCandidate(IceCandidate::new("c1")),
                EngineOp::AddCandidate(IceCandidate::new("c2")),
                EngineOp::GenerateAnswer,
            ]
        );

        let commands = remote(&mut negotiator, candidate("c3"));
        assert_eq!(
            ops(&commands),
            vec![EngineOp::AddCandidate(IceCandidate::new("c3"))]
        );
    }

    #[test_timeout::timeout]
    fn local_candidates_wait_for_description_to_be_sent() {
        let mut negotiator = Negotiator::new(GlarePolicy::Reject);
        negotiator.handle(Input::Start).expect("start");
        let id = current(&negotiator);

        let early = negotiator
            .handle(Input::LocalCandidate {
                session: id,
                candidate: Some(IceCandidate::new("l1")),
            })
            .expect("candidate");
        assert!(early.is_empty());

        let commands = complete(
            &mut negotiator,
            Completion::LocalDescriptionSet {
                kind: DescriptionKind::Offer,
                sdp: "X".into(),
            },
        );
        assert_eq!(sent(&commands), vec![offer("X"), candidate("l1")]);

        let commands = negotiator
            .handle(Input::LocalCandidate {
                session: id,
                candidate: Some(IceCandidate::new("l2")),
            })
            .expect("candidate");
        assert_eq!(sent(&commands), vec![candidate("l2")]);

        let done = negotiator
            .handle(Input::LocalCandidate {
                session: id,
                candidate: None,
            })
            .expect("end of candidates");
        assert!(done.is_empty());
    }

    #[test_timeout::timeout]
    fn second_start_is_a_violation_and_keeps_the_session() {
        let mut negotiator = initiator_with_offer_sent();
        let before = current(&negotiator);
        let err = negotiator.handle(Input::Start).unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::ProtocolViolation(Violation::SessionActive(
                NegotiationState::Negotiating(Role::Initiator)
            ))
        ));
        assert_eq!(current(&negotiator), before);
    }

    #[test_timeout::timeout]
    fn offer_during_active_responder_session_is_rejected() {
        let mut negotiator = Negotiator::new(GlarePolicy::Reject);
        remote(&mut negotiator, offer("X"));
        let before = current(&negotiator);
        let err = negotiator.handle(Input::Remote(offer("Z"))).unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::ProtocolViolation(Violation::SessionActive(_))
        ));
        assert_eq!(current(&negotiator), before);
    }

    #[test_timeout::timeout]
    fn glare_rejected_by_default() {
        let mut negotiator = initiator_with_offer_sent();
        let err = negotiator.handle(Input::Remote(offer("Z"))).unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::ProtocolViolation(Violation::Glare)
        ));
        assert_eq!(
            negotiator.state(),
            NegotiationState::Negotiating(Role::Initiator)
        );
    }

    #[test_timeout::timeout]
    fn candidates_of_a_rejected_colliding_offer_are_never_applied() {
        let mut negotiator = initiator_with_offer_sent();
        assert!(negotiator.handle(Input::Remote(offer("Z"))).is_err());
        assert!(remote(&mut negotiator, candidate("for-z-1")).is_empty());
        assert!(remote(&mut negotiator, candidate("for-z-2")).is_empty());

        let commands = remote(&mut negotiator, answer("Y"));
        assert_eq!(
            ops(&commands),
            vec![EngineOp::SetRemote {
                kind: DescriptionKind::Answer,
                sdp: "Y".into()
            }]
        );
        assert_eq!(negotiator.session().map(Session::pending_remote), Some(0));

        let commands = complete(&mut negotiator, Completion::RemoteDescriptionSet);
        assert!(!ops(&commands)
            .iter()
            .any(|op| matches!(op, EngineOp::AddCandidate(_))));

        let commands = remote(&mut negotiator, candidate("for-y"));
        assert_eq!(
            ops(&commands),
            vec![EngineOp::AddCandidate(IceCandidate::new("for-y"))]
        );
    }

    #[test_timeout::timeout]
    fn exchanging_session_refuses_start_and_new_offer() {
        let mut negotiator = initiator_with_offer_sent();
        remote(&mut negotiator, answer("Y"));
        assert_eq!(negotiator.state(), NegotiationState::Exchanging);
        let before = current(&negotiator);

        assert!(matches!(
            negotiator.handle(Input::Start),
            Err(NegotiationError::ProtocolViolation(Violation::SessionActive(
                NegotiationState::Exchanging
            )))
        ));
        assert!(matches!(
            negotiator.handle(Input::Remote(offer("Z"))),
            Err(NegotiationError::ProtocolViolation(Violation::SessionActive(
                NegotiationState::Exchanging
            )))
        ));
        assert_eq!(current(&negotiator), before);
        assert_eq!(negotiator.state(), NegotiationState::Exchanging);
    }

    #[test_timeout::timeout]
    fn polite_peer_yields_to_remote_offer() {
        let mut negotiator = Negotiator::new(GlarePolicy::Yield);
        negotiator.handle(Input::Start).expect("start");
        let abandoned = current(&negotiator);

        let commands = remote(&mut negotiator, offer("Z"));
        let fresh = current(&negotiator);
        assert_ne!(fresh, abandoned);
        assert_eq!(
            commands,
            vec![
                Command::CloseSession { session: abandoned },
                Command::OpenSession {
                    session: fresh,
                    role: Role::Responder
                },
                Command::Engine {
                    session: fresh,
                    op: EngineOp::SetRemote {
                        kind: DescriptionKind::Offer,
                        sdp: "Z".into()
                    }
                },
            ]
        );
        assert!(sent(&commands).is_empty());
        assert_eq!(
            negotiator.state(),
            NegotiationState::Negotiating(Role::Responder)
        );
    }

    #[test_timeout::timeout]
    fn answer_and_candidate_without_session_are_violations() {
        let mut negotiator = Negotiator::new(GlarePolicy::Reject);
        assert!(matches!(
            negotiator.handle(Input::Remote(answer("Y"))),
            Err(NegotiationError::ProtocolViolation(Violation::NoSession(
                MessageKind::Answer
            )))
        ));
        assert!(matches!(
            negotiator.handle(Input::Remote(candidate("c"))),
            Err(NegotiationError::ProtocolViolation(Violation::NoSession(
                MessageKind::Candidate
            )))
        ));
        assert_eq!(negotiator.state(), NegotiationState::Idle);
    }

    #[test_timeout::timeout]
    fn answer_is_unexpected_for_responder_and_before_offer_is_sent() {
        let mut responder = Negotiator::new(GlarePolicy::Reject);
        remote(&mut responder, offer("X"));
        assert!(matches!(
            responder.handle(Input::Remote(answer("Y"))),
            Err(NegotiationError::ProtocolViolation(
                Violation::UnexpectedAnswer(_)
            ))
        ));

        let mut initiator = Negotiator::new(GlarePolicy::Reject);
        initiator.handle(Input::Start).expect("start");
        assert!(matches!(
            initiator.handle(Input::Remote(answer("Y"))),
            Err(NegotiationError::ProtocolViolation(
                Violation::UnexpectedAnswer(_)
            ))
        ));
    }

    #[test_timeout::timeout]
    fn duplicate_answer_is_ignored() {
        let mut negotiator = initiator_with_offer_sent();
        remote(&mut negotiator, answer("Y"));
        assert!(remote(&mut negotiator, answer("Y2")).is_empty());
        assert_eq!(negotiator.state(), NegotiationState::Exchanging);
    }

    #[test_timeout::timeout]
    fn terminal_connectivity_closes_and_notifies_peer() {
        let mut negotiator = initiator_with_offer_sent();
        remote(&mut negotiator, answer("Y"));
        let id = current(&negotiator);

        let quiet = negotiator
            .handle(Input::Connectivity {
                session: id,
                state: ConnectivityState::Disconnected,
            })
            .expect("connectivity");
        assert!(quiet.is_empty());
        assert_eq!(negotiator.state(), NegotiationState::Exchanging);

        let commands = negotiator
            .handle(Input::Connectivity {
                session: id,
                state: ConnectivityState::Failed,
            })
            .expect("connectivity");
        assert_eq!(
            commands,
            vec![
                Command::CloseSession { session: id },
                Command::Send(SignalMessage::Close)
            ]
        );
        assert_eq!(negotiator.state(), NegotiationState::Closed);
        assert!(negotiator.session().is_none());
    }

    #[test_timeout::timeout]
    fn remote_close_tears_down_without_echo_and_is_idempotent() {
        let mut negotiator = initiator_with_offer_sent();
        let id = current(&negotiator);
        let commands = remote(&mut negotiator, SignalMessage::Close);
        assert_eq!(commands, vec![Command::CloseSession { session: id }]);
        assert_eq!(negotiator.state(), NegotiationState::Closed);

        assert!(remote(&mut negotiator, SignalMessage::Close).is_empty());
        assert!(negotiator.handle(Input::Hangup).expect("hangup").is_empty());
        assert!(remote(&mut negotiator, candidate("late")).is_empty());
        assert!(remote(&mut negotiator, answer("late")).is_empty());
        assert_eq!(negotiator.state(), NegotiationState::Closed);
    }

    #[test_timeout::timeout]
    fn hang_up_sends_close_once() {
        let mut negotiator = initiator_with_offer_sent();
        let commands = negotiator.handle(Input::Hangup).expect("hangup");
        assert_eq!(sent(&commands), vec![SignalMessage::Close]);
        let again = negotiator.handle(Input::Hangup).expect("hangup");
        assert!(again.is_empty());

        let mut idle = Negotiator::new(GlarePolicy::Reject);
        assert!(idle.handle(Input::Hangup).expect("hangup").is_empty());
        assert_eq!(idle.state(), NegotiationState::Idle);
    }

    #[test_timeout::timeout]
    fn closed_agent_accepts_a_new_session() {
        let mut negotiator = initiator_with_offer_sent();
        let first = current(&negotiator);
        negotiator.handle(Input::Hangup).expect("hangup");

        remote(&mut negotiator, offer("again"));
        assert!(current(&negotiator) > first);
        assert_eq!(
            negotiator.state(),
            NegotiationState::Negotiating(Role::Responder)
        );

        negotiator.handle(Input::Hangup).expect("hangup");
        negotiator.handle(Input::Start).expect("restart");
        assert_eq!(
            negotiator.state(),
            NegotiationState::Negotiating(Role::Initiator)
        );
    }

    #[test_timeout::timeout]
    fn rejected_description_aborts_to_idle() {
        let mut negotiator = Negotiator::new(GlarePolicy::Reject);
        remote(&mut negotiator, offer("garbage"));
        let id = current(&negotiator);
        let commands = complete(
            &mut negotiator,
            Completion::Failed {
                step: Step::SetRemoteDescription,
                error: "bad sdp".into(),
            },
        );
        assert_eq!(
            commands,
            vec![
                Command::CloseSession { session: id },
                Command::Send(SignalMessage::Close)
            ]
        );
        assert_eq!(negotiator.state(), NegotiationState::Idle);
    }

    #[test_timeout::timeout]
    fn events_from_torn_down_session_are_dropped() {
        let mut negotiator = initiator_with_offer_sent();
        let stale = current(&negotiator);
        negotiator.handle(Input::Hangup).expect("hangup");
        negotiator.handle(Input::Start).expect("restart");
        let state = negotiator.state();

        let inputs = vec![
            Input::Completed {
                session: stale,
                completion: Completion::RemoteDescriptionSet,
            },
            Input::LocalCandidate {
                session: stale,
                candidate: Some(IceCandidate::new("old")),
            },
            Input::Connectivity {
                session: stale,
                state: ConnectivityState::Failed,
            },
            Input::RemoteStream {
                session: stale,
                stream: RemoteStream {
                    stream_id: "s".into(),
                    track_id: "t".into(),
                    kind: "video".into(),
                },
            },
        ];
        for input in inputs {
            assert!(negotiator.handle(input).expect("stale input").is_empty());
        }
        assert_eq!(negotiator.state(), state);
    }

    #[test_timeout::timeout]
    fn transport_failure_behaves_like_connectivity_failure() {
        let mut negotiator = initiator_with_offer_sent();
        let commands = negotiator
            .handle(Input::TransportFailed)
            .expect("transport failure");
        assert_eq!(sent(&commands), vec![SignalMessage::Close]);
        assert_eq!(negotiator.state(), NegotiationState::Closed);

        assert!(negotiator
            .handle(Input::TransportFailed)
            .expect("again")
            .is_empty());
    }

    #[test_timeout::timeout]
    fn shutdown_releases_session_silently() {
        let mut negotiator = initiator_with_offer_sent();
        let id = current(&negotiator);
        let commands = negotiator.handle(Input::Shutdown).expect("shutdown");
        assert_eq!(commands, vec![Command::CloseSession { session: id }]);
        assert_eq!(negotiator.state(), NegotiationState::Closed);
    }
}

//! Async runtime around [`Negotiator`].
//!
//! The agent drains a single event queue and handles each event to
//! completion. Engine work never runs on that path: every session gets a
//! worker task that owns the engine and executes operations strictly in the
//! order they were issued, reporting results back as tagged events.

use std::collections::HashMap;
use std::sync::Arc;

use rendezvous_proto::SignalMessage;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::engine::{DescriptionKind, EngineEvents, EngineFactory, PeerEngine};
use crate::error::Step;
use crate::media::Playback;
use crate::negotiator::{
    Command, Completion, EngineOp, GlarePolicy, Input, NegotiationState, Negotiator,
};
use crate::session::{Role, SessionId};

#[derive(Debug, Clone, Copy, Default)]
pub struct AgentConfig {
    pub glare: GlarePolicy,
}

struct SessionWorker {
    ops: mpsc::UnboundedSender<EngineOp>,
    close: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct Agent<F: EngineFactory + 'static> {
    negotiator: Negotiator,
    factory: Arc<F>,
    playback: Arc<dyn Playback>,
    inputs_tx: mpsc::UnboundedSender<Input>,
    inputs_rx: mpsc::UnboundedReceiver<Input>,
    outbound: mpsc::UnboundedSender<SignalMessage>,
    state_tx: watch::Sender<NegotiationState>,
    workers: HashMap<SessionId, SessionWorker>,
    closing: Vec<JoinHandle<()>>,
}

/// Cloneable control surface of a running [`Agent`]. Dropping the last clone
/// shuts the agent down.
#[derive(Clone)]
pub struct AgentHandle {
    inputs: mpsc::UnboundedSender<Input>,
    state: watch::Receiver<NegotiationState>,
    _release: Arc<ShutdownOnDrop>,
}

/// The agent and its engines keep internal senders of their own, so the
/// input queue never closes by itself.
struct ShutdownOnDrop {
    inputs: mpsc::UnboundedSender<Input>,
}

impl Drop for ShutdownOnDrop {
    fn drop(&mut self) {
        let _ = self.inputs.send(Input::Shutdown);
    }
}

impl<F: EngineFactory + 'static> Agent<F> {
    /// Builds an agent. Messages it wants delivered to the peer come out of
    /// the returned receiver; whoever owns the relay link drains it.
    pub fn new(
        config: AgentConfig,
        factory: F,
        playback: Arc<dyn Playback>,
    ) -> (Self, AgentHandle, mpsc::UnboundedReceiver<SignalMessage>) {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(NegotiationState::Idle);
        let handle = AgentHandle {
            inputs: inputs_tx.clone(),
            state: state_rx,
            _release: Arc::new(ShutdownOnDrop {
                inputs: inputs_tx.clone(),
            }),
        };
        let agent = Self {
            negotiator: Negotiator::new(config.glare),
            factory: Arc::new(factory),
            playback,
            inputs_tx,
            inputs_rx,
            outbound,
            state_tx,
            workers: HashMap::new(),
            closing: Vec::new(),
        };
        (agent, handle, outbound_rx)
    }

    /// Runs until [`AgentHandle::shutdown`] is called or the last handle is
    /// dropped. Engines of any live
    /// session are closed before this returns.
    pub async fn run(mut self) {
        while let Some(input) = self.inputs_rx.recv().await {
            let stop = matches!(input, Input::Shutdown);
            self.step(input);
            if stop {
                break;
            }
        }

        for (_, worker) in self.workers.drain() {
            let _ = worker.close.send(());
            self.closing.push(worker.task);
        }
        for task in self.closing.drain(..) {
            if let Err(err) = task.await {
                debug!(target = "rendezvous::agent", error = %err, "session worker ended abnormally");
            }
        }
        debug!(target = "rendezvous::agent", "agent stopped");
    }

    fn step(&mut self, input: Input) {
        trace!(target = "rendezvous::agent", ?input, "event");
        match self.negotiator.handle(input) {
            Ok(commands) => {
                for command in commands {
                    self.execute(command);
                }
            }
            Err(err) => {
                warn!(
                    target = "rendezvous::agent",
                    state = %self.negotiator.state(),
                    error = %err,
                    "event dropped"
                );
            }
        }

        let next = self.negotiator.state();
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::OpenSession { session, role } => self.open_session(session, role),
            Command::Engine { session, op } => match self.workers.get(&session) {
                Some(worker) => {
                    if worker.ops.send(op).is_err() {
                        debug!(target = "rendezvous::agent", session = %session, "session worker gone; op dropped");
                    }
                }
                None => {
                    debug!(target = "rendezvous::agent", session = %session, "no worker for session; op dropped");
                }
            },
            Command::Send(message) => {
                let kind = message.kind();
                if self.outbound.send(message).is_err() {
                    warn!(target = "rendezvous::agent", %kind, "relay link gone; message not sent");
                    let _ = self.inputs_tx.send(Input::TransportFailed);
                } else {
                    debug!(target = "rendezvous::agent", %kind, "message queued for relay");
                }
            }
            Command::CloseSession { session } => {
                if let Some(worker) = self.workers.remove(&session) {
                    let _ = worker.close.send(());
                    self.closing.retain(|task| !task.is_finished());
                    self.closing.push(worker.task);
                }
                self.playback.detach();
                info!(target = "rendezvous::agent", session = %session, "session closed");
            }
            Command::Attach(stream) => {
                info!(
                    target = "rendezvous::agent",
                    stream_id = %stream.stream_id,
                    kind = %stream.kind,
                    "remote stream arrived"
                );
                self.playback.attach(&stream);
            }
        }
    }

    fn open_session(&mut self, session: SessionId, role: Role) {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        let events = EngineEvents::new(session, self.inputs_tx.clone());
        let task = tokio::spawn(run_session_worker(
            Arc::clone(&self.factory),
            session,
            role,
            events,
            ops_rx,
            close_rx,
            self.inputs_tx.clone(),
        ));
        self.workers.insert(
            session,
            SessionWorker {
                ops: ops_tx,
                close: close_tx,
                task,
            },
        );
    }
}

async fn run_session_worker<F: EngineFactory>(
    factory: Arc<F>,
    session: SessionId,
    role: Role,
    events: EngineEvents,
    mut ops: mpsc::UnboundedReceiver<EngineOp>,
    mut close: oneshot::Receiver<()>,
    inputs: mpsc::UnboundedSender<Input>,
) {
    let engine = tokio::select! {
        biased;
        _ = &mut close => {
            debug!(target = "rendezvous::agent", session = %session, "closed before engine was created");
            return;
        }
        created = factory.create(role, events) => match created {
            Ok(engine) => engine,
            Err(err) => {
                let _ = inputs.send(Input::Completed {
                    session,
                    completion: Completion::Failed {
                        step: Step::CreateEngine,
                        error: err.to_string(),
                    },
                });
                return;
            }
        },
    };
    debug!(target = "rendezvous::agent", session = %session, %role, "engine ready");

    loop {
        let op = tokio::select! {
            biased;
            _ = &mut close => break,
            op = ops.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };
        let Some(completion) = perform(&engine, session, op).await else {
            continue;
        };
        if inputs
            .send(Input::Completed {
                session,
                completion,
            })
            .is_err()
        {
            break;
        }
    }

    if let Err(err) = engine.close().await {
        debug!(target = "rendezvous::agent", session = %session, error = %err, "engine close failed");
    }
    debug!(target = "rendezvous::agent", session = %session, "session worker exiting");
}

async fn perform<E: PeerEngine>(
    engine: &E,
    session: SessionId,
    op: EngineOp,
) -> Option<Completion> {
    let completion = match op {
        EngineOp::GenerateOffer => match engine.generate_offer().await {
            Ok(sdp) => Completion::DescriptionGenerated {
                kind: DescriptionKind::Offer,
                sdp,
            },
            Err(err) => Completion::Failed {
                step: Step::GenerateOffer,
                error: err.to_string(),
            },
        },
        EngineOp::GenerateAnswer => match engine.generate_answer().await {
            Ok(sdp) => Completion::DescriptionGenerated {
                kind: DescriptionKind::Answer,
                sdp,
            },
            Err(err) => Completion::Failed {
                step: Step::GenerateAnswer,
                error: err.to_string(),
            },
        },
        EngineOp::SetLocal { kind, sdp } => match engine.set_local_description(kind, &sdp).await {
            Ok(()) => Completion::LocalDescriptionSet { kind, sdp },
            Err(err) => Completion::Failed {
                step: Step::SetLocalDescription,
                error: err.to_string(),
            },
        },
        EngineOp::SetRemote { kind, sdp } => {
            match engine.set_remote_description(kind, &sdp).await {
                Ok(()) => Completion::RemoteDescriptionSet,
                Err(err) => Completion::Failed {
                    step: Step::SetRemoteDescription,
                    error: err.to_string(),
                },
            }
        }
        EngineOp::AddCandidate(candidate) => {
            if let Err(err) = engine.add_remote_candidate(candidate).await {
                warn!(
                    target = "rendezvous::agent",
                    session = %session,
                    error = %err,
                    "remote candidate not applied"
                );
            }
            return None;
        }
    };
    Some(completion)
}

impl AgentHandle {
    pub fn start(&self) {
        self.send(Input::Start);
    }

    pub fn hang_up(&self) {
        self.send(Input::Hangup);
    }

    pub fn shutdown(&self) {
        self.send(Input::Shutdown);
    }

    pub fn transport_failed(&self) {
        self.send(Input::TransportFailed);
    }

    pub fn deliver(&self, message: SignalMessage) {
        self.send(Input::Remote(message));
    }

    /// Decodes and delivers a text frame from the relay. Frames that fail
    /// validation are logged and dropped.
    pub fn deliver_text(&self, text: &str) {
        match SignalMessage::decode(text) {
            Ok(message) => self.deliver(message),
            Err(err) => log_rejected(&err, text.len()),
        }
    }

    pub fn deliver_bytes(&self, bytes: &[u8]) {
        match SignalMessage::decode_slice(bytes) {
            Ok(message) => self.deliver(message),
            Err(err) => log_rejected(&err, bytes.len()),
        }
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<NegotiationState> {
        self.state.clone()
    }

    /// Waits until the published state satisfies `predicate`. Returns `None`
    /// once the agent has stopped without getting there.
    pub async fn wait_for_state(
        &self,
        mut predicate: impl FnMut(NegotiationState) -> bool,
    ) -> Option<NegotiationState> {
        let mut state = self.state.clone();
        let result = state.wait_for(|current| predicate(*current)).await;
        result.ok().map(|current| *current)
    }

    fn send(&self, input: Input) {
        if self.inputs.send(input).is_err() {
            debug!(target = "rendezvous::agent", "agent stopped; input ignored");
        }
    }
}

fn log_rejected(err: &rendezvous_proto::DecodeError, len: usize) {
    if err.is_unknown_type() {
        info!(target = "rendezvous::agent", error = %err, len, "ignoring unknown message");
    } else {
        warn!(target = "rendezvous::agent", error = %err, len, "dropping invalid frame");
    }
}

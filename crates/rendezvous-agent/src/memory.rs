//! In-process [`PeerEngine`] with no real transport.
//!
//! Descriptions are synthetic strings and connectivity is simulated: an
//! engine reports `connected` once both of its descriptions are in place.
//! Every call is recorded on a shared [`MemoryProbe`] so tests can check
//! ordering against the engine's view of the world.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rendezvous_proto::IceCandidate;

use crate::engine::{
    ConnectivityState, DescriptionKind, EngineEvents, EngineFactory, PeerEngine, RemoteStream,
};
use crate::error::EngineError;
use crate::session::{Role, SessionId};

/// One call observed by a memory engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Created(Role),
    GenerateOffer,
    GenerateAnswer,
    SetLocal(DescriptionKind),
    SetRemote(DescriptionKind, String),
    AddCandidate(String),
    Close,
}

#[derive(Default)]
struct ProbeInner {
    calls: Vec<(SessionId, EngineCall)>,
    reject_remote: bool,
    fail_create: bool,
    latest: Option<EngineEvents>,
}

/// Shared view into every engine a [`MemoryEngineFactory`] has built.
#[derive(Clone, Default)]
pub struct MemoryProbe {
    inner: Arc<Mutex<ProbeInner>>,
}

impl MemoryProbe {
    pub fn calls(&self) -> Vec<(SessionId, EngineCall)> {
        self.inner.lock().calls.clone()
    }

    pub fn calls_for(&self, session: SessionId) -> Vec<EngineCall> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|(id, _)| *id == session)
            .map(|(_, call)| call.clone())
            .collect()
    }

    /// Applied remote candidates, in the order the engine received them.
    pub fn applied_candidates(&self) -> Vec<String> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter_map(|(_, call)| match call {
                EngineCall::AddCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn closed(&self, session: SessionId) -> bool {
        self.calls_for(session).contains(&EngineCall::Close)
    }

    /// Makes every later `set_remote_description` fail.
    pub fn reject_remote_descriptions(&self, reject: bool) {
        self.inner.lock().reject_remote = reject;
    }

    /// Makes every later engine construction fail.
    pub fn fail_creation(&self, fail: bool) {
        self.inner.lock().fail_create = fail;
    }

    /// Reports `state` from the most recently created engine.
    pub fn inject_connectivity(&self, state: ConnectivityState) {
        if let Some(events) = self.inner.lock().latest.as_ref() {
            events.connectivity(state);
        }
    }

    /// Reports a locally discovered candidate from the most recently created
    /// engine.
    pub fn inject_local_candidate(&self, candidate: Option<IceCandidate>) {
        if let Some(events) = self.inner.lock().latest.as_ref() {
            events.local_candidate(candidate);
        }
    }

    fn record(&self, session: SessionId, call: EngineCall) {
        self.inner.lock().calls.push((session, call));
    }
}

/// Builds [`MemoryEngine`]s. `label` prefixes every synthetic description
/// and candidate so two agents' traffic can be told apart.
#[derive(Clone)]
pub struct MemoryEngineFactory {
    label: String,
    candidates: usize,
    probe: MemoryProbe,
}

impl MemoryEngineFactory {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            candidates: 2,
            probe: MemoryProbe::default(),
        }
    }

    /// Number of candidates each engine discovers after its local description
    /// is set.
    pub fn with_candidates(mut self, candidates: usize) -> Self {
        self.candidates = candidates;
        self
    }

    pub fn probe(&self) -> MemoryProbe {
        self.probe.clone()
    }
}

#[async_trait]
impl EngineFactory for MemoryEngineFactory {
    type Engine = MemoryEngine;

    async fn create(&self, role: Role, events: EngineEvents) -> Result<MemoryEngine, EngineError> {
        let session = events.session();
        {
            let mut inner = self.probe.inner.lock();
            if inner.fail_create {
                return Err(EngineError::Setup("memory engine creation disabled".into()));
            }
            inner.latest = Some(events.clone());
        }
        self.probe.record(session, EngineCall::Created(role));
        Ok(MemoryEngine {
            label: self.label.clone(),
            candidates: self.candidates,
            session,
            events,
            probe: self.probe.clone(),
            state: Mutex::new(EngineState::default()),
        })
    }
}

#[derive(Default)]
struct EngineState {
    local: Option<DescriptionKind>,
    remote: Option<DescriptionKind>,
    connected: bool,
    closed: bool,
}

pub struct MemoryEngine {
    label: String,
    candidates: usize,
    session: SessionId,
    events: EngineEvents,
    probe: MemoryProbe,
    state: Mutex<EngineState>,
}

impl MemoryEngine {
    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.state.lock().closed {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    fn maybe_connect(&self) {
        let connect = {
            let mut state = self.state.lock();
            let ready = state.local.is_some() && state.remote.is_some() && !state.connected;
            if ready {
                state.connected = true;
            }
            ready
        };
        if connect {
            self.events.connectivity(ConnectivityState::Checking);
            self.events.connectivity(ConnectivityState::Connected);
            self.events.remote_stream(RemoteStream {
                stream_id: format!("{}-remote", self.label),
                track_id: format!("{}-video", self.label),
                kind: "video".into(),
            });
        }
    }
}

#[async_trait]
impl PeerEngine for MemoryEngine {
    async fn generate_offer(&self) -> Result<String, EngineError> {
        self.ensure_open()?;
        self.probe.record(self.session, EngineCall::GenerateOffer);
        Ok(format!("{}-offer-{}", self.label, self.session))
    }

    async fn generate_answer(&self) -> Result<String, EngineError> {
        self.ensure_open()?;
        self.probe.record(self.session, EngineCall::GenerateAnswer);
        if self.state.lock().remote != Some(DescriptionKind::Offer) {
            return Err(EngineError::Rejected(
                "cannot answer without a remote offer".into(),
            ));
        }
        Ok(format!("{}-answer-{}", self.label, self.session))
    }

    async fn set_local_description(
        &self,
        kind: DescriptionKind,
        _sdp: &str,
    ) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.probe.record(self.session, EngineCall::SetLocal(kind));
        self.state.lock().local = Some(kind);
        for index in 0..self.candidates {
            self.events.local_candidate(Some(
                IceCandidate::new(format!(
                    "candidate:{index} 1 udp 2122260223 {}.{} 9 typ host",
                    self.label, self.session
                ))
                .with_mid("0", 0),
            ));
        }
        self.events.local_candidate(None);
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        kind: DescriptionKind,
        sdp: &str,
    ) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.probe
            .record(self.session, EngineCall::SetRemote(kind, sdp.to_string()));
        if self.probe.inner.lock().reject_remote {
            return Err(EngineError::Rejected(format!("refusing {kind}")));
        }
        self.state.lock().remote = Some(kind);
        self.maybe_connect();
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.ensure_open()?;
        if self.state.lock().remote.is_none() {
            return Err(EngineError::Candidate(
                "remote description not set".into(),
            ));
        }
        self.probe
            .record(self.session, EngineCall::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        let was_closed = std::mem::replace(&mut self.state.lock().closed, true);
        if was_closed {
            return Err(EngineError::Closed);
        }
        self.probe.record(self.session, EngineCall::Close);
        Ok(())
    }
}

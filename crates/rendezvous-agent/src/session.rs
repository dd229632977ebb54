use std::collections::VecDeque;
use std::fmt;

use rendezvous_proto::IceCandidate;

/// Which side of the offer/answer exchange a session plays. Fixed when the
/// session is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

/// Identifies one negotiation attempt. Every asynchronous completion and
/// engine event carries the id of the session it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Bookkeeping for the single live session an agent owns.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    role: Role,
    local_description_sent: bool,
    remote_description_requested: bool,
    remote_description_set: bool,
    rejected_remote_offer: bool,
    pending_local: VecDeque<IceCandidate>,
    pending_remote: VecDeque<IceCandidate>,
}

impl Session {
    pub fn new(id: SessionId, role: Role) -> Self {
        Self {
            id,
            role,
            local_description_sent: false,
            remote_description_requested: false,
            remote_description_set: false,
            rejected_remote_offer: false,
            pending_local: VecDeque::new(),
            pending_remote: VecDeque::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_description_sent(&self) -> bool {
        self.local_description_sent
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn remote_description_requested(&self) -> bool {
        self.remote_description_requested
    }

    pub fn pending_local(&self) -> usize {
        self.pending_local.len()
    }

    pub fn pending_remote(&self) -> usize {
        self.pending_remote.len()
    }

    /// Returns the candidate when it may go out now. Candidates found before
    /// our description has been sent would reach a peer that has no session
    /// yet, so they wait in the queue.
    pub fn offer_local_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.local_description_sent {
            Some(candidate)
        } else {
            self.pending_local.push_back(candidate);
            None
        }
    }

    /// Marks the local description as sent and hands back every candidate
    /// that was held for it, oldest first.
    pub fn mark_local_description_sent(&mut self) -> Vec<IceCandidate> {
        self.local_description_sent = true;
        self.pending_local.drain(..).collect()
    }

    pub fn mark_remote_description_requested(&mut self) {
        self.remote_description_requested = true;
    }

    /// Returns the candidate when the engine can take it now; otherwise it is
    /// buffered until the remote description has been accepted.
    pub fn offer_remote_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_description_set {
            Some(candidate)
        } else {
            self.pending_remote.push_back(candidate);
            None
        }
    }

    pub fn mark_remote_description_set(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        self.pending_remote.drain(..).collect()
    }

    /// Records that a colliding offer from the peer was turned away. Remote
    /// candidates buffered from then on belong to that offer.
    pub fn mark_remote_offer_rejected(&mut self) {
        self.rejected_remote_offer = true;
    }

    pub fn rejected_remote_offer(&self) -> bool {
        self.rejected_remote_offer
    }

    /// Drops every buffered remote candidate and returns how many there were.
    pub fn discard_pending_remote(&mut self) -> usize {
        let discarded = self.pending_remote.len();
        self.pending_remote.clear();
        discarded
    }
}

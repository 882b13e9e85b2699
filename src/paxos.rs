//! The pure state machine for one link of the multi-Paxos chain. It receives
//! typed protocol events and returns typed protocol outputs; it performs no
//! I/O and knows nothing about time. The enclosing register owns persistence
//! and is responsible for saving promises and acceptances before the
//! corresponding replies leave the process.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::PeerUid;

/// A totally ordered proposal identifier: compared by number first, then by
/// proposer uid. The proposer uid namespaces the number space, so each
/// proposer can advance its own numbers without coordination. Number 0 is
/// reserved for "none" and is represented as `Option::None`; proposers begin
/// at 1.
///
/// Serializes as a two-element sequence `[number, proposer_uid]`, which is
/// the wire encoding the protocol requires.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProposalId(u64, PeerUid);

impl ProposalId {
    pub fn new(number: u64, proposer: impl Into<PeerUid>) -> Self {
        ProposalId(number, proposer.into())
    }

    pub fn number(&self) -> u64 {
        self.0
    }

    pub fn proposer(&self) -> &str {
        &self.1
    }
}

// Protocol events and outputs. `from_uid` is always the peer the event
// originates from; `proposer_uid` on Promise and Nack names the proposer the
// message answers, which is where the register routes the reply.

#[derive(Debug, Clone, PartialEq)]
pub struct Prepare {
    pub from_uid: PeerUid,
    pub proposal_id: ProposalId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Promise {
    pub from_uid: PeerUid,
    pub proposer_uid: PeerUid,
    pub proposal_id: ProposalId,
    pub last_accepted_id: Option<ProposalId>,
    pub last_accepted_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Accept {
    pub from_uid: PeerUid,
    pub proposal_id: ProposalId,
    pub proposal_value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    pub from_uid: PeerUid,
    pub proposal_id: ProposalId,
    pub proposal_value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Nack {
    pub from_uid: PeerUid,
    pub proposer_uid: PeerUid,
    pub proposal_id: ProposalId,
    pub promised_proposal_id: ProposalId,
}

/// Emitted once a quorum of acceptors has accepted the same proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub value: String,
}

/// Reply to an inbound `Prepare`.
#[derive(Debug, Clone, PartialEq)]
pub enum PrepareReply {
    Promise(Promise),
    Nack(Nack),
}

/// Reply to an inbound `Accept`.
#[derive(Debug, Clone, PartialEq)]
pub enum AcceptReply {
    Accepted(Accepted),
    Nack(Nack),
}

/// One link of the chain as a closed state machine. Created from the
/// persistent record on boot and replaced wholesale on advancement.
pub struct PaxosInstance {
    network_uid: PeerUid,
    quorum_size: usize,

    // Acceptor side.
    promised_id: Option<ProposalId>,
    accepted_id: Option<ProposalId>,
    accepted_value: Option<String>,

    // Proposer side.
    proposal_id: Option<ProposalId>,
    proposed_value: Option<String>,
    promises_received: HashSet<PeerUid>,
    nacks_received: HashSet<PeerUid>,
    // Highest accepted id reported in promises; its value overrides ours.
    highest_promised_accepted_id: Option<ProposalId>,
    leader: bool,

    // Highest proposal id observed anywhere for this instance; the next
    // local prepare must exceed it.
    highest_proposal_id: Option<ProposalId>,

    // Learner side: votes for the highest proposal seen in Accepted traffic.
    resolution_id: Option<ProposalId>,
    resolution_votes: HashSet<PeerUid>,
    final_value: Option<String>,
}

impl PaxosInstance {
    pub fn new(
        network_uid: PeerUid,
        quorum_size: usize,
        promised_id: Option<ProposalId>,
        accepted_id: Option<ProposalId>,
        accepted_value: Option<String>,
    ) -> Self {
        PaxosInstance {
            network_uid,
            quorum_size,
            highest_proposal_id: promised_id.clone(),
            promised_id,
            accepted_id,
            accepted_value,
            proposal_id: None,
            proposed_value: None,
            promises_received: HashSet::new(),
            nacks_received: HashSet::new(),
            highest_promised_accepted_id: None,
            leader: false,
            resolution_id: None,
            resolution_votes: HashSet::new(),
            final_value: None,
        }
    }

    pub fn proposal_id(&self) -> Option<&ProposalId> {
        self.proposal_id.as_ref()
    }

    pub fn proposed_value(&self) -> Option<&str> {
        self.proposed_value.as_deref()
    }

    pub fn promised_id(&self) -> Option<&ProposalId> {
        self.promised_id.as_ref()
    }

    pub fn accepted_id(&self) -> Option<&ProposalId> {
        self.accepted_id.as_ref()
    }

    pub fn accepted_value(&self) -> Option<&str> {
        self.accepted_value.as_deref()
    }

    pub fn is_leader(&self) -> bool {
        self.leader
    }

    pub fn nacks_received(&self) -> usize {
        self.nacks_received.len()
    }

    /// Records a proposal id seen on the network so the next local
    /// `prepare()` chooses a strictly greater number.
    pub fn observe_proposal(&mut self, proposal_id: &ProposalId) {
        let higher = self
            .highest_proposal_id
            .as_ref()
            .map_or(true, |h| proposal_id > h);
        if higher {
            self.highest_proposal_id = Some(proposal_id.clone());
        }
    }

    /// Abandons any current proposal round and starts a new one with a
    /// number greater than every proposal id seen for this instance.
    pub fn prepare(&mut self) -> Prepare {
        self.leader = false;
        self.promises_received.clear();
        self.nacks_received.clear();

        let number = self.highest_proposal_id.as_ref().map_or(0, |p| p.number()) + 1;
        let proposal_id = ProposalId::new(number, self.network_uid.clone());

        self.proposal_id = Some(proposal_id.clone());
        self.highest_proposal_id = Some(proposal_id.clone());

        Prepare {
            from_uid: self.network_uid.clone(),
            proposal_id,
        }
    }

    /// Sets the value this peer wants decided. A no-op if a value is already
    /// proposed. Returns an `Accept` immediately when a quorum of promises
    /// has already been gathered without a pre-accepted value.
    pub fn propose_value(&mut self, value: String) -> Option<Accept> {
        if self.proposed_value.is_some() {
            return None;
        }
        self.proposed_value = Some(value.clone());

        if self.leader {
            if let Some(proposal_id) = &self.proposal_id {
                return Some(Accept {
                    from_uid: self.network_uid.clone(),
                    proposal_id: proposal_id.clone(),
                    proposal_value: value,
                });
            }
        }
        None
    }

    /// Promises a proposal at or above the current promise; rejects lower
    /// ones. Retransmitted prepares are re-answered with the same promise so
    /// a driver survives lost replies.
    pub fn receive_prepare(&mut self, msg: Prepare) -> PrepareReply {
        self.observe_proposal(&msg.proposal_id);

        match &self.promised_id {
            Some(promised) if msg.proposal_id < *promised => PrepareReply::Nack(Nack {
                from_uid: self.network_uid.clone(),
                proposer_uid: msg.from_uid,
                proposal_id: msg.proposal_id,
                promised_proposal_id: promised.clone(),
            }),
            _ => {
                self.promised_id = Some(msg.proposal_id.clone());
                PrepareReply::Promise(Promise {
                    from_uid: self.network_uid.clone(),
                    proposer_uid: msg.from_uid,
                    proposal_id: msg.proposal_id,
                    last_accepted_id: self.accepted_id.clone(),
                    last_accepted_value: self.accepted_value.clone(),
                })
            }
        }
    }

    /// Collects promises for the current proposal. On quorum, the value
    /// paired with the highest reported acceptance wins; otherwise the
    /// locally proposed value is used. Returns the `Accept` to broadcast
    /// once a value is available.
    pub fn receive_promise(&mut self, msg: Promise) -> Option<Accept> {
        self.observe_proposal(&msg.proposal_id);

        if self.leader
            || self.proposal_id.as_ref() != Some(&msg.proposal_id)
            || self.promises_received.contains(&msg.from_uid)
        {
            return None;
        }
        self.promises_received.insert(msg.from_uid);

        let higher = self
            .highest_promised_accepted_id
            .as_ref()
            .map_or(msg.last_accepted_id.is_some(), |h| {
                msg.last_accepted_id.as_ref() > Some(h)
            });
        if higher {
            self.highest_promised_accepted_id = msg.last_accepted_id.clone();
            if let Some(value) = msg.last_accepted_value {
                self.proposed_value = Some(value);
            }
        }

        if self.promises_received.len() >= self.quorum_size {
            self.leader = true;
            if let (Some(proposal_id), Some(value)) = (&self.proposal_id, &self.proposed_value) {
                return Some(Accept {
                    from_uid: self.network_uid.clone(),
                    proposal_id: proposal_id.clone(),
                    proposal_value: value.clone(),
                });
            }
        }
        None
    }

    /// Accepts a proposal at or above the current promise; rejects lower
    /// ones. Acceptance raises the promise to the accepted id, so
    /// `accepted_id <= promised_id` always holds.
    pub fn receive_accept(&mut self, msg: Accept) -> AcceptReply {
        self.observe_proposal(&msg.proposal_id);

        match &self.promised_id {
            Some(promised) if msg.proposal_id < *promised => AcceptReply::Nack(Nack {
                from_uid: self.network_uid.clone(),
                proposer_uid: msg.from_uid,
                proposal_id: msg.proposal_id,
                promised_proposal_id: promised.clone(),
            }),
            _ => {
                self.promised_id = Some(msg.proposal_id.clone());
                self.accepted_id = Some(msg.proposal_id.clone());
                self.accepted_value = Some(msg.proposal_value.clone());
                AcceptReply::Accepted(Accepted {
                    from_uid: self.network_uid.clone(),
                    proposal_id: msg.proposal_id,
                    proposal_value: msg.proposal_value,
                })
            }
        }
    }

    /// Counts acceptances for the highest proposal seen in `Accepted`
    /// traffic. A quorum resolves the instance; later calls keep returning
    /// the resolution so replayed messages stay harmless.
    pub fn receive_accepted(&mut self, msg: Accepted) -> Option<Resolution> {
        self.observe_proposal(&msg.proposal_id);

        if let Some(value) = &self.final_value {
            return Some(Resolution {
                value: value.clone(),
            });
        }

        if self.resolution_id.as_ref() != Some(&msg.proposal_id) {
            let newer = self
                .resolution_id
                .as_ref()
                .map_or(true, |current| msg.proposal_id > *current);
            if !newer {
                return None;
            }
            self.resolution_id = Some(msg.proposal_id.clone());
            self.resolution_votes.clear();
        }
        self.resolution_votes.insert(msg.from_uid);

        if self.resolution_votes.len() >= self.quorum_size {
            self.final_value = Some(msg.proposal_value.clone());
            return Some(Resolution {
                value: msg.proposal_value,
            });
        }
        None
    }

    /// Records a rejection of the current proposal. The rejector's promised
    /// id is observed so the next prepare overtakes it; reacting to the
    /// rejection is the resolution driver's business.
    pub fn receive_nack(&mut self, msg: Nack) {
        self.observe_proposal(&msg.promised_proposal_id);

        if self.proposal_id.as_ref() == Some(&msg.proposal_id) {
            self.nacks_received.insert(msg.from_uid);
        }
    }
}

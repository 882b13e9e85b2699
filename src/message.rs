//! The messages peers exchange over the datagram transport, and their text
//! encoding. Every message is `<type> <payload>`: `propose` carries its raw
//! value, every other type carries a JSON object whose fields are fixed per
//! type. Proposal ids travel as two-element sequences `[number, uid]`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::paxos::ProposalId;
use crate::{Error, PeerUid, Result};

/// An enum which contains all types of messages peers and clients exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Propose(ProposeValue),
    Prepare(Preparation),
    Promise(PromiseReply),
    Accept(AcceptRequest),
    Accepted(Acceptance),
    Nack(Rejection),
    SyncRequest(SyncRequest),
    Catchup(Catchup),
}

/// A client suggestion. Fire-and-forget: no reply is ever sent.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposeValue {
    pub value: String,
}

/// Phase 1a, broadcast by the driving proposer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Preparation {
    pub instance_number: u64,
    pub proposal_id: ProposalId,
}

/// Phase 1b, sent point-to-point back to the preparer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PromiseReply {
    pub instance_number: u64,
    pub proposal_id: ProposalId,
    pub last_accepted_id: Option<ProposalId>,
    pub last_accepted_value: Option<String>,
}

/// Phase 2a, broadcast by the proposer that gathered a quorum of promises.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AcceptRequest {
    pub instance_number: u64,
    pub proposal_id: ProposalId,
    pub proposal_value: String,
}

/// Phase 2b, broadcast by each acceptor so every peer can learn the
/// resolution independently.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Acceptance {
    pub instance_number: u64,
    pub proposal_id: ProposalId,
    pub proposal_value: String,
}

/// Rejection of a prepare or accept below the current promise.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Rejection {
    pub instance_number: u64,
    pub proposal_id: ProposalId,
    pub promised_proposal_id: ProposalId,
}

/// Periodic probe carrying the sender's chain position.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SyncRequest {
    pub instance_number: u64,
}

/// Answer to a probe from a lagging peer: the responder's position and most
/// recently decided value. Intermediate decisions are not replayed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Catchup {
    pub instance_number: u64,
    pub current_value: String,
}

impl Message {
    /// Short type tag used on the wire and in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Propose(_) => "propose",
            Message::Prepare(_) => "prepare",
            Message::Promise(_) => "promise",
            Message::Accept(_) => "accept",
            Message::Accepted(_) => "accepted",
            Message::Nack(_) => "nack",
            Message::SyncRequest(_) => "sync_request",
            Message::Catchup(_) => "catchup",
        }
    }

    pub fn encode(&self) -> String {
        let payload = match self {
            Message::Propose(m) => m.value.clone(),
            Message::Prepare(m) => encode_body(m),
            Message::Promise(m) => encode_body(m),
            Message::Accept(m) => encode_body(m),
            Message::Accepted(m) => encode_body(m),
            Message::Nack(m) => encode_body(m),
            Message::SyncRequest(m) => encode_body(m),
            Message::Catchup(m) => encode_body(m),
        };
        format!("{} {}", self.kind(), payload)
    }

    pub fn decode(text: &str) -> Result<Message> {
        let (kind, payload) = text
            .split_once(' ')
            .ok_or_else(|| Error::Malformed(format!("no payload in {text:?}")))?;

        match kind {
            "propose" => Ok(Message::Propose(ProposeValue {
                value: payload.to_string(),
            })),
            "prepare" => Ok(Message::Prepare(decode_body(payload)?)),
            "promise" => Ok(Message::Promise(decode_body(payload)?)),
            "accept" => Ok(Message::Accept(decode_body(payload)?)),
            "accepted" => Ok(Message::Accepted(decode_body(payload)?)),
            "nack" => Ok(Message::Nack(decode_body(payload)?)),
            "sync_request" => Ok(Message::SyncRequest(decode_body(payload)?)),
            "catchup" => Ok(Message::Catchup(decode_body(payload)?)),
            other => Err(Error::Malformed(format!("unknown message type {other:?}"))),
        }
    }
}

fn encode_body<T: Serialize>(body: &T) -> String {
    // The payload structs hold only strings, integers and proposal ids;
    // encoding them cannot fail.
    serde_json::to_string(body).expect("message payload is always encodable")
}

fn decode_body<T: DeserializeOwned>(payload: &str) -> Result<T> {
    Ok(serde_json::from_str(payload)?)
}

/// The two-slot payload decided by Paxos when the master-lease strategy is
/// active: exactly one slot is occupied. The lease grant travels through the
/// same decision path as application values.
pub fn encode_lease_slots(master: Option<PeerUid>, application: Option<String>) -> String {
    serde_json::to_string(&(master, application)).expect("lease payload is always encodable")
}

pub fn decode_lease_slots(raw: &str) -> Result<(Option<PeerUid>, Option<String>)> {
    Ok(serde_json::from_str(raw)?)
}

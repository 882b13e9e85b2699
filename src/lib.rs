//! A replicated single-register store maintained by a chain of Paxos
//! instances (multi-Paxos). A fixed set of peers cooperates over UDP so that
//! every peer, after crashes and message loss, converges on the same
//! sequence of decided values.
//!
//! The engine is layered leaves-first: [`state`] persists the minimum data
//! Paxos safety requires, [`paxos`] is the pure per-instance state machine,
//! and [`register`] binds the current instance to the network, drives stuck
//! instances to resolution, catches up lagging peers, and optionally runs
//! the dedicated-master lease strategy. [`server`] hosts the event loop.

pub mod configurations;
pub mod message;
pub mod net_node;
pub mod paxos;
pub mod register;
pub mod server;
pub mod state;

/// Identifier of a peer, drawn from the closed set in the configuration.
pub type PeerUid = String;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("state record encoding: {0}")]
    Record(#[from] bincode::Error),

    #[error("message payload encoding: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("bad peer address: {0}")]
    Address(#[from] std::net::AddrParseError),

    #[error("unknown peer {0:?}")]
    UnknownPeer(String),

    #[error("malformed packet: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, Error>;

//! Reads the static cluster configuration: the peer directory mapping each
//! uid to a UDP endpoint, and the per-peer state file used for crash
//! recovery. Membership is fixed at startup; peers address each other by
//! uid, never by raw address.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::str::FromStr;

use config::{Config, File};
use serde::Deserialize;

use crate::{Error, PeerUid, Result};

#[derive(Deserialize, Debug, Clone)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ClusterConfig {
    pub peers: HashMap<PeerUid, PeerAddress>,
    pub state_files: HashMap<PeerUid, PathBuf>,
}

impl ClusterConfig {
    /// Loads the configuration from `<name>.toml` (or any extension the
    /// config loader recognizes) relative to the working directory.
    pub fn load(name: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(name))
            .build()?;
        Ok(settings.try_deserialize::<ClusterConfig>()?)
    }

    /// All configured peer uids in a stable order.
    pub fn peer_uids(&self) -> Vec<PeerUid> {
        let mut uids: Vec<PeerUid> = self.peers.keys().cloned().collect();
        uids.sort();
        uids
    }

    pub fn socket_addr(&self, uid: &str) -> Result<SocketAddrV4> {
        let peer = self
            .peers
            .get(uid)
            .ok_or_else(|| Error::UnknownPeer(uid.to_string()))?;
        Ok(SocketAddrV4::new(Ipv4Addr::from_str(&peer.host)?, peer.port))
    }

    pub fn state_file(&self, uid: &str) -> Result<&PathBuf> {
        self.state_files
            .get(uid)
            .ok_or_else(|| Error::UnknownPeer(uid.to_string()))
    }
}

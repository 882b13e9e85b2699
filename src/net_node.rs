//! A struct which can be used to send to or receive from a UDP socket, bound
//! to this peer's entry in the peer directory. Datagram loss, duplication
//! and reordering are the transport's normal behavior; the layers above mask
//! them with retransmission and catch-up, so send failures are only logged.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use log::{debug, warn};

use crate::configurations::ClusterConfig;
use crate::message::Message;
use crate::{PeerUid, Result};

const MAX_DATAGRAM: usize = 16384;

/// A datagram decoded off the wire. `from` is resolved through the inverse
/// peer directory; client `propose` packets arrive from ephemeral ports and
/// carry no uid.
pub struct Packet {
    pub from: Option<PeerUid>,
    pub message: Message,
}

pub struct NetNode {
    socket: UdpSocket,
    // Two-way mapping between peer uids and endpoints.
    addrs: HashMap<PeerUid, SocketAddrV4>,
    uids: HashMap<SocketAddrV4, PeerUid>,
}

impl NetNode {
    /// Binds this peer's configured endpoint and builds the directory maps.
    pub fn bind(uid: &str, config: &ClusterConfig) -> Result<Self> {
        let mut addrs = HashMap::new();
        let mut uids = HashMap::new();
        for peer in config.peer_uids() {
            let addr = config.socket_addr(&peer)?;
            addrs.insert(peer.clone(), addr);
            uids.insert(addr, peer);
        }

        let own = config.socket_addr(uid)?;
        let socket = UdpSocket::bind(own)?;
        Ok(NetNode { socket, addrs, uids })
    }

    /// Sends a message to the named peer. Loss is the transport's default
    /// failure mode, so an unknown peer or a send error is logged and the
    /// caller keeps going.
    pub fn send(&self, to: &str, message: &Message) {
        let Some(addr) = self.addrs.get(to) else {
            warn!("send to unknown peer {to:?} dropped");
            return;
        };
        let encoded = message.encode();
        debug!("snd {to}: {encoded}");
        if let Err(e) = self.socket.send_to(encoded.as_bytes(), addr) {
            warn!("send of {} to {to} failed: {e}", message.kind());
        }
    }

    /// Waits up to `timeout` for one datagram. Returns `None` on timeout and
    /// on malformed input; a malformed packet is logged and the peer
    /// continues.
    pub fn receive(&self, timeout: Duration) -> Result<Option<Packet>> {
        self.socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, src) = match self.socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let text = match std::str::from_utf8(&buf[..len]) {
            Ok(text) => text,
            Err(e) => {
                warn!("non-text datagram from {src}: {e}");
                return Ok(None);
            }
        };

        let message = match Message::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("error processing packet {text:?}: {e}");
                return Ok(None);
            }
        };

        let from = match src {
            SocketAddr::V4(addr) => self.uids.get(&addr).cloned(),
            SocketAddr::V6(_) => None,
        };
        if let Some(uid) = &from {
            debug!("rcv {uid}: {text}");
        }
        Ok(Some(Packet { from, message }))
    }
}

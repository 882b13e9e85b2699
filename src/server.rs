//! The event loop hosting one peer: a single thread that services inbound
//! datagrams and timer callbacks, and flushes the register's outbox to the
//! socket. Handlers run to completion between suspension points; the only
//! blocking work besides the receive wait is the synchronous state save
//! inside the register.

use std::time::{Duration, Instant};

use log::{info, warn};

use crate::configurations::ClusterConfig;
use crate::net_node::NetNode;
use crate::register::Register;
use crate::state::StateStore;
use crate::Result;

// Upper bound on one receive wait; keeps the loop responsive to freshly
// armed timers even when the network is quiet.
const MAX_RECEIVE_WAIT: Duration = Duration::from_millis(100);

pub struct Server {
    register: Register,
    node: NetNode,
}

impl Server {
    pub fn new(uid: &str, config: &ClusterConfig, master_lease: bool) -> Result<Self> {
        let store = StateStore::new(config.state_file(uid)?);
        let register = Register::new(
            uid,
            config.peer_uids(),
            store,
            master_lease,
            Instant::now(),
        )?;
        let node = NetNode::bind(uid, config)?;
        info!(
            "[{uid}] listening on {} (master lease: {master_lease})",
            config.socket_addr(uid)?
        );
        Ok(Server { register, node })
    }

    /// Runs until an unrecoverable error. A failed state save is fatal:
    /// continuing without durability would break the promises this peer has
    /// already made.
    pub fn run(&mut self) -> Result<()> {
        loop {
            let now = Instant::now();
            self.register.poll_timers(now)?;
            self.flush();

            let wait = self
                .register
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(now))
                .unwrap_or(MAX_RECEIVE_WAIT)
                .min(MAX_RECEIVE_WAIT);

            if let Some(packet) = self.node.receive(wait)? {
                let now = Instant::now();
                match packet.from {
                    Some(from) => self.register.handle_message(now, &from, packet.message)?,
                    // Clients send from ephemeral ports; everything else
                    // must come from a configured peer.
                    None => match packet.message {
                        crate::message::Message::Propose(m) => {
                            self.register.propose_update(now, m.value)?
                        }
                        other => {
                            warn!("{} from unknown sender dropped", other.kind());
                        }
                    },
                }
                self.flush();
            }
        }
    }

    fn flush(&mut self) {
        for envelope in self.register.drain_outbox() {
            self.node.send(&envelope.to, &envelope.message);
        }
    }
}

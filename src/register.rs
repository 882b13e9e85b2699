//! The replicated register: binds the Paxos instance for the current chain
//! link to the network, persists before replying, and advances the chain on
//! resolution. The resolution driver (retransmission, randomized backoff,
//! silent takeover), the catch-up synchronizer, and the optional dedicated
//! master-lease strategy are layered over the same operations; the lease
//! branches are gated on configuration.
//!
//! The register performs no I/O itself: outbound messages accumulate in an
//! outbox of `(to, message)` envelopes drained by the event loop, and every
//! time-sensitive entry point takes `now`. Handlers are therefore a pure
//! function of the message/timer sequence, which the simulated-cluster
//! tests rely on.

use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::message::{
    self, Acceptance, AcceptRequest, Catchup, Message, Preparation, PromiseReply, Rejection,
    SyncRequest,
};
use crate::paxos::{self, AcceptReply, PaxosInstance, PrepareReply, ProposalId};
use crate::state::{PersistentRecord, StateStore};
use crate::{PeerUid, Result};

// All driver and lease times; the retransmit interval covers both the
// prepare and the accept phase.
const BACKOFF_INITIAL: Duration = Duration::from_millis(5);
const BACKOFF_CAP: Duration = Duration::from_millis(2000);
const DRIVE_SILENCE_TIMEOUT: Duration = Duration::from_millis(3000);
const RETRANSMIT_INTERVAL: Duration = Duration::from_secs(1);
const SYNC_DELAY: Duration = Duration::from_secs(10);
const LEASE_WINDOW: Duration = Duration::from_secs(10);
const LEASE_RENEW_MARGIN: Duration = Duration::from_secs(1);

/// An outbound message addressed to one peer. Broadcasts enqueue one
/// envelope per configured peer, the local peer included; self-delivery is
/// plain loopback.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub to: PeerUid,
    pub message: Message,
}

#[derive(Debug, Clone)]
enum Retransmit {
    Prepare(ProposalId),
    Accept(ProposalId, String),
}

/// Liveness state: what we are currently pushing toward resolution, and
/// when to retry or take over.
struct DriverState {
    backoff_window: Duration,
    retransmit: Option<(Instant, Retransmit)>,
    delayed_drive: Option<Instant>,
}

struct SyncState {
    next_sync: Instant,
}

/// Mastership as seen by this peer. `master_uid == None` means no peer is
/// currently believed to hold the lease.
struct LeaseState {
    master_uid: Option<PeerUid>,
    // Limits this peer to one mastership attempt per lease window.
    master_attempt: bool,
    lease_start: Instant,
    expiry: Option<Instant>,
    renew: Option<Instant>,
}

pub struct Register {
    network_uid: PeerUid,
    peers: Vec<PeerUid>,
    quorum_size: usize,
    store: StateStore,
    record: PersistentRecord,
    paxos: PaxosInstance,
    driver: DriverState,
    sync: SyncState,
    lease: Option<LeaseState>,
    outbox: Vec<Envelope>,
    rng: StdRng,
}

impl Register {
    /// Loads (or initializes) the persistent record and builds the Paxos
    /// instance for the current chain link. With the lease strategy enabled
    /// every peer starts lease-less, giving a possibly live master one full
    /// window to reassert itself before anyone scrambles for the lease.
    pub fn new(
        network_uid: impl Into<PeerUid>,
        peers: Vec<PeerUid>,
        store: StateStore,
        master_lease: bool,
        now: Instant,
    ) -> Result<Self> {
        let network_uid = network_uid.into();
        let record = store.load()?;
        let quorum_size = peers.len() / 2 + 1;
        let paxos = PaxosInstance::new(
            network_uid.clone(),
            quorum_size,
            record.promised_id.clone(),
            record.accepted_id.clone(),
            record.accepted_value.clone(),
        );

        let mut register = Register {
            network_uid,
            peers,
            quorum_size,
            store,
            record,
            paxos,
            driver: DriverState {
                backoff_window: BACKOFF_INITIAL,
                retransmit: None,
                delayed_drive: None,
            },
            sync: SyncState { next_sync: now },
            lease: master_lease.then(|| LeaseState {
                master_uid: None,
                master_attempt: false,
                lease_start: now,
                expiry: None,
                renew: None,
            }),
            outbox: Vec::new(),
            rng: StdRng::from_entropy(),
        };
        if register.lease.is_some() {
            register.update_lease(now, None);
        }
        Ok(register)
    }

    /// Replaces the jitter source; the simulated-cluster tests seed it for
    /// reproducible backoff and sync-target draws.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn network_uid(&self) -> &str {
        &self.network_uid
    }

    pub fn record(&self) -> &PersistentRecord {
        &self.record
    }

    pub fn instance_number(&self) -> u64 {
        self.record.instance_number
    }

    pub fn current_value(&self) -> Option<&str> {
        self.record.current_value.as_deref()
    }

    /// The peer currently believed to hold the master lease, if the lease
    /// strategy is enabled and a grant has been observed.
    pub fn master_uid(&self) -> Option<&str> {
        self.lease.as_ref().and_then(|l| l.master_uid.as_deref())
    }

    fn is_master(&self) -> bool {
        self.master_uid() == Some(self.network_uid.as_str())
    }

    /// Takes the accumulated outbound envelopes.
    pub fn drain_outbox(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outbox)
    }

    /// Earliest pending timer deadline, used by the event loop to bound its
    /// receive wait.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut next = Some(self.sync.next_sync);
        let mut fold = |candidate: Option<Instant>| {
            next = match (next, candidate) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, None) => a,
                (None, b) => b,
            };
        };
        fold(self.driver.retransmit.as_ref().map(|(deadline, _)| *deadline));
        fold(self.driver.delayed_drive);
        if let Some(lease) = &self.lease {
            fold(lease.expiry);
            fold(lease.renew);
        }
        next
    }

    // ------------------------------------------------------------------
    // Inbound routing
    // ------------------------------------------------------------------

    pub fn handle_message(&mut self, now: Instant, from: &str, message: Message) -> Result<()> {
        match message {
            Message::Propose(m) => self.propose_update(now, m.value),
            Message::Prepare(m) => self.receive_prepare(now, from, m),
            Message::Promise(m) => self.receive_promise(now, from, m),
            Message::Accept(m) => self.receive_accept(now, from, m),
            Message::Accepted(m) => self.receive_accepted(now, from, m),
            Message::Nack(m) => self.receive_nack(now, from, m),
            Message::SyncRequest(m) => self.receive_sync_request(from, m),
            Message::Catchup(m) => self.receive_catchup(now, m),
        }
    }

    /// Suggests a new value for the current instance. With the lease
    /// strategy enabled, only the master forwards client suggestions; every
    /// other peer drops them.
    pub fn propose_update(&mut self, now: Instant, value: String) -> Result<()> {
        if self.lease.is_some() {
            if !self.is_master() {
                info!(
                    "[{}] ignoring client request, current master is {:?}",
                    self.network_uid,
                    self.master_uid()
                );
                return Ok(());
            }
            let wrapped = message::encode_lease_slots(None, Some(value));
            return self.propose_inner(now, wrapped);
        }
        self.propose_inner(now, value)
    }

    fn propose_inner(&mut self, now: Instant, value: String) -> Result<()> {
        // The instance keeps the first proposal; a second suggestion for the
        // same instance only restarts the drive.
        let _ = self.paxos.propose_value(value);
        self.drive_to_resolution(now);
        Ok(())
    }

    /// Attempts to claim (or renew) the master lease by proposing our own
    /// uid through the ordinary decision path. At most one attempt per
    /// lease window.
    fn propose_master(&mut self, now: Instant) -> Result<()> {
        let candidate = self.network_uid.clone();
        let attempt = match self.lease.as_mut() {
            Some(lease)
                if !lease.master_attempt
                    && (lease.master_uid.is_none()
                        || lease.master_uid.as_deref() == Some(candidate.as_str())) =>
            {
                lease.master_attempt = true;
                lease.lease_start = now;
                lease.expiry = Some(now + LEASE_WINDOW);
                true
            }
            _ => false,
        };
        if attempt {
            debug!("[{}] attempting mastership", self.network_uid);
            let wrapped = message::encode_lease_slots(Some(candidate), None);
            self.propose_inner(now, wrapped)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Protocol handlers. Only messages for the current link in the chain
    // are processed; the synchronizer heals anything further apart.
    // ------------------------------------------------------------------

    fn receive_prepare(&mut self, _now: Instant, from: &str, m: Preparation) -> Result<()> {
        if self.lease_rejects(from) {
            debug!("[{}] dropping prepare from non-master {from}", self.network_uid);
            return Ok(());
        }
        if m.instance_number != self.record.instance_number {
            return Ok(());
        }

        let reply = self.paxos.receive_prepare(paxos::Prepare {
            from_uid: from.to_string(),
            proposal_id: m.proposal_id,
        });
        match reply {
            PrepareReply::Promise(promise) => {
                // The promise must be durable before it leaves the process.
                self.save_state(
                    self.record.instance_number,
                    self.record.current_value.clone(),
                    Some(promise.proposal_id.clone()),
                    promise.last_accepted_id.clone(),
                    promise.last_accepted_value.clone(),
                )?;
                self.outbox.push(Envelope {
                    to: promise.proposer_uid,
                    message: Message::Promise(PromiseReply {
                        instance_number: self.record.instance_number,
                        proposal_id: promise.proposal_id,
                        last_accepted_id: promise.last_accepted_id,
                        last_accepted_value: promise.last_accepted_value,
                    }),
                });
            }
            PrepareReply::Nack(nack) => self.send_nack(nack),
        }
        Ok(())
    }

    fn receive_promise(&mut self, now: Instant, from: &str, m: PromiseReply) -> Result<()> {
        if m.instance_number != self.record.instance_number {
            return Ok(());
        }

        let accept = self.paxos.receive_promise(paxos::Promise {
            from_uid: from.to_string(),
            proposer_uid: self.network_uid.clone(),
            proposal_id: m.proposal_id,
            last_accepted_id: m.last_accepted_id,
            last_accepted_value: m.last_accepted_value,
        });
        if let Some(accept) = accept {
            self.send_accept(now, accept.proposal_id, accept.proposal_value);
        }
        Ok(())
    }

    fn receive_accept(&mut self, now: Instant, from: &str, m: AcceptRequest) -> Result<()> {
        if self.lease_rejects(from) {
            debug!("[{}] dropping accept from non-master {from}", self.network_uid);
            return Ok(());
        }
        if m.instance_number != self.record.instance_number {
            return Ok(());
        }

        let reply = self.paxos.receive_accept(paxos::Accept {
            from_uid: from.to_string(),
            proposal_id: m.proposal_id,
            proposal_value: m.proposal_value,
        });
        match reply {
            AcceptReply::Accepted(accepted) => {
                // Acceptance implies the proposal is at or above our promise,
                // so the persisted promise moves up with it.
                self.save_state(
                    self.record.instance_number,
                    self.record.current_value.clone(),
                    Some(accepted.proposal_id.clone()),
                    Some(accepted.proposal_id.clone()),
                    Some(accepted.proposal_value.clone()),
                )?;
                self.broadcast(Message::Accepted(Acceptance {
                    instance_number: self.record.instance_number,
                    proposal_id: accepted.proposal_id,
                    proposal_value: accepted.proposal_value,
                }));
            }
            AcceptReply::Nack(nack) => self.send_nack(nack),
        }

        // Someone is driving this instance. If they fall silent before
        // resolution, step in and finish it for them.
        self.driver.delayed_drive = Some(now + DRIVE_SILENCE_TIMEOUT);
        Ok(())
    }

    fn receive_accepted(&mut self, now: Instant, from: &str, m: Acceptance) -> Result<()> {
        if m.instance_number != self.record.instance_number {
            return Ok(());
        }

        let resolution = self.paxos.receive_accepted(paxos::Accepted {
            from_uid: from.to_string(),
            proposal_id: m.proposal_id,
            proposal_value: m.proposal_value,
        });
        if let Some(resolution) = resolution {
            let next = self.record.instance_number + 1;
            self.advance_instance(now, next, Some(resolution.value), false)?;
        }
        Ok(())
    }

    fn receive_nack(&mut self, now: Instant, from: &str, m: Rejection) -> Result<()> {
        if m.instance_number != self.record.instance_number {
            return Ok(());
        }

        self.paxos.receive_nack(paxos::Nack {
            from_uid: from.to_string(),
            proposer_uid: self.network_uid.clone(),
            proposal_id: m.proposal_id,
            promised_proposal_id: m.promised_proposal_id,
        });

        // Contention: back off for a random slice of a growing window so
        // duelling proposers fall out of lockstep.
        self.stop_driving();
        self.driver.backoff_window = (self.driver.backoff_window * 2).min(BACKOFF_CAP);
        let jitter = self
            .rng
            .gen_range(0..self.driver.backoff_window.as_millis() as u64);
        self.driver.delayed_drive = Some(now + Duration::from_millis(jitter));
        Ok(())
    }

    fn receive_sync_request(&mut self, from: &str, m: SyncRequest) -> Result<()> {
        if m.instance_number < self.record.instance_number {
            if let Some(value) = self.record.current_value.clone() {
                self.outbox.push(Envelope {
                    to: from.to_string(),
                    message: Message::Catchup(Catchup {
                        instance_number: self.record.instance_number,
                        current_value: value,
                    }),
                });
            }
        }
        Ok(())
    }

    fn receive_catchup(&mut self, now: Instant, m: Catchup) -> Result<()> {
        if m.instance_number > self.record.instance_number {
            info!(
                "[{}] synchronized: {} {:?}",
                self.network_uid, m.instance_number, m.current_value
            );
            self.advance_instance(now, m.instance_number, Some(m.current_value), true)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Advancement
    // ------------------------------------------------------------------

    /// Moves to a new link in the chain, either because the current instance
    /// resolved (`catchup == false`, one step) or because a more advanced
    /// peer answered our sync probe (`catchup == true`, possibly skipping
    /// many instances).
    fn advance_instance(
        &mut self,
        now: Instant,
        new_instance_number: u64,
        new_current_value: Option<String>,
        catchup: bool,
    ) -> Result<()> {
        let lease_enabled = self.lease.is_some();
        let mut surfaced = new_current_value;

        if let Some(lease) = self.lease.as_mut() {
            lease.master_attempt = false;
        }
        if lease_enabled && !catchup {
            surfaced = self.decode_lease_decision(now, surfaced)?;
        }

        self.save_state(new_instance_number, surfaced, None, None, None)?;
        self.paxos = PaxosInstance::new(self.network_uid.clone(), self.quorum_size, None, None, None);
        info!(
            "[{}] updated: {} {:?}",
            self.network_uid, self.record.instance_number, self.record.current_value
        );

        self.stop_driving();
        self.driver.backoff_window = BACKOFF_INITIAL;

        if lease_enabled {
            if catchup {
                // A jump may land us next to a live master using the fixed
                // ProposalId(1, master); make sure our next proposal number
                // is above 1.
                let _ = self.paxos.prepare();
            } else {
                self.prime_lease_instance();
            }
        }
        Ok(())
    }

    /// Unwraps the two-slot payload decided under the lease strategy. A
    /// grant installs the lease and surfaces the previous register value; an
    /// application slot surfaces as-is.
    fn decode_lease_decision(
        &mut self,
        now: Instant,
        decided: Option<String>,
    ) -> Result<Option<String>> {
        let Some(raw) = decided else {
            return Ok(None);
        };
        match message::decode_lease_slots(&raw) {
            Ok((Some(master), _)) => {
                info!("[{}] lease granted: {master}", self.network_uid);
                self.update_lease(now, Some(master));
                Ok(self.record.current_value.clone())
            }
            Ok((None, application)) => Ok(application),
            Err(e) => {
                warn!("[{}] undecodable decision payload: {e}", self.network_uid);
                Ok(Some(raw))
            }
        }
    }

    /// Prepares the fresh instance for one-round-trip operation while a
    /// lease is held. The master gathers synthetic promises so its next
    /// proposal goes straight to the accept phase; followers pre-promise the
    /// master's fixed ProposalId(1, master).
    fn prime_lease_instance(&mut self) {
        let Some(master) = self.lease.as_ref().and_then(|l| l.master_uid.clone()) else {
            return;
        };
        let master_pid = ProposalId::new(1, master.clone());

        if master == self.network_uid {
            // On a fresh instance this yields exactly ProposalId(1, us).
            let _ = self.paxos.prepare();
            for uid in self.peers.clone() {
                let _ = self.paxos.receive_promise(paxos::Promise {
                    from_uid: uid,
                    proposer_uid: self.network_uid.clone(),
                    proposal_id: master_pid.clone(),
                    last_accepted_id: None,
                    last_accepted_value: None,
                });
            }
        } else {
            // Never sent anywhere: primes the promise locally and records
            // the master's proposal so our own numbering stays above it.
            let _ = self.paxos.receive_prepare(paxos::Prepare {
                from_uid: master,
                proposal_id: master_pid,
            });
        }
    }

    // ------------------------------------------------------------------
    // Lease bookkeeping
    // ------------------------------------------------------------------

    /// While a lease is held by someone else, their traffic is the only
    /// proposer traffic we act on.
    fn lease_rejects(&self, from: &str) -> bool {
        match self.master_uid() {
            Some(master) => master != from,
            None => false,
        }
    }

    fn update_lease(&mut self, now: Instant, master_uid: Option<PeerUid>) {
        let network_uid = self.network_uid.clone();
        let mut renew_overdue = false;

        if let Some(lease) = self.lease.as_mut() {
            lease.master_uid = master_uid.clone();
            if master_uid.as_deref() != Some(network_uid.as_str()) {
                // Someone else's lease (or none): their window starts now.
                // The previous expiry, if any, is superseded.
                lease.lease_start = now;
                lease.expiry = Some(now + LEASE_WINDOW);
                lease.renew = None;
            } else {
                // Our own lease: renew shortly before it runs out. The
                // expiry armed when we proposed keeps running; a missed
                // renewal drops us back to no-master.
                let renew_at = lease.lease_start + LEASE_WINDOW - LEASE_RENEW_MARGIN;
                if renew_at > now {
                    lease.renew = Some(renew_at);
                } else {
                    renew_overdue = true;
                }
            }
        }

        if renew_overdue {
            let _ = self.propose_master(now);
        }
    }

    // ------------------------------------------------------------------
    // Resolution driver
    // ------------------------------------------------------------------

    /// Starts (or restarts) pushing the current instance to resolution.
    /// A master holding the lease skips the prepare phase and sends the
    /// accept directly; everyone else opens a fresh, higher-numbered
    /// prepare round. The outstanding message is retransmitted until the
    /// instance advances or contention forces a new round.
    fn drive_to_resolution(&mut self, now: Instant) {
        self.stop_driving();

        if self.is_master() && self.paxos.proposal_id().map(|p| p.number()) == Some(1) {
            if let (Some(proposal_id), Some(value)) = (
                self.paxos.proposal_id().cloned(),
                self.paxos.proposed_value().map(str::to_string),
            ) {
                self.send_accept(now, proposal_id, value);
            }
            return;
        }

        let prepare = self.paxos.prepare();
        self.broadcast_prepare(prepare.proposal_id.clone());
        self.driver.retransmit = Some((
            now + RETRANSMIT_INTERVAL,
            Retransmit::Prepare(prepare.proposal_id),
        ));
    }

    fn stop_driving(&mut self) {
        self.driver.retransmit = None;
        self.driver.delayed_drive = None;
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Fires every due timer. Called by the event loop before each receive
    /// wait; the simulated clock in tests calls it directly.
    pub fn poll_timers(&mut self, now: Instant) -> Result<()> {
        if now >= self.sync.next_sync {
            self.sync.next_sync = now + SYNC_DELAY;
            self.send_sync_request();
        }

        if let Some((deadline, what)) = self.driver.retransmit.clone() {
            if now >= deadline {
                self.driver.retransmit = Some((now + RETRANSMIT_INTERVAL, what.clone()));
                match what {
                    Retransmit::Prepare(proposal_id) => self.broadcast_prepare(proposal_id),
                    Retransmit::Accept(proposal_id, value) => {
                        self.broadcast_accept(proposal_id, value)
                    }
                }
            }
        }

        if let Some(deadline) = self.driver.delayed_drive {
            if now >= deadline {
                self.driver.delayed_drive = None;
                self.drive_to_resolution(now);
            }
        }

        let mut expired = false;
        let mut renew = false;
        if let Some(lease) = self.lease.as_mut() {
            if lease.expiry.map_or(false, |deadline| now >= deadline) {
                lease.expiry = None;
                lease.master_uid = None;
                expired = true;
            }
            if lease.renew.map_or(false, |deadline| now >= deadline) {
                lease.renew = None;
                renew = true;
            }
        }
        if expired {
            info!("[{}] master lease expired", self.network_uid);
            self.propose_master(now)?;
        }
        if renew {
            self.propose_master(now)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Senders
    // ------------------------------------------------------------------

    fn send_sync_request(&mut self) {
        // Asking ourselves can never heal anything; probe a random other
        // peer.
        let others: Vec<&PeerUid> = self
            .peers
            .iter()
            .filter(|uid| *uid != &self.network_uid)
            .collect();
        if others.is_empty() {
            return;
        }
        let target = others[self.rng.gen_range(0..others.len())].clone();
        self.outbox.push(Envelope {
            to: target,
            message: Message::SyncRequest(SyncRequest {
                instance_number: self.record.instance_number,
            }),
        });
    }

    fn send_accept(&mut self, now: Instant, proposal_id: ProposalId, value: String) {
        self.driver.retransmit = Some((
            now + RETRANSMIT_INTERVAL,
            Retransmit::Accept(proposal_id.clone(), value.clone()),
        ));
        self.broadcast_accept(proposal_id, value);
    }

    fn broadcast_prepare(&mut self, proposal_id: ProposalId) {
        self.broadcast(Message::Prepare(Preparation {
            instance_number: self.record.instance_number,
            proposal_id,
        }));
    }

    fn broadcast_accept(&mut self, proposal_id: ProposalId, value: String) {
        self.broadcast(Message::Accept(AcceptRequest {
            instance_number: self.record.instance_number,
            proposal_id,
            proposal_value: value,
        }));
    }

    fn send_nack(&mut self, nack: paxos::Nack) {
        self.outbox.push(Envelope {
            to: nack.proposer_uid,
            message: Message::Nack(Rejection {
                instance_number: self.record.instance_number,
                proposal_id: nack.proposal_id,
                promised_proposal_id: nack.promised_proposal_id,
            }),
        });
    }

    fn broadcast(&mut self, message: Message) {
        for uid in &self.peers {
            self.outbox.push(Envelope {
                to: uid.clone(),
                message: message.clone(),
            });
        }
    }

    /// Durably replaces the record, then mirrors it in memory. Callers rely
    /// on the error path: when the save fails, the reply that depended on it
    /// is never enqueued.
    fn save_state(
        &mut self,
        instance_number: u64,
        current_value: Option<String>,
        promised_id: Option<ProposalId>,
        accepted_id: Option<ProposalId>,
        accepted_value: Option<String>,
    ) -> Result<()> {
        let record = PersistentRecord {
            instance_number,
            promised_id,
            accepted_id,
            accepted_value,
            current_value,
        };
        self.store.save(&record)?;
        self.record = record;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ProposeValue;

    struct Fixture {
        _dir: tempfile::TempDir,
        state_path: std::path::PathBuf,
        register: Register,
        now: Instant,
    }

    fn fixture(uid: &str, peers: &[&str], master_lease: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join(format!("{uid}.state"));
        let now = Instant::now();
        let register = Register::new(
            uid,
            peers.iter().map(|p| p.to_string()).collect(),
            StateStore::new(&state_path),
            master_lease,
            now,
        )
        .unwrap()
        .with_rng(StdRng::seed_from_u64(7));
        Fixture {
            _dir: dir,
            state_path,
            register,
            now,
        }
    }

    fn stored(f: &Fixture) -> PersistentRecord {
        StateStore::new(&f.state_path).load().unwrap()
    }

    fn prepares_in(envelopes: &[Envelope]) -> Vec<&Preparation> {
        envelopes
            .iter()
            .filter_map(|e| match &e.message {
                Message::Prepare(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn fresh_boot_starts_at_instance_zero() {
        let f = fixture("A", &["A", "B", "C"], false);
        assert_eq!(f.register.instance_number(), 0);
        assert_eq!(f.register.current_value(), None);
        assert_eq!(stored(&f), PersistentRecord::default());
    }

    #[test]
    fn single_peer_quorum_of_one_decides_locally() {
        let mut f = fixture("A", &["A"], false);
        f.register.propose_update(f.now, "x".to_string()).unwrap();

        // Loop the register's own broadcasts back until traffic dries up.
        loop {
            let envelopes = f.register.drain_outbox();
            if envelopes.is_empty() {
                break;
            }
            for envelope in envelopes {
                assert_eq!(envelope.to, "A");
                f.register
                    .handle_message(f.now, "A", envelope.message)
                    .unwrap();
            }
        }

        assert_eq!(f.register.instance_number(), 1);
        assert_eq!(f.register.current_value(), Some("x"));
        assert_eq!(stored(&f).instance_number, 1);
    }

    #[test]
    fn promise_is_durable_before_it_is_enqueued() {
        let mut f = fixture("B", &["A", "B", "C"], false);
        let pid = ProposalId::new(1, "A");
        f.register
            .handle_message(
                f.now,
                "A",
                Message::Prepare(Preparation {
                    instance_number: 0,
                    proposal_id: pid.clone(),
                }),
            )
            .unwrap();

        assert_eq!(stored(&f).promised_id, Some(pid.clone()));
        let envelopes = f.register.drain_outbox();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].to, "A");
        match &envelopes[0].message {
            Message::Promise(m) => assert_eq!(m.proposal_id, pid),
            other => panic!("expected a promise, got {other:?}"),
        }
    }

    #[test]
    fn acceptance_is_durable_before_accepted_is_enqueued() {
        let mut f = fixture("B", &["A", "B", "C"], false);
        let pid = ProposalId::new(1, "A");
        f.register
            .handle_message(
                f.now,
                "A",
                Message::Accept(AcceptRequest {
                    instance_number: 0,
                    proposal_id: pid.clone(),
                    proposal_value: "v".to_string(),
                }),
            )
            .unwrap();

        let record = stored(&f);
        assert_eq!(record.promised_id, Some(pid.clone()));
        assert_eq!(record.accepted_id, Some(pid.clone()));
        assert_eq!(record.accepted_value.as_deref(), Some("v"));

        let envelopes = f.register.drain_outbox();
        let accepted: Vec<_> = envelopes
            .iter()
            .filter(|e| matches!(e.message, Message::Accepted(_)))
            .collect();
        assert_eq!(accepted.len(), 3, "accepted is broadcast to every peer");
    }

    #[test]
    fn stale_instance_messages_are_dropped() {
        let mut f = fixture("B", &["A", "B", "C"], false);
        f.register
            .handle_message(
                f.now,
                "A",
                Message::Prepare(Preparation {
                    instance_number: 7,
                    proposal_id: ProposalId::new(1, "A"),
                }),
            )
            .unwrap();

        assert!(f.register.drain_outbox().is_empty());
        assert_eq!(stored(&f).promised_id, None);
    }

    #[test]
    fn nack_backs_off_and_redrives_with_a_higher_number() {
        let mut f = fixture("A", &["A", "B", "C"], false);
        f.register.propose_update(f.now, "x".to_string()).unwrap();
        let first = f.register.drain_outbox();
        assert_eq!(prepares_in(&first)[0].proposal_id, ProposalId::new(1, "A"));

        f.register
            .handle_message(
                f.now,
                "B",
                Message::Nack(Rejection {
                    instance_number: 0,
                    proposal_id: ProposalId::new(1, "A"),
                    promised_proposal_id: ProposalId::new(5, "C"),
                }),
            )
            .unwrap();
        assert!(f.register.drain_outbox().is_empty(), "backoff delays the redrive");

        // Well past any jitter the first backoff window can draw.
        f.register.poll_timers(f.now + Duration::from_secs(3)).unwrap();
        let redriven = f.register.drain_outbox();
        assert_eq!(prepares_in(&redriven)[0].proposal_id, ProposalId::new(6, "A"));
    }

    #[test]
    fn observed_accept_schedules_a_silent_takeover() {
        let mut f = fixture("C", &["A", "B", "C"], false);
        f.register
            .handle_message(
                f.now,
                "A",
                Message::Accept(AcceptRequest {
                    instance_number: 0,
                    proposal_id: ProposalId::new(1, "A"),
                    proposal_value: "v".to_string(),
                }),
            )
            .unwrap();
        f.register.drain_outbox();

        // The driving peer falls silent; after the timeout we step in.
        f.register.poll_timers(f.now + Duration::from_secs(4)).unwrap();
        let envelopes = f.register.drain_outbox();
        let prepares = prepares_in(&envelopes);
        assert_eq!(prepares.len(), 3);
        assert_eq!(prepares[0].proposal_id, ProposalId::new(2, "C"));
    }

    #[test]
    fn catchup_skips_to_the_advertised_instance() {
        let mut f = fixture("C", &["A", "B", "C"], false);
        f.register
            .handle_message(
                f.now,
                "A",
                Message::Catchup(Catchup {
                    instance_number: 5,
                    current_value: "z".to_string(),
                }),
            )
            .unwrap();

        assert_eq!(f.register.instance_number(), 5);
        assert_eq!(f.register.current_value(), Some("z"));
        let record = stored(&f);
        assert_eq!(record.instance_number, 5);
        assert_eq!(record.promised_id, None);
        assert_eq!(record.accepted_id, None);
    }

    #[test]
    fn sync_request_is_answered_only_when_the_caller_lags() {
        let mut f = fixture("A", &["A", "B", "C"], false);
        f.register
            .handle_message(
                f.now,
                "B",
                Message::Catchup(Catchup {
                    instance_number: 3,
                    current_value: "c".to_string(),
                }),
            )
            .unwrap();

        f.register
            .handle_message(f.now, "C", Message::SyncRequest(SyncRequest { instance_number: 0 }))
            .unwrap();
        let envelopes = f.register.drain_outbox();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].to, "C");
        match &envelopes[0].message {
            Message::Catchup(m) => {
                assert_eq!(m.instance_number, 3);
                assert_eq!(m.current_value, "c");
            }
            other => panic!("expected catchup, got {other:?}"),
        }

        f.register
            .handle_message(f.now, "C", Message::SyncRequest(SyncRequest { instance_number: 3 }))
            .unwrap();
        assert!(f.register.drain_outbox().is_empty());
    }

    #[test]
    fn non_master_drops_client_proposals() {
        let mut f = fixture("B", &["A", "B", "C"], true);
        f.register
            .handle_message(
                f.now,
                "B",
                Message::Propose(ProposeValue {
                    value: "x".to_string(),
                }),
            )
            .unwrap();
        assert!(f.register.drain_outbox().is_empty());
    }

    fn grant_lease_to(f: &mut Fixture, master: &str) {
        let wrapped = message::encode_lease_slots(Some(master.to_string()), None);
        let pid = ProposalId::new(1, master);
        for voter in ["A", "B", "C"] {
            f.register
                .handle_message(
                    f.now,
                    voter,
                    Message::Accepted(Acceptance {
                        instance_number: 0,
                        proposal_id: pid.clone(),
                        proposal_value: wrapped.clone(),
                    }),
                )
                .unwrap();
        }
        f.register.drain_outbox();
    }

    #[test]
    fn lease_grant_surfaces_the_previous_value_and_filters_outsiders() {
        let mut f = fixture("B", &["A", "B", "C"], true);
        grant_lease_to(&mut f, "A");

        assert_eq!(f.register.master_uid(), Some("A"));
        assert_eq!(f.register.instance_number(), 1);
        // The grant is not an application value.
        assert_eq!(f.register.current_value(), None);

        // While A's lease holds, other proposers are ignored outright.
        f.register
            .handle_message(
                f.now,
                "C",
                Message::Prepare(Preparation {
                    instance_number: 1,
                    proposal_id: ProposalId::new(2, "C"),
                }),
            )
            .unwrap();
        assert!(f.register.drain_outbox().is_empty());
        assert_eq!(stored(&f).promised_id, None);
    }

    #[test]
    fn master_commits_in_one_round_trip_without_prepares() {
        let mut f = fixture("A", &["A", "B", "C"], true);
        grant_lease_to(&mut f, "A");
        assert_eq!(f.register.master_uid(), Some("A"));

        f.register.propose_update(f.now, "p1".to_string()).unwrap();
        let envelopes = f.register.drain_outbox();
        assert!(prepares_in(&envelopes).is_empty(), "no prepare phase under a lease");

        let accepts: Vec<_> = envelopes
            .iter()
            .filter_map(|e| match &e.message {
                Message::Accept(m) => Some(m),
                _ => None,
            })
            .collect();
        assert_eq!(accepts.len(), 3);
        assert_eq!(accepts[0].proposal_id, ProposalId::new(1, "A"));
        assert_eq!(
            message::decode_lease_slots(&accepts[0].proposal_value).unwrap(),
            (None, Some("p1".to_string()))
        );
    }

    #[test]
    fn catchup_under_a_lease_bumps_the_proposal_number_past_one() {
        let mut f = fixture("B", &["A", "B", "C"], true);
        f.register
            .handle_message(
                f.now,
                "A",
                Message::Catchup(Catchup {
                    instance_number: 4,
                    current_value: "w".to_string(),
                }),
            )
            .unwrap();
        f.register.drain_outbox();

        // A later local drive must not collide with a live master's fixed
        // ProposalId(1, master). Drive via the lease-expiry path, since a
        // non-master drops client proposals outright.
        f.register
            .poll_timers(f.now + Duration::from_secs(10))
            .unwrap();
        let envelopes = f.register.drain_outbox();
        let prepares = prepares_in(&envelopes);
        assert!(!prepares.is_empty());
        assert!(prepares[0].proposal_id.number() >= 2);
    }
}

//! Per-remote state: identity, keypair slots, handshake scratch, timers and
//! the queue of packets waiting for a session.

use core::time::Duration;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tai64::Tai64N;
use veilguard_crypto::{HandshakeState, Mac, StaticPeerConfig};
use veilguard_types::{Cookie, FEATURES_COUNT, FEATURE_OFF, TIMESTAMP_LEN};
use x25519_dalek::ReusableSecret;

use crate::ext::CipherList;
use crate::keypair::KeyPair;
use crate::timers::{
    Timer, TimerActions, TimerSet, KEEPALIVE_TIMEOUT, MAX_HANDSHAKE_ATTEMPTS,
    MAX_QUEUED_PACKETS_PER_PEER, MIN_HANDSHAKE_INTERVAL, REJECT_AFTER_TIME, REKEY_AFTER_TIME,
    REKEY_TIMEOUT,
};

/// The three keypair slots. `Curr` carries outgoing traffic, `Prev` still
/// decrypts stragglers from before the last rotation, `Next` was installed
/// by a responder-side handshake and is promoted on its first packet.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum KeyRole {
    Curr = 0,
    Prev = 1,
    Next = 2,
}

#[derive(Default)]
pub(crate) struct KeySlots([Option<Arc<KeyPair>>; 3]);

impl KeySlots {
    pub fn get(&self, role: KeyRole) -> Option<&Arc<KeyPair>> {
        self.0[role as usize].as_ref()
    }

    pub fn current(&self) -> Option<&Arc<KeyPair>> {
        self.get(KeyRole::Curr)
    }

    pub fn iter(&self) -> impl Iterator<Item = (KeyRole, &Arc<KeyPair>)> {
        [KeyRole::Curr, KeyRole::Prev, KeyRole::Next]
            .into_iter()
            .filter_map(move |role| Some((role, self.0[role as usize].as_ref()?)))
    }

    pub fn role_of(&self, kp: &Arc<KeyPair>) -> Option<KeyRole> {
        self.iter()
            .find(|(_, held)| Arc::ptr_eq(held, kp))
            .map(|(role, _)| role)
    }

    /// Installs a keypair we initiated: it starts carrying traffic at once
    /// and the old current key moves to the previous slot. Returns the
    /// displaced keypairs.
    pub fn install_current(&mut self, kp: Arc<KeyPair>) -> Vec<Arc<KeyPair>> {
        let mut out = Vec::new();
        let old_curr = self.0[KeyRole::Curr as usize].replace(kp);
        let displaced_prev = match old_curr {
            Some(old) => {
                old.mark_did_refresh();
                self.0[KeyRole::Prev as usize].replace(old)
            }
            None => self.0[KeyRole::Prev as usize].take(),
        };
        out.extend(displaced_prev);
        // an unconfirmed next key from an older exchange is dead weight now
        out.extend(self.0[KeyRole::Next as usize].take());
        out
    }

    /// Installs a keypair the remote initiated. It waits in the next slot
    /// until the peer proves liveness by sending on it.
    pub fn install_next(&mut self, kp: Arc<KeyPair>) -> Option<Arc<KeyPair>> {
        self.0[KeyRole::Next as usize].replace(kp)
    }

    /// First packet on a next-slot keypair confirms the handshake: rotate
    /// it into current. Returns the displaced previous keypair.
    pub fn promote_next(&mut self, kp: &Arc<KeyPair>) -> Option<Arc<KeyPair>> {
        match &self.0[KeyRole::Next as usize] {
            Some(next) if Arc::ptr_eq(next, kp) => {}
            _ => return None,
        }
        let next = self.0[KeyRole::Next as usize].take().unwrap();
        match self.0[KeyRole::Curr as usize].replace(next) {
            Some(old) => {
                old.mark_did_refresh();
                self.0[KeyRole::Prev as usize].replace(old)
            }
            None => None,
        }
    }

    /// Drops a specific keypair from whatever slot holds it.
    pub fn remove(&mut self, kp: &Arc<KeyPair>) -> Option<Arc<KeyPair>> {
        let role = self.role_of(kp)?;
        self.0[role as usize].take()
    }

    pub fn clear(&mut self) -> Vec<Arc<KeyPair>> {
        self.0.iter_mut().filter_map(Option::take).collect()
    }
}

/// In-flight initiator handshake state.
pub(crate) struct PendingHandshake {
    pub local_id: u32,
    pub esk: ReusableSecret,
    pub hs: HandshakeState,
}

pub struct Peer {
    pub(crate) static_: StaticPeerConfig,
    /// Serializes the responder's initiation-accept path. The timestamp
    /// monotonicity and 20 ms spacing checks must commit atomically with
    /// respect to other initiations for this peer, and the work between
    /// check and commit (negotiation, key-id reservation, the response
    /// AEADs) runs without `inner` held. Acquired before any device table
    /// lock and before `inner`; nothing is ever acquired before it.
    pub(crate) initiation_serial: Mutex<()>,
    pub(crate) inner: Mutex<PeerInner>,
}

impl Peer {
    pub(crate) fn new(static_: StaticPeerConfig) -> Self {
        Self {
            static_,
            initiation_serial: Mutex::new(()),
            inner: Mutex::new(PeerInner::default()),
        }
    }
}

pub(crate) struct PeerInner {
    pub endpoint: Option<SocketAddr>,
    pub allow_endpoint_change: bool,
    pub allow_multicast: bool,
    pub persistent_keepalive: Option<Duration>,

    pub keypairs: KeySlots,
    pub handshake: Option<PendingHandshake>,

    /// Highest TAI64N seen in an accepted initiation; later initiations
    /// must strictly exceed it.
    pub latest_ts: [u8; TIMESTAMP_LEN],
    pub last_initiation_recv: Option<Tai64N>,
    pub last_initiation_sent: Option<Tai64N>,
    pub handshake_attempts: u8,
    /// Set after too many failed attempts; new outbound traffic wakes the
    /// peer back up.
    pub dormant: bool,

    pub cookie: Option<Cookie>,
    pub cookie_created: Option<Tai64N>,
    pub expect_cookie_reply: bool,
    pub last_sent_mac1: Mac,

    pub queue: VecDeque<Vec<u8>>,

    pub features: [u8; FEATURES_COUNT],
    pub ciphers: CipherList,
    pub cipher_prio: bool,

    pub timers: TimerSet,
}

impl Default for PeerInner {
    fn default() -> Self {
        let mut ciphers = CipherList::new();
        ciphers.push(veilguard_crypto::CipherSuite::ChaCha20Poly1305);
        Self {
            endpoint: None,
            allow_endpoint_change: true,
            allow_multicast: false,
            persistent_keepalive: None,
            keypairs: KeySlots::default(),
            handshake: None,
            latest_ts: [0; TIMESTAMP_LEN],
            last_initiation_recv: None,
            last_initiation_sent: None,
            handshake_attempts: 0,
            dormant: false,
            cookie: None,
            cookie_created: None,
            expect_cookie_reply: false,
            last_sent_mac1: [0; 16],
            queue: VecDeque::new(),
            features: [FEATURE_OFF; FEATURES_COUNT],
            ciphers,
            cipher_prio: false,
            timers: TimerSet::default(),
        }
    }
}

impl PeerInner {
    /// Buffers a packet until a session exists. Bounded; the oldest packet
    /// gives way.
    pub fn queue_packet(&mut self, packet: Vec<u8>) -> bool {
        let mut dropped = false;
        while self.queue.len() >= MAX_QUEUED_PACKETS_PER_PEER {
            self.queue.pop_front();
            dropped = true;
        }
        self.queue.push_back(packet);
        dropped
    }

    /// Whether a new initiation may leave right now. Flood-limited to one
    /// per 20 ms and capped at twenty attempts before the peer goes
    /// dormant.
    pub fn may_initiate(&self, now: Tai64N) -> bool {
        if self.dormant || self.handshake_attempts >= MAX_HANDSHAKE_ATTEMPTS {
            return false;
        }
        match self.last_initiation_sent {
            Some(at) => at + MIN_HANDSHAKE_INTERVAL <= now,
            None => true,
        }
    }

    /// The 20 ms responder-side gate between accepted initiations.
    pub fn may_accept_initiation(&self, now: Tai64N) -> bool {
        match self.last_initiation_recv {
            Some(at) => at + MIN_HANDSHAKE_INTERVAL <= now,
            None => true,
        }
    }

    pub fn cookie_fresh(&self, now: Tai64N) -> Option<&Cookie> {
        let created = self.cookie_created?;
        if created + crate::timers::COOKIE_SECRET_MAX_AGE > now {
            self.cookie.as_ref()
        } else {
            None
        }
    }

    pub fn on_handshake_init_sent(&mut self, now: Tai64N) {
        self.handshake_attempts = self.handshake_attempts.saturating_add(1);
        self.last_initiation_sent = Some(now);
        self.expect_cookie_reply = true;
        self.timers.arm(Timer::RetransmitHandshake, now + REKEY_TIMEOUT);
    }

    pub fn on_handshake_complete(&mut self, now: Tai64N, initiator: bool) {
        self.handshake_attempts = 0;
        self.dormant = false;
        self.expect_cookie_reply = false;
        self.timers.disarm(Timer::RetransmitHandshake);
        if initiator {
            self.timers.arm(Timer::NewHandshake, now + REKEY_AFTER_TIME);
        }
        self.timers.arm_earlier(Timer::Reject, now + REJECT_AFTER_TIME);
        if let Some(interval) = self.persistent_keepalive {
            self.timers.arm(Timer::PersistentKeepalive, now + interval);
        }
    }

    pub fn on_data_sent(&mut self, now: Tai64N) {
        self.timers.disarm(Timer::Keepalive);
        if let Some(interval) = self.persistent_keepalive {
            self.timers.arm(Timer::PersistentKeepalive, now + interval);
        }
    }

    pub fn on_data_received(&mut self, now: Tai64N) {
        self.timers
            .arm_earlier(Timer::Keepalive, now + KEEPALIVE_TIMEOUT);
    }

    /// The once-per-second evaluation of all five timers.
    pub fn check_timeouts(&mut self, now: Tai64N) -> TimerActions {
        let mut actions = TimerActions::default();

        if self.timers.fire(Timer::RetransmitHandshake, now) && self.handshake.is_some() {
            if self.handshake_attempts >= MAX_HANDSHAKE_ATTEMPTS {
                self.handshake = None;
                self.dormant = true;
                tracing::debug!("handshake attempts exhausted, going dormant");
            } else {
                actions.insert(TimerActions::SEND_HANDSHAKE);
            }
        }

        if self.timers.fire(Timer::NewHandshake, now) {
            actions.insert(TimerActions::SEND_HANDSHAKE);
        }

        if self.timers.fire(Timer::Keepalive, now) {
            actions.insert(TimerActions::SEND_KEEPALIVE);
        }

        if self.timers.fire(Timer::PersistentKeepalive, now) {
            actions.insert(TimerActions::SEND_KEEPALIVE);
            if let Some(interval) = self.persistent_keepalive {
                self.timers.arm(Timer::PersistentKeepalive, now + interval);
            }
        }

        actions
    }
}

/// Observable peer state for the control surface.
#[derive(Clone, Copy, Debug)]
pub struct PeerStatus {
    pub endpoint: Option<SocketAddr>,
    pub has_session: bool,
    pub handshake_attempts: u8,
    /// Stopped initiating after too many failures; waiting for new
    /// outbound traffic.
    pub dormant: bool,
}

#[cfg(test)]
mod tests {
    use tai64::Tai64N;
    use veilguard_crypto::CipherSuite;

    use super::*;
    use crate::keypair::{KeyPair, KeyPairParams};
    use crate::PeerId;

    fn kp(local_id: u32) -> Arc<KeyPair> {
        Arc::new(KeyPair::new(KeyPairParams {
            peer: PeerId(0),
            is_initiator: false,
            local_id,
            remote_id: local_id + 1000,
            created: Tai64N::UNIX_EPOCH,
            suite: CipherSuite::ChaCha20Poly1305,
            send_key: [1; 32],
            recv_key: [2; 32],
            features: [false; FEATURES_COUNT],
            compression: None,
        }))
    }

    #[test]
    fn slots_stay_pairwise_distinct() {
        let mut slots = KeySlots::default();
        let a = kp(1);
        let b = kp(2);
        let c = kp(3);

        assert!(slots.install_current(a.clone()).is_empty());
        assert!(slots.install_current(b.clone()).is_empty());
        assert_eq!(slots.current().unwrap().local_id(), 2);
        assert_eq!(slots.get(KeyRole::Prev).unwrap().local_id(), 1);

        // a third rotation displaces the oldest
        let displaced = slots.install_current(c.clone());
        assert_eq!(displaced.len(), 1);
        assert_eq!(displaced[0].local_id(), 1);

        let mut seen = std::collections::HashSet::new();
        for (_, kp) in slots.iter() {
            assert!(seen.insert(kp.local_id()));
        }
    }

    #[test]
    fn next_promotes_on_confirmation() {
        let mut slots = KeySlots::default();
        let old = kp(1);
        let fresh = kp(2);

        slots.install_current(old.clone());
        assert!(slots.install_next(fresh.clone()).is_none());
        assert_eq!(slots.current().unwrap().local_id(), 1);

        // traffic on the next key rotates it in
        assert!(slots.promote_next(&fresh).is_none());
        assert_eq!(slots.current().unwrap().local_id(), 2);
        assert_eq!(slots.get(KeyRole::Prev).unwrap().local_id(), 1);
        assert!(slots.get(KeyRole::Next).is_none());

        // promoting something no longer in the next slot is a no-op
        assert!(slots.promote_next(&old).is_none());
        assert_eq!(slots.current().unwrap().local_id(), 2);
    }

    #[test]
    fn queue_drops_oldest_past_cap() {
        let mut inner = PeerInner::default();
        for i in 0..MAX_QUEUED_PACKETS_PER_PEER {
            assert!(!inner.queue_packet(vec![i as u8]));
        }
        assert!(inner.queue_packet(vec![0xff]));
        assert_eq!(inner.queue.len(), MAX_QUEUED_PACKETS_PER_PEER);
        assert_eq!(inner.queue.front().unwrap()[0], 1);
        assert_eq!(inner.queue.back().unwrap()[0], 0xff);
    }

    #[test]
    fn initiation_spacing_and_dormancy() {
        let mut inner = PeerInner::default();
        let t0 = Tai64N::UNIX_EPOCH + core::time::Duration::from_secs(100);

        assert!(inner.may_initiate(t0));
        inner.on_handshake_init_sent(t0);
        assert!(!inner.may_initiate(t0 + core::time::Duration::from_millis(10)));
        assert!(inner.may_initiate(t0 + core::time::Duration::from_millis(21)));

        inner.handshake_attempts = MAX_HANDSHAKE_ATTEMPTS;
        assert!(!inner.may_initiate(t0 + core::time::Duration::from_secs(10)));
    }

    #[test]
    fn retransmit_exhaustion_goes_dormant() {
        let mut inner = PeerInner::default();
        let mut now = Tai64N::UNIX_EPOCH + core::time::Duration::from_secs(100);

        inner.handshake = Some(PendingHandshake {
            local_id: 1,
            esk: ReusableSecret::random_from_rng(rand::rngs::OsRng),
            hs: HandshakeState::default(),
        });

        for _ in 0..MAX_HANDSHAKE_ATTEMPTS {
            inner.on_handshake_init_sent(now);
            now = now + REKEY_TIMEOUT;
            let actions = inner.check_timeouts(now);
            if inner.dormant {
                break;
            }
            assert!(actions.contains(TimerActions::SEND_HANDSHAKE));
        }

        now = now + REKEY_TIMEOUT;
        let actions = inner.check_timeouts(now);
        assert!(inner.dormant);
        assert!(inner.handshake.is_none());
        assert!(!actions.contains(TimerActions::SEND_HANDSHAKE));
    }

    #[test]
    fn keepalive_answering_received_data() {
        let mut inner = PeerInner::default();
        let t0 = Tai64N::UNIX_EPOCH + core::time::Duration::from_secs(100);

        inner.on_data_received(t0);
        assert!(inner.check_timeouts(t0).is_empty());

        let actions = inner.check_timeouts(t0 + KEEPALIVE_TIMEOUT);
        assert!(actions.contains(TimerActions::SEND_KEEPALIVE));

        // sending first cancels the pending keepalive
        inner.on_data_received(t0);
        inner.on_data_sent(t0 + core::time::Duration::from_secs(1));
        assert!(inner.check_timeouts(t0 + KEEPALIVE_TIMEOUT).is_empty());
    }
}

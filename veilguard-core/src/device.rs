//! The process-wide registry and packet switch.
//!
//! A [`Device`] owns the static identity, the peer registry, the key-id and
//! address demultiplexing tables, the IP routing table, the cookie secret
//! and the handshake rate limiter. Workers call the packet paths
//! concurrently; structural changes and the 1 Hz [`Device::tick`] stay on
//! the main thread.
//!
//! Lock order, outermost first: a peer's `initiation_serial`, then the
//! device RW locks (`key_ids`, `addr_entries`, `registry`, `ip_lookup`),
//! then a peer mutex, then keypair-local state. Retiring a keypair touches
//! the tables and is therefore always done after the owning peer's mutex
//! is released.

use core::hash::BuildHasher;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use foldhash::fast::FixedState;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use rand::rngs::{OsRng, StdRng};
use rand::{Rng, RngCore, SeedableRng};
use tai64::Tai64N;
use x25519_dalek::{PublicKey, ReusableSecret, StaticSecret};
use zerocopy::AsBytes;
use zerocopy::FromBytes;

use veilguard_crypto::{
    decrypt_cookie, decrypt_handshake_init, decrypt_handshake_resp, encrypt_cookie,
    encrypt_handshake_init, encrypt_handshake_resp, verify_macs, CipherSuite, CookieState,
    HandshakeInitArgs, HandshakeRespArgs, HandshakeState, Key, StaticInitiatorConfig,
    StaticPeerConfig,
};
use veilguard_types::{
    CookieMessage, DataHeader, InitPrelude, PacketCompressionV1, RespPrelude, COOKIE_REPLY_SIZE,
    EXT_PACKET_COMPRESSION_VER, FEATURES_COUNT, FEATURE_IPZIP, FEATURE_SHORT_HEADER,
    HANDSHAKE_INIT_SIZE, HANDSHAKE_RESP_SIZE, MAX_HANDSHAKE_EXTENSION, MESSAGE_MINIMUM_SIZE,
    MSG_COOKIE, MSG_DATA, MSG_FIRST, MSG_SECOND, SHORT_HEADER_BIT,
};
use veilguard_utils::rate_limit::HandshakeRateLimiter;

use crate::addr_entry::{pack_addr, AddrEntry};
use crate::ext::{
    negotiate_cipher, negotiate_features, parse_extensions, write_extensions, CipherList,
    ExtensionBuf, RemoteExtensions,
};
use crate::framing::{
    dst_ip, is_multicast_or_broadcast, parse_short_header, reconstruct_counter, src_ip,
    write_short_header, ShortAck, ShortKeyRef,
};
use crate::ip_lookup::{CidrAddr, IpLookup};
use crate::keypair::{KeyPair, KeyPairParams};
use crate::obfuscate::Obfuscator;
use crate::peer::{Peer, PeerInner, PeerStatus, PendingHandshake};
use crate::timers::COOKIE_SECRET_MAX_AGE;
use crate::{DeviceCounters, Error, MainThread, PeerId};

/// Invoked when an initiation decrypts to a public key we do not know.
/// Returning `true` means the caller installs the peer and feeds the
/// packet back in.
pub type UnknownPeerHandler = Box<dyn Fn(&[u8; 32], &[u8]) -> bool + Send + Sync>;

/// What a received datagram turned into.
#[derive(Debug)]
pub enum RecvEvent<'m> {
    /// Nothing further to do (cookie consumed, keepalive absorbed).
    None,
    /// A protocol reply to send back to the source address.
    WriteBack(&'m mut [u8]),
    /// A decrypted tunnel packet to hand to the TUN side.
    Deliver { peer: PeerId, packet: &'m mut [u8] },
    /// An initiator handshake finished; queued traffic was flushed into
    /// [`Device::poll_transmit`].
    HandshakeComplete(PeerId),
}

/// What an outbound tunnel packet turned into.
#[derive(Debug)]
pub enum SendOutcome {
    Transmit(SocketAddr, Vec<u8>),
    /// Held back: queued for a pending session or fanned out through
    /// [`Device::poll_transmit`].
    Buffered,
}

struct KeyIdEntry {
    peer: PeerId,
    /// `None` while the handshake that reserved this id is in flight.
    keypair: Option<Arc<KeyPair>>,
}

struct PeerRegistry {
    peers: Vec<Option<Arc<Peer>>>,
    hasher: FixedState,
    by_pubkey: hashbrown::HashTable<PeerId>,
}

impl PeerRegistry {
    fn get(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.get(id.0 as usize)?.clone()
    }

    fn find(&self, key: &PublicKey) -> Option<PeerId> {
        let peers = &self.peers;
        self.by_pubkey
            .find(self.hasher.hash_one(key.as_bytes()), |&id| {
                peers[id.0 as usize]
                    .as_ref()
                    .is_some_and(|p| p.static_.key == *key)
            })
            .copied()
    }

    fn iter(&self) -> impl Iterator<Item = (PeerId, &Arc<Peer>)> {
        self.peers
            .iter()
            .enumerate()
            .filter_map(|(i, p)| Some((PeerId(i as u32), p.as_ref()?)))
    }
}

struct CookieRotation {
    state: CookieState,
    rotated_at: Tai64N,
}

pub struct Device {
    config: StaticInitiatorConfig,
    compression: PacketCompressionV1,

    rng: Mutex<StdRng>,
    registry: RwLock<PeerRegistry>,
    key_ids: RwLock<HashMap<u32, KeyIdEntry, FixedState>>,
    addr_entries: RwLock<HashMap<u64, AddrEntry, FixedState>>,
    ip_lookup: RwLock<IpLookup>,
    cookie: Mutex<CookieRotation>,
    rate_limiter: Mutex<HandshakeRateLimiter>,
    obfuscator: RwLock<Option<Obfuscator>>,
    delegate: RwLock<Option<UnknownPeerHandler>>,

    /// Auxiliary datagrams (handshakes, keepalives, flushed queues) for the
    /// driver to drain.
    pending: Mutex<VecDeque<(SocketAddr, Vec<u8>)>>,
    /// Retired keypairs wait here until no worker holds them.
    delayed_delete: Mutex<Vec<Arc<KeyPair>>>,

    counters: DeviceCounters,
}

impl Device {
    pub fn new(private_key: StaticSecret, rng: &mut (impl rand::CryptoRng + RngCore)) -> Self {
        let mut seed = <StdRng as SeedableRng>::Seed::default();
        rng.fill_bytes(&mut seed);

        let mut compression = PacketCompressionV1::default();
        compression.version = EXT_PACKET_COMPRESSION_VER.into();
        compression.ttl = 64;

        Self {
            config: StaticInitiatorConfig::new(private_key),
            compression,
            rng: Mutex::new(StdRng::from_seed(seed)),
            registry: RwLock::new(PeerRegistry {
                peers: Vec::new(),
                hasher: FixedState::with_seed(0),
                by_pubkey: hashbrown::HashTable::new(),
            }),
            key_ids: RwLock::new(HashMap::default()),
            addr_entries: RwLock::new(HashMap::default()),
            ip_lookup: RwLock::new(IpLookup::default()),
            cookie: Mutex::new(CookieRotation {
                state: CookieState::new(rng),
                rotated_at: Tai64N::UNIX_EPOCH,
            }),
            rate_limiter: Mutex::new(HandshakeRateLimiter::new(rng)),
            obfuscator: RwLock::new(None),
            delegate: RwLock::new(None),
            pending: Mutex::new(VecDeque::new()),
            delayed_delete: Mutex::new(Vec::new()),
            counters: DeviceCounters::default(),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.config.public_key
    }

    pub fn counters(&self) -> &DeviceCounters {
        &self.counters
    }

    // ---- control surface (main thread) ---- //

    /// Adds a peer, or replaces the stored preshared key when the public
    /// key is already present.
    pub fn add_peer(
        &self,
        _mt: &MainThread,
        key: PublicKey,
        preshared_key: Option<Key>,
    ) -> PeerId {
        let static_ = StaticPeerConfig::new(key, preshared_key, &self.config.private_key);
        let mut guard = self.registry.write();
        let registry = &mut *guard;

        if let Some(id) = registry.find(&key) {
            registry.peers[id.0 as usize] = Some(Arc::new(Peer::new(static_)));
            return id;
        }

        let id = PeerId(registry.peers.len() as u32);
        registry.peers.push(Some(Arc::new(Peer::new(static_))));
        let hash = registry.hasher.hash_one(key.as_bytes());
        let peers = &registry.peers;
        let hasher = &registry.hasher;
        registry.by_pubkey.insert_unique(hash, id, |&i| {
            hasher.hash_one(
                peers[i.0 as usize]
                    .as_ref()
                    .map_or([0; 32], |p| *p.static_.key.as_bytes()),
            )
        });
        tracing::debug!(peer = ?id, "peer added");
        id
    }

    /// Removes a peer: clears its keypairs, drains its queue and drops its
    /// routes.
    pub fn remove_peer(&self, _mt: &MainThread, id: PeerId) {
        let peer = {
            let mut registry = self.registry.write();
            let Some(slot) = registry.peers.get_mut(id.0 as usize) else {
                return;
            };
            let Some(peer) = slot.take() else { return };
            let hash = registry.hasher.hash_one(peer.static_.key.as_bytes());
            if let Ok(entry) = registry
                .by_pubkey
                .find_entry(hash, |&i| i == id)
            {
                entry.remove();
            }
            peer
        };
        self.ip_lookup.write().remove_peer(id);

        let (keypairs, pending_id) = {
            let mut inner = peer.inner.lock();
            inner.queue.clear();
            inner.timers.clear();
            let pending = inner.handshake.take().map(|hs| hs.local_id);
            (inner.keypairs.clear(), pending)
        };
        if let Some(local_id) = pending_id {
            self.key_ids.write().remove(&local_id);
        }
        for kp in keypairs {
            self.retire_keypair(kp);
        }
        tracing::debug!(peer = ?id, "peer removed");
    }

    pub fn add_allowed_ip(&self, _mt: &MainThread, id: PeerId, cidr: CidrAddr) {
        self.ip_lookup.write().insert(cidr, id);
    }

    pub fn set_endpoint(&self, id: PeerId, endpoint: SocketAddr) {
        self.with_peer(id, |inner| inner.endpoint = Some(endpoint));
    }

    pub fn set_persistent_keepalive(&self, id: PeerId, secs: Option<u32>) {
        self.with_peer(id, |inner| {
            inner.persistent_keepalive =
                secs.map(|s| core::time::Duration::from_secs(u64::from(s)));
        });
    }

    /// Declares one of the negotiable boolean features: off / supports /
    /// wants / enforces.
    pub fn set_feature(&self, id: PeerId, feature: usize, value: u8) {
        if feature >= FEATURES_COUNT || value > veilguard_types::FEATURE_ENFORCES {
            return;
        }
        self.with_peer(id, |inner| inner.features[feature] = value);
    }

    /// Appends to the peer's ordered cipher list. Returns false when the
    /// list is full or already contains the suite.
    pub fn add_cipher(&self, id: PeerId, suite: CipherSuite) -> bool {
        let mut added = false;
        self.with_peer(id, |inner| {
            if !inner.ciphers.contains(&suite) && inner.ciphers.try_push(suite).is_ok() {
                added = true;
            }
        });
        added
    }

    pub fn set_cipher_priority(&self, id: PeerId, prio: bool) {
        self.with_peer(id, |inner| inner.cipher_prio = prio);
    }

    pub fn set_allow_multicast(&self, id: PeerId, allow: bool) {
        self.with_peer(id, |inner| inner.allow_multicast = allow);
    }

    pub fn set_allow_endpoint_change(&self, id: PeerId, allow: bool) {
        self.with_peer(id, |inner| inner.allow_endpoint_change = allow);
    }

    pub fn set_header_obfuscation(&self, _mt: &MainThread, passphrase: Option<&str>) {
        *self.obfuscator.write() = passphrase.map(Obfuscator::new);
    }

    pub fn set_unknown_peer_handler(&self, _mt: &MainThread, handler: UnknownPeerHandler) {
        *self.delegate.write() = Some(handler);
    }

    pub fn peer_status(&self, id: PeerId) -> Option<PeerStatus> {
        let peer = self.registry.read().get(id)?;
        let inner = peer.inner.lock();
        Some(PeerStatus {
            endpoint: inner.endpoint,
            has_session: inner.keypairs.current().is_some(),
            handshake_attempts: inner.handshake_attempts,
            dormant: inner.dormant,
        })
    }

    /// Auxiliary datagrams produced by handshakes, timers and queue
    /// flushes. Drain until `None` after every call into the device.
    pub fn poll_transmit(&self) -> Option<(SocketAddr, Vec<u8>)> {
        self.pending.lock().pop_front()
    }

    fn with_peer(&self, id: PeerId, f: impl FnOnce(&mut PeerInner)) {
        if let Some(peer) = self.registry.read().get(id) {
            f(&mut peer.inner.lock());
        }
    }

    fn obfuscate(&self, data: &mut [u8]) {
        if let Some(obf) = &*self.obfuscator.read() {
            obf.apply(data);
        }
    }

    // ---- once-per-second maintenance (main thread) ---- //

    pub fn tick(&self, _mt: &MainThread, now: Tai64N) {
        {
            let mut rng = self.rng.lock();
            let mut cookie = self.cookie.lock();
            if cookie.rotated_at + COOKIE_SECRET_MAX_AGE <= now {
                cookie.state.generate(&mut *rng);
                cookie.rotated_at = now;
                // periodic reseed alongside the secret rotation
                let mut seed = <StdRng as SeedableRng>::Seed::default();
                OsRng.fill_bytes(&mut seed);
                *rng = StdRng::from_seed(seed);
            }
            self.rate_limiter.lock().periodic(&mut *rng);
        }

        let peers: Vec<(PeerId, Arc<Peer>)> = self
            .registry
            .read()
            .iter()
            .map(|(id, p)| (id, p.clone()))
            .collect();

        for (id, peer) in peers {
            let mut displaced = Vec::new();
            let (actions, keepalive_kp, endpoint, initiate) = {
                let mut inner = peer.inner.lock();

                let expired: Vec<Arc<KeyPair>> = inner
                    .keypairs
                    .iter()
                    .filter(|(_, kp)| kp.expired(now))
                    .map(|(_, kp)| kp.clone())
                    .collect();
                for kp in &expired {
                    inner.keypairs.remove(kp);
                }
                displaced.extend(expired);
                let _ = inner.timers.fire(crate::timers::Timer::Reject, now);

                let actions = inner.check_timeouts(now);
                let keepalive_kp = inner
                    .keypairs
                    .current()
                    .filter(|kp| kp.send_valid() && !kp.expired(now))
                    .cloned();
                let initiate = actions.contains(crate::TimerActions::SEND_HANDSHAKE)
                    && inner.may_initiate(now);
                if actions.contains(crate::TimerActions::SEND_KEEPALIVE)
                    && keepalive_kp.is_some()
                {
                    inner.on_data_sent(now);
                }
                (actions, keepalive_kp, inner.endpoint, initiate)
            };

            for kp in displaced {
                self.retire_keypair(kp);
            }

            if actions.contains(crate::TimerActions::SEND_KEEPALIVE) {
                if let (Some(kp), Some(ep)) = (keepalive_kp, endpoint) {
                    if let Ok(data) = self.frame_and_seal(&kp, &[]) {
                        self.pending.lock().push_back((ep, data));
                    }
                }
            }

            if initiate {
                let _ = self.begin_handshake(id, &peer, now);
            }
        }

        // a retired keypair is freed once no worker still holds it
        self.delayed_delete
            .lock()
            .retain(|kp| Arc::strong_count(kp) > 1);
    }

    // ---- outbound path (any thread) ---- //

    /// Routes and encrypts one L3 packet from the TUN side.
    pub fn send_packet(&self, packet: &[u8], now: Tai64N) -> Result<SendOutcome, Error> {
        let dst = dst_ip(packet).ok_or_else(|| {
            DeviceCounters::bump(&self.counters.dropped_invalid);
            Error::InvalidMessage
        })?;

        if is_multicast_or_broadcast(dst) {
            let peers: Vec<(PeerId, Arc<Peer>)> = self
                .registry
                .read()
                .iter()
                .map(|(id, p)| (id, p.clone()))
                .collect();
            for (id, peer) in peers {
                if peer.inner.lock().allow_multicast {
                    if let Ok(Some(t)) = self.encrypt_to_peer(id, &peer, packet, now) {
                        self.pending.lock().push_back(t);
                    }
                }
            }
            return Ok(SendOutcome::Buffered);
        }

        let peer_id = self.ip_lookup.read().lookup(dst).ok_or(Error::Rejected)?;
        let peer = self.registry.read().get(peer_id).ok_or(Error::Rejected)?;
        match self.encrypt_to_peer(peer_id, &peer, packet, now)? {
            Some((ep, data)) => Ok(SendOutcome::Transmit(ep, data)),
            None => Ok(SendOutcome::Buffered),
        }
    }

    fn encrypt_to_peer(
        &self,
        id: PeerId,
        peer: &Arc<Peer>,
        packet: &[u8],
        now: Tai64N,
    ) -> Result<Option<(SocketAddr, Vec<u8>)>, Error> {
        let mut displaced = Vec::new();
        let (result, initiate) = {
            let mut inner = peer.inner.lock();
            // fresh outbound traffic wakes a dormant peer
            if inner.dormant {
                inner.dormant = false;
                inner.handshake_attempts = 0;
            }

            let expired: Vec<Arc<KeyPair>> = inner
                .keypairs
                .iter()
                .filter(|(_, kp)| kp.expired(now))
                .map(|(_, kp)| kp.clone())
                .collect();
            for kp in &expired {
                inner.keypairs.remove(kp);
            }
            displaced.extend(expired);

            let kp = inner
                .keypairs
                .current()
                .filter(|kp| kp.send_valid())
                .cloned();

            match (kp, inner.endpoint) {
                (Some(kp), Some(ep)) => {
                    let rekey = kp.is_initiator()
                        && kp.wants_rekey(now)
                        && inner.handshake.is_none()
                        && inner.may_initiate(now);
                    if rekey {
                        kp.mark_want_refresh();
                    }
                    inner.on_data_sent(now);
                    (Some((kp, ep)), rekey)
                }
                (_, endpoint) => {
                    inner.queue_packet(packet.to_vec());
                    DeviceCounters::bump(&self.counters.queued);
                    let initiate = endpoint.is_some()
                        && inner.handshake.is_none()
                        && inner.may_initiate(now);
                    (None, initiate)
                }
            }
        };

        for kp in displaced {
            self.retire_keypair(kp);
        }

        match result {
            Some((kp, ep)) => {
                let data = self.frame_and_seal(&kp, packet)?;
                if initiate {
                    let _ = self.begin_handshake(id, peer, now);
                }
                DeviceCounters::bump(&self.counters.data_tx);
                Ok(Some((ep, data)))
            }
            None => {
                if initiate {
                    let _ = self.begin_handshake(id, peer, now);
                }
                Ok(None)
            }
        }
    }

    /// Frames (full or negotiated short header), encrypts and obfuscates
    /// one payload on `kp`.
    fn frame_and_seal(&self, kp: &Arc<KeyPair>, packet: &[u8]) -> Result<Vec<u8>, Error> {
        let ctr = kp.next_send_counter()?;
        let mut out = Vec::with_capacity(packet.len() + 32);

        if kp.feature(FEATURE_SHORT_HEADER) {
            let key = match kp.skip_keyid_out() {
                Some(slot) => ShortKeyRef::Slot(slot),
                None => ShortKeyRef::Explicit(kp.remote_id()),
            };
            let broadcast = kp
                .broadcast_short_key
                .load(core::sync::atomic::Ordering::Relaxed);
            let ack = (broadcast != 0).then_some(ShortAck {
                acked_low: 0,
                acked_bytes: 0,
                key_slot_broadcast: broadcast,
            });
            write_short_header(&mut out, ctr, key, ack);
            let hdr_len = out.len();
            out.extend_from_slice(packet);
            let (hdr, payload) = out.split_at_mut(hdr_len);
            let (tag, tag_len) = kp.seal(ctr, hdr, payload);
            out.extend_from_slice(&tag[..tag_len]);
        } else {
            let header = DataHeader {
                _type: MSG_DATA.into(),
                receiver: kp.remote_id().into(),
                counter: ctr.into(),
            };
            out.extend_from_slice(header.as_bytes());
            out.extend_from_slice(packet);
            let (tag, tag_len) = {
                let payload = &mut out[16..];
                kp.seal(ctr, &[], payload)
            };
            out.extend_from_slice(&tag[..tag_len]);
        }

        self.obfuscate(&mut out);
        Ok(out)
    }

    // ---- inbound path (any thread) ---- //

    /// Classifies and processes one datagram. The buffer is modified in
    /// place; replies and decrypted payloads are returned as subslices.
    pub fn recv_datagram<'m>(
        &self,
        src: SocketAddr,
        msg: &'m mut [u8],
        now: Tai64N,
    ) -> Result<RecvEvent<'m>, Error> {
        self.obfuscate_in(msg);

        let Some(&first) = msg.first() else {
            DeviceCounters::bump(&self.counters.dropped_invalid);
            return Err(Error::InvalidMessage);
        };
        if first & SHORT_HEADER_BIT != 0 {
            return self.recv_short_data(src, msg, now);
        }

        if msg.len() < MESSAGE_MINIMUM_SIZE {
            DeviceCounters::bump(&self.counters.dropped_invalid);
            return Err(Error::InvalidMessage);
        }
        let msg_type = u32::from_le_bytes(msg[..4].try_into().unwrap());
        match msg_type {
            MSG_FIRST => self.recv_handshake_init(src, msg, now),
            MSG_SECOND => self.recv_handshake_resp(src, msg, now),
            MSG_COOKIE => self.recv_cookie(msg, now).map(|()| RecvEvent::None),
            MSG_DATA => self.recv_data(src, msg, now),
            _ => {
                DeviceCounters::bump(&self.counters.dropped_invalid);
                Err(Error::InvalidMessage)
            }
        }
    }

    fn obfuscate_in(&self, msg: &mut [u8]) {
        if let Some(obf) = &*self.obfuscator.read() {
            obf.apply(msg);
        }
    }

    fn lookup_keypair(&self, key_id: u32) -> Option<Arc<KeyPair>> {
        self.key_ids.read().get(&key_id)?.keypair.clone()
    }

    fn count(&self, err: Error) -> Error {
        self.counters.count_error(err);
        err
    }

    fn recv_data<'m>(
        &self,
        src: SocketAddr,
        msg: &'m mut [u8],
        now: Tai64N,
    ) -> Result<RecvEvent<'m>, Error> {
        let header = DataHeader::read_from_prefix(&msg[..]).ok_or(Error::InvalidMessage)?;
        let kp = self
            .lookup_keypair(header.receiver.get())
            .ok_or_else(|| self.count(Error::Rejected))?;
        if !kp.recv_valid() || kp.expired(now) {
            return Err(self.count(Error::Rejected));
        }

        let tag_len = kp.auth_tag_len();
        if msg.len() < 16 + tag_len {
            return Err(self.count(Error::InvalidMessage));
        }
        let split = msg.len() - tag_len;
        let (rest, tag) = msg.split_at_mut(split);
        let payload = &mut rest[16..];

        kp.open(header.counter.get(), &[], payload, tag)
            .map_err(|e| self.count(e))?;

        self.after_decrypt(&kp, src, now);
        DeviceCounters::bump(&self.counters.data_rx);

        let peer = kp.peer();
        if payload.is_empty() {
            return Ok(RecvEvent::None);
        }
        self.check_inner_source(peer, payload)?;
        Ok(RecvEvent::Deliver {
            peer,
            packet: &mut msg[16..split],
        })
    }

    fn recv_short_data<'m>(
        &self,
        src: SocketAddr,
        msg: &'m mut [u8],
        now: Tai64N,
    ) -> Result<RecvEvent<'m>, Error> {
        let (header, hdr_len) =
            parse_short_header(msg).ok_or_else(|| self.count(Error::InvalidMessage))?;

        let kp = match header.key {
            ShortKeyRef::Explicit(id) => self.lookup_keypair(id),
            ShortKeyRef::Slot(slot) => {
                let addr_id = pack_addr(src).ok_or(Error::Rejected)?;
                self.addr_entries
                    .read()
                    .get(&addr_id)
                    .and_then(|e| e.get(slot).cloned())
            }
        }
        .ok_or_else(|| self.count(Error::Rejected))?;

        if !kp.recv_valid() || kp.expired(now) || !kp.feature(FEATURE_SHORT_HEADER) {
            return Err(self.count(Error::Rejected));
        }

        let wire_ctr = reconstruct_counter(
            kp.expected_wire_counter(),
            header.counter_low,
            header.counter_bytes,
        );

        let tag_len = kp.auth_tag_len();
        if msg.len() < hdr_len + tag_len {
            return Err(self.count(Error::InvalidMessage));
        }
        let split = msg.len() - tag_len;
        let (rest, tag) = msg.split_at_mut(split);
        let (hdr, payload) = rest.split_at_mut(hdr_len);

        kp.open(wire_ctr, hdr, payload, tag).map_err(|e| self.count(e))?;

        if let Some(ack) = header.ack {
            if ack.acked_bytes > 0 {
                let acked =
                    reconstruct_counter(kp.send_counter(), ack.acked_low, ack.acked_bytes);
                kp.record_ack(acked);
            }
            if ack.key_slot_broadcast != 0 {
                kp.can_use_short_key.store(
                    ack.key_slot_broadcast,
                    core::sync::atomic::Ordering::Relaxed,
                );
            }
        }

        self.after_decrypt(&kp, src, now);
        DeviceCounters::bump(&self.counters.data_rx);

        let peer = kp.peer();
        if payload.is_empty() {
            return Ok(RecvEvent::None);
        }
        self.check_inner_source(peer, payload)?;
        Ok(RecvEvent::Deliver {
            peer,
            packet: &mut msg[hdr_len..split],
        })
    }

    /// Anti-spoof: the inner source must be inside the peer's allowed-IP
    /// ranges.
    fn check_inner_source(&self, peer: PeerId, payload: &[u8]) -> Result<(), Error> {
        let src = src_ip(payload).ok_or_else(|| self.count(Error::InvalidMessage))?;
        if self.ip_lookup.read().peer_owns(peer, src) {
            Ok(())
        } else {
            DeviceCounters::bump(&self.counters.dropped_spoofed);
            Err(Error::Rejected)
        }
    }

    /// Post-decrypt bookkeeping: roaming, next-key confirmation, timers,
    /// addr-table learning and queue flushing.
    fn after_decrypt(&self, kp: &Arc<KeyPair>, src: SocketAddr, now: Tai64N) {
        let Some(peer) = self.registry.read().get(kp.peer()) else {
            return;
        };

        let mut displaced = Vec::new();
        let mut flushed = Vec::new();
        {
            let mut inner = peer.inner.lock();
            inner.on_data_received(now);

            if inner.endpoint != Some(src) && inner.allow_endpoint_change {
                tracing::debug!(peer = ?kp.peer(), %src, "peer endpoint moved");
                inner.endpoint = Some(src);
            }

            // first traffic on a responder-side key confirms the handshake
            if let Some(old) = inner.keypairs.promote_next(kp) {
                displaced.push(old);
            }
            if inner.keypairs.current().is_some_and(|c| Arc::ptr_eq(c, kp)) {
                flushed = inner.queue.drain(..).collect();
            }
            if !flushed.is_empty() {
                inner.on_data_sent(now);
            }
        }

        for old in displaced {
            self.retire_keypair(old);
        }

        if !flushed.is_empty() {
            let endpoint = peer.inner.lock().endpoint;
            if let Some(ep) = endpoint {
                for packet in flushed {
                    if let Ok(data) = self.frame_and_seal(kp, &packet) {
                        DeviceCounters::bump(&self.counters.data_tx);
                        self.pending.lock().push_back((ep, data));
                    }
                }
            }
        }

        // remember the address so short headers can omit the key-id
        if !kp
            .did_attempt_remember_addr
            .swap(true, core::sync::atomic::Ordering::Relaxed)
        {
            if let Some(addr_id) = pack_addr(src) {
                self.remember_addr(kp, addr_id, now);
            }
        }
    }

    fn remember_addr(&self, kp: &Arc<KeyPair>, addr_id: u64, now: Tai64N) {
        let mut entries = self.addr_entries.write();
        let entry = entries
            .entry(addr_id)
            .or_insert_with(|| AddrEntry::new(addr_id));
        if !entry.may_insert(now) {
            return;
        }
        let (slot, evicted) = entry.insert(kp.clone(), now);
        tracing::trace!(addr_id = entry.addr_id, slot, "addr table learned keypair");
        *kp.addr_entry.lock() = Some(crate::keypair::AddrSlot { addr_id, slot });
        kp.broadcast_short_key
            .store(slot + 1, core::sync::atomic::Ordering::Relaxed);
        if let Some(evicted) = evicted {
            *evicted.addr_entry.lock() = None;
        }
    }

    /// Pulls a keypair out of every table and parks it for delayed
    /// deletion. Never called with the owning peer's mutex held.
    fn retire_keypair(&self, kp: Arc<KeyPair>) {
        kp.invalidate();
        self.key_ids.write().remove(&kp.local_id());

        {
            let mut entries = self.addr_entries.write();
            let slot = kp.addr_entry.lock().take();
            if let Some(slot) = slot {
                if let Some(entry) = entries.get_mut(&slot.addr_id) {
                    if entry.clear(slot.slot, &kp) == 0 {
                        entries.remove(&slot.addr_id);
                    }
                }
            }
        }

        self.delayed_delete.lock().push(kp);
    }

    /// Reserves a fresh random key-id. The entry holds `None` until the
    /// handshake completes and promotes it.
    fn alloc_key_id(&self, peer: PeerId) -> u32 {
        let mut ids = self.key_ids.write();
        let mut rng = self.rng.lock();
        loop {
            let id: u32 = rng.gen();
            match ids.entry(id) {
                hashbrown::hash_map::Entry::Occupied(_) => continue,
                hashbrown::hash_map::Entry::Vacant(v) => {
                    v.insert(KeyIdEntry {
                        peer,
                        keypair: None,
                    });
                    return id;
                }
            }
        }
    }

    fn extension_block(&self, inner: &PeerInner) -> ExtensionBuf {
        let compression =
            (inner.features[FEATURE_IPZIP] != veilguard_types::FEATURE_OFF)
                .then_some(&self.compression);
        write_extensions(
            &inner.features,
            &inner.ciphers,
            inner.cipher_prio,
            compression,
        )
    }

    /// Builds and queues a handshake initiation towards `peer`.
    fn begin_handshake(&self, id: PeerId, peer: &Arc<Peer>, now: Tai64N) -> Result<(), Error> {
        let (ext, cookie, endpoint) = {
            let inner = peer.inner.lock();
            if !inner.may_initiate(now) {
                return Err(Error::Rejected);
            }
            (
                self.extension_block(&inner),
                inner.cookie_fresh(now).copied(),
                inner.endpoint,
            )
        };
        let Some(endpoint) = endpoint else {
            return Err(Error::Rejected);
        };

        let local_id = self.alloc_key_id(id);
        let esk = ReusableSecret::random_from_rng(&mut *self.rng.lock());
        let mut hs = HandshakeState::default();

        let mut buf = vec![0u8; HANDSHAKE_INIT_SIZE + MAX_HANDSHAKE_EXTENSION];
        let (written, mac1) = encrypt_handshake_init(
            &mut hs,
            &self.config,
            &peer.static_,
            &esk,
            HandshakeInitArgs {
                sender: local_id,
                now,
                cookie: cookie.as_ref(),
                extension: &ext,
            },
            &mut buf,
        )
        .map_err(|_| {
            self.key_ids.write().remove(&local_id);
            Error::Rejected
        })?;
        let mut datagram = written.to_vec();

        let stale_id = {
            let mut inner = peer.inner.lock();
            let stale = inner.handshake.take().map(|hs| hs.local_id);
            inner.handshake = Some(PendingHandshake { local_id, esk, hs });
            inner.last_sent_mac1 = mac1;
            inner.on_handshake_init_sent(now);
            stale
        };
        if let Some(stale) = stale_id {
            self.key_ids.write().remove(&stale);
        }

        self.obfuscate(&mut datagram);
        self.pending.lock().push_back((endpoint, datagram));
        DeviceCounters::bump(&self.counters.handshakes_initiated);
        tracing::debug!(peer = ?id, "handshake initiation sent");
        Ok(())
    }

    fn write_cookie_reply<'m>(
        &self,
        receiver: u32,
        mac1: &[u8; 16],
        cookie: veilguard_types::Cookie,
        msg: &'m mut [u8],
    ) -> &'m mut [u8] {
        let mut nonce = [0u8; 24];
        self.rng.lock().fill_bytes(&mut nonce);
        let sealed = encrypt_cookie(cookie, &self.config.cookie_key, &nonce, mac1);

        let reply = CookieMessage {
            _type: MSG_COOKIE.into(),
            receiver: receiver.into(),
            nonce,
            cookie: sealed,
        };
        let out = &mut msg[..COOKIE_REPLY_SIZE];
        out.copy_from_slice(reply.as_bytes());
        self.obfuscate(out);
        DeviceCounters::bump(&self.counters.cookies_sent);
        out
    }

    fn recv_handshake_init<'m>(
        &self,
        src: SocketAddr,
        msg: &'m mut [u8],
        now: Tai64N,
    ) -> Result<RecvEvent<'m>, Error> {
        if msg.len() < HANDSHAKE_INIT_SIZE {
            return Err(self.count(Error::InvalidMessage));
        }

        // the limiter result is only committed once the MACs checked out
        let ip_key = ip_rate_key(src);
        let (rate, overload) = {
            let limiter = self.rate_limiter.lock();
            (limiter.check(ip_key), limiter.is_used())
        };
        if rate.is_rate_limited() {
            return Err(self.count(Error::RateLimited));
        }

        let flow = {
            let cookie = self.cookie.lock();
            verify_macs(msg, &self.config.mac1_key, overload, &cookie.state, src)
        }
        .map_err(|_| {
            DeviceCounters::bump(&self.counters.dropped_mac);
            Error::Rejected
        })?;

        self.rate_limiter.lock().commit(&rate);

        if let core::ops::ControlFlow::Break(cookie) = flow {
            let prelude = InitPrelude::read_from_prefix(&msg[..]).ok_or(Error::InvalidMessage)?;
            let mac1: [u8; 16] = msg[msg.len() - 32..msg.len() - 16].try_into().unwrap();
            let sender = prelude.sender.get();
            return Ok(RecvEvent::WriteBack(
                self.write_cookie_reply(sender, &mac1, cookie, msg),
            ));
        }

        // keep the original bytes around for the unknown-peer hook
        let original = self
            .delegate
            .read()
            .is_some()
            .then(|| msg.to_vec());

        let mut hs = HandshakeState::default();
        let payload = decrypt_handshake_init(msg, &mut hs, &self.config)
            .map_err(|_| self.count(Error::DecryptionError))?;

        let remote_ext =
            parse_extensions(payload.extension).map_err(|e| self.count(e))?;
        let init_sender = payload.sender;
        let init_ephemeral = payload.ephemeral;
        let init_static = payload.static_key;
        let init_timestamp = payload.timestamp;

        let Some(peer_id) = self.registry.read().find(&init_static) else {
            if let (Some(handler), Some(original)) = (&*self.delegate.read(), original) {
                if handler(init_static.as_bytes(), &original) {
                    tracing::debug!("unknown peer accepted by delegate");
                }
            }
            return Err(self.count(Error::Rejected));
        };
        let peer = self.registry.read().get(peer_id).ok_or(Error::Rejected)?;

        // Initiations for one peer are accepted strictly one at a time.
        // The original runs this whole sequence on its main thread; here
        // the serial lock spans check, negotiation and commit, so two
        // racing initiations can never both pass the timestamp and
        // spacing gates before either records its acceptance.
        let _serial = peer.initiation_serial.lock();

        // validate and snapshot negotiation inputs
        let (local_features, local_ciphers, local_prio, resp_cookie) = {
            let inner = peer.inner.lock();
            if !inner.may_accept_initiation(now) {
                return Err(self.count(Error::Rejected));
            }
            if init_timestamp <= inner.latest_ts {
                return Err(self.count(Error::Rejected));
            }
            (
                inner.features,
                inner.ciphers.clone(),
                inner.cipher_prio,
                inner.cookie_fresh(now).copied(),
            )
        };

        let (features, suite, compression) = negotiate(
            &local_features,
            &local_ciphers,
            local_prio,
            &self.config.public_key,
            &remote_ext,
            &peer.static_.key,
        )
        .map_err(|e| self.count(e))?;

        let local_id = self.alloc_key_id(peer_id);

        // answer with our own announcement only if the peer extended
        let ext = if remote_ext.extended {
            let inner = peer.inner.lock();
            self.extension_block(&inner)
        } else {
            ExtensionBuf::new()
        };

        let mut resp_buf = vec![0u8; HANDSHAKE_RESP_SIZE + MAX_HANDSHAKE_EXTENSION];
        let resp = encrypt_handshake_resp(
            &mut hs,
            &init_ephemeral,
            &init_static,
            &ReusableSecret::random_from_rng(&mut *self.rng.lock()),
            &peer.static_,
            HandshakeRespArgs {
                sender: local_id,
                receiver: init_sender,
                cookie: resp_cookie.as_ref(),
                extension: &ext,
            },
            &mut resp_buf,
        );
        let (resp, resp_mac1) = match resp {
            Ok(v) => v,
            Err(_) => {
                self.key_ids.write().remove(&local_id);
                return Err(self.count(Error::Rejected));
            }
        };
        let resp_len = resp.len();

        let (send_key, recv_key) = hs.split(false);
        let kp = Arc::new(KeyPair::new(KeyPairParams {
            peer: peer_id,
            is_initiator: false,
            local_id,
            remote_id: init_sender,
            created: now,
            suite,
            send_key,
            recv_key,
            features,
            compression,
        }));

        // promote the reservation and install the key under one write
        // lock, peer mutex nested inside, so workers see all or nothing
        let displaced = {
            let mut ids = self.key_ids.write();
            if let Some(entry) = ids.get_mut(&local_id) {
                entry.keypair = Some(kp.clone());
            }
            let mut inner = peer.inner.lock();
            inner.latest_ts = init_timestamp;
            inner.last_initiation_recv = Some(now);
            inner.endpoint = Some(src);
            inner.last_sent_mac1 = resp_mac1;
            inner.on_handshake_complete(now, false);
            inner.keypairs.install_next(kp.clone())
        };
        if let Some(old) = displaced {
            self.retire_keypair(old);
        }

        DeviceCounters::bump(&self.counters.handshakes_completed);
        tracing::debug!(peer = ?peer_id, "handshake initiation accepted");

        // the response always fits where the larger initiation sat
        msg[..resp_len].copy_from_slice(&resp_buf[..resp_len]);
        let out = &mut msg[..resp_len];
        self.obfuscate(out);
        Ok(RecvEvent::WriteBack(out))
    }

    fn recv_handshake_resp<'m>(
        &self,
        src: SocketAddr,
        msg: &'m mut [u8],
        now: Tai64N,
    ) -> Result<RecvEvent<'m>, Error> {
        if msg.len() < HANDSHAKE_RESP_SIZE {
            return Err(self.count(Error::InvalidMessage));
        }

        let overload = self.rate_limiter.lock().is_used();
        let flow = {
            let cookie = self.cookie.lock();
            verify_macs(msg, &self.config.mac1_key, overload, &cookie.state, src)
        }
        .map_err(|_| {
            DeviceCounters::bump(&self.counters.dropped_mac);
            Error::Rejected
        })?;

        if let core::ops::ControlFlow::Break(cookie) = flow {
            let prelude = RespPrelude::read_from_prefix(&msg[..]).ok_or(Error::InvalidMessage)?;
            let mac1: [u8; 16] = msg[msg.len() - 32..msg.len() - 16].try_into().unwrap();
            let sender = prelude.sender.get();
            return Ok(RecvEvent::WriteBack(
                self.write_cookie_reply(sender, &mac1, cookie, msg),
            ));
        }

        let prelude = RespPrelude::read_from_prefix(&msg[..]).ok_or(Error::InvalidMessage)?;
        let receiver = prelude.receiver.get();

        let peer_id = {
            let ids = self.key_ids.read();
            let entry = ids.get(&receiver).ok_or_else(|| self.count(Error::Rejected))?;
            if entry.keypair.is_some() {
                // this id already belongs to a finished session
                return Err(self.count(Error::Rejected));
            }
            entry.peer
        };
        let peer = self.registry.read().get(peer_id).ok_or(Error::Rejected)?;

        // work on clones so a forged response cannot destroy the pending
        // handshake state
        let (esk, mut hs, local_features, local_ciphers, local_prio) = {
            let inner = peer.inner.lock();
            let pending = inner.handshake.as_ref().ok_or_else(|| self.count(Error::Rejected))?;
            if pending.local_id != receiver {
                return Err(self.count(Error::Rejected));
            }
            (
                pending.esk.clone(),
                pending.hs.clone(),
                inner.features,
                inner.ciphers.clone(),
                inner.cipher_prio,
            )
        };

        let payload = decrypt_handshake_resp(msg, &mut hs, &self.config, &peer.static_, &esk)
            .map_err(|_| self.count(Error::DecryptionError))?;
        let remote_ext = parse_extensions(payload.extension).map_err(|e| self.count(e))?;
        let resp_sender = payload.sender;

        let (features, suite, compression) = negotiate(
            &local_features,
            &local_ciphers,
            local_prio,
            &self.config.public_key,
            &remote_ext,
            &peer.static_.key,
        )
        .map_err(|e| self.count(e))?;

        let (send_key, recv_key) = hs.split(true);
        let kp = Arc::new(KeyPair::new(KeyPairParams {
            peer: peer_id,
            is_initiator: true,
            local_id: receiver,
            remote_id: resp_sender,
            created: now,
            suite,
            send_key,
            recv_key,
            features,
            compression,
        }));

        let (displaced, flushed, endpoint) = {
            let mut ids = self.key_ids.write();
            let mut inner = peer.inner.lock();
            // a racing duplicate of this response may have completed the
            // handshake first; only one completion may promote the
            // reservation and install keys
            if !inner
                .handshake
                .as_ref()
                .is_some_and(|pending| pending.local_id == receiver)
            {
                return Err(self.count(Error::Rejected));
            }
            if let Some(entry) = ids.get_mut(&receiver) {
                entry.keypair = Some(kp.clone());
            }
            inner.handshake = None;
            if inner.allow_endpoint_change || inner.endpoint.is_none() {
                inner.endpoint = Some(src);
            }
            inner.on_handshake_complete(now, true);
            let displaced = inner.keypairs.install_current(kp.clone());
            let flushed: Vec<Vec<u8>> = inner.queue.drain(..).collect();
            if !flushed.is_empty() {
                inner.on_data_sent(now);
            }
            (displaced, flushed, inner.endpoint)
        };
        for old in displaced {
            self.retire_keypair(old);
        }

        if let Some(ep) = endpoint {
            for packet in flushed {
                if let Ok(data) = self.frame_and_seal(&kp, &packet) {
                    DeviceCounters::bump(&self.counters.data_tx);
                    self.pending.lock().push_back((ep, data));
                }
            }
        }

        DeviceCounters::bump(&self.counters.handshakes_completed);
        tracing::debug!(peer = ?peer_id, "handshake completed as initiator");
        Ok(RecvEvent::HandshakeComplete(peer_id))
    }

    fn recv_cookie(&self, msg: &mut [u8], now: Tai64N) -> Result<(), Error> {
        let reply =
            CookieMessage::read_from_prefix(&msg[..]).ok_or_else(|| self.count(Error::InvalidMessage))?;

        let peer_id = self
            .key_ids
            .read()
            .get(&reply.receiver.get())
            .map(|e| e.peer)
            .ok_or_else(|| self.count(Error::Rejected))?;
        let peer = self.registry.read().get(peer_id).ok_or(Error::Rejected)?;

        let mut inner = peer.inner.lock();
        if !inner.expect_cookie_reply {
            return Err(self.count(Error::Rejected));
        }

        let mut sealed = reply.cookie;
        let cookie = decrypt_cookie(
            &mut sealed,
            &peer.static_.cookie_key,
            &reply.nonce,
            &inner.last_sent_mac1,
        )
        .map_err(|_| self.count(Error::DecryptionError))?;

        inner.cookie = Some(*cookie);
        inner.cookie_created = Some(now);
        inner.expect_cookie_reply = false;
        tracing::debug!(peer = ?peer_id, "cookie accepted");
        Ok(())
    }
}

fn ip_rate_key(src: SocketAddr) -> u64 {
    match src.ip() {
        core::net::IpAddr::V4(v4) => u64::from(v4.to_bits()),
        core::net::IpAddr::V6(v6) => (v6.to_bits() >> 64) as u64,
    }
}

/// Shared negotiation for both handshake directions: the same pure function
/// of the two announcements runs on each side, so both conclude the same
/// session parameters.
#[allow(clippy::type_complexity)]
fn negotiate(
    local_features: &[u8; FEATURES_COUNT],
    local_ciphers: &CipherList,
    local_prio: bool,
    local_pub: &PublicKey,
    remote: &RemoteExtensions,
    remote_pub: &PublicKey,
) -> Result<([bool; FEATURES_COUNT], CipherSuite, Option<PacketCompressionV1>), Error> {
    let features = negotiate_features(local_features, &remote.features)?;
    let suite = negotiate_cipher(
        local_ciphers,
        local_prio,
        local_pub,
        &remote.ciphers,
        remote.cipher_prio,
        remote_pub,
    );
    let compression = (features[FEATURE_IPZIP]).then_some(()).and(remote.compression);
    Ok((features, suite, compression))
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;
    use crate::MainThread;

    #[test]
    fn key_id_reservation() {
        let device = Device::new(StaticSecret::random_from_rng(OsRng), &mut OsRng);
        let a = device.alloc_key_id(PeerId(0));
        let b = device.alloc_key_id(PeerId(0));
        assert_ne!(a, b);
        assert!(device.lookup_keypair(a).is_none());
        assert!(device.key_ids.read().contains_key(&a));
    }

    #[test]
    fn add_peer_dedupes_by_pubkey() {
        let mt = MainThread::claim();
        let device = Device::new(StaticSecret::random_from_rng(OsRng), &mut OsRng);
        let key = PublicKey::from(&StaticSecret::random_from_rng(OsRng));

        let a = device.add_peer(&mt, key, None);
        let b = device.add_peer(&mt, key, Some([1; 32]));
        assert_eq!(a, b);

        let other = PublicKey::from(&StaticSecret::random_from_rng(OsRng));
        let c = device.add_peer(&mt, other, None);
        assert_ne!(a, c);
        assert_eq!(device.registry.read().find(&other), Some(c));
    }

    #[test]
    fn removed_peer_disappears() {
        let mt = MainThread::claim();
        let device = Device::new(StaticSecret::random_from_rng(OsRng), &mut OsRng);
        let key = PublicKey::from(&StaticSecret::random_from_rng(OsRng));
        let id = device.add_peer(&mt, key, None);
        device.add_allowed_ip(&mt, id, CidrAddr::new("10.0.0.0".parse().unwrap(), 24).unwrap());

        device.remove_peer(&mt, id);
        assert!(device.registry.read().find(&key).is_none());
        assert!(device.peer_status(id).is_none());
        assert!(device
            .ip_lookup
            .read()
            .lookup("10.0.0.1".parse().unwrap())
            .is_none());
    }
}

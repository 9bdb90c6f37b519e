//! One established session: a send/receive cipher pair bound to a completed
//! handshake.
//!
//! Everything a worker touches on the hot path is atomic or internally
//! locked, so packets flow on all threads while the main thread rotates and
//! retires keypairs around them.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use parking_lot::Mutex;
use tai64::Tai64N;
use veilguard_crypto::{
    compress_tag, derive_tag_compress_keys, tag_over_ciphertext, CipherSuite, Key, TagCompressKey,
    TransportCipher,
};
use veilguard_types::{
    PacketCompressionV1, Tag, FEATURES_COUNT, FEATURE_SHORT_MAC, FEATURE_SKIP_KEYID_OUT,
};
use veilguard_utils::replay::ReplayFilter;
use zeroize::Zeroize;

use crate::timers::{REJECT_AFTER_MESSAGES, REJECT_AFTER_TIME, REKEY_AFTER_TIME};
use crate::{Error, PeerId};

pub const KEY_INVALID: u8 = 0;
pub const KEY_VALID: u8 = 1;
pub const KEY_WANT_REFRESH: u8 = 2;
pub const KEY_DID_REFRESH: u8 = 3;

/// Where this keypair sits in the device addr table, if anywhere.
#[derive(Clone, Copy)]
pub struct AddrSlot {
    pub addr_id: u64,
    pub slot: u8,
}

/// Retained only while the 8-byte-MAC feature is active: recovering the
/// full tag on receive needs the raw session keys.
struct ShortMacState {
    send_key: Key,
    recv_key: Key,
    /// send direction first, receive second
    keys: [TagCompressKey; 2],
}

impl Drop for ShortMacState {
    fn drop(&mut self) {
        self.send_key.zeroize();
        self.recv_key.zeroize();
    }
}

pub struct KeyPair {
    peer: PeerId,
    is_initiator: bool,
    local_id: u32,
    remote_id: u32,
    created: Tai64N,
    suite: CipherSuite,
    send: TransportCipher,
    recv: TransportCipher,
    short_mac: Option<ShortMacState>,
    features: [bool; FEATURES_COUNT],
    compression: Option<PacketCompressionV1>,

    /// Next wire counter for outgoing packets.
    send_ctr: AtomicU64,
    /// Highest counter the peer acknowledged.
    send_ctr_acked: AtomicU64,
    send_key_state: AtomicU8,
    recv_key_state: AtomicU8,
    replay: ReplayFilter,

    pub(crate) addr_entry: Mutex<Option<AddrSlot>>,
    /// Slot+1 to broadcast to the peer in ack bytes, 0 when none pending.
    pub(crate) broadcast_short_key: AtomicU8,
    /// Slot+1 the peer told us we occupy in its addr table.
    pub(crate) can_use_short_key: AtomicU8,
    pub(crate) incoming_packet_count: AtomicU32,
    pub(crate) did_attempt_remember_addr: AtomicBool,
}

pub struct KeyPairParams {
    pub peer: PeerId,
    pub is_initiator: bool,
    pub local_id: u32,
    pub remote_id: u32,
    pub created: Tai64N,
    pub suite: CipherSuite,
    pub send_key: Key,
    pub recv_key: Key,
    pub features: [bool; FEATURES_COUNT],
    pub compression: Option<PacketCompressionV1>,
}

impl KeyPair {
    pub(crate) fn new(mut params: KeyPairParams) -> Self {
        // GCM tags cannot be recovered from ciphertext on receive, so the
        // short-MAC feature only takes effect on the ChaCha-keyed suites.
        let mut features = params.features;
        if matches!(params.suite, CipherSuite::Aes128Gcm | CipherSuite::Aes256Gcm) {
            features[FEATURE_SHORT_MAC] = false;
        }

        let short_mac = features[FEATURE_SHORT_MAC].then(|| ShortMacState {
            send_key: params.send_key,
            recv_key: params.recv_key,
            keys: derive_tag_compress_keys(&params.send_key, &params.recv_key),
        });

        let kp = Self {
            peer: params.peer,
            is_initiator: params.is_initiator,
            local_id: params.local_id,
            remote_id: params.remote_id,
            created: params.created,
            suite: params.suite,
            send: TransportCipher::new(params.suite, &params.send_key),
            recv: TransportCipher::new(params.suite, &params.recv_key),
            short_mac,
            features,
            compression: params.compression,
            send_ctr: AtomicU64::new(0),
            send_ctr_acked: AtomicU64::new(0),
            send_key_state: AtomicU8::new(KEY_VALID),
            recv_key_state: AtomicU8::new(KEY_VALID),
            replay: ReplayFilter::default(),
            addr_entry: Mutex::new(None),
            broadcast_short_key: AtomicU8::new(0),
            can_use_short_key: AtomicU8::new(0),
            incoming_packet_count: AtomicU32::new(0),
            did_attempt_remember_addr: AtomicBool::new(false),
        };
        params.send_key.zeroize();
        params.recv_key.zeroize();
        kp
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    pub fn created(&self) -> Tai64N {
        self.created
    }

    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    pub fn feature(&self, feature: usize) -> bool {
        self.features[feature]
    }

    pub fn compression(&self) -> Option<&PacketCompressionV1> {
        self.compression.as_ref()
    }

    pub fn packets_received(&self) -> u32 {
        self.incoming_packet_count.load(Ordering::Relaxed)
    }

    pub fn auth_tag_len(&self) -> usize {
        if self.short_mac.is_some() {
            8
        } else {
            16
        }
    }

    /// Whether outgoing packets may omit the key-id: the feature must be
    /// negotiated and the peer must have told us our slot in its addr table.
    pub fn skip_keyid_out(&self) -> Option<u8> {
        if !self.features[FEATURE_SKIP_KEYID_OUT] {
            return None;
        }
        match self.can_use_short_key.load(Ordering::Relaxed) {
            0 => None,
            slot => Some(slot - 1),
        }
    }

    pub fn send_valid(&self) -> bool {
        self.send_key_state.load(Ordering::Relaxed) != KEY_INVALID
    }

    pub fn recv_valid(&self) -> bool {
        self.recv_key_state.load(Ordering::Relaxed) != KEY_INVALID
    }

    pub fn invalidate(&self) {
        self.send_key_state.store(KEY_INVALID, Ordering::Relaxed);
        self.recv_key_state.store(KEY_INVALID, Ordering::Relaxed);
    }

    /// Notes that a rekey has been kicked off on this keypair. The key
    /// stays usable until the replacement lands or the reject limits hit.
    pub(crate) fn mark_want_refresh(&self) {
        let _ = self.send_key_state.compare_exchange(
            KEY_VALID,
            KEY_WANT_REFRESH,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    /// Notes that the replacement session is in place.
    pub(crate) fn mark_did_refresh(&self) {
        let _ = self.send_key_state.compare_exchange(
            KEY_WANT_REFRESH,
            KEY_DID_REFRESH,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    pub fn expired(&self, now: Tai64N) -> bool {
        self.created + REJECT_AFTER_TIME <= now
            || self.send_ctr.load(Ordering::Relaxed) >= REJECT_AFTER_MESSAGES
    }

    pub fn wants_rekey(&self, now: Tai64N) -> bool {
        self.created + REKEY_AFTER_TIME <= now
            || self.send_ctr.load(Ordering::Relaxed) >= crate::timers::REKEY_AFTER_MESSAGES
    }

    pub fn send_counter(&self) -> u64 {
        self.send_ctr.load(Ordering::Relaxed)
    }

    pub fn acked_counter(&self) -> u64 {
        self.send_ctr_acked.load(Ordering::Relaxed)
    }

    pub(crate) fn record_ack(&self, acked: u64) {
        // only ever raise; acks may arrive out of order
        self.send_ctr_acked.fetch_max(acked, Ordering::Relaxed);
    }

    /// Claims the next outgoing counter. Strictly increasing across all
    /// workers; the keypair dies at the message limit.
    pub(crate) fn next_send_counter(&self) -> Result<u64, Error> {
        let n = self.send_ctr.fetch_add(1, Ordering::Relaxed);
        if n >= REJECT_AFTER_MESSAGES {
            self.send_key_state.store(KEY_INVALID, Ordering::Relaxed);
            return Err(Error::Rejected);
        }
        Ok(n)
    }

    /// Encrypts in place and returns the wire tag (16 bytes, or 8 when the
    /// short-MAC feature is active).
    pub(crate) fn seal(&self, ctr: u64, aad: &[u8], payload: &mut [u8]) -> ([u8; 16], usize) {
        let tag = self.send.seal(ctr, aad, payload);
        match &self.short_mac {
            Some(state) => {
                let mut wire = [0u8; 16];
                wire[..8].copy_from_slice(&compress_tag(state.keys[0], &tag));
                (wire, 8)
            }
            None => (tag.0, 16),
        }
    }

    /// Replay-checks, verifies and decrypts an incoming payload in place.
    pub(crate) fn open(
        &self,
        wire_ctr: u64,
        aad: &[u8],
        payload: &mut [u8],
        tag: &[u8],
    ) -> Result<(), Error> {
        if wire_ctr >= REJECT_AFTER_MESSAGES {
            return Err(Error::Rejected);
        }

        let full_tag = match &self.short_mac {
            Some(state) => {
                if tag.len() != 8 {
                    return Err(Error::InvalidMessage);
                }
                let full = tag_over_ciphertext(self.suite, &state.recv_key, wire_ctr, aad, payload)
                    .ok_or(Error::Rejected)?;
                let expect = compress_tag(state.keys[1], &full);
                // single u64 compare, no early-out on a prefix match
                let wire = u64::from_le_bytes(tag.try_into().unwrap());
                if u64::from_le_bytes(expect) != wire {
                    return Err(Error::DecryptionError);
                }
                full
            }
            None => {
                if tag.len() != 16 {
                    return Err(Error::InvalidMessage);
                }
                Tag(tag.try_into().unwrap())
            }
        };

        self.recv
            .open(wire_ctr, aad, payload, &full_tag)
            .map_err(|_| Error::DecryptionError)?;

        // counters are offset by one inside the window so the wire's
        // counter zero is representable
        if !self.replay.check(wire_ctr + 1) {
            return Err(Error::Replay);
        }

        self.incoming_packet_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// The wire counter the replay window expects next, for widening
    /// truncated short-header counters.
    pub(crate) fn expected_wire_counter(&self) -> u64 {
        self.replay.expected_seq_nr().saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use veilguard_types::FEATURE_SHORT_HEADER;

    use super::*;

    fn pair(suite: CipherSuite, features: [bool; FEATURES_COUNT]) -> (KeyPair, KeyPair) {
        let a = KeyPair::new(KeyPairParams {
            peer: PeerId(0),
            is_initiator: true,
            local_id: 1,
            remote_id: 2,
            created: Tai64N::UNIX_EPOCH,
            suite,
            send_key: [1; 32],
            recv_key: [2; 32],
            features,
            compression: None,
        });
        let b = KeyPair::new(KeyPairParams {
            peer: PeerId(0),
            is_initiator: false,
            local_id: 2,
            remote_id: 1,
            created: Tai64N::UNIX_EPOCH,
            suite,
            send_key: [2; 32],
            recv_key: [1; 32],
            features,
            compression: None,
        });
        (a, b)
    }

    #[test]
    fn transport_roundtrip_all_suites() {
        for suite in [
            CipherSuite::ChaCha20Poly1305,
            CipherSuite::Aes128Gcm,
            CipherSuite::Aes256Gcm,
            CipherSuite::NonePoly1305,
        ] {
            let (a, b) = pair(suite, [false; FEATURES_COUNT]);
            let ctr = a.next_send_counter().unwrap();
            assert_eq!(ctr, 0);

            let mut payload = *b"ping ping ping!!";
            let (tag, tag_len) = a.seal(ctr, &[], &mut payload);
            assert_eq!(tag_len, 16);
            b.open(ctr, &[], &mut payload, &tag[..tag_len]).unwrap();
            assert_eq!(&payload, b"ping ping ping!!");

            // replaying the same counter fails
            let mut second = *b"ping ping ping!!";
            let (tag, tag_len) = a.seal(ctr, &[], &mut second);
            assert_eq!(
                b.open(ctr, &[], &mut second, &tag[..tag_len]).unwrap_err(),
                Error::Replay
            );
        }
    }

    #[test]
    fn short_mac_roundtrip_and_forgery() {
        let mut features = [false; FEATURES_COUNT];
        features[FEATURE_SHORT_MAC] = true;
        let (a, b) = pair(CipherSuite::ChaCha20Poly1305, features);
        assert_eq!(a.auth_tag_len(), 8);

        let mut payload = *b"short tag please";
        let (tag, tag_len) = a.seal(5, b"hdr", &mut payload);
        assert_eq!(tag_len, 8);
        b.open(5, b"hdr", &mut payload, &tag[..8]).unwrap();
        assert_eq!(&payload, b"short tag please");

        let mut tampered = payload;
        let mut bad = [0u8; 8];
        bad.copy_from_slice(&tag[..8]);
        bad[0] ^= 1;
        assert!(b.open(6, b"hdr", &mut tampered, &bad).is_err());
    }

    #[test]
    fn short_mac_disabled_for_gcm() {
        let mut features = [false; FEATURES_COUNT];
        features[FEATURE_SHORT_MAC] = true;
        features[FEATURE_SHORT_HEADER] = true;
        let (a, _) = pair(CipherSuite::Aes256Gcm, features);
        assert_eq!(a.auth_tag_len(), 16);
        assert!(a.feature(FEATURE_SHORT_HEADER));
    }

    #[test]
    fn counter_exhaustion() {
        let (a, _) = pair(CipherSuite::ChaCha20Poly1305, [false; FEATURES_COUNT]);
        a.send_ctr.store(REJECT_AFTER_MESSAGES - 1, Ordering::Relaxed);

        // the boundary counter is the last usable one
        assert_eq!(a.next_send_counter().unwrap(), REJECT_AFTER_MESSAGES - 1);
        assert_eq!(a.next_send_counter().unwrap_err(), Error::Rejected);
        assert!(!a.send_valid());
    }

    #[test]
    fn acks_only_raise() {
        let (a, _) = pair(CipherSuite::ChaCha20Poly1305, [false; FEATURES_COUNT]);
        a.record_ack(10);
        a.record_ack(5);
        assert_eq!(a.acked_counter(), 10);
    }
}

//! Device, peer and session state machines for a WireGuard-compatible
//! endpoint with the veilguard protocol extensions.
//!
//! The crate is sans-IO: datagrams come in as byte slices with their source
//! address, and everything to transmit comes back out as `(SocketAddr,
//! bytes)`. Sockets, TUN devices and the 1 Hz tick loop live with the
//! caller.
//!
//! Concurrency model: any number of worker threads may call the packet
//! paths ([`Device::recv_datagram`], [`Device::send_packet`]) while one
//! main thread performs structural mutations (peer add/remove, allowed-IP
//! changes, [`Device::tick`]) holding a [`MainThread`] token. Device-level
//! tables sit behind RW locks that are always acquired before any per-peer
//! mutex.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, Ordering};

mod addr_entry;
mod device;
mod ext;
mod framing;
mod ip_lookup;
mod keypair;
mod obfuscate;
mod peer;
mod timers;

pub use device::{Device, RecvEvent, SendOutcome, UnknownPeerHandler};
pub use ip_lookup::CidrAddr;
pub use keypair::KeyPair;
pub use peer::PeerStatus;
pub use timers::{
    Timer, TimerActions, KEEPALIVE_TIMEOUT, MAX_HANDSHAKE_ATTEMPTS, MAX_QUEUED_PACKETS_PER_PEER,
    MIN_HANDSHAKE_INTERVAL, REJECT_AFTER_MESSAGES, REJECT_AFTER_TIME, REKEY_AFTER_MESSAGES,
    REKEY_AFTER_TIME, REKEY_TIMEOUT,
};

pub use veilguard_crypto::{CipherSuite, Key};
pub use veilguard_types::{
    FEATURE_ENFORCES, FEATURE_IPZIP, FEATURE_OFF, FEATURE_SHORT_HEADER, FEATURE_SHORT_MAC,
    FEATURE_SKIP_KEYID_IN, FEATURE_SKIP_KEYID_OUT, FEATURE_SUPPORTS, FEATURE_WANTS,
};
pub use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub(crate) u32);

impl core::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PeerId({:08X})", &self.0)
    }
}

/// Packet-level failure. Nothing here aborts anything larger than the
/// packet (or, for [`Error::Rejected`] on a session, the session); every
/// variant pairs with a counter on [`DeviceCounters`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Malformed framing, wrong type or wrong size.
    InvalidMessage,
    /// A MAC or AEAD tag did not verify.
    DecryptionError,
    /// Structurally fine but not acceptable: unknown session, stale
    /// timestamp, policy failure.
    Rejected,
    /// The counter was already seen or fell out of the window.
    Replay,
    /// The handshake rate limiter refused the packet.
    RateLimited,
}

/// Capability token for operations reserved to the main thread.
///
/// Claim it once on the thread that drives the device and keep it there:
/// the token is deliberately not `Send`, so handing it to a worker is a
/// compile error rather than a data-ordering bug.
pub struct MainThread {
    _not_send: PhantomData<*const ()>,
}

impl MainThread {
    pub fn claim() -> Self {
        Self {
            _not_send: PhantomData,
        }
    }
}

/// Drop and traffic counters. Errors never propagate past a packet, so
/// these are the observable record of what the device declined.
#[derive(Default)]
pub struct DeviceCounters {
    pub dropped_invalid: AtomicU64,
    pub dropped_mac: AtomicU64,
    pub dropped_decrypt: AtomicU64,
    pub dropped_replay: AtomicU64,
    pub dropped_no_session: AtomicU64,
    pub dropped_spoofed: AtomicU64,
    pub rate_limited: AtomicU64,
    pub cookies_sent: AtomicU64,
    pub handshakes_initiated: AtomicU64,
    pub handshakes_completed: AtomicU64,
    pub data_rx: AtomicU64,
    pub data_tx: AtomicU64,
    pub queued: AtomicU64,
}

impl DeviceCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_error(&self, err: Error) {
        let counter = match err {
            Error::InvalidMessage => &self.dropped_invalid,
            Error::DecryptionError => &self.dropped_decrypt,
            Error::Rejected => &self.dropped_no_session,
            Error::Replay => &self.dropped_replay,
            Error::RateLimited => &self.rate_limited,
        };
        Self::bump(counter);
    }
}

//! Per-peer timer bookkeeping, evaluated on the once-per-second tick.

use core::time::Duration;

use tai64::Tai64N;

pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);
pub const DEFAULT_PERSISTENT_KEEPALIVE: Duration = Duration::from_secs(25);
pub const MIN_HANDSHAKE_INTERVAL: Duration = Duration::from_millis(20);
pub const COOKIE_SECRET_MAX_AGE: Duration = Duration::from_secs(120);

/// After sending this many messages on a keypair, a rekey should take place.
pub const REKEY_AFTER_MESSAGES: u64 = u64::MAX - 0xffff;
/// After this many messages a keypair must no longer be used.
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - 2048;

pub const MAX_HANDSHAKE_ATTEMPTS: u8 = 20;
pub const MAX_QUEUED_PACKETS_PER_PEER: usize = 128;

/// The five per-peer timers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Timer {
    /// Re-send the handshake initiation while no response arrived.
    RetransmitHandshake = 0,
    /// Answer received data when we have nothing else to say.
    Keepalive = 1,
    /// Keep NAT mappings warm regardless of traffic.
    PersistentKeepalive = 2,
    /// Start rekeying a session that is still sending past its prime.
    NewHandshake = 3,
    /// Tear down a session past REJECT_AFTER_TIME.
    Reject = 4,
}

const TIMER_COUNT: usize = 5;

/// Deadline per timer, `None` when unarmed.
#[derive(Default)]
pub struct TimerSet {
    deadlines: [Option<Tai64N>; TIMER_COUNT],
}

impl TimerSet {
    pub fn arm(&mut self, timer: Timer, deadline: Tai64N) {
        self.deadlines[timer as usize] = Some(deadline);
    }

    /// Arms only if it would fire earlier than the current deadline.
    pub fn arm_earlier(&mut self, timer: Timer, deadline: Tai64N) {
        let slot = &mut self.deadlines[timer as usize];
        match slot {
            Some(cur) if *cur <= deadline => {}
            _ => *slot = Some(deadline),
        }
    }

    pub fn disarm(&mut self, timer: Timer) {
        self.deadlines[timer as usize] = None;
    }

    pub fn deadline(&self, timer: Timer) -> Option<Tai64N> {
        self.deadlines[timer as usize]
    }

    /// Returns whether the timer is due, disarming it if so.
    pub fn fire(&mut self, timer: Timer, now: Tai64N) -> bool {
        match self.deadlines[timer as usize] {
            Some(deadline) if deadline <= now => {
                self.deadlines[timer as usize] = None;
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.deadlines = [None; TIMER_COUNT];
    }
}

/// What the tick decided a peer has to transmit.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct TimerActions(pub u32);

impl TimerActions {
    pub const SEND_KEEPALIVE: u32 = 1;
    pub const SEND_HANDSHAKE: u32 = 2;

    pub fn insert(&mut self, action: u32) {
        self.0 |= action;
    }

    pub fn contains(self, action: u32) -> bool {
        self.0 & action != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

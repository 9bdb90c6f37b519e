//! Handshake-flood accounting.
//!
//! Two byte bins are indexed by independent SipHash keys; an address is
//! rate-limited once the smaller of its two entries reaches
//! [`PACKET_ACCUM`]. Checking and counting are split so a packet is only
//! counted after it has passed the cheap validation that follows the check.

use core::hash::Hasher;

use rand_core::{CryptoRng, RngCore};
use siphasher::sip::SipHasher13;

pub const BIN_COUNT: usize = 4096;
/// Global handshake budget multiplier, halved under sustained floods.
pub const PACKETS_PER_SEC: u32 = 25;
/// Per-address accumulator threshold.
pub const PACKET_ACCUM: u8 = 100;
/// Commits past this count within one second shrink the global budget.
pub const TOTAL_PACKETS_PER_SEC: u32 = 25_000;

/// How many periodic ticks a bin key lives before it is rotated out.
const KEY_ROTATION_TICKS: u32 = 8;

/// Outcome of [`HandshakeRateLimiter::check`]. Carries the losing bin slot
/// and its proposed value so the caller can count the packet after cheap
/// validation succeeds.
#[derive(Clone, Copy)]
pub struct RateLimitResult {
    bin: u8,
    index: u16,
    new_value: u8,
    ok: bool,
}

impl RateLimitResult {
    pub fn is_rate_limited(&self) -> bool {
        !self.ok
    }

    /// Whether this is the first packet from the address since the bin was
    /// last rotated. Used to prioritize likely-new peers under load.
    pub fn is_first_ip(&self) -> bool {
        self.new_value == 1
    }
}

pub struct HandshakeRateLimiter {
    bins: [[u8; BIN_COUNT]; 2],
    keys: [(u64, u64); 2],
    packets_per_sec: u32,
    used_rate_limit: u32,
    ticks: u32,
}

impl HandshakeRateLimiter {
    pub fn new(rng: &mut (impl RngCore + CryptoRng)) -> Self {
        Self {
            bins: [[0; BIN_COUNT]; 2],
            keys: [
                (rng.next_u64(), rng.next_u64()),
                (rng.next_u64(), rng.next_u64()),
            ],
            packets_per_sec: PACKETS_PER_SEC,
            used_rate_limit: 0,
            ticks: 0,
        }
    }

    fn bin_index(&self, bin: usize, ip_key: u64) -> usize {
        let (k0, k1) = self.keys[bin];
        let mut h = SipHasher13::new_with_keys(k0, k1);
        h.write_u64(ip_key);
        h.finish() as usize % BIN_COUNT
    }

    /// Looks up both bins for the address. Nothing is counted until the
    /// caller decides to [`commit`](Self::commit).
    pub fn check(&self, ip_key: u64) -> RateLimitResult {
        let i1 = self.bin_index(0, ip_key);
        let i2 = self.bin_index(1, ip_key);
        let v1 = self.bins[0][i1];
        let v2 = self.bins[1][i2];

        // conservative update: only the smaller entry advances
        let (bin, index, value) = if v1 <= v2 {
            (0u8, i1 as u16, v1)
        } else {
            (1u8, i2 as u16, v2)
        };

        if value >= PACKET_ACCUM {
            return RateLimitResult {
                bin,
                index,
                new_value: value,
                ok: false,
            };
        }
        RateLimitResult {
            bin,
            index,
            new_value: value + 1,
            ok: true,
        }
    }

    /// Counts a packet that passed validation, shrinking the global budget
    /// when the second's total crosses [`TOTAL_PACKETS_PER_SEC`].
    pub fn commit(&mut self, result: &RateLimitResult) {
        self.bins[result.bin as usize][result.index as usize] = result.new_value;
        self.used_rate_limit += 1;
        if self.used_rate_limit == TOTAL_PACKETS_PER_SEC {
            self.packets_per_sec = (self.packets_per_sec + 1) >> 1;
        }
    }

    /// Whether the limiter saw handshake traffic this second, or is still
    /// recovering from a flood. Drives the responder's mac2 requirement.
    pub fn is_used(&self) -> bool {
        self.used_rate_limit != 0 || self.packets_per_sec != PACKETS_PER_SEC
    }

    /// Once-per-second maintenance: decay the bins, rotate the hash keys,
    /// and let the global budget recover while under it.
    pub fn periodic(&mut self, rng: &mut (impl RngCore + CryptoRng)) {
        let flooded = self.used_rate_limit >= TOTAL_PACKETS_PER_SEC;
        self.used_rate_limit = 0;
        if !flooded && self.packets_per_sec < PACKETS_PER_SEC {
            self.packets_per_sec = (self.packets_per_sec * 2).min(PACKETS_PER_SEC);
        }

        for bin in self.bins.iter_mut() {
            for v in bin.iter_mut() {
                *v >>= 1;
            }
        }

        self.ticks += 1;
        if self.ticks % KEY_ROTATION_TICKS == 0 {
            let rotate = ((self.ticks / KEY_ROTATION_TICKS) % 2) as usize;
            self.keys[rotate] = (rng.next_u64(), rng.next_u64());
            self.bins[rotate] = [0; BIN_COUNT];
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn accumulates_per_address() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut rl = HandshakeRateLimiter::new(&mut rng);

        assert!(!rl.is_used());

        let r = rl.check(0x0a00_0001_d2c4);
        assert!(!r.is_rate_limited());
        assert!(r.is_first_ip());
        rl.commit(&r);
        assert!(rl.is_used());

        for _ in 0..PACKET_ACCUM {
            let r = rl.check(0x0a00_0001_d2c4);
            if r.is_rate_limited() {
                return;
            }
            assert!(!r.is_first_ip());
            rl.commit(&r);
        }
        panic!("address was never rate limited");
    }

    #[test]
    fn uncounted_checks_are_free() {
        let mut rng = StdRng::seed_from_u64(8);
        let mut rl = HandshakeRateLimiter::new(&mut rng);

        for _ in 0..10_000 {
            let r = rl.check(42);
            assert!(!r.is_rate_limited());
        }
        let r = rl.check(42);
        rl.commit(&r);
        assert!(rl.is_used());
    }

    #[test]
    fn budget_halves_under_flood() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut rl = HandshakeRateLimiter::new(&mut rng);

        for ip in 0..TOTAL_PACKETS_PER_SEC as u64 {
            let r = rl.check(ip);
            rl.commit(&r);
        }
        assert_eq!(rl.packets_per_sec, (PACKETS_PER_SEC + 1) >> 1);
        assert!(rl.is_used());

        // quiet seconds recover the budget
        rl.periodic(&mut rng);
        rl.periodic(&mut rng);
        assert_eq!(rl.packets_per_sec, PACKETS_PER_SEC);
    }

    #[test]
    fn periodic_decays_bins() {
        let mut rng = StdRng::seed_from_u64(10);
        let mut rl = HandshakeRateLimiter::new(&mut rng);

        for _ in 0..6 {
            let r = rl.check(1234);
            rl.commit(&r);
        }
        rl.periodic(&mut rng);
        rl.periodic(&mut rng);
        rl.periodic(&mut rng);
        let r = rl.check(1234);
        assert!(r.is_first_ip() || r.new_value <= 2);
    }
}

//! Implementation of <https://tools.ietf.org/html/rfc6479>, shared across
//! receive workers.
//!
//! The bitmap words are updated with `fetch_or` and the window head advances
//! through a CAS loop, so concurrent receivers never move the window
//! backwards and each counter value is accepted at most once.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const BITS_PER_WORD: u64 = 32;
const WORD_SHIFT: u32 = BITS_PER_WORD.ilog2();

const BITMAP_BITLEN: u64 = 2048;
const BITMAP_WORDS: usize = (BITMAP_BITLEN / BITS_PER_WORD) as usize;
const BITMAP_INDEX_MASK: usize = BITMAP_WORDS - 1;
const BITMAP_LOC_MASK: u64 = BITS_PER_WORD - 1;

/// Counters this far behind the window head are rejected outright.
pub const WINDOW_SIZE: u64 = BITMAP_BITLEN - BITS_PER_WORD;

pub struct ReplayFilter {
    /// Highest accepted counter plus one.
    expected: AtomicU64,
    bitmap: [AtomicU32; BITMAP_WORDS],
}

impl Default for ReplayFilter {
    fn default() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU32 = AtomicU32::new(0);
        Self {
            expected: AtomicU64::new(0),
            bitmap: [ZERO; BITMAP_WORDS],
        }
    }
}

impl ReplayFilter {
    /// The next counter value the window expects to see.
    pub fn expected_seq_nr(&self) -> u64 {
        self.expected.load(Ordering::Acquire)
    }

    /// Records `seq` and reports whether it was fresh. A result of `false`
    /// means the counter is zero, stale, or already seen.
    pub fn check(&self, seq: u64) -> bool {
        if seq == 0 {
            return false;
        }

        let index = (seq >> WORD_SHIFT) as usize;
        let bit = 1u32 << (seq & BITMAP_LOC_MASK);

        let mut expected = self.expected.load(Ordering::Acquire);
        while seq >= expected {
            match self.expected.compare_exchange_weak(
                expected,
                seq + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // We own the advance from `expected` to `seq + 1`:
                    // clear every word the window skipped over.
                    let prev_index = (expected.saturating_sub(1) >> WORD_SHIFT) as usize;
                    if index > prev_index && index - prev_index >= BITMAP_WORDS {
                        for w in &self.bitmap {
                            w.store(0, Ordering::Relaxed);
                        }
                    } else {
                        for i in (prev_index + 1)..=index {
                            self.bitmap[i & BITMAP_INDEX_MASK].store(0, Ordering::Relaxed);
                        }
                    }
                    self.bitmap[index & BITMAP_INDEX_MASK].fetch_or(bit, Ordering::AcqRel);
                    return true;
                }
                Err(now) => expected = now,
            }
        }

        if expected - seq >= WINDOW_SIZE {
            return false;
        }

        let prev = self.bitmap[index & BITMAP_INDEX_MASK].fetch_or(bit, Ordering::AcqRel);
        prev & bit == 0
    }
}

#[cfg(test)]
mod tests {
    use super::{ReplayFilter, WINDOW_SIZE};

    #[test]
    fn check() {
        let replay = ReplayFilter::default();
        assert!(!replay.check(0));
        for i in 1..1024 {
            assert!(replay.check(i * 2 + 1));
            assert!(!replay.check(i * 2 + 1));
            assert!(replay.check(i * 2));
            assert!(!replay.check(i * 2));
        }
        for i in 0..2048 {
            assert!(!replay.check(i));
        }
        assert!(replay.check(4096 + 2048));
        assert!(!replay.check(4097));

        assert!(replay.check(65535));
        assert!(!replay.check(10000));

        assert!(replay.check(66000));
    }

    #[test]
    fn window_lower_edge() {
        let replay = ReplayFilter::default();
        assert!(replay.check(100_000));
        let expected = replay.expected_seq_nr();
        assert_eq!(expected, 100_001);

        // oldest acceptable counter sits just inside the window
        let edge = expected - (WINDOW_SIZE - 1);
        assert!(replay.check(edge));
        assert!(!replay.check(edge));

        // one further back is stale
        assert!(!replay.check(edge - 1));
    }

    #[test]
    fn never_regresses() {
        let replay = ReplayFilter::default();
        assert!(replay.check(500));
        assert!(replay.check(10));
        assert_eq!(replay.expected_seq_nr(), 501);
    }

    #[test]
    fn giant_skip_resets_bitmap() {
        let replay = ReplayFilter::default();
        for i in 1..64 {
            assert!(replay.check(i));
        }
        assert!(replay.check(1 << 40));
        // everything before the skip is now stale
        assert!(!replay.check(63));
    }
}

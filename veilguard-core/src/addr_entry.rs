//! Reverse index from a recently seen (ip, port) to candidate sessions.
//!
//! Incoming short-header packets that omit the key-id name one of three
//! slots here instead. Insertions are throttled to one per minute per
//! address so each slot lives at least three minutes.

use core::net::SocketAddr;
use core::time::Duration;
use std::sync::Arc;

use tai64::Tai64N;

use crate::keypair::KeyPair;

/// Minimum spacing between insertions into one entry.
pub const ADDR_INSERT_INTERVAL: Duration = Duration::from_secs(60);

pub const ADDR_SLOTS: usize = 3;

/// Packs an IPv4 endpoint into the table key. IPv6 endpoints are not
/// indexed; sessions behind them always carry explicit key-ids.
pub fn pack_addr(addr: SocketAddr) -> Option<u64> {
    match addr {
        SocketAddr::V4(v4) => {
            Some(u64::from(v4.ip().to_bits()) << 16 | u64::from(v4.port()))
        }
        SocketAddr::V6(_) => None,
    }
}

pub struct AddrEntry {
    /// The packed address, kept so a keypair can erase its own slot.
    pub addr_id: u64,
    /// Slot the next insertion will overwrite, round-robin.
    next_slot: u8,
    /// Occupied slot count; the entry leaves the table when it hits zero.
    ref_count: u8,
    time_of_last_insertion: Tai64N,
    slots: [Option<Arc<KeyPair>>; ADDR_SLOTS],
}

impl AddrEntry {
    pub fn new(addr_id: u64) -> Self {
        Self {
            addr_id,
            next_slot: 0,
            ref_count: 0,
            time_of_last_insertion: Tai64N::UNIX_EPOCH,
            slots: [None, None, None],
        }
    }

    pub fn get(&self, slot: u8) -> Option<&Arc<KeyPair>> {
        self.slots.get(slot as usize)?.as_ref()
    }

    pub fn ref_count(&self) -> u8 {
        self.ref_count
    }

    pub fn may_insert(&self, now: Tai64N) -> bool {
        self.ref_count == 0 || self.time_of_last_insertion + ADDR_INSERT_INTERVAL <= now
    }

    /// Installs the keypair into the next slot and returns that slot,
    /// along with whatever it displaced.
    pub fn insert(&mut self, keypair: Arc<KeyPair>, now: Tai64N) -> (u8, Option<Arc<KeyPair>>) {
        let slot = self.next_slot;
        let evicted = self.slots[slot as usize].replace(keypair);
        if evicted.is_none() {
            self.ref_count += 1;
        }
        self.next_slot = (slot + 1) % ADDR_SLOTS as u8;
        self.time_of_last_insertion = now;
        (slot, evicted)
    }

    /// Clears `slot` if it still holds `keypair`. Returns the remaining
    /// occupancy.
    pub fn clear(&mut self, slot: u8, keypair: &Arc<KeyPair>) -> u8 {
        if let Some(held) = &self.slots[slot as usize] {
            if Arc::ptr_eq(held, keypair) {
                self.slots[slot as usize] = None;
                self.ref_count -= 1;
            }
        }
        self.ref_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_v4_only() {
        let v4: SocketAddr = "1.2.3.4:51820".parse().unwrap();
        let packed = pack_addr(v4).unwrap();
        assert_eq!(packed >> 16, u64::from(u32::from_be_bytes([1, 2, 3, 4])));
        assert_eq!(packed & 0xffff, 51820);

        let v6: SocketAddr = "[::1]:51820".parse().unwrap();
        assert!(pack_addr(v6).is_none());
    }

    #[test]
    fn insertion_throttle() {
        let t0 = Tai64N::UNIX_EPOCH + Duration::from_secs(1000);
        let mut entry = AddrEntry::new(1);
        assert!(entry.may_insert(t0));

        // occupancy is checked in the real table; fabricate via timestamps
        entry.time_of_last_insertion = t0;
        entry.ref_count = 1;
        assert!(!entry.may_insert(t0 + Duration::from_secs(59)));
        assert!(entry.may_insert(t0 + Duration::from_secs(61)));
    }
}

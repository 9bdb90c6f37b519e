//! Header obfuscation.
//!
//! When enabled, the first 16 bytes of every datagram are XORed with a mask
//! derived from the packet length and a salt drawn from beyond the masked
//! region, so on-path classifiers cannot key on the fixed WireGuard message
//! prelude. The transform is its own inverse and invisible to every
//! upper-layer check.

use core::hash::Hasher;

use siphasher::sip::SipHasher;
use veilguard_crypto::mac;

pub struct Obfuscator {
    keys: [u64; 4],
}

impl Obfuscator {
    /// Derives the four SipHash keys from an operator passphrase.
    pub fn new(passphrase: &str) -> Self {
        let a = mac(b"header-obfuscation-a", passphrase.as_bytes());
        let b = mac(b"header-obfuscation-b", passphrase.as_bytes());
        Self {
            keys: [
                u64::from_le_bytes(a[..8].try_into().unwrap()),
                u64::from_le_bytes(a[8..].try_into().unwrap()),
                u64::from_le_bytes(b[..8].try_into().unwrap()),
                u64::from_le_bytes(b[8..].try_into().unwrap()),
            ],
        }
    }

    fn mask(&self, len: usize, salt: &[u8; 8]) -> [u8; 16] {
        let mut mask = [0u8; 16];
        for (chunk, keys) in mask.chunks_exact_mut(8).zip([&self.keys[..2], &self.keys[2..]]) {
            let mut h = SipHasher::new_with_keys(keys[0], keys[1]);
            h.write_u64(len as u64);
            h.write(salt);
            chunk.copy_from_slice(&h.finish().to_le_bytes());
        }
        mask
    }

    /// Masks or unmasks a datagram in place.
    pub fn apply(&self, packet: &mut [u8]) {
        // the salt must come from outside the masked region
        let mut salt = [0u8; 8];
        if let Some(tail) = packet.get(16..24) {
            salt[..tail.len()].copy_from_slice(tail);
        } else if let Some(tail) = packet.get(16..) {
            salt[..tail.len()].copy_from_slice(tail);
        }

        let mask = self.mask(packet.len(), &salt);
        for (b, m) in packet.iter_mut().zip(mask) {
            *b ^= m;
        }
    }
}

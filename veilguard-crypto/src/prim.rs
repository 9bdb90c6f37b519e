use blake2::digest::consts::U16;
use blake2::digest::Digest;
use x25519_dalek::{PublicKey, ReusableSecret, SharedSecret, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub type Key = [u8; 32];
pub type Mac = [u8; 16];

/// Construction: The UTF-8 string literal “Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s”, 37 bytes of output.
/// Identifier: The UTF-8 string literal “WireGuard v1 zx2c4 Jason@zx2c4.com”, 34 bytes of output.
/// Ci := Hash(Construction)
/// Hi := Hash(Ci || Identifier)
pub(crate) const CONSTRUCTION_HASH: [u8; 32] = [
    96, 226, 109, 174, 243, 39, 239, 192, 46, 195, 53, 226, 160, 37, 210, 208, 22, 235, 66, 6, 248,
    114, 119, 245, 45, 56, 209, 152, 139, 120, 205, 54,
];
pub(crate) const IDENTIFIER_HASH: [u8; 32] = [
    34, 17, 179, 97, 8, 26, 197, 102, 105, 18, 67, 219, 69, 138, 213, 50, 45, 156, 108, 102, 34,
    147, 232, 183, 14, 225, 156, 101, 186, 7, 158, 243,
];
pub(crate) const LABEL_MAC1: [u8; 8] = *b"mac1----";
pub(crate) const LABEL_COOKIE: [u8; 8] = *b"cookie--";

pub(crate) fn nonce(counter: u64) -> [u8; 12] {
    let mut n = [0; 12];
    n[4..].copy_from_slice(&u64::to_le_bytes(counter));
    n
}

pub(crate) fn hash(msg: [&[u8]; 2]) -> [u8; 32] {
    let mut h = blake2::Blake2s256::default();
    for msg in msg {
        h.update(msg);
    }
    h.finalize().into()
}

pub fn mac(key: &[u8], msg: &[u8]) -> Mac {
    use blake2::digest::Mac;
    let mut mac = blake2::Blake2sMac::<U16>::new_from_slice(key).unwrap();
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// The HKDF construction from the WireGuard paper, over HMAC-BLAKE2s.
pub(crate) fn hkdf<const N: usize>(key: &Key, msg: &[u8]) -> [Key; N] {
    use hmac::Mac;
    type Hmac = hmac::SimpleHmac<blake2::Blake2s256>;

    const { assert!(N >= 1 && N <= 255) };

    let prk = Hmac::new_from_slice(key)
        .unwrap()
        .chain_update(msg)
        .finalize()
        .into_bytes();
    let mut hmac = Hmac::new_from_slice(&prk).unwrap();

    let mut output = [Key::default(); N];

    hmac.update(&[1]);
    let mut ti = hmac.finalize_reset().into_bytes();
    output[0].copy_from_slice(&ti);

    for i in 1..N as u8 {
        hmac.update(&ti);
        hmac.update(&[i + 1]);
        ti = hmac.finalize_reset().into_bytes();
        output[i as usize].copy_from_slice(&ti);
    }

    output
}

// ---- Noise IKpsk2 ---- //
// WireGuard makes use of a slightly modified Noise IKpsk2 handshake.
// Read the noise specification: https://noiseprotocol.org/noise.html
//
// The IKpsk2 pattern is as follows:
// <- s
// -> e, es, s, ss
// <- e, ee, se, psk
//
// The initiator is expected to know the responder's static public key prior
// to the handshake. The initiator sends an ephemeral public key and their
// encrypted static public key. The responder sends an ephemeral public key.

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HandshakeState {
    hash: [u8; 32],
    chain: Key,
}

impl Default for HandshakeState {
    fn default() -> Self {
        Self {
            chain: CONSTRUCTION_HASH,
            hash: IDENTIFIER_HASH,
        }
    }
}

impl HandshakeState {
    pub(crate) fn hash(&self) -> &[u8; 32] {
        &self.hash
    }

    /// Like mix-key, but discards the unused key.
    pub fn mix_chain(&mut self, b: &[u8]) {
        let [c] = hkdf(&self.chain, b);
        self.chain = c;
    }

    pub fn mix_dh(&mut self, sk: &StaticSecret, pk: &PublicKey) {
        self.mix_chain(sk.diffie_hellman(pk).as_bytes());
    }

    pub fn mix_edh(&mut self, sk: &ReusableSecret, pk: &PublicKey) {
        self.mix_chain(sk.diffie_hellman(pk).as_bytes());
    }

    pub(crate) fn mix_key(&mut self, b: &[u8]) -> Key {
        let [c, k] = hkdf(&self.chain, b);
        self.chain = c;
        k
    }

    pub fn mix_key_shared(&mut self, shared: &SharedSecret) -> Key {
        self.mix_key(shared.as_bytes())
    }

    pub fn mix_key_dh(&mut self, sk: &StaticSecret, pk: &PublicKey) -> Key {
        self.mix_key(sk.diffie_hellman(pk).as_bytes())
    }

    pub fn mix_key_edh(&mut self, sk: &ReusableSecret, pk: &PublicKey) -> Key {
        self.mix_key(sk.diffie_hellman(pk).as_bytes())
    }

    pub fn mix_key_and_hash(&mut self, b: &[u8]) -> Key {
        let [c, t, k] = hkdf(&self.chain, b);
        self.chain = c;
        self.mix_hash(&t);
        k
    }

    pub fn mix_hash(&mut self, b: &[u8]) {
        self.hash = hash([&self.hash, b]);
    }

    /// Derives the transport keys and wipes the handshake state. The
    /// initiator sends with the first derived key, the responder with the
    /// second.
    pub fn split(&mut self, initiator: bool) -> (Key, Key) {
        let [k1, k2] = hkdf(&self.chain, &[]);
        self.zeroize();

        if initiator {
            (k1, k2)
        } else {
            (k2, k1)
        }
    }
}

#[cfg(test)]
mod tests {
    use blake2::digest::Digest;

    #[test]
    fn construction_identifier() {
        let c: [u8; 32] = blake2::Blake2s256::default()
            .chain_update(b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s")
            .finalize()
            .into();
        let h: [u8; 32] = blake2::Blake2s256::default()
            .chain_update(c)
            .chain_update(b"WireGuard v1 zx2c4 Jason@zx2c4.com")
            .finalize()
            .into();

        assert_eq!(c, super::CONSTRUCTION_HASH);
        assert_eq!(h, super::IDENTIFIER_HASH);
    }

    #[test]
    fn hkdf_chain() {
        let [a] = super::hkdf(&[7; 32], b"msg data here even more data");
        let [b, c] = super::hkdf(&[7; 32], b"msg data here even more data");
        let [d, e, f] = super::hkdf(&[7; 32], b"msg data here even more data");

        // extending the output count never changes earlier outputs
        assert_eq!(a, b);
        assert_eq!(b, d);
        assert_eq!(c, e);
        assert_ne!(e, f);
    }

    #[test]
    fn split_directions_mirror() {
        let mut hs1 = super::HandshakeState::default();
        let mut hs2 = super::HandshakeState::default();
        hs1.mix_chain(b"shared transcript");
        hs2.mix_chain(b"shared transcript");

        let (i_send, i_recv) = hs1.split(true);
        let (r_send, r_recv) = hs2.split(false);
        assert_eq!(i_send, r_recv);
        assert_eq!(i_recv, r_send);
        assert_ne!(i_send, i_recv);
    }
}

//! Transport ciphers negotiable through the handshake extension block.
//!
//! Suite 0 is stock WireGuard and always available. The AES-GCM suites take
//! over on hardware where that is cheaper, and suite 3 authenticates without
//! encrypting for links that are already confidential.

use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit};
use core::hash::Hasher;
use poly1305::universal_hash::UniversalHash;
use poly1305::Poly1305;
use siphasher::sip::SipHasher;
use subtle::ConstantTimeEq;
use veilguard_types::{
    Tag, CIPHER_AES128_GCM, CIPHER_AES256_GCM, CIPHER_CHACHA20_POLY1305, CIPHER_NONE_POLY1305,
};

use crate::prim::{mac, nonce, Key};
use crate::CryptoError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CipherSuite {
    /// Stock WireGuard transport cipher, the mandatory baseline.
    ChaCha20Poly1305,
    Aes128Gcm,
    Aes256Gcm,
    /// Poly1305 authentication over plaintext. No confidentiality.
    NonePoly1305,
}

impl CipherSuite {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            CIPHER_CHACHA20_POLY1305 => Some(Self::ChaCha20Poly1305),
            CIPHER_AES128_GCM => Some(Self::Aes128Gcm),
            CIPHER_AES256_GCM => Some(Self::Aes256Gcm),
            CIPHER_NONE_POLY1305 => Some(Self::NonePoly1305),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        match self {
            Self::ChaCha20Poly1305 => CIPHER_CHACHA20_POLY1305,
            Self::Aes128Gcm => CIPHER_AES128_GCM,
            Self::Aes256Gcm => CIPHER_AES256_GCM,
            Self::NonePoly1305 => CIPHER_NONE_POLY1305,
        }
    }
}

/// One direction of an established session.
pub enum TransportCipher {
    ChaCha(ChaCha20Poly1305),
    Aes128(Aes128Gcm),
    Aes256(Aes256Gcm),
    NonePoly { key: Key },
}

impl TransportCipher {
    pub fn new(suite: CipherSuite, key: &Key) -> Self {
        match suite {
            CipherSuite::ChaCha20Poly1305 => {
                Self::ChaCha(ChaCha20Poly1305::new(key.into()))
            }
            CipherSuite::Aes128Gcm => Self::Aes128(Aes128Gcm::new(key[..16].into())),
            CipherSuite::Aes256Gcm => Self::Aes256(Aes256Gcm::new(key.into())),
            CipherSuite::NonePoly1305 => Self::NonePoly { key: *key },
        }
    }

    /// Encrypts `payload` in place under `counter` and returns the full tag.
    pub fn seal(&self, counter: u64, aad: &[u8], payload: &mut [u8]) -> Tag {
        let n = nonce(counter);
        match self {
            Self::ChaCha(key) => {
                let tag = key
                    .encrypt_in_place_detached((&n).into(), aad, payload)
                    .unwrap();
                Tag(tag.into())
            }
            Self::Aes128(key) => {
                let tag = key
                    .encrypt_in_place_detached((&n).into(), aad, payload)
                    .unwrap();
                Tag(tag.into())
            }
            Self::Aes256(key) => {
                let tag = key
                    .encrypt_in_place_detached((&n).into(), aad, payload)
                    .unwrap();
                Tag(tag.into())
            }
            Self::NonePoly { key } => Tag(poly1305_only(key, &n, aad, payload)),
        }
    }

    /// Verifies `tag` and decrypts `payload` in place.
    pub fn open(
        &self,
        counter: u64,
        aad: &[u8],
        payload: &mut [u8],
        tag: &Tag,
    ) -> Result<(), CryptoError> {
        let n = nonce(counter);
        match self {
            Self::ChaCha(key) => key
                .decrypt_in_place_detached((&n).into(), aad, payload, (&tag.0).into())
                .map_err(|_| CryptoError::DecryptionError),
            Self::Aes128(key) => key
                .decrypt_in_place_detached((&n).into(), aad, payload, (&tag.0).into())
                .map_err(|_| CryptoError::DecryptionError),
            Self::Aes256(key) => key
                .decrypt_in_place_detached((&n).into(), aad, payload, (&tag.0).into())
                .map_err(|_| CryptoError::DecryptionError),
            Self::NonePoly { key } => {
                let expect = poly1305_only(key, &n, aad, payload);
                if expect.ct_eq(&tag.0).into() {
                    Ok(())
                } else {
                    Err(CryptoError::DecryptionError)
                }
            }
        }
    }
}

/// The RFC 8439 tag computation with the encryption step skipped: the
/// one-time Poly1305 key still comes from the ChaCha20 keystream so tags
/// stay unique per counter.
fn poly1305_only(key: &Key, nonce: &[u8; 12], aad: &[u8], msg: &[u8]) -> [u8; 16] {
    let mut stream = chacha20::ChaCha20::new(key.into(), nonce.into());
    let mut otk = poly1305::Key::default();
    stream.apply_keystream(&mut otk);

    let mut poly = Poly1305::new(&otk);
    poly.update_padded(aad);
    poly.update_padded(msg);

    let mut lens = [0u8; 16];
    lens[..8].copy_from_slice(&(aad.len() as u64).to_le_bytes());
    lens[8..].copy_from_slice(&(msg.len() as u64).to_le_bytes());
    poly.update(core::slice::from_ref(poly1305::Block::from_slice(&lens)));

    poly.finalize().into()
}

/// Recomputes the full AEAD tag over already-encrypted bytes, without
/// decrypting. Possible for the ChaCha20-keyed suites because their tag is a
/// Poly1305 over the ciphertext; the receive path of the 8-byte-MAC feature
/// needs this to recover the full tag the sender compressed. GCM suites
/// cannot do this, so negotiation never pairs them with short MACs.
pub fn tag_over_ciphertext(
    suite: CipherSuite,
    key: &Key,
    counter: u64,
    aad: &[u8],
    ciphertext: &[u8],
) -> Option<Tag> {
    match suite {
        CipherSuite::ChaCha20Poly1305 | CipherSuite::NonePoly1305 => Some(Tag(poly1305_only(
            key,
            &nonce(counter),
            aad,
            ciphertext,
        ))),
        CipherSuite::Aes128Gcm | CipherSuite::Aes256Gcm => None,
    }
}

/// SipHash key compressing 16 byte tags down to 8 on one direction.
pub type TagCompressKey = (u64, u64);

/// Derives the per-direction tag-compression keys from the session keys.
/// Active only when the 8-byte-MAC feature was negotiated.
pub fn derive_tag_compress_keys(send_key: &Key, recv_key: &Key) -> [TagCompressKey; 2] {
    let mut out = [(0, 0); 2];
    for (slot, key) in out.iter_mut().zip([send_key, recv_key]) {
        let m = mac(key, b"mac-compress");
        *slot = (
            u64::from_le_bytes(m[..8].try_into().unwrap()),
            u64::from_le_bytes(m[8..].try_into().unwrap()),
        );
    }
    out
}

/// Hashes a full AEAD tag down to the 8 byte wire form.
pub fn compress_tag(key: TagCompressKey, tag: &Tag) -> [u8; 8] {
    let mut h = SipHasher::new_with_keys(key.0, key.1);
    h.write(&tag.0);
    h.finish().to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUITES: [CipherSuite; 4] = [
        CipherSuite::ChaCha20Poly1305,
        CipherSuite::Aes128Gcm,
        CipherSuite::Aes256Gcm,
        CipherSuite::NonePoly1305,
    ];

    #[test]
    fn seal_open_roundtrip() {
        for suite in SUITES {
            let cipher = TransportCipher::new(suite, &[0x41; 32]);
            let mut payload = *b"a 16 byte packet";
            let tag = cipher.seal(7, &[], &mut payload);
            if suite == CipherSuite::NonePoly1305 {
                assert_eq!(&payload, b"a 16 byte packet");
            } else {
                assert_ne!(&payload, b"a 16 byte packet");
            }
            cipher.open(7, &[], &mut payload, &tag).unwrap();
            assert_eq!(&payload, b"a 16 byte packet");
        }
    }

    #[test]
    fn open_rejects_wrong_counter_and_tag() {
        for suite in SUITES {
            let cipher = TransportCipher::new(suite, &[0x42; 32]);
            let mut payload = *b"a 16 byte packet";
            let tag = cipher.seal(1, &[], &mut payload);

            let mut tampered = payload;
            assert!(cipher.open(2, &[], &mut tampered, &tag).is_err());

            let mut bad_tag = tag;
            bad_tag.0[0] ^= 1;
            let mut tampered = payload;
            assert!(cipher.open(1, &[], &mut tampered, &bad_tag).is_err());
        }
    }

    #[test]
    fn suite_ids_roundtrip() {
        for suite in SUITES {
            assert_eq!(CipherSuite::from_id(suite.id()), Some(suite));
        }
        assert_eq!(CipherSuite::from_id(9), None);
    }

    #[test]
    fn tag_recomputation_matches_seal() {
        for suite in [CipherSuite::ChaCha20Poly1305, CipherSuite::NonePoly1305] {
            let key = [0x33; 32];
            let cipher = TransportCipher::new(suite, &key);
            let mut payload = *b"sixteen byte msg";
            let tag = cipher.seal(3, b"ad", &mut payload);
            let recomputed = tag_over_ciphertext(suite, &key, 3, b"ad", &payload).unwrap();
            assert_eq!(tag.0, recomputed.0);
        }
        assert!(tag_over_ciphertext(CipherSuite::Aes256Gcm, &[0; 32], 0, &[], &[]).is_none());
    }

    #[test]
    fn compressed_tags_differ_by_direction() {
        let keys = derive_tag_compress_keys(&[1; 32], &[2; 32]);
        assert_ne!(keys[0], keys[1]);

        let tag = Tag([9; 16]);
        let a = compress_tag(keys[0], &tag);
        let b = compress_tag(keys[1], &tag);
        assert_ne!(a, b);
        assert_eq!(a, compress_tag(keys[0], &tag));
    }
}

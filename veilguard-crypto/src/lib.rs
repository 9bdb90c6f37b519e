//! The Noise IKpsk2 handshake and transport-cipher layer.
//!
//! Handshake messages are bit-compatible with WireGuard when no extension
//! block is carried. With extensions, the AEAD-protected payload of the
//! initiation and response grows by a TLV block and the two trailing MACs
//! move with the end of the message; MAC coverage is always "everything
//! before the field".

#![no_std]

use core::net::SocketAddr;
use core::ops::ControlFlow;

use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, XChaCha20Poly1305};
use rand_core::{CryptoRng, RngCore};
use subtle::ConstantTimeEq;
use tai64::Tai64N;
use x25519_dalek::{PublicKey, ReusableSecret, StaticSecret};
use zerocopy::{AsBytes, FromBytes};
use zeroize::Zeroize;

use veilguard_types::{
    mac1_region, mac2_region, split_macs, Cookie, EncryptedCookie, InitPrelude, RespPrelude, Tag,
    HANDSHAKE_INIT_SIZE, HANDSHAKE_RESP_SIZE, MAX_HANDSHAKE_EXTENSION, MSG_FIRST, MSG_SECOND,
    TIMESTAMP_LEN,
};

mod cipher;
mod prim;

pub use cipher::{
    compress_tag, derive_tag_compress_keys, tag_over_ciphertext, CipherSuite, TagCompressKey,
    TransportCipher,
};
pub use prim::{mac, HandshakeState, Key, Mac};

use prim::{hash, nonce, LABEL_COOKIE, LABEL_MAC1};

#[derive(Debug, PartialEq, Eq)]
pub enum CryptoError {
    DecryptionError,
    Rejected,
}

pub fn mac1_key(spk: &PublicKey) -> Key {
    hash([&LABEL_MAC1, spk.as_bytes()])
}

pub fn cookie_key(spk: &PublicKey) -> Key {
    hash([&LABEL_COOKIE, spk.as_bytes()])
}

/// Our own static identity, with the MAC keys peers will use towards us.
pub struct StaticInitiatorConfig {
    pub private_key: StaticSecret,
    pub public_key: PublicKey,
    /// Cached mac1_key: calculated using `mac1_key(&self.public_key)`
    pub mac1_key: Key,
    /// Cached cookie_key: calculated using `cookie_key(&self.public_key)`
    pub cookie_key: Key,
}

impl StaticInitiatorConfig {
    pub fn new(private_key: StaticSecret) -> Self {
        let public_key = PublicKey::from(&private_key);
        Self {
            mac1_key: mac1_key(&public_key),
            cookie_key: cookie_key(&public_key),
            public_key,
            private_key,
        }
    }
}

/// A peer's static identity and everything derivable from it up front.
pub struct StaticPeerConfig {
    /// Peer's public key.
    pub key: PublicKey,
    /// Peer's preshared key, all zero when not configured.
    pub preshared_key: Key,
    /// Cached mac1_key: calculated using `mac1_key(&self.key)`
    pub mac1_key: Key,
    /// Cached cookie_key: calculated using `cookie_key(&self.key)`
    pub cookie_key: Key,
    /// Precomputed DH between our static key and the peer's.
    pub static_shared: Key,
}

impl StaticPeerConfig {
    pub fn new(key: PublicKey, preshared_key: Option<Key>, local: &StaticSecret) -> Self {
        Self {
            mac1_key: mac1_key(&key),
            cookie_key: cookie_key(&key),
            static_shared: local.diffie_hellman(&key).to_bytes(),
            key,
            preshared_key: preshared_key.unwrap_or_default(),
        }
    }
}

/// Responder-local secret binding cookies to a source address. The caller
/// rotates it every two minutes.
#[derive(Zeroize)]
pub struct CookieState {
    key: Key,
}

impl CookieState {
    pub fn new(rng: &mut (impl CryptoRng + RngCore)) -> Self {
        let mut key = Key::default();
        rng.fill_bytes(&mut key);
        Self { key }
    }

    pub fn generate(&mut self, rng: &mut (impl CryptoRng + RngCore)) {
        rng.fill_bytes(&mut self.key);
    }

    pub fn new_cookie(&self, addr: SocketAddr) -> Cookie {
        // no specified encoding, the mac input just needs the address and port
        let mut a = [0; 18];
        match addr.ip() {
            core::net::IpAddr::V4(ipv4) => a[..4].copy_from_slice(&ipv4.octets()[..]),
            core::net::IpAddr::V6(ipv6) => a[..16].copy_from_slice(&ipv6.octets()[..]),
        }
        a[16..].copy_from_slice(&addr.port().to_le_bytes()[..]);
        Cookie(mac(&self.key, &a))
    }
}

/// Computes and writes both trailing MACs. mac2 is zero without a fresh
/// cookie. Returns the mac1 value so the caller can remember it for
/// decrypting a possible cookie reply.
pub fn write_macs(msg: &mut [u8], mac1_key: &Key, cookie: Option<&Cookie>) -> Mac {
    let len = msg.len();
    let mac1 = mac(mac1_key, &msg[..len - 32]);
    msg[len - 32..len - 16].copy_from_slice(&mac1);
    let mac2 = match cookie {
        Some(cookie) => mac(&cookie.0, &msg[..len - 16]),
        None => [0; 16],
    };
    msg[len - 16..].copy_from_slice(&mac2);
    mac1
}

pub fn verify_mac1(msg: &[u8], mac1_key: &Key) -> Result<(), CryptoError> {
    let (_, macs) = split_macs(msg).ok_or(CryptoError::Rejected)?;
    let actual = mac(mac1_key, mac1_region(msg));
    if actual.ct_eq(&macs.mac1).into() {
        Ok(())
    } else {
        Err(CryptoError::Rejected)
    }
}

pub fn verify_mac2(msg: &[u8], cookie: &Cookie) -> Result<(), CryptoError> {
    let (_, macs) = split_macs(msg).ok_or(CryptoError::Rejected)?;
    let actual = mac(&cookie.0, mac2_region(msg));
    if actual.ct_eq(&macs.mac2).into() {
        Ok(())
    } else {
        Err(CryptoError::Rejected)
    }
}

/// The cheap gate in front of the handshake.
///
/// mac1 must always be valid. Under load the message additionally needs a
/// mac2 bound to a cookie we recently issued for that address; a valid-mac1
/// message without one gets the cookie back instead of any expensive work.
pub fn verify_macs(
    msg: &[u8],
    mac1_key: &Key,
    overload: bool,
    cookie: &CookieState,
    addr: SocketAddr,
) -> Result<ControlFlow<Cookie>, CryptoError> {
    verify_mac1(msg, mac1_key)?;

    if overload {
        let cookie = cookie.new_cookie(addr);
        if verify_mac2(msg, &cookie).is_err() {
            return Ok(ControlFlow::Break(cookie));
        }
    }

    Ok(ControlFlow::Continue(()))
}

/// Seals `region[..len-16]` in place under the handshake hash and writes the
/// tag into the last 16 bytes, then absorbs the whole region.
fn hs_seal(hs: &mut HandshakeState, k: &Key, region: &mut [u8]) {
    let aad = *hs.hash();
    let split = region.len() - 16;
    let (body, tagspace) = region.split_at_mut(split);
    let tag = ChaCha20Poly1305::new(k.into())
        .encrypt_in_place_detached((&nonce(0)).into(), &aad, body)
        .unwrap();
    tagspace.copy_from_slice(&tag);
    hs.mix_hash(region);
}

/// Absorbs the sealed region, then opens it in place and returns the
/// plaintext body.
fn hs_open<'m>(
    hs: &mut HandshakeState,
    k: &Key,
    region: &'m mut [u8],
) -> Result<&'m mut [u8], CryptoError> {
    let aad = *hs.hash();
    hs.mix_hash(region);
    let split = region.len() - 16;
    let (body, tag) = region.split_at_mut(split);
    ChaCha20Poly1305::new(k.into())
        .decrypt_in_place_detached(
            (&nonce(0)).into(),
            &aad,
            body,
            chacha20poly1305::Tag::from_slice(tag),
        )
        .map_err(|_| CryptoError::DecryptionError)?;
    Ok(body)
}

pub struct HandshakeInitArgs<'a> {
    pub sender: u32,
    pub now: Tai64N,
    pub cookie: Option<&'a Cookie>,
    /// TLV extension block carried inside the encrypted payload.
    pub extension: &'a [u8],
}

/// Builds a handshake initiation into `out` and returns the written message
/// along with its mac1.
pub fn encrypt_handshake_init<'m>(
    hs: &mut HandshakeState,
    initiator: &StaticInitiatorConfig,
    peer: &StaticPeerConfig,
    esk_i: &ReusableSecret,
    args: HandshakeInitArgs<'_>,
    out: &'m mut [u8],
) -> Result<(&'m mut [u8], Mac), CryptoError> {
    let ext = args.extension;
    if ext.len() > MAX_HANDSHAKE_EXTENSION {
        return Err(CryptoError::Rejected);
    }
    let len = HANDSHAKE_INIT_SIZE + ext.len();
    let out = out.get_mut(..len).ok_or(CryptoError::Rejected)?;

    let epk_i = PublicKey::from(esk_i);

    // IKpsk2:
    // <- s
    hs.mix_hash(peer.key.as_bytes());

    // -> e: wireguard goes off-spec here with mix-chain.
    hs.mix_chain(epk_i.as_bytes());
    hs.mix_hash(epk_i.as_bytes());

    // -> es:
    let k = hs.mix_key_edh(esk_i, &peer.key);

    let prelude = InitPrelude {
        _type: MSG_FIRST.into(),
        sender: args.sender.into(),
        ephemeral: *epk_i.as_bytes(),
        static_key: zerocopy::FromZeroes::new_zeroed(),
    };
    out[..88].copy_from_slice(prelude.as_bytes());

    // -> s:
    out[40..72].copy_from_slice(initiator.public_key.as_bytes());
    hs_seal(hs, &k, &mut out[40..88]);

    // -> ss: precomputed in the peer config
    let k = hs.mix_key(&peer.static_shared);

    // payload: timestamp plus the extension block
    out[88..88 + TIMESTAMP_LEN].copy_from_slice(&args.now.to_bytes());
    out[88 + TIMESTAMP_LEN..len - 48].copy_from_slice(ext);
    hs_seal(hs, &k, &mut out[88..len - 32]);

    let mac1 = write_macs(out, &peer.mac1_key, args.cookie);
    Ok((out, mac1))
}

/// Decrypted contents of a handshake initiation.
pub struct InitiationPayload<'m> {
    pub sender: u32,
    pub ephemeral: PublicKey,
    pub static_key: PublicKey,
    pub timestamp: [u8; TIMESTAMP_LEN],
    pub extension: &'m [u8],
}

/// Consumes a MAC-checked initiation. The caller is expected to look the
/// decrypted static key up and enforce its timestamp rules before answering.
pub fn decrypt_handshake_init<'m>(
    msg: &'m mut [u8],
    hs: &mut HandshakeState,
    receiver: &StaticInitiatorConfig,
) -> Result<InitiationPayload<'m>, CryptoError> {
    let len = msg.len();
    if !(HANDSHAKE_INIT_SIZE..=HANDSHAKE_INIT_SIZE + MAX_HANDSHAKE_EXTENSION).contains(&len) {
        return Err(CryptoError::Rejected);
    }
    let prelude = InitPrelude::read_from_prefix(&msg[..]).ok_or(CryptoError::Rejected)?;
    if prelude._type.get() != MSG_FIRST {
        return Err(CryptoError::Rejected);
    }

    // <- s:
    hs.mix_hash(receiver.public_key.as_bytes());

    // -> e:
    hs.mix_chain(&prelude.ephemeral);
    hs.mix_hash(&prelude.ephemeral);
    let epk_i = PublicKey::from(prelude.ephemeral);

    // -> es:
    let k = hs.mix_key_dh(&receiver.private_key, &epk_i);

    // -> s:
    let spk_i = {
        let body = hs_open(hs, &k, &mut msg[40..88])?;
        PublicKey::from(<[u8; 32]>::try_from(&*body).unwrap())
    };

    // -> ss:
    let k = hs.mix_key_dh(&receiver.private_key, &spk_i);

    // payload:
    let body = hs_open(hs, &k, &mut msg[88..len - 32])?;
    let (timestamp, extension) = body.split_at(TIMESTAMP_LEN);

    Ok(InitiationPayload {
        sender: prelude.sender.get(),
        ephemeral: epk_i,
        static_key: spk_i,
        timestamp: timestamp.try_into().unwrap(),
        extension,
    })
}

pub struct HandshakeRespArgs<'a> {
    pub sender: u32,
    pub receiver: u32,
    pub cookie: Option<&'a Cookie>,
    pub extension: &'a [u8],
}

/// Builds the handshake response into `out`, completing the responder side
/// of the exchange. `init_ephemeral` and `init_static` come from the
/// decrypted initiation.
pub fn encrypt_handshake_resp<'m>(
    hs: &mut HandshakeState,
    init_ephemeral: &PublicKey,
    init_static: &PublicKey,
    esk_r: &ReusableSecret,
    peer: &StaticPeerConfig,
    args: HandshakeRespArgs<'_>,
    out: &'m mut [u8],
) -> Result<(&'m mut [u8], Mac), CryptoError> {
    let ext = args.extension;
    if ext.len() > MAX_HANDSHAKE_EXTENSION {
        return Err(CryptoError::Rejected);
    }
    let len = HANDSHAKE_RESP_SIZE + ext.len();
    let out = out.get_mut(..len).ok_or(CryptoError::Rejected)?;

    let epk_r = PublicKey::from(esk_r);

    // IKpsk2:
    // <- e: wireguard goes off-spec here with mix-chain.
    hs.mix_chain(epk_r.as_bytes());
    hs.mix_hash(epk_r.as_bytes());

    // <- ee:
    hs.mix_edh(esk_r, init_ephemeral);

    // <- se:
    hs.mix_edh(esk_r, init_static);

    // <- psk:
    let k = hs.mix_key_and_hash(&peer.preshared_key);

    let prelude = RespPrelude {
        _type: MSG_SECOND.into(),
        sender: args.sender.into(),
        receiver: args.receiver.into(),
        ephemeral: *epk_r.as_bytes(),
    };
    out[..44].copy_from_slice(prelude.as_bytes());

    // payload: just the extension block (empty for stock wireguard)
    out[44..44 + ext.len()].copy_from_slice(ext);
    hs_seal(hs, &k, &mut out[44..len - 32]);

    let mac1 = write_macs(out, &peer.mac1_key, args.cookie);
    Ok((out, mac1))
}

/// Decrypted contents of a handshake response.
pub struct ResponsePayload<'m> {
    pub sender: u32,
    pub receiver: u32,
    pub extension: &'m [u8],
}

pub fn decrypt_handshake_resp<'m>(
    msg: &'m mut [u8],
    hs: &mut HandshakeState,
    initiator: &StaticInitiatorConfig,
    peer: &StaticPeerConfig,
    esk_i: &ReusableSecret,
) -> Result<ResponsePayload<'m>, CryptoError> {
    let len = msg.len();
    if !(HANDSHAKE_RESP_SIZE..=HANDSHAKE_RESP_SIZE + MAX_HANDSHAKE_EXTENSION).contains(&len) {
        return Err(CryptoError::Rejected);
    }
    let prelude = RespPrelude::read_from_prefix(&msg[..]).ok_or(CryptoError::Rejected)?;
    if prelude._type.get() != MSG_SECOND {
        return Err(CryptoError::Rejected);
    }

    let epk_r = PublicKey::from(prelude.ephemeral);

    // <- e:
    hs.mix_chain(epk_r.as_bytes());
    hs.mix_hash(epk_r.as_bytes());

    // <- ee:
    hs.mix_edh(esk_i, &epk_r);

    // <- se:
    hs.mix_dh(&initiator.private_key, &epk_r);

    // <- psk:
    let k = hs.mix_key_and_hash(&peer.preshared_key);

    // payload:
    let extension = hs_open(hs, &k, &mut msg[44..len - 32])?;

    Ok(ResponsePayload {
        sender: prelude.sender.get(),
        receiver: prelude.receiver.get(),
        extension,
    })
}

pub fn encrypt_cookie(
    mut cookie: Cookie,
    key: &Key,
    nonce: &[u8; 24],
    aad: &[u8],
) -> EncryptedCookie {
    let tag = XChaCha20Poly1305::new(key.into())
        .encrypt_in_place_detached(nonce.into(), aad, &mut cookie.0)
        .unwrap();

    EncryptedCookie {
        msg: cookie,
        tag: Tag(tag.into()),
    }
}

pub fn decrypt_cookie<'c>(
    cookie: &'c mut EncryptedCookie,
    key: &Key,
    nonce: &[u8; 24],
    aad: &[u8],
) -> Result<&'c Cookie, CryptoError> {
    XChaCha20Poly1305::new(key.into())
        .decrypt_in_place_detached(
            nonce.into(),
            aad,
            &mut cookie.msg.0,
            chacha20poly1305::Tag::from_slice(&cookie.tag.0),
        )
        .map_err(|_| CryptoError::DecryptionError)?;

    Ok(&cookie.msg)
}

//! Handshake extension block: TLV codec and negotiation rules.
//!
//! Extensions ride inside the AEAD-protected payload of both handshake
//! messages, so they are authenticated and invisible on the wire. Each
//! record is a 1-byte tag, a 1-byte length and the payload. Unknown tags
//! are skipped so either side can be newer.

use arrayvec::ArrayVec;
use veilguard_crypto::CipherSuite;
use veilguard_types::{
    PacketCompressionV1, EXT_BOOLEAN_FEATURES, EXT_CIPHER_SUITES, EXT_CIPHER_SUITES_PRIO,
    EXT_PACKET_COMPRESSION, EXT_PACKET_COMPRESSION_VER, FEATURES_COUNT, FEATURE_ENFORCES,
    FEATURE_OFF, FEATURE_SKIP_KEYID_IN, FEATURE_SKIP_KEYID_OUT, FEATURE_SUPPORTS, FEATURE_WANTS,
    MAX_HANDSHAKE_EXTENSION,
};
use x25519_dalek::PublicKey;
use zerocopy::{AsBytes, FromBytes};

use crate::Error;

pub const MAX_CIPHERS: usize = 4;

pub type ExtensionBuf = ArrayVec<u8, MAX_HANDSHAKE_EXTENSION>;
pub type CipherList = ArrayVec<CipherSuite, MAX_CIPHERS>;

/// What the remote side announced inside its handshake payload.
pub struct RemoteExtensions {
    pub features: [u8; FEATURES_COUNT],
    pub ciphers: CipherList,
    pub cipher_prio: bool,
    pub compression: Option<PacketCompressionV1>,
    /// Whether any extension record was present at all. A stock WireGuard
    /// peer sends none and gets a stock session.
    pub extended: bool,
}

impl Default for RemoteExtensions {
    fn default() -> Self {
        let mut ciphers = CipherList::new();
        ciphers.push(CipherSuite::ChaCha20Poly1305);
        Self {
            features: [FEATURE_OFF; FEATURES_COUNT],
            ciphers,
            cipher_prio: false,
            compression: None,
            extended: false,
        }
    }
}

/// Serializes our announcement. Record order is stable so the block is
/// reproducible across retransmits.
pub fn write_extensions(
    features: &[u8; FEATURES_COUNT],
    ciphers: &[CipherSuite],
    cipher_prio: bool,
    compression: Option<&PacketCompressionV1>,
) -> ExtensionBuf {
    let mut out = ExtensionBuf::new();

    if features.iter().any(|&f| f != FEATURE_OFF) {
        let mut packed = [0u8; FEATURES_COUNT.div_ceil(4)];
        for (i, &f) in features.iter().enumerate() {
            packed[i / 4] |= (f & 3) << ((i % 4) * 2);
        }
        out.push(EXT_BOOLEAN_FEATURES);
        out.push(packed.len() as u8);
        out.try_extend_from_slice(&packed).unwrap();
    }

    if !ciphers.is_empty() {
        out.push(EXT_CIPHER_SUITES);
        out.push(ciphers.len() as u8);
        for &c in ciphers {
            out.push(c.id());
        }
        if cipher_prio {
            out.push(EXT_CIPHER_SUITES_PRIO);
            out.push(1);
            out.push(1);
        }
    }

    if let Some(compression) = compression {
        out.push(EXT_PACKET_COMPRESSION);
        out.push(core::mem::size_of::<PacketCompressionV1>() as u8);
        out.try_extend_from_slice(compression.as_bytes()).unwrap();
    }

    out
}

/// Parses the remote block. Truncated records reject the handshake,
/// unknown tags do not.
pub fn parse_extensions(mut data: &[u8]) -> Result<RemoteExtensions, Error> {
    let mut ext = RemoteExtensions {
        extended: !data.is_empty(),
        ..Default::default()
    };

    while !data.is_empty() {
        if data.len() < 2 {
            return Err(Error::InvalidMessage);
        }
        let tag = data[0];
        let len = data[1] as usize;
        let Some(payload) = data.get(2..2 + len) else {
            return Err(Error::InvalidMessage);
        };
        data = &data[2 + len..];

        match tag {
            EXT_BOOLEAN_FEATURES => {
                for (i, f) in ext.features.iter_mut().enumerate() {
                    let byte = payload.get(i / 4).copied().unwrap_or(0);
                    *f = (byte >> ((i % 4) * 2)) & 3;
                }
            }
            EXT_CIPHER_SUITES => {
                ext.ciphers.clear();
                for &id in payload {
                    if let Some(suite) = CipherSuite::from_id(id) {
                        if ext.ciphers.len() < MAX_CIPHERS && !ext.ciphers.contains(&suite) {
                            ext.ciphers.push(suite);
                        }
                    }
                }
                if ext.ciphers.is_empty() {
                    ext.ciphers.push(CipherSuite::ChaCha20Poly1305);
                }
            }
            EXT_CIPHER_SUITES_PRIO => {
                ext.cipher_prio = payload.first().copied().unwrap_or(0) != 0;
            }
            EXT_PACKET_COMPRESSION => {
                if let Some(c) = PacketCompressionV1::read_from(payload) {
                    if c.version.get() == EXT_PACKET_COMPRESSION_VER {
                        ext.compression = Some(c);
                    }
                }
            }
            _ => {}
        }
    }

    Ok(ext)
}

fn combine(a: u8, b: u8) -> Result<bool, Error> {
    if (a == FEATURE_ENFORCES && b == FEATURE_OFF) || (b == FEATURE_ENFORCES && a == FEATURE_OFF) {
        return Err(Error::Rejected);
    }
    Ok((a >= FEATURE_WANTS && b >= FEATURE_SUPPORTS) || (b >= FEATURE_WANTS && a >= FEATURE_SUPPORTS))
}

/// Resolves each feature from the two announcements. The skip-keyid pair is
/// directional: our inbound skip pairs with their outbound skip.
pub fn negotiate_features(
    local: &[u8; FEATURES_COUNT],
    remote: &[u8; FEATURES_COUNT],
) -> Result<[bool; FEATURES_COUNT], Error> {
    let mut enabled = [false; FEATURES_COUNT];
    for i in 0..FEATURES_COUNT {
        let j = match i {
            FEATURE_SKIP_KEYID_IN => FEATURE_SKIP_KEYID_OUT,
            FEATURE_SKIP_KEYID_OUT => FEATURE_SKIP_KEYID_IN,
            _ => i,
        };
        enabled[i] = combine(local[i], remote[j])?;
    }
    Ok(enabled)
}

/// Picks the transport suite.
///
/// If exactly one side set the priority flag, that side's ordered list
/// decides; otherwise the list of the lexicographically lower static public
/// key does. The winner's first suite also present on the other side is
/// chosen; ChaCha20-Poly1305 is the implicit common fallback.
pub fn negotiate_cipher(
    local: &CipherList,
    local_prio: bool,
    local_pub: &PublicKey,
    remote: &CipherList,
    remote_prio: bool,
    remote_pub: &PublicKey,
) -> CipherSuite {
    let local_decides = match (local_prio, remote_prio) {
        (true, false) => true,
        (false, true) => false,
        _ => local_pub.as_bytes() < remote_pub.as_bytes(),
    };
    let (winner, other) = if local_decides {
        (local, remote)
    } else {
        (remote, local)
    };

    winner
        .iter()
        .copied()
        .find(|suite| other.contains(suite))
        .unwrap_or(CipherSuite::ChaCha20Poly1305)
}

//! Wire layouts for the veilguard protocol.
//!
//! The first four message types are bit-compatible with WireGuard. On top of
//! those, handshake payloads may carry a TLV extension block inside their
//! AEAD-protected region, and data messages may use a negotiated short header
//! form. Everything on the wire is little-endian.

#![no_std]

use zerocopy::{byteorder::little_endian, AsBytes, FromBytes, FromZeroes};

pub type Mac = [u8; 16];

/// The type of [`HandshakeInit`]
pub const MSG_FIRST: u32 = 1;
/// The type of [`HandshakeResp`]
pub const MSG_SECOND: u32 = 2;
/// The type of [`CookieMessage`]
pub const MSG_COOKIE: u32 = 3;
/// The type of [`DataHeader`]
pub const MSG_DATA: u32 = 4;

/// Smallest parseable datagram.
pub const MESSAGE_MINIMUM_SIZE: usize = 16;

/// Size of a stock handshake initiation, without any extension block.
pub const HANDSHAKE_INIT_SIZE: usize = 148;
/// Size of a stock handshake response, without any extension block.
pub const HANDSHAKE_RESP_SIZE: usize = 92;
/// Size of a cookie reply.
pub const COOKIE_REPLY_SIZE: usize = 64;

/// Hard cap on the TLV extension block carried inside a handshake payload.
pub const MAX_HANDSHAKE_EXTENSION: usize = 1024;

pub const TIMESTAMP_LEN: usize = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, FromZeroes, AsBytes)]
#[repr(transparent)]
pub struct Cookie(pub Mac);

#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(transparent)]
pub struct Tag(pub [u8; 16]);

#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct EncryptedPublicKey {
    pub msg: [u8; 32],
    pub tag: Tag,
}

#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct EncryptedCookie {
    pub msg: Cookie,
    pub tag: Tag,
}

/// Both handshake messages end in two MACs covering everything before them.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct MessageMacs {
    pub mac1: Mac,
    pub mac2: Mac,
}

/// Fixed prefix of a handshake initiation. The encrypted timestamp (12 bytes
/// plus an optional extension block, plus a 16 byte tag) and the two MACs
/// follow as a variable-length tail.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C, align(4))]
pub struct InitPrelude {
    /// Must always be [`MSG_FIRST`]
    pub _type: little_endian::U32,
    /// A randomly generated key-id. Any incoming messages with this value
    /// as the _receiver_ will be associated with this handshake.
    pub sender: little_endian::U32,
    /// Randomly generated x25519 public key.
    pub ephemeral: [u8; 32],
    /// The initiator's static public key, encrypted as part of the
    /// Noise IKpsk2 handshake.
    pub static_key: EncryptedPublicKey,
}

/// Fixed prefix of a handshake response. The encrypted-empty payload
/// (an optional extension block plus a 16 byte tag) and the two MACs follow.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C, align(4))]
pub struct RespPrelude {
    /// Must always be [`MSG_SECOND`]
    pub _type: little_endian::U32,
    /// A randomly generated key-id, like [`InitPrelude::sender`].
    pub sender: little_endian::U32,
    /// Must be set to the same as [`InitPrelude::sender`]
    pub receiver: little_endian::U32,
    /// Randomly generated x25519 public key.
    pub ephemeral: [u8; 32],
}

/// A cookie reply, sent instead of a handshake response when the responder
/// is under load and the message carried no fresh mac2.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C, align(4))]
pub struct CookieMessage {
    /// Must always be [`MSG_COOKIE`]
    pub _type: little_endian::U32,
    /// Must be set to the same as the received
    /// [`InitPrelude::sender`] or [`RespPrelude::sender`].
    pub receiver: little_endian::U32,
    /// Randomly generated nonce for the XChaCha20-Poly1305 seal.
    pub nonce: [u8; 24],
    /// Encrypted cookie value.
    pub cookie: EncryptedCookie,
}

/// The full-size data message header. A data message is this header followed
/// by the ciphertext and the (16 or negotiated 8 byte) auth tag.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C, align(8))]
pub struct DataHeader {
    /// Must always be [`MSG_DATA`]
    pub _type: little_endian::U32,
    /// The receiver's key-id for this session.
    pub receiver: little_endian::U32,
    /// The nonce-counter for the encrypted payload, checked against the
    /// receiver's replay window.
    pub counter: little_endian::U64,
}

/// Splits a handshake message into its MAC-covered body and the MAC trailer.
pub fn split_macs(msg: &[u8]) -> Option<(&[u8], &MessageMacs)> {
    if msg.len() < core::mem::size_of::<MessageMacs>() {
        return None;
    }
    let (body, tail) = msg.split_at(msg.len() - core::mem::size_of::<MessageMacs>());
    Some((body, MessageMacs::ref_from(tail)?))
}

/// The byte range covered by mac1: everything before the mac fields.
pub fn mac1_region(msg: &[u8]) -> &[u8] {
    &msg[..msg.len() - 32]
}

/// The byte range covered by mac2: everything before it, mac1 included.
pub fn mac2_region(msg: &[u8]) -> &[u8] {
    &msg[..msg.len() - 16]
}

// Short-header data messages. The flag byte has the high bit set, which no
// stock message type shares, so the two framings can coexist on one port.
pub const SHORT_HEADER_BIT: u8 = 0x80;
/// Two-bit addr-table slot selector; zero means an explicit key-id follows.
pub const SHORT_HEADER_KEY_ID_MASK: u8 = 0x60;
pub const SHORT_HEADER_KEY_ID_SHIFT: u32 = 5;
/// Set when an ack byte follows the counter.
pub const SHORT_HEADER_ACK: u8 = 0x10;
pub const SHORT_HEADER_TYPE_MASK: u8 = 0x0f;
pub const SHORT_HEADER_CTR1: u8 = 0x00;
pub const SHORT_HEADER_CTR2: u8 = 0x01;
pub const SHORT_HEADER_CTR4: u8 = 0x02;

// Layout of the ack byte.
pub const ACK_HEADER_COUNTER_MASK: u8 = 0x0c;
pub const ACK_HEADER_COUNTER_NONE: u8 = 0x00;
pub const ACK_HEADER_COUNTER_2: u8 = 0x04;
pub const ACK_HEADER_COUNTER_4: u8 = 0x08;
pub const ACK_HEADER_COUNTER_6: u8 = 0x0c;
/// Low bits of the ack byte: the sender's addr-table slot for us, plus one.
pub const ACK_HEADER_KEY_MASK: u8 = 0x03;

// Handshake extension TLV tags.
pub const EXT_PACKET_COMPRESSION: u8 = 0x15;
pub const EXT_PACKET_COMPRESSION_VER: u16 = 0x01;
pub const EXT_BOOLEAN_FEATURES: u8 = 0x16;
pub const EXT_CIPHER_SUITES: u8 = 0x18;
pub const EXT_CIPHER_SUITES_PRIO: u8 = 0x19;

// Negotiable cipher suites.
pub const CIPHER_CHACHA20_POLY1305: u8 = 0x00;
pub const CIPHER_AES128_GCM: u8 = 0x01;
pub const CIPHER_AES256_GCM: u8 = 0x02;
/// ChaCha20-Poly1305 authentication without the encryption step.
pub const CIPHER_NONE_POLY1305: u8 = 0x03;
pub const CIPHER_SUITE_COUNT: usize = 4;

// Negotiable boolean features, two bits each in the feature vector.
pub const FEATURES_COUNT: usize = 6;
pub const FEATURE_SHORT_HEADER: usize = 0;
pub const FEATURE_SHORT_MAC: usize = 1;
pub const FEATURE_IPZIP: usize = 2;
pub const FEATURE_SKIP_KEYID_IN: usize = 4;
pub const FEATURE_SKIP_KEYID_OUT: usize = 5;

pub const FEATURE_OFF: u8 = 0x0;
pub const FEATURE_SUPPORTS: u8 = 0x1;
pub const FEATURE_WANTS: u8 = 0x2;
pub const FEATURE_ENFORCES: u8 = 0x3;

/// Packet-compression descriptor exchanged in the handshake extension block.
#[derive(Clone, Copy, Default, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct PacketCompressionV1 {
    /// Packet compressor version, [`EXT_PACKET_COMPRESSION_VER`].
    pub version: little_endian::U16,
    /// Guessed TTL of outgoing packets.
    pub ttl: u8,
    /// Subnet length and packet direction.
    pub flags: u8,
    /// IPv4 address of the endpoint.
    pub ipv4_addr: [u8; 4],
    /// IPv6 address of the endpoint.
    pub ipv6_addr: [u8; 16],
}

//! Data-message framing: the stock 16 byte header and the negotiated
//! short forms.
//!
//! A short header is a flag byte, 1/2/4 low bytes of the send counter, an
//! optional ack byte group, and an optional explicit key-id when the
//! receiver cannot infer the session from its addr table slot. The receiver
//! widens the truncated counter against its replay window.

use veilguard_types::{
    ACK_HEADER_COUNTER_2, ACK_HEADER_COUNTER_4, ACK_HEADER_COUNTER_6, ACK_HEADER_COUNTER_MASK,
    ACK_HEADER_KEY_MASK, SHORT_HEADER_ACK, SHORT_HEADER_BIT, SHORT_HEADER_CTR1, SHORT_HEADER_CTR2,
    SHORT_HEADER_CTR4, SHORT_HEADER_KEY_ID_MASK, SHORT_HEADER_KEY_ID_SHIFT,
    SHORT_HEADER_TYPE_MASK,
};

/// How the receiver should find the session.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ShortKeyRef {
    /// Explicit key-id trailing the header.
    Explicit(u32),
    /// Addr-table slot index 0..3 at the receiver.
    Slot(u8),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ShortAck {
    /// Low bytes of the highest counter the sender saw from us, zero width
    /// when the ack byte only broadcasts a slot.
    pub acked_low: u64,
    pub acked_bytes: u8,
    /// "You occupy slot n-1 in my addr table", zero when not broadcast.
    pub key_slot_broadcast: u8,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ShortHeader {
    pub counter_low: u64,
    pub counter_bytes: u8,
    pub key: ShortKeyRef,
    pub ack: Option<ShortAck>,
}

/// Smallest counter width that still round-trips losslessly near `ctr`.
/// One byte of slack keeps the low bits unambiguous across small reorders.
fn counter_width(ctr: u64) -> u8 {
    if ctr < 0x80 {
        1
    } else if ctr < 0x8000 {
        2
    } else {
        4
    }
}

pub fn write_short_header(out: &mut Vec<u8>, ctr: u64, key: ShortKeyRef, ack: Option<ShortAck>) {
    let width = counter_width(ctr);
    let mut flags = SHORT_HEADER_BIT
        | match width {
            1 => SHORT_HEADER_CTR1,
            2 => SHORT_HEADER_CTR2,
            _ => SHORT_HEADER_CTR4,
        };
    if let ShortKeyRef::Slot(slot) = key {
        debug_assert!(slot < 3);
        flags |= (slot + 1) << SHORT_HEADER_KEY_ID_SHIFT;
    }
    if ack.is_some() {
        flags |= SHORT_HEADER_ACK;
    }
    out.push(flags);
    out.extend_from_slice(&ctr.to_le_bytes()[..width as usize]);

    if let Some(ack) = ack {
        debug_assert!(matches!(ack.acked_bytes, 0 | 2 | 4 | 6));
        let code = match ack.acked_bytes {
            2 => ACK_HEADER_COUNTER_2,
            4 => ACK_HEADER_COUNTER_4,
            6 => ACK_HEADER_COUNTER_6,
            _ => 0,
        };
        out.push(code | (ack.key_slot_broadcast & ACK_HEADER_KEY_MASK));
        out.extend_from_slice(&ack.acked_low.to_le_bytes()[..ack.acked_bytes as usize]);
    }

    if let ShortKeyRef::Explicit(id) = key {
        out.extend_from_slice(&id.to_le_bytes());
    }
}

/// Parses a short header, returning it and the header length.
pub fn parse_short_header(msg: &[u8]) -> Option<(ShortHeader, usize)> {
    let flags = *msg.first()?;
    if flags & SHORT_HEADER_BIT == 0 {
        return None;
    }
    let counter_bytes = match flags & SHORT_HEADER_TYPE_MASK {
        SHORT_HEADER_CTR1 => 1usize,
        SHORT_HEADER_CTR2 => 2,
        SHORT_HEADER_CTR4 => 4,
        _ => return None,
    };
    let mut off = 1;

    let mut ctr = [0u8; 8];
    ctr[..counter_bytes].copy_from_slice(msg.get(off..off + counter_bytes)?);
    let counter_low = u64::from_le_bytes(ctr);
    off += counter_bytes;

    let ack = if flags & SHORT_HEADER_ACK != 0 {
        let ack_flags = *msg.get(off)?;
        off += 1;
        let acked_bytes = match ack_flags & ACK_HEADER_COUNTER_MASK {
            ACK_HEADER_COUNTER_2 => 2usize,
            ACK_HEADER_COUNTER_4 => 4,
            ACK_HEADER_COUNTER_6 => 6,
            _ => 0,
        };
        let mut acked = [0u8; 8];
        acked[..acked_bytes].copy_from_slice(msg.get(off..off + acked_bytes)?);
        off += acked_bytes;
        Some(ShortAck {
            acked_low: u64::from_le_bytes(acked),
            acked_bytes: acked_bytes as u8,
            key_slot_broadcast: ack_flags & ACK_HEADER_KEY_MASK,
        })
    } else {
        None
    };

    let slot = (flags & SHORT_HEADER_KEY_ID_MASK) >> SHORT_HEADER_KEY_ID_SHIFT;
    let key = if slot == 0 {
        let id = msg.get(off..off + 4)?;
        off += 4;
        ShortKeyRef::Explicit(u32::from_le_bytes(id.try_into().unwrap()))
    } else {
        ShortKeyRef::Slot(slot - 1)
    };

    Some((
        ShortHeader {
            counter_low,
            counter_bytes: counter_bytes as u8,
            key,
            ack,
        },
        off,
    ))
}

/// Widens a truncated counter to the candidate closest to `expected`.
pub fn reconstruct_counter(expected: u64, low: u64, low_bytes: u8) -> u64 {
    if low_bytes >= 8 {
        return low;
    }
    let span = 1u64 << (low_bytes as u32 * 8);
    let half = span >> 1;

    let base = expected & !(span - 1);
    let candidate = base | low;
    if candidate.saturating_add(half) < expected {
        candidate.saturating_add(span)
    } else if candidate >= expected.saturating_add(half) && candidate >= span {
        candidate - span
    } else {
        candidate
    }
}

/// Returns the destination address of an L3 packet; the IP version comes
/// from the first nibble.
pub fn dst_ip(packet: &[u8]) -> Option<core::net::IpAddr> {
    match packet.first()? >> 4 {
        4 => {
            let octets: [u8; 4] = packet.get(16..20)?.try_into().unwrap();
            Some(core::net::IpAddr::V4(octets.into()))
        }
        6 => {
            let octets: [u8; 16] = packet.get(24..40)?.try_into().unwrap();
            Some(core::net::IpAddr::V6(octets.into()))
        }
        _ => None,
    }
}

/// Returns the source address of an L3 packet.
pub fn src_ip(packet: &[u8]) -> Option<core::net::IpAddr> {
    match packet.first()? >> 4 {
        4 => {
            let octets: [u8; 4] = packet.get(12..16)?.try_into().unwrap();
            Some(core::net::IpAddr::V4(octets.into()))
        }
        6 => {
            let octets: [u8; 16] = packet.get(8..24)?.try_into().unwrap();
            Some(core::net::IpAddr::V6(octets.into()))
        }
        _ => None,
    }
}

pub fn is_multicast_or_broadcast(ip: core::net::IpAddr) -> bool {
    match ip {
        core::net::IpAddr::V4(v4) => v4.is_multicast() || v4.is_broadcast(),
        core::net::IpAddr::V6(v6) => v6.is_multicast(),
    }
}

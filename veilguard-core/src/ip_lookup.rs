//! Longest-prefix match from tunnel addresses to peers.

use core::net::IpAddr;

use crate::PeerId;

/// A CIDR block a peer declared as its allowed source/destination range.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CidrAddr {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl CidrAddr {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Option<Self> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        (prefix_len <= max).then_some(Self { addr, prefix_len })
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - self.prefix_len as u32).unwrap_or(0);
                (net.to_bits() ^ ip.to_bits()) & mask == 0
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - self.prefix_len as u32).unwrap_or(0);
                (net.to_bits() ^ ip.to_bits()) & mask == 0
            }
            _ => false,
        }
    }
}

/// Routes by the most specific declared prefix. Entries are kept sorted by
/// descending prefix length so the first hit wins.
#[derive(Default)]
pub struct IpLookup {
    entries: Vec<(CidrAddr, PeerId)>,
}

impl IpLookup {
    pub fn insert(&mut self, cidr: CidrAddr, peer: PeerId) {
        self.entries.retain(|(c, _)| *c != cidr);
        let at = self
            .entries
            .partition_point(|(c, _)| c.prefix_len >= cidr.prefix_len);
        self.entries.insert(at, (cidr, peer));
    }

    pub fn lookup(&self, ip: IpAddr) -> Option<PeerId> {
        self.entries
            .iter()
            .find(|(c, _)| c.contains(ip))
            .map(|&(_, peer)| peer)
    }

    pub fn remove_peer(&mut self, peer: PeerId) {
        self.entries.retain(|&(_, p)| p != peer);
    }

    /// Whether the peer declared a range containing `ip`. Inbound packets
    /// whose inner source fails this check are spoofed and dropped.
    pub fn peer_owns(&self, peer: PeerId, ip: IpAddr) -> bool {
        self.lookup(ip) == Some(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str, len: u8) -> CidrAddr {
        CidrAddr::new(s.parse().unwrap(), len).unwrap()
    }

    #[test]
    fn longest_prefix_wins() {
        let mut map = IpLookup::default();
        map.insert(cidr("10.0.0.0", 8), PeerId(0));
        map.insert(cidr("10.1.0.0", 16), PeerId(1));
        map.insert(cidr("10.1.2.0", 24), PeerId(2));

        assert_eq!(map.lookup("10.9.9.9".parse().unwrap()), Some(PeerId(0)));
        assert_eq!(map.lookup("10.1.9.9".parse().unwrap()), Some(PeerId(1)));
        assert_eq!(map.lookup("10.1.2.9".parse().unwrap()), Some(PeerId(2)));
        assert_eq!(map.lookup("192.168.0.1".parse().unwrap()), None);
    }

    #[test]
    fn default_route_and_v6() {
        let mut map = IpLookup::default();
        map.insert(cidr("0.0.0.0", 0), PeerId(7));
        map.insert(cidr("fd00::", 8), PeerId(8));

        assert_eq!(map.lookup("8.8.8.8".parse().unwrap()), Some(PeerId(7)));
        assert_eq!(map.lookup("fd00::123".parse().unwrap()), Some(PeerId(8)));
        // v4 routes never capture v6 traffic
        assert_eq!(map.lookup("2001:db8::1".parse().unwrap()), None);
    }

    #[test]
    fn remove_and_ownership() {
        let mut map = IpLookup::default();
        map.insert(cidr("10.0.0.0", 24), PeerId(0));
        map.insert(cidr("10.0.1.0", 24), PeerId(1));

        assert!(map.peer_owns(PeerId(0), "10.0.0.5".parse().unwrap()));
        assert!(!map.peer_owns(PeerId(1), "10.0.0.5".parse().unwrap()));

        map.remove_peer(PeerId(0));
        assert_eq!(map.lookup("10.0.0.5".parse().unwrap()), None);
    }
}

//! Two in-process devices talking to each other, no sockets involved.
//!
//! Shows the sans-IO driving pattern: feed datagrams in with
//! `recv_datagram`, drain auxiliary traffic with `poll_transmit`.

use std::time::Duration;

use rand::rngs::OsRng;
use tai64::Tai64N;
use veilguard_core::{
    CidrAddr, Device, MainThread, PublicKey, RecvEvent, SendOutcome, StaticSecret,
};

fn main() {
    let now = Tai64N::UNIX_EPOCH + Duration::from_secs(1_700_000_000);

    let a_secret = StaticSecret::random_from_rng(OsRng);
    let b_secret = StaticSecret::random_from_rng(OsRng);
    let a_public = PublicKey::from(&a_secret);
    let b_public = PublicKey::from(&b_secret);

    let mt = MainThread::claim();
    let a = Device::new(a_secret, &mut OsRng);
    let b = Device::new(b_secret, &mut OsRng);

    let b_on_a = a.add_peer(&mt, b_public, None);
    a.set_endpoint(b_on_a, "127.0.0.1:51821".parse().unwrap());
    a.add_allowed_ip(&mt, b_on_a, CidrAddr::new("10.0.0.2".parse().unwrap(), 32).unwrap());

    let a_on_b = b.add_peer(&mt, a_public, None);
    b.add_allowed_ip(&mt, a_on_b, CidrAddr::new("10.0.0.1".parse().unwrap(), 32).unwrap());

    // a tiny IPv4 packet from A's tunnel address to B's
    let mut packet = vec![0u8; 28];
    packet[0] = 0x45;
    packet[12..16].copy_from_slice(&[10, 0, 0, 1]);
    packet[16..20].copy_from_slice(&[10, 0, 0, 2]);

    // no session yet: the packet queues and a handshake goes out
    assert!(matches!(
        a.send_packet(&packet, now).unwrap(),
        SendOutcome::Buffered
    ));
    let (_, mut init) = a.poll_transmit().unwrap();
    println!("initiation: {} bytes", init.len());

    let a_addr = "127.0.0.1:51820".parse().unwrap();
    let b_addr = "127.0.0.1:51821".parse().unwrap();

    let mut resp = match b.recv_datagram(a_addr, &mut init, now).unwrap() {
        RecvEvent::WriteBack(resp) => resp.to_vec(),
        _ => unreachable!(),
    };
    println!("response: {} bytes", resp.len());

    match a.recv_datagram(b_addr, &mut resp, now).unwrap() {
        RecvEvent::HandshakeComplete(peer) => println!("handshake complete with {peer:?}"),
        _ => unreachable!(),
    }

    // the queued packet was flushed through the fresh session
    let (_, mut data) = a.poll_transmit().unwrap();
    println!("data: {} bytes", data.len());

    match b.recv_datagram(a_addr, &mut data, now).unwrap() {
        RecvEvent::Deliver { packet: inner, .. } => {
            assert_eq!(inner, &packet[..]);
            println!("delivered {} plaintext bytes", inner.len());
        }
        _ => unreachable!(),
    }
}

//! End-to-end scenarios driven entirely through [`NetStack`]'s public API
//! and a [`LoopbackDevice`], exercising the same request/reply round trips
//! a real tap device would see.

use std::cell::RefCell;
use std::rc::Rc;

use netstack::net::device::LoopbackDevice;
use netstack::net::tcp::{TcpEvent, TcpKey};
use netstack::net::types::{IpProtocol, Ipv4Addr, MacAddr, Port};
use netstack::{Config, NetStack};

const LOCAL: Config = Config::new(MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]), Ipv4Addr([10, 0, 0, 2]));
const PEER_MAC: MacAddr = MacAddr([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
const PEER_IP: Ipv4Addr = Ipv4Addr([10, 0, 0, 1]);

/// Surface the stack's `debug`/`warn` drop-reason logging under `RUST_LOG`
/// when running these scenarios; harmless to call more than once.
fn init_logging() {
    let _ = env_logger::try_init();
}

fn ipv4_checksum(header: &mut [u8; 20]) {
    header[10] = 0;
    header[11] = 0;
    let mut sum = 0u32;
    for chunk in header.chunks(2) {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    let csum = !(sum as u16);
    header[10..12].copy_from_slice(&csum.to_be_bytes());
}

fn pseudo_header_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let mut sum = 0u32;
    sum += u16::from_be_bytes([src.as_bytes()[0], src.as_bytes()[1]]) as u32;
    sum += u16::from_be_bytes([src.as_bytes()[2], src.as_bytes()[3]]) as u32;
    sum += u16::from_be_bytes([dst.as_bytes()[0], dst.as_bytes()[1]]) as u32;
    sum += u16::from_be_bytes([dst.as_bytes()[2], dst.as_bytes()[3]]) as u32;
    sum += protocol as u32;
    sum += segment.len() as u32;
    let mut i = 0;
    while i + 1 < segment.len() {
        sum += u16::from_be_bytes([segment[i], segment[i + 1]]) as u32;
        i += 2;
    }
    if i < segment.len() {
        sum += (segment[i] as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn ip_frame(protocol: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; 14 + 20 + payload.len()];
    frame[0..6].copy_from_slice(LOCAL.mac.as_bytes());
    frame[6..12].copy_from_slice(PEER_MAC.as_bytes());
    frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());

    let mut hdr = [0u8; 20];
    hdr[0] = 0x45;
    hdr[2..4].copy_from_slice(&((20 + payload.len()) as u16).to_be_bytes());
    hdr[8] = 64;
    hdr[9] = protocol;
    hdr[12..16].copy_from_slice(PEER_IP.as_bytes());
    hdr[16..20].copy_from_slice(LOCAL.ip.as_bytes());
    ipv4_checksum(&mut hdr);

    frame[14..34].copy_from_slice(&hdr);
    frame[34..].copy_from_slice(payload);
    frame
}

fn arp_reply_frame() -> Vec<u8> {
    let mut frame = vec![0u8; 14 + 28];
    frame[0..6].copy_from_slice(LOCAL.mac.as_bytes());
    frame[6..12].copy_from_slice(PEER_MAC.as_bytes());
    frame[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
    let pkt = &mut frame[14..];
    pkt[0..2].copy_from_slice(&1u16.to_be_bytes());
    pkt[2..4].copy_from_slice(&0x0800u16.to_be_bytes());
    pkt[4] = 6;
    pkt[5] = 4;
    pkt[6..8].copy_from_slice(&2u16.to_be_bytes());
    pkt[8..14].copy_from_slice(PEER_MAC.as_bytes());
    pkt[14..18].copy_from_slice(PEER_IP.as_bytes());
    pkt[18..24].copy_from_slice(LOCAL.mac.as_bytes());
    pkt[24..28].copy_from_slice(LOCAL.ip.as_bytes());
    frame
}

/// Scenario 1 & 2: an outbound datagram to an unresolved peer broadcasts an
/// ARP request and is queued; a subsequent reply drains the queue.
#[test]
fn arp_request_then_reply_drains_the_queued_datagram() {
    init_logging();
    let mut stack = NetStack::new(LoopbackDevice::new(), LOCAL);
    stack.udp_send(Port::new(5000), PEER_IP, Port::new(6000), b"queued");

    assert_eq!(stack.device().sent.len(), 1, "unresolved send issues exactly one ARP request");
    let request = &stack.device().sent[0];
    assert_eq!(&request[0..6], MacAddr::BROADCAST.as_bytes());
    let arp_pkt = &request[14..];
    assert_eq!(u16::from_be_bytes([arp_pkt[6], arp_pkt[7]]), 1, "opcode is request");
    assert_eq!(&arp_pkt[8..14], LOCAL.mac.as_bytes(), "sender MAC");
    assert_eq!(&arp_pkt[14..18], LOCAL.ip.as_bytes(), "sender IP");
    assert_eq!(&arp_pkt[24..28], PEER_IP.as_bytes(), "target IP");

    stack.device_mut().inject(arp_reply_frame());
    assert!(stack.poll());

    assert_eq!(stack.device().sent.len(), 2, "the reply drains the queued datagram as a second frame");
    let drained = &stack.device().sent[1];
    assert_eq!(&drained[0..6], PEER_MAC.as_bytes());
    assert_eq!(&drained[34..], b"queued");
}

/// Scenario 3: an Echo Request gets an Echo Reply with the same id/seq/payload.
#[test]
fn icmp_echo_request_gets_a_reply() {
    init_logging();
    let mut stack = NetStack::new(LoopbackDevice::new(), LOCAL);
    stack.device_mut().inject(arp_reply_frame());
    assert!(stack.poll());

    let mut icmp_msg = vec![8u8, 0, 0, 0, 0, 1, 0, 2];
    icmp_msg.extend_from_slice(b"AAAABBBBCCCCDDDDEEEEFFFFGGGGHHHH");
    let csum = {
        let mut sum = 0u32;
        let mut i = 0;
        while i + 1 < icmp_msg.len() {
            sum += u16::from_be_bytes([icmp_msg[i], icmp_msg[i + 1]]) as u32;
            i += 2;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        !(sum as u16)
    };
    icmp_msg[2..4].copy_from_slice(&csum.to_be_bytes());

    stack.device_mut().inject(ip_frame(IpProtocol::Icmp.as_u8(), &icmp_msg));
    assert!(stack.poll());

    let sent = &stack.device().sent;
    let reply = sent.last().unwrap();
    let icmp_reply = &reply[34..];
    assert_eq!(icmp_reply[0], 0); // Echo Reply
    assert_eq!(&icmp_reply[4..8], &icmp_msg[4..8]); // same id/seq
    assert_eq!(&icmp_reply[8..], &icmp_msg[8..]); // same payload
}

/// Scenario 4: UDP to an unbound port gets ICMP Port Unreachable.
#[test]
fn udp_to_unbound_port_gets_port_unreachable() {
    init_logging();
    let mut stack = NetStack::new(LoopbackDevice::new(), LOCAL);
    stack.device_mut().inject(arp_reply_frame());
    assert!(stack.poll());

    let mut datagram = vec![0u8; 8 + 4];
    datagram[0..2].copy_from_slice(&4000u16.to_be_bytes());
    datagram[2..4].copy_from_slice(&9999u16.to_be_bytes());
    datagram[4..6].copy_from_slice(&12u16.to_be_bytes());
    datagram[8..].copy_from_slice(b"nope");
    let csum = pseudo_header_checksum(PEER_IP, LOCAL.ip, 17, &datagram);
    datagram[6..8].copy_from_slice(&csum.to_be_bytes());

    stack.device_mut().inject(ip_frame(IpProtocol::Udp.as_u8(), &datagram));
    assert!(stack.poll());

    let reply = stack.device().sent.last().unwrap();
    let icmp_msg = &reply[34..];
    assert_eq!(icmp_msg[0], 3); // Destination Unreachable
    assert_eq!(icmp_msg[1], 3); // Port Unreachable
}

/// Scenario 4b (positive case): a datagram to a bound port reaches its handler.
#[test]
fn udp_to_bound_port_reaches_the_handler() {
    init_logging();
    let mut stack = NetStack::new(LoopbackDevice::new(), LOCAL);
    let received = Rc::new(RefCell::new(None));
    let received_clone = received.clone();
    stack
        .udp_open(Port::new(9000), move |ip, port, data| {
            *received_clone.borrow_mut() = Some((ip, port, data.to_vec()));
        })
        .unwrap();

    let mut datagram = vec![0u8; 8 + 5];
    datagram[0..2].copy_from_slice(&4000u16.to_be_bytes());
    datagram[2..4].copy_from_slice(&9000u16.to_be_bytes());
    datagram[4..6].copy_from_slice(&13u16.to_be_bytes());
    datagram[8..].copy_from_slice(b"howdy");
    let csum = pseudo_header_checksum(PEER_IP, LOCAL.ip, 17, &datagram);
    datagram[6..8].copy_from_slice(&csum.to_be_bytes());

    stack.device_mut().inject(ip_frame(IpProtocol::Udp.as_u8(), &datagram));
    assert!(stack.poll());

    let (ip, port, payload) = received.borrow().clone().unwrap();
    assert_eq!(ip, PEER_IP);
    assert_eq!(port, Port::new(4000));
    assert_eq!(payload, b"howdy");
}

/// Scenario 6: a 3000-byte UDP payload fragments into three IP datagrams.
#[test]
fn large_udp_payload_fragments_on_send() {
    init_logging();
    let mut stack = NetStack::new(LoopbackDevice::new(), LOCAL);
    stack.device_mut().inject(arp_reply_frame());
    assert!(stack.poll());

    stack.udp_send(Port::new(5353), PEER_IP, Port::new(6000), &vec![0xABu8; 3000]);

    let sent = &stack.device().sent;
    assert_eq!(sent.len(), 3);
    let sizes: Vec<usize> = sent.iter().map(|f| f.len() - 14 - 20).collect();
    assert_eq!(sizes, vec![1480, 1480, 48]); // 1480 + 1480 + (8-byte UDP header + 40 bytes)

    let ids: Vec<u16> = sent.iter().map(|f| u16::from_be_bytes([f[18], f[19]])).collect();
    assert_eq!(ids[0], ids[1]);
    assert_eq!(ids[1], ids[2]);
}

/// Scenario 5: full TCP handshake, data exchange, and passive close.
#[test]
fn tcp_handshake_data_and_close() {
    init_logging();
    let mut stack = NetStack::new(LoopbackDevice::new(), LOCAL);
    stack.device_mut().inject(arp_reply_frame());
    assert!(stack.poll());

    let events = Rc::new(RefCell::new(Vec::new()));
    let events_clone = events.clone();
    stack.tcp_open(Port::new(7), move |_conn, ev| events_clone.borrow_mut().push(ev)).unwrap();

    let build_segment = |seq: u32, ack: u32, flags: u8, payload: &[u8]| -> Vec<u8> {
        let mut seg = vec![0u8; 20 + payload.len()];
        seg[0..2].copy_from_slice(&4000u16.to_be_bytes());
        seg[2..4].copy_from_slice(&7u16.to_be_bytes());
        seg[4..8].copy_from_slice(&seq.to_be_bytes());
        seg[8..12].copy_from_slice(&ack.to_be_bytes());
        seg[12] = 5 << 4;
        seg[13] = flags;
        seg[14..16].copy_from_slice(&4096u16.to_be_bytes());
        seg[20..].copy_from_slice(payload);
        let csum = pseudo_header_checksum(PEER_IP, LOCAL.ip, 6, &seg);
        seg[16..18].copy_from_slice(&csum.to_be_bytes());
        seg
    };

    // Peer sends SYN(seq=1000).
    stack.device_mut().inject(ip_frame(IpProtocol::Tcp.as_u8(), &build_segment(1000, 0, 0b0000_0010, &[])));
    assert!(stack.poll());
    let syn_ack = stack.device().sent.last().unwrap().clone();
    let syn_ack_tcp = &syn_ack[34..];
    assert_eq!(u32::from_be_bytes([syn_ack_tcp[8], syn_ack_tcp[9], syn_ack_tcp[10], syn_ack_tcp[11]]), 1001);
    assert_eq!(syn_ack_tcp[13], 0b0001_0010); // SYN|ACK
    let isn = u32::from_be_bytes([syn_ack_tcp[4], syn_ack_tcp[5], syn_ack_tcp[6], syn_ack_tcp[7]]);

    let key: TcpKey = (PEER_IP, Port::new(4000), Port::new(7));

    // Peer ACKs the handshake.
    stack.device_mut().inject(ip_frame(IpProtocol::Tcp.as_u8(), &build_segment(1001, isn + 1, 0b0001_0000, &[])));
    assert!(stack.poll());
    assert_eq!(*events.borrow(), vec![TcpEvent::Connected]);

    // Peer sends "hello".
    stack.device_mut().inject(ip_frame(IpProtocol::Tcp.as_u8(), &build_segment(1001, isn + 1, 0b0001_0000, b"hello")));
    assert!(stack.poll());
    assert_eq!(*events.borrow(), vec![TcpEvent::Connected, TcpEvent::DataRecv]);

    let mut readback = [0u8; 5];
    assert_eq!(stack.tcp_connect_read(&key, &mut readback), 5);
    assert_eq!(&readback, b"hello");

    // Peer sends FIN.
    stack.device_mut().inject(ip_frame(IpProtocol::Tcp.as_u8(), &build_segment(1006, isn + 1, 0b0001_0001, &[])));
    assert!(stack.poll());
    let fin_ack = stack.device().sent.last().unwrap().clone();
    let fin_ack_tcp = &fin_ack[34..];
    assert_eq!(fin_ack_tcp[13], 0b0001_0001); // FIN|ACK
    assert_eq!(u32::from_be_bytes([fin_ack_tcp[8], fin_ack_tcp[9], fin_ack_tcp[10], fin_ack_tcp[11]]), 1007);

    // Peer's final ACK closes the connection.
    stack.device_mut().inject(ip_frame(IpProtocol::Tcp.as_u8(), &build_segment(1007, isn + 2, 0b0001_0000, &[])));
    assert!(stack.poll());
    assert_eq!(*events.borrow(), vec![TcpEvent::Connected, TcpEvent::DataRecv, TcpEvent::Closed]);
    assert_eq!(stack.tcp_connect_read(&key, &mut readback), 0, "connection is gone");
}

//! IPv4 — header validation/demux on ingress, fragmentation on egress.
//!
//! Routing and multi-interface support are out of scope: every outbound
//! datagram either targets the local address directly or goes through ARP
//! for the single configured interface, so there is no routing table here,
//! only the ARP resolve-or-queue step in [`super::arp`].

use log::debug;

use super::arp::{arp_in, arp_out, ArpTable};
use super::buf::Buffer;
use super::checksum;
use super::device::LinkDevice;
use super::icmp::{icmp_in, icmp_unreachable, CODE_PROTOCOL_UNREACHABLE};
use super::tcp::{self, TcpConnectionTable};
use super::types::{IpProtocol, Ipv4Addr};
use super::udp::{self, UdpTable};
use crate::config::Config;

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV4_VERSION: u8 = 4;
pub const DEFAULT_TTL: u8 = 64;
/// Ethernet MTU (1500) minus the IPv4 header; the largest single fragment body.
pub const MAX_FRAGMENT_BODY: usize = 1480;

struct Ipv4Header {
    total_len: u16,
    id: u16,
    flags: u8,
    frag_offset: u16,
    /// Raw IP protocol number; resolved to a known [`IpProtocol`] (or not) in
    /// [`ip_in`], which is the only place that needs to tell "unsupported
    /// protocol" apart from "malformed header".
    protocol_raw: u8,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    header_len: usize,
}

fn parse_header(packet: &[u8]) -> Option<Ipv4Header> {
    if packet.len() < IPV4_HEADER_LEN {
        debug!("ipv4: packet shorter than minimum header, dropping");
        return None;
    }
    let version = packet[0] >> 4;
    let ihl = (packet[0] & 0x0f) as usize * 4;
    if version != IPV4_VERSION || ihl < IPV4_HEADER_LEN || ihl > packet.len() {
        debug!("ipv4: bad version/IHL, dropping");
        return None;
    }
    let total_len = u16::from_be_bytes([packet[2], packet[3]]);
    if (total_len as usize) > packet.len() {
        debug!("ipv4: total_len exceeds frame, dropping");
        return None;
    }
    if checksum::checksum16(&packet[..ihl]) != 0 {
        debug!("ipv4: header checksum mismatch, dropping");
        return None;
    }
    let id = u16::from_be_bytes([packet[4], packet[5]]);
    let flags_frag = u16::from_be_bytes([packet[6], packet[7]]);
    let flags = (flags_frag >> 13) as u8;
    let frag_offset = flags_frag & 0x1fff;
    let src = Ipv4Addr([packet[12], packet[13], packet[14], packet[15]]);
    let dst = Ipv4Addr([packet[16], packet[17], packet[18], packet[19]]);

    Some(Ipv4Header {
        total_len,
        id,
        flags,
        frag_offset,
        protocol_raw: packet[9],
        src,
        dst,
        header_len: ihl,
    })
}

/// Handle one inbound IPv4 packet (Ethernet payload). Reassembly of incoming
/// fragments is not implemented — a fragmented datagram is logged and dropped.
#[allow(clippy::too_many_arguments)]
pub fn ip_in(
    device: &mut dyn LinkDevice,
    arp: &mut ArpTable,
    config: &Config,
    ip_id: &mut u16,
    udp_table: &mut UdpTable,
    tcp_table: &mut TcpConnectionTable,
    packet: &[u8],
) {
    let Some(hdr) = parse_header(packet) else {
        return;
    };
    if hdr.dst != config.ip {
        debug!("ipv4: packet not addressed to us, dropping");
        return;
    }
    let more_fragments = hdr.flags & 0b001 != 0;
    if more_fragments || hdr.frag_offset != 0 {
        debug!("ipv4: fragmented datagram (id={}), reassembly unsupported, dropping", hdr.id);
        return;
    }

    let ip_header = &packet[..hdr.header_len];
    let payload = &packet[hdr.header_len..hdr.total_len as usize];
    match IpProtocol::from_u8(hdr.protocol_raw) {
        Some(IpProtocol::Icmp) => icmp_in(device, arp, config, ip_id, payload, hdr.src),
        Some(IpProtocol::Udp) => udp::udp_in(device, arp, config, ip_id, udp_table, ip_header, payload, hdr.src),
        Some(IpProtocol::Tcp) => tcp::tcp_in(device, arp, config, ip_id, tcp_table, payload, hdr.src),
        None => {
            debug!("ipv4: unsupported protocol {}, sending protocol-unreachable", hdr.protocol_raw);
            let quoted = &packet[..hdr.total_len as usize];
            icmp_unreachable(device, arp, config, ip_id, hdr.src, CODE_PROTOCOL_UNREACHABLE, quoted);
        }
    }
}

fn write_header(hdr_bytes: &mut [u8], total_len: u16, id: u16, flags: u8, frag_offset: u16, ttl: u8, protocol: u8, src: Ipv4Addr, dst: Ipv4Addr) {
    hdr_bytes[0] = (IPV4_VERSION << 4) | ((IPV4_HEADER_LEN / 4) as u8);
    hdr_bytes[1] = 0;
    hdr_bytes[2..4].copy_from_slice(&total_len.to_be_bytes());
    hdr_bytes[4..6].copy_from_slice(&id.to_be_bytes());
    let flags_frag = ((flags as u16) << 13) | frag_offset;
    hdr_bytes[6..8].copy_from_slice(&flags_frag.to_be_bytes());
    hdr_bytes[8] = ttl;
    hdr_bytes[9] = protocol;
    hdr_bytes[10..12].copy_from_slice(&[0, 0]);
    hdr_bytes[12..16].copy_from_slice(src.as_bytes());
    hdr_bytes[16..20].copy_from_slice(dst.as_bytes());
    let csum = checksum::checksum16(&hdr_bytes[..IPV4_HEADER_LEN]);
    hdr_bytes[10..12].copy_from_slice(&csum.to_be_bytes());
}

/// Send `buf` (an already-built transport-layer segment/datagram) to `dst_ip`,
/// fragmenting into [`MAX_FRAGMENT_BODY`]-byte chunks (offsets counted in
/// 8-byte units) if it does not fit in one. All fragments of one datagram
/// share `*ip_id`; it is advanced by exactly one once the whole datagram has
/// gone out.
pub fn ip_out(device: &mut dyn LinkDevice, arp: &mut ArpTable, config: &Config, ip_id: &mut u16, buf: Buffer, dst_ip: Ipv4Addr, protocol: IpProtocol) {
    let payload = buf.data();
    let id = *ip_id;
    if payload.len() <= MAX_FRAGMENT_BODY {
        let mut out = Buffer::from_bytes(payload);
        if let Ok(hdr) = out.add_header(IPV4_HEADER_LEN) {
            write_header(hdr, (IPV4_HEADER_LEN + payload.len()) as u16, id, 0, 0, DEFAULT_TTL, protocol.as_u8(), config.ip, dst_ip);
            arp_out(arp, device, config, out, dst_ip);
        }
        *ip_id = ip_id.wrapping_add(1);
        return;
    }

    let mut offset = 0usize;
    while offset < payload.len() {
        let remaining = payload.len() - offset;
        let chunk_len = remaining.min(MAX_FRAGMENT_BODY);
        let more = offset + chunk_len < payload.len();
        let flags = if more { 0b001 } else { 0 };
        let frag_offset = (offset / 8) as u16;

        let mut out = Buffer::from_bytes(&payload[offset..offset + chunk_len]);
        if let Ok(hdr) = out.add_header(IPV4_HEADER_LEN) {
            write_header(hdr, (IPV4_HEADER_LEN + chunk_len) as u16, id, flags, frag_offset, DEFAULT_TTL, protocol.as_u8(), config.ip, dst_ip);
            arp_out(arp, device, config, out, dst_ip);
        }
        offset += chunk_len;
    }
    *ip_id = ip_id.wrapping_add(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::device::LoopbackDevice;
    use crate::net::types::MacAddr;

    const LOCAL: Config = Config::new(MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]), Ipv4Addr([10, 0, 0, 2]));
    const PEER_MAC: MacAddr = MacAddr([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    const PEER_IP: Ipv4Addr = Ipv4Addr([10, 0, 0, 1]);

    fn resolved_arp() -> ArpTable {
        let mut arp = ArpTable::new();
        let mut dev = LoopbackDevice::new();
        // Prime the table by feeding in a reply so lookups resolve immediately.
        super::super::arp::arp_in(
            &mut arp,
            &mut dev,
            &LOCAL,
            &build_arp_reply(),
            PEER_MAC,
        );
        arp
    }

    fn build_arp_reply() -> Vec<u8> {
        let mut pkt = vec![0u8; 28];
        pkt[0..2].copy_from_slice(&1u16.to_be_bytes());
        pkt[2..4].copy_from_slice(&0x0800u16.to_be_bytes());
        pkt[4] = 6;
        pkt[5] = 4;
        pkt[6..8].copy_from_slice(&2u16.to_be_bytes());
        pkt[8..14].copy_from_slice(PEER_MAC.as_bytes());
        pkt[14..18].copy_from_slice(PEER_IP.as_bytes());
        pkt[18..24].copy_from_slice(LOCAL.mac.as_bytes());
        pkt[24..28].copy_from_slice(LOCAL.ip.as_bytes());
        pkt
    }

    #[test]
    fn small_payload_goes_out_unfragmented() {
        let mut arp = resolved_arp();
        let mut dev = LoopbackDevice::new();
        let mut ip_id = 5u16;
        let buf = Buffer::from_bytes(b"hello");
        ip_out(&mut dev, &mut arp, &LOCAL, &mut ip_id, buf, PEER_IP, IpProtocol::Udp);

        assert_eq!(dev.sent.len(), 1);
        let ip_pkt = &dev.sent[0][14..];
        assert_eq!(u16::from_be_bytes([ip_pkt[4], ip_pkt[5]]), 5);
        assert_eq!(&ip_pkt[20..25], b"hello");
        assert_eq!(ip_id, 6);
    }

    #[test]
    fn oversized_payload_splits_into_three_fragments_per_scenario_6() {
        let mut arp = resolved_arp();
        let mut dev = LoopbackDevice::new();
        let mut ip_id = 0u16;
        let payload = vec![0xABu8; 3000];
        let buf = Buffer::from_bytes(&payload);
        ip_out(&mut dev, &mut arp, &LOCAL, &mut ip_id, buf, PEER_IP, IpProtocol::Udp);

        assert_eq!(dev.sent.len(), 3);
        let sizes: Vec<usize> = dev.sent.iter().map(|f| f.len() - 14 - IPV4_HEADER_LEN).collect();
        assert_eq!(sizes, vec![1480, 1480, 40]);

        let offsets: Vec<u16> = dev
            .sent
            .iter()
            .map(|f| {
                let flags_frag = u16::from_be_bytes([f[14 + 6], f[14 + 7]]);
                flags_frag & 0x1fff
            })
            .collect();
        assert_eq!(offsets, vec![0, 185, 370]);

        let more_flags: Vec<bool> = dev
            .sent
            .iter()
            .map(|f| {
                let flags_frag = u16::from_be_bytes([f[14 + 6], f[14 + 7]]);
                (flags_frag >> 13) & 0b001 != 0
            })
            .collect();
        assert_eq!(more_flags, vec![true, true, false]);

        for frame in &dev.sent {
            let ip_pkt = &frame[14..];
            assert_eq!(u16::from_be_bytes([ip_pkt[4], ip_pkt[5]]), 0);
        }
        assert_eq!(ip_id, 1);
    }

    #[test]
    fn malformed_header_is_dropped_silently() {
        let mut dev = LoopbackDevice::new();
        let mut arp = ArpTable::new();
        let mut udp_table = UdpTable::default();
        let mut tcp_table = TcpConnectionTable::new();
        let mut ip_id = 0u16;
        ip_in(&mut dev, &mut arp, &LOCAL, &mut ip_id, &mut udp_table, &mut tcp_table, &[0u8; 4]);
        assert!(dev.sent.is_empty());
    }

    #[test]
    fn unsupported_protocol_gets_icmp_protocol_unreachable() {
        let mut dev = LoopbackDevice::new();
        let mut arp = resolved_arp();
        let mut udp_table = UdpTable::default();
        let mut tcp_table = TcpConnectionTable::new();
        let mut ip_id = 0u16;

        let mut pkt = [0u8; 24];
        pkt[0] = (IPV4_VERSION << 4) | 5;
        pkt[2..4].copy_from_slice(&24u16.to_be_bytes());
        pkt[8] = DEFAULT_TTL;
        pkt[9] = 99; // no handler for this protocol number
        pkt[12..16].copy_from_slice(PEER_IP.as_bytes());
        pkt[16..20].copy_from_slice(LOCAL.ip.as_bytes());
        let csum = checksum::checksum16(&pkt[..20]);
        pkt[10..12].copy_from_slice(&csum.to_be_bytes());

        ip_in(&mut dev, &mut arp, &LOCAL, &mut ip_id, &mut udp_table, &mut tcp_table, &pkt);

        assert_eq!(dev.sent.len(), 1);
        let ip_pkt = &dev.sent[0][14..];
        assert_eq!(ip_pkt[20], 3); // Destination Unreachable
        assert_eq!(ip_pkt[21], 2); // Protocol Unreachable
    }
}

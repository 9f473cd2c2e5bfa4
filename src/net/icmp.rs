//! ICMP — echo request/reply only (RFC 792 §3.6). No other ICMP message
//! types are generated or interpreted; unreachable notifications sent by
//! UDP live in [`super::udp`], which calls [`icmp_unreachable`] directly.

use log::debug;

use super::arp::{arp_out, ArpTable};
use super::buf::Buffer;
use super::checksum;
use super::device::LinkDevice;
use super::ipv4::ip_out;
use super::types::{IpProtocol, Ipv4Addr};
use crate::config::Config;

const ICMP_HEADER_LEN: usize = 8;
const ECHO_REQUEST_PAYLOAD_LEN: usize = 32;
const TYPE_ECHO_REPLY: u8 = 0;
const TYPE_ECHO_REQUEST: u8 = 8;
const TYPE_DEST_UNREACHABLE: u8 = 3;
/// Sent by [`super::ipv4::ip_in`] when the IP protocol field names nothing
/// this stack demultiplexes (only ICMP/UDP/TCP are handled).
pub const CODE_PROTOCOL_UNREACHABLE: u8 = 2;
/// Sent by [`super::udp::udp_in`] when no handler is bound to the destination port.
pub const CODE_PORT_UNREACHABLE: u8 = 3;

fn build_message(msg_type: u8, code: u8, rest_of_header: [u8; 4], body: &[u8]) -> Buffer {
    let mut buf = Buffer::from_bytes(body);
    let hdr = buf.add_header(ICMP_HEADER_LEN).expect("fresh buffer has headroom");
    hdr[0] = msg_type;
    hdr[1] = code;
    hdr[2..4].copy_from_slice(&[0, 0]);
    hdr[4..8].copy_from_slice(&rest_of_header);
    let csum = checksum::checksum16(buf.data());
    buf.data_mut()[2..4].copy_from_slice(&csum.to_be_bytes());
    buf
}

/// Handle an inbound ICMP message. Only echo requests addressed to us get a
/// reply; everything else (including echo replies, since this stack never
/// originates pings) is logged and dropped.
pub fn icmp_in(device: &mut dyn LinkDevice, arp: &mut ArpTable, config: &Config, ip_id: &mut u16, payload: &[u8], src_ip: Ipv4Addr) {
    if payload.len() < ICMP_HEADER_LEN {
        debug!("icmp: message shorter than header, dropping");
        return;
    }
    let msg_type = payload[0];
    if msg_type != TYPE_ECHO_REQUEST {
        debug!("icmp: type {msg_type} not handled, dropping");
        return;
    }
    let rest_of_header = [payload[4], payload[5], payload[6], payload[7]];
    let body = &payload[ICMP_HEADER_LEN..];
    let reply = build_message(TYPE_ECHO_REPLY, 0, rest_of_header, body);
    ip_out(device, arp, config, ip_id, reply, src_ip, IpProtocol::Icmp);
}

/// Send a Destination Unreachable message with the given `code`, quoting the
/// start of `offending_ip_packet` (the IPv4 header plus leading payload
/// bytes of the datagram that could not be delivered).
pub fn icmp_unreachable(
    device: &mut dyn LinkDevice,
    arp: &mut ArpTable,
    config: &Config,
    ip_id: &mut u16,
    dst_ip: Ipv4Addr,
    code: u8,
    offending_ip_packet: &[u8],
) {
    let quote_len = offending_ip_packet.len().min(28);
    let msg = build_message(TYPE_DEST_UNREACHABLE, code, [0; 4], &offending_ip_packet[..quote_len]);
    ip_out(device, arp, config, ip_id, msg, dst_ip, IpProtocol::Icmp);
}

/// Send an Echo Request carrying a 32-byte payload whose leading 8 bytes are
/// an opaque RTT timestamp tag, echoed back verbatim in the peer's reply.
/// Used by a ping-style client built on top of this stack (out of scope here).
pub fn icmp_req(device: &mut dyn LinkDevice, arp: &mut ArpTable, config: &Config, ip_id: &mut u16, id: u16, seq: u16, tag: u64, dst_ip: Ipv4Addr) {
    let mut body = [0u8; ECHO_REQUEST_PAYLOAD_LEN];
    body[0..8].copy_from_slice(&tag.to_be_bytes());
    let rest_of_header = [(id >> 8) as u8, id as u8, (seq >> 8) as u8, seq as u8];
    let req = build_message(TYPE_ECHO_REQUEST, 0, rest_of_header, &body);
    ip_out(device, arp, config, ip_id, req, dst_ip, IpProtocol::Icmp);
}

//! UDP (RFC 768) — stateless datagram demux on a table of bound ports.
//!
//! A "connection" here is just a registered handler for a local port; there
//! is no session state, so [`udp_in`] is a single lookup-and-call.

use std::collections::HashMap;

use log::debug;

use super::arp::{arp_out, ArpTable};
use super::buf::Buffer;
use super::checksum;
use super::device::LinkDevice;
use super::icmp::icmp_unreachable;
use super::ipv4::ip_out;
use super::types::{IpProtocol, Ipv4Addr, Port};
use crate::config::Config;
use crate::error::NetError;

pub const UDP_HEADER_LEN: usize = 8;

type UdpHandler = Box<dyn FnMut(Ipv4Addr, Port, &[u8])>;

/// Port -> handler table. Unlike TCP there is no per-peer state to track.
#[derive(Default)]
pub struct UdpTable {
    handlers: HashMap<Port, UdpHandler>,
}

/// Register `handler` to be called with `(peer_ip, peer_port, payload)` for
/// every datagram that arrives on `port`.
pub fn udp_open(table: &mut UdpTable, port: Port, handler: impl FnMut(Ipv4Addr, Port, &[u8]) + 'static) -> Result<(), NetError> {
    if table.handlers.contains_key(&port) {
        return Err(NetError::AddressInUse);
    }
    table.handlers.insert(port, Box::new(handler));
    Ok(())
}

/// Unregister the handler for `port`, if any.
pub fn udp_close(table: &mut UdpTable, port: Port) {
    table.handlers.remove(&port);
}

/// Handle one inbound UDP datagram. `ip_header` is the 20-byte IPv4 header
/// [`super::ipv4::ip_in`] stripped before dispatch, kept around only so that
/// an ICMP Port Unreachable reply can quote it. A datagram to an unbound
/// port gets such a reply, per RFC 1122 §3.2.2.1.
#[allow(clippy::too_many_arguments)]
pub fn udp_in(
    device: &mut dyn LinkDevice,
    arp: &mut ArpTable,
    config: &Config,
    ip_id: &mut u16,
    table: &mut UdpTable,
    ip_header: &[u8],
    datagram: &[u8],
    src_ip: Ipv4Addr,
) {
    if datagram.len() < UDP_HEADER_LEN {
        debug!("udp: datagram shorter than header, dropping");
        return;
    }
    let src_port = Port::from_network_bytes([datagram[0], datagram[1]]);
    let dst_port = Port::from_network_bytes([datagram[2], datagram[3]]);
    let length = u16::from_be_bytes([datagram[4], datagram[5]]) as usize;
    if length < UDP_HEADER_LEN || length > datagram.len() {
        debug!("udp: bad length field, dropping");
        return;
    }
    let stored_csum = u16::from_be_bytes([datagram[6], datagram[7]]);
    let mut buf = Buffer::from_bytes(&datagram[..length]);
    buf.data_mut()[6..8].copy_from_slice(&[0, 0]);
    let computed = checksum::pseudo_header_checksum(&mut buf, &src_ip, &config.ip, IpProtocol::Udp.as_u8());
    let computed = if computed == 0 { 0xFFFF } else { computed };
    if computed != stored_csum {
        debug!("udp: checksum mismatch, dropping");
        return;
    }

    let payload = &datagram[UDP_HEADER_LEN..length];
    if let Some(handler) = table.handlers.get_mut(&dst_port) {
        handler(src_ip, src_port, payload);
    } else {
        debug!("udp: no listener on port {dst_port}, sending port-unreachable");
        let mut offending = Vec::with_capacity(ip_header.len() + length.min(8));
        offending.extend_from_slice(ip_header);
        offending.extend_from_slice(&datagram[..length.min(8)]);
        icmp_unreachable(device, arp, config, ip_id, src_ip, super::icmp::CODE_PORT_UNREACHABLE, &offending);
    }
}

/// Build and send a UDP datagram from `local_port` to `(dst_ip, dst_port)`.
pub fn udp_out(
    device: &mut dyn LinkDevice,
    arp: &mut ArpTable,
    config: &Config,
    ip_id: &mut u16,
    local_port: Port,
    dst_ip: Ipv4Addr,
    dst_port: Port,
    payload: &[u8],
) {
    let mut buf = Buffer::from_bytes(payload);
    let length = (UDP_HEADER_LEN + payload.len()) as u16;
    let Ok(hdr) = buf.add_header(UDP_HEADER_LEN) else {
        debug!("udp: no headroom for header, dropping send");
        return;
    };
    hdr[0..2].copy_from_slice(&local_port.to_network_bytes());
    hdr[2..4].copy_from_slice(&dst_port.to_network_bytes());
    hdr[4..6].copy_from_slice(&length.to_be_bytes());
    hdr[6..8].copy_from_slice(&[0, 0]);

    let csum = checksum::pseudo_header_checksum(&mut buf, &config.ip, &dst_ip, IpProtocol::Udp.as_u8());
    let csum = if csum == 0 { 0xFFFF } else { csum };
    buf.data_mut()[6..8].copy_from_slice(&csum.to_be_bytes());

    ip_out(device, arp, config, ip_id, buf, dst_ip, IpProtocol::Udp);
}

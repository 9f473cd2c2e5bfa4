//! ARP (RFC 826, Ethernet/IPv4 only) — resolution table and deferred-send queue.
//!
//! Two [`TimedMap`]s back the table: `table` (IPv4 -> MAC, long TTL) and
//! `pending` (IPv4 -> one queued outbound [`Buffer`], short TTL). A pending
//! entry implies an outstanding request for that IP; resolving the IP drains
//! the queued buffer. At most one buffer is queued per unresolved IP — a
//! second `arp_out` to the same IP overwrites the first.

use std::time::Duration;

use log::debug;

use super::buf::Buffer;
use super::device::LinkDevice;
use super::ethernet::ethernet_out;
use super::timedmap::TimedMap;
use super::types::{EtherType, Ipv4Addr, MacAddr};
use crate::config::Config;

/// How long a resolved `IPv4 -> MAC` mapping is trusted before re-request.
pub const ARP_TIMEOUT_SEC: u64 = 60;
/// Minimum interval between ARP requests for the same unresolved IP —
/// modeled as the TTL of the pending-send entry.
pub const ARP_MIN_INTERVAL_SEC: u64 = 1;

const ARP_HTYPE_ETHERNET: u16 = 1;
const ARP_PTYPE_IPV4: u16 = 0x0800;
const ARP_HLEN_ETHERNET: u8 = 6;
const ARP_PLEN_IPV4: u8 = 4;
const ARP_OPER_REQUEST: u16 = 1;
const ARP_OPER_REPLY: u16 = 2;
pub const ARP_PACKET_LEN: usize = 28;

struct ArpPacket {
    oper: u16,
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    target_ip: Ipv4Addr,
}

fn parse_arp_packet(payload: &[u8]) -> Option<ArpPacket> {
    if payload.len() < ARP_PACKET_LEN {
        return None;
    }
    let htype = u16::from_be_bytes([payload[0], payload[1]]);
    let ptype = u16::from_be_bytes([payload[2], payload[3]]);
    let hlen = payload[4];
    let plen = payload[5];
    let oper = u16::from_be_bytes([payload[6], payload[7]]);

    if htype != ARP_HTYPE_ETHERNET || ptype != ARP_PTYPE_IPV4 || hlen != ARP_HLEN_ETHERNET || plen != ARP_PLEN_IPV4 {
        return None;
    }
    if oper != ARP_OPER_REQUEST && oper != ARP_OPER_REPLY {
        return None;
    }

    let sender_mac = MacAddr([payload[8], payload[9], payload[10], payload[11], payload[12], payload[13]]);
    let sender_ip = Ipv4Addr([payload[14], payload[15], payload[16], payload[17]]);
    let target_ip = Ipv4Addr([payload[24], payload[25], payload[26], payload[27]]);

    Some(ArpPacket { oper, sender_mac, sender_ip, target_ip })
}

fn build_arp_packet(
    oper: u16,
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    target_mac: MacAddr,
    target_ip: Ipv4Addr,
) -> Buffer {
    let mut buf = Buffer::new(ARP_PACKET_LEN);
    let body = buf.data_mut();
    body[0..2].copy_from_slice(&ARP_HTYPE_ETHERNET.to_be_bytes());
    body[2..4].copy_from_slice(&ARP_PTYPE_IPV4.to_be_bytes());
    body[4] = ARP_HLEN_ETHERNET;
    body[5] = ARP_PLEN_IPV4;
    body[6..8].copy_from_slice(&oper.to_be_bytes());
    body[8..14].copy_from_slice(sender_mac.as_bytes());
    body[14..18].copy_from_slice(sender_ip.as_bytes());
    body[18..24].copy_from_slice(target_mac.as_bytes());
    body[24..28].copy_from_slice(target_ip.as_bytes());
    buf
}

/// IPv4-to-MAC resolution table plus the pending-send queue for unresolved IPs.
pub struct ArpTable {
    table: TimedMap<Ipv4Addr, MacAddr>,
    pending: TimedMap<Ipv4Addr, Buffer>,
}

impl ArpTable {
    pub fn new() -> Self {
        Self {
            table: TimedMap::new(Some(Duration::from_secs(ARP_TIMEOUT_SEC)), None),
            pending: TimedMap::new(Some(Duration::from_secs(ARP_MIN_INTERVAL_SEC)), None),
        }
    }

    /// Look up a resolved MAC address, purging it first if stale.
    pub fn lookup(&mut self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.table.get(&ip).copied()
    }
}

impl Default for ArpTable {
    fn default() -> Self {
        Self::new()
    }
}

fn arp_req(device: &mut dyn LinkDevice, config: &Config, target_ip: Ipv4Addr) {
    let buf = build_arp_packet(ARP_OPER_REQUEST, config.mac, config.ip, MacAddr::ZERO, target_ip);
    ethernet_out(device, config.mac, buf, MacAddr::BROADCAST, EtherType::Arp.as_u16());
}

fn arp_resp(device: &mut dyn LinkDevice, config: &Config, target_ip: Ipv4Addr, target_mac: MacAddr) {
    let buf = build_arp_packet(ARP_OPER_REPLY, config.mac, config.ip, target_mac, target_ip);
    ethernet_out(device, config.mac, buf, target_mac, EtherType::Arp.as_u16());
}

/// Handle an inbound ARP frame. Learns the sender unconditionally, drains a
/// pending send for it if one exists, and answers requests for our own IP.
pub fn arp_in(arp: &mut ArpTable, device: &mut dyn LinkDevice, config: &Config, payload: &[u8], src_mac: MacAddr) {
    let Some(pkt) = parse_arp_packet(payload) else {
        debug!("arp: malformed packet, dropping");
        return;
    };

    let _ = arp.table.set(pkt.sender_ip, src_mac);

    if let Some(queued) = arp.pending.remove(&pkt.sender_ip) {
        ethernet_out(device, config.mac, queued, src_mac, EtherType::Ipv4.as_u16());
        return;
    }

    if pkt.oper == ARP_OPER_REQUEST && pkt.target_ip == config.ip {
        arp_resp(device, config, pkt.sender_ip, pkt.sender_mac);
    }
}

/// Resolve `dst_ip` and hand `buf` to Ethernet, or queue it and (rate-limited)
/// issue an ARP request if the address is not yet known.
pub fn arp_out(arp: &mut ArpTable, device: &mut dyn LinkDevice, config: &Config, buf: Buffer, dst_ip: Ipv4Addr) {
    if dst_ip == config.ip {
        ethernet_out(device, config.mac, buf, config.mac, EtherType::Ipv4.as_u16());
        return;
    }

    if let Some(mac) = arp.lookup(dst_ip) {
        ethernet_out(device, config.mac, buf, mac, EtherType::Ipv4.as_u16());
        return;
    }

    if arp.pending.get(&dst_ip).is_none() {
        arp_req(device, config, dst_ip);
    }
    let _ = arp.pending.set(dst_ip, buf);
}

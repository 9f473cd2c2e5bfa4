//! Ethernet framing/deframing and MAC filtering.
//!
//! Frame layout: `[dst MAC(6)][src MAC(6)][ethertype(2, BE)][payload]`.
//! Minimum transport unit 60 bytes (payload padded to 46); MTU 1500.

use log::{debug, warn};

use super::buf::{Buffer, ETHERNET_MIN_TRANSPORT_UNIT};
use super::device::LinkDevice;
use super::types::{EtherType, MacAddr};

pub const ETH_HEADER_LEN: usize = 14;
pub const MTU: usize = 1500;

/// Parse an Ethernet frame, returning `(ethertype, src_mac, payload)` if it
/// is addressed to `local_mac` (unicast or broadcast) and long enough.
/// Anything else is a silent drop (returns `None`).
pub fn ethernet_in(local_mac: MacAddr, frame: &[u8]) -> Option<(EtherType, MacAddr, &[u8])> {
    if frame.len() < ETH_HEADER_LEN {
        debug!("ethernet: frame too short ({} < {ETH_HEADER_LEN})", frame.len());
        return None;
    }
    let dst = MacAddr([frame[0], frame[1], frame[2], frame[3], frame[4], frame[5]]);
    let src = MacAddr([frame[6], frame[7], frame[8], frame[9], frame[10], frame[11]]);
    let ethertype_raw = u16::from_be_bytes([frame[12], frame[13]]);

    if dst != local_mac && !dst.is_broadcast() {
        return None;
    }

    let Some(ethertype) = EtherType::from_u16(ethertype_raw) else {
        debug!("ethernet: unknown ethertype 0x{ethertype_raw:04x}, dropping");
        return None;
    };

    Some((ethertype, src, &frame[ETH_HEADER_LEN..]))
}

/// Pad `buf` to the minimum Ethernet payload, prepend the 14-byte header,
/// and hand the frame to the driver. Driver failure is logged, not propagated.
pub fn ethernet_out(
    device: &mut dyn LinkDevice,
    local_mac: MacAddr,
    mut buf: Buffer,
    dst_mac: MacAddr,
    ethertype: u16,
) {
    let _ = buf.pad_to(ETHERNET_MIN_TRANSPORT_UNIT);

    let hdr = match buf.add_header(ETH_HEADER_LEN) {
        Ok(hdr) => hdr,
        Err(_) => {
            warn!("ethernet: no headroom for Ethernet header, dropping");
            return;
        }
    };
    hdr[0..6].copy_from_slice(dst_mac.as_bytes());
    hdr[6..12].copy_from_slice(local_mac.as_bytes());
    hdr[12..14].copy_from_slice(&ethertype.to_be_bytes());

    if device.send(buf.data()).is_err() {
        warn!("ethernet: driver_send failed");
    }
}

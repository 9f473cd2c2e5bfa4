//! Net core — the protocol registry and poll driver that ties every layer
//! together, and the public UDP/TCP application API.
//!
//! [`NetStack`] owns the ARP table, the UDP/TCP port and connection tables,
//! and the outbound IPv4 datagram ID counter. `poll()` is the sole driver:
//! it asks the [`LinkDevice`] for one frame, deframes it, and dispatches it
//! through ARP or IPv4 to completion before returning. There is no
//! background task and no lock — see §5 of the design for why a
//! single-threaded poll loop needs neither.

use log::warn;

use super::arp::ArpTable;
use super::device::LinkDevice;
use super::ethernet::{ethernet_in, ETH_HEADER_LEN, MTU};
use super::icmp;
use super::ipv4::ip_in;
use super::tcp::{self, TcpConnection, TcpConnectionTable, TcpEvent, TcpKey};
use super::types::{EtherType, Ipv4Addr, MacAddr, Port};
use super::udp::{self, UdpTable};
use crate::config::Config;
use crate::error::NetError;

/// Largest frame a single `recv` can hand back: MTU payload plus the
/// 14-byte Ethernet header.
const RX_FRAME_LEN: usize = MTU + ETH_HEADER_LEN;

/// The assembled stack: one [`LinkDevice`], one [`Config`], and every
/// protocol table below it. Not `Send`/`Sync` — it is meant to be driven
/// from a single poll loop on one thread (§5).
pub struct NetStack<D: LinkDevice> {
    device: D,
    config: Config,
    ip_id: u16,
    arp: ArpTable,
    udp: UdpTable,
    tcp: TcpConnectionTable,
}

impl<D: LinkDevice> NetStack<D> {
    /// Build a stack bound to `device`, answering to `config`'s MAC/IP.
    pub fn new(device: D, config: Config) -> Self {
        Self {
            device,
            config,
            ip_id: 0,
            arp: ArpTable::new(),
            udp: UdpTable::default(),
            tcp: TcpConnectionTable::new(),
        }
    }

    pub fn config(&self) -> Config {
        self.config
    }

    /// Receive and fully process at most one frame. Returns `true` if a
    /// frame was present (whether or not it was ultimately accepted),
    /// `false` if the device had nothing to offer this tick.
    pub fn poll(&mut self) -> bool {
        let mut frame = [0u8; RX_FRAME_LEN];
        let n = match self.device.recv(&mut frame) {
            Ok(0) => return false,
            Ok(n) => n,
            Err(err) => {
                warn!("netstack: driver_recv failed: {err}");
                return false;
            }
        };
        self.net_rx(&frame[..n]);
        true
    }

    /// Deframe one Ethernet frame and dispatch it to ARP or IPv4. Mirrors
    /// `net_in`'s protocol-number registry from the design (§4.7) — here
    /// expressed as a two-armed match rather than a lookup table, since
    /// Ethernet only ever forwards to exactly these two protocols.
    fn net_rx(&mut self, frame: &[u8]) {
        let Some((ethertype, src_mac, payload)) = ethernet_in(self.config.mac, frame) else {
            return;
        };
        match ethertype {
            EtherType::Arp => {
                super::arp::arp_in(&mut self.arp, &mut self.device, &self.config, payload, src_mac);
            }
            EtherType::Ipv4 => {
                ip_in(&mut self.device, &mut self.arp, &self.config, &mut self.ip_id, &mut self.udp, &mut self.tcp, payload);
            }
        }
    }

    // ---- UDP application API ----------------------------------------

    /// Register `handler(peer_ip, peer_port, payload)` for datagrams arriving on `port`.
    pub fn udp_open(&mut self, port: Port, handler: impl FnMut(Ipv4Addr, Port, &[u8]) + 'static) -> Result<(), NetError> {
        udp::udp_open(&mut self.udp, port, handler)
    }

    /// Unregister the handler for `port`, if any.
    pub fn udp_close(&mut self, port: Port) {
        udp::udp_close(&mut self.udp, port);
    }

    /// Send `payload` from `local_port` to `(dst_ip, dst_port)`.
    pub fn udp_send(&mut self, local_port: Port, dst_ip: Ipv4Addr, dst_port: Port, payload: &[u8]) {
        udp::udp_out(&mut self.device, &mut self.arp, &self.config, &mut self.ip_id, local_port, dst_ip, dst_port, payload);
    }

    // ---- TCP application API ----------------------------------------

    /// Register `handler(connection, event)` for new connections arriving on `port`.
    pub fn tcp_open(&mut self, port: Port, handler: impl FnMut(&mut TcpConnection, TcpEvent) + 'static) -> Result<(), NetError> {
        tcp::tcp_open(&mut self.tcp, port, handler)
    }

    /// Release every connection on `port` and remove its listener.
    pub fn tcp_close(&mut self, port: Port) {
        tcp::tcp_close(&mut self.tcp, port);
    }

    /// Drain up to `out.len()` bytes from `key`'s receive buffer. Returns 0
    /// if the connection does not exist (already closed, or never existed).
    pub fn tcp_connect_read(&mut self, key: &TcpKey, out: &mut [u8]) -> usize {
        match self.tcp.get_mut(key) {
            Some(conn) => tcp::tcp_connect_read(conn, out),
            None => 0,
        }
    }

    /// Queue `data` for transmission on `key`. Returns the number of bytes
    /// accepted (0 if the window is full, the local buffer is full, or the
    /// connection does not exist).
    pub fn tcp_connect_write(&mut self, key: &TcpKey, data: &[u8]) -> usize {
        let Some(conn) = self.tcp.get_mut(key) else {
            return 0;
        };
        tcp::tcp_connect_write(&mut self.device, &mut self.arp, &self.config, &mut self.ip_id, conn, data)
    }

    /// Begin closing `key`: flushes buffered output with FIN|ACK if
    /// established, otherwise releases the connection immediately.
    pub fn tcp_connect_close(&mut self, key: &TcpKey) {
        tcp::tcp_connect_close(&mut self.device, &mut self.arp, &self.config, &mut self.ip_id, &mut self.tcp, key);
    }

    // ---- ICMP ---------------------------------------------------------

    /// Send an Echo Request, e.g. from a ping-style client built on this
    /// stack (the client itself is out of scope for this crate).
    pub fn icmp_echo_request(&mut self, id: u16, seq: u16, tag: u64, dst_ip: Ipv4Addr) {
        icmp::icmp_req(&mut self.device, &mut self.arp, &self.config, &mut self.ip_id, id, seq, tag, dst_ip);
    }

    /// Resolve a MAC address from the ARP table without sending anything.
    pub fn arp_lookup(&mut self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.arp.lookup(ip)
    }

    /// Borrow the underlying device, e.g. to inject frames into a
    /// [`super::device::LoopbackDevice`] in tests.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Borrow the underlying device immutably.
    pub fn device(&self) -> &D {
        &self.device
    }
}

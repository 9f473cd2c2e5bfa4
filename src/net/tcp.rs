//! TCP — connection table, per-connection state machine, and rx/tx byte buffers.
//!
//! A deliberately small subset of RFC 793: no options, no retransmission
//! timer, no congestion control. The state machine is the one in the design
//! document §4.6 — `LISTEN -> SYN_RCVD -> ESTABLISHED -> {FIN_WAIT_1,
//! FIN_WAIT_2} | LAST_ACK -> gone`. Two oddities in the literal source this
//! was distilled from are fixed here rather than carried forward: an
//! out-of-order segment gets a RST|ACK *and is dropped* (the source
//! continues dispatching it regardless), and a non-SYN segment to a LISTEN
//! connection stops after the RST|ACK instead of also re-initializing the
//! connection.

use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use log::debug;

use super::arp::ArpTable;
use super::buf::Buffer;
use super::checksum;
use super::device::LinkDevice;
use super::ipv4;
use super::types::{IpProtocol, Ipv4Addr, Port};
use crate::config::Config;
use crate::random::Xorshift64;

pub const TCP_HEADER_LEN: usize = 20;

/// Bytes buffered per connection outbound before `write` refuses more data
/// or is forced to flush eagerly.
const TX_BUF_CAPACITY: usize = 16 * 1024;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        const FIN = 0b0000_0001;
        const SYN = 0b0000_0010;
        const RST = 0b0000_0100;
        const PSH = 0b0000_1000;
        const ACK = 0b0001_0000;
        const URG = 0b0010_0000;
        const ECE = 0b0100_0000;
        const CWR = 0b1000_0000;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    Listen,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    LastAck,
}

/// Events delivered to the application handler registered via [`tcp_open`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpEvent {
    Connected,
    DataRecv,
    Closed,
}

/// 5-tuple minus the local IP (the stack has exactly one interface): peer
/// IP, peer port, local port.
pub type TcpKey = (Ipv4Addr, Port, Port);

/// A single TCP connection's state, sequence bookkeeping, and byte buffers.
///
/// `rx_buf`/`tx_buf` are allocated empty in [`TcpState::Listen`] and populated
/// from [`TcpState::SynRcvd`] onward; they are dropped with the connection.
pub struct TcpConnection {
    pub state: TcpState,
    pub local_ip: Ipv4Addr,
    pub local_port: Port,
    pub remote_ip: Ipv4Addr,
    pub remote_port: Port,
    /// Oldest unacknowledged outgoing sequence number.
    pub unack_seq: u32,
    /// Next outgoing sequence number to assign.
    pub next_seq: u32,
    /// Next expected incoming sequence number.
    pub ack: u32,
    /// Peer's last-advertised receive window.
    pub remote_win: u16,
    rx_buf: VecDeque<u8>,
    tx_buf: VecDeque<u8>,
}

impl TcpConnection {
    fn new_listen(local_ip: Ipv4Addr, local_port: Port, remote_ip: Ipv4Addr, remote_port: Port) -> Self {
        Self {
            state: TcpState::Listen,
            local_ip,
            local_port,
            remote_ip,
            remote_port,
            unack_seq: 0,
            next_seq: 0,
            ack: 0,
            remote_win: 0,
            rx_buf: VecDeque::new(),
            tx_buf: VecDeque::new(),
        }
    }

    /// Drain up to `out.len()` bytes from the front of the receive buffer.
    /// Returns the number of bytes copied.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.rx_buf.len());
        for slot in out.iter_mut().take(n) {
            *slot = self.rx_buf.pop_front().expect("checked against rx_buf.len()");
        }
        n
    }
}

type TcpHandler = Box<dyn FnMut(&mut TcpConnection, TcpEvent)>;

/// Port listener table plus the live connection table.
pub struct TcpConnectionTable {
    listeners: HashMap<Port, TcpHandler>,
    connections: HashMap<TcpKey, TcpConnection>,
    rng: Xorshift64,
}

impl TcpConnectionTable {
    pub fn new() -> Self {
        let seed = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(1);
        Self {
            listeners: HashMap::new(),
            connections: HashMap::new(),
            rng: Xorshift64::with_seed(seed),
        }
    }

    /// Look up a live connection by its 5-tuple key.
    pub fn get_mut(&mut self, key: &TcpKey) -> Option<&mut TcpConnection> {
        self.connections.get_mut(key)
    }
}

impl Default for TcpConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Register a handler for new connections on `port`.
pub fn tcp_open(
    table: &mut TcpConnectionTable,
    port: Port,
    handler: impl FnMut(&mut TcpConnection, TcpEvent) + 'static,
) -> Result<(), crate::error::NetError> {
    if table.listeners.contains_key(&port) {
        return Err(crate::error::NetError::AddressInUse);
    }
    table.listeners.insert(port, Box::new(handler));
    Ok(())
}

/// Release every connection whose local port is `port` and remove its listener.
pub fn tcp_close(table: &mut TcpConnectionTable, port: Port) {
    table.connections.retain(|_, conn| conn.local_port != port);
    table.listeners.remove(&port);
}

fn acks_new_data(unack_seq: u32, seg_ack: u32, next_seq: u32) -> bool {
    let span = next_seq.wrapping_sub(unack_seq);
    let advanced = seg_ack.wrapping_sub(unack_seq);
    advanced != 0 && advanced <= span
}

fn drain_front(buf: &mut VecDeque<u8>, n: usize) {
    for _ in 0..n.min(buf.len()) {
        buf.pop_front();
    }
}

/// Build and send one bare TCP segment — used for RST replies that are not
/// tied to a live connection's sequence state.
#[allow(clippy::too_many_arguments)]
fn send_raw_segment(
    device: &mut dyn LinkDevice,
    arp: &mut ArpTable,
    config: &Config,
    ip_id: &mut u16,
    local_port: Port,
    remote_ip: Ipv4Addr,
    remote_port: Port,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
) {
    let mut buf = Buffer::from_bytes(payload);
    let hdr = match buf.add_header(TCP_HEADER_LEN) {
        Ok(hdr) => hdr,
        Err(_) => return,
    };
    hdr[0..2].copy_from_slice(&local_port.to_network_bytes());
    hdr[2..4].copy_from_slice(&remote_port.to_network_bytes());
    hdr[4..8].copy_from_slice(&seq.to_be_bytes());
    hdr[8..12].copy_from_slice(&ack.to_be_bytes());
    hdr[12] = 5 << 4;
    hdr[13] = flags.bits();
    hdr[14..16].copy_from_slice(&window.to_be_bytes());
    hdr[16..18].copy_from_slice(&[0, 0]);
    hdr[18..20].copy_from_slice(&[0, 0]);

    let csum = checksum::pseudo_header_checksum(&mut buf, &config.ip, &remote_ip, IpProtocol::Tcp.as_u8());
    buf.data_mut()[16..18].copy_from_slice(&csum.to_be_bytes());

    ipv4::ip_out(device, arp, config, ip_id, buf, remote_ip, IpProtocol::Tcp);
}

/// Send a segment carrying `payload` on behalf of `conn`. The sequence
/// number labels `payload` as starting at `next_seq - payload.len()`; SYN
/// and FIN each consume one sequence number, advancing `next_seq` by one.
fn tcp_send(
    device: &mut dyn LinkDevice,
    arp: &mut ArpTable,
    config: &Config,
    ip_id: &mut u16,
    conn: &mut TcpConnection,
    flags: TcpFlags,
    payload: &[u8],
) {
    let seq = conn.next_seq.wrapping_sub(payload.len() as u32);
    let window = conn.remote_win;
    send_raw_segment(
        device,
        arp,
        config,
        ip_id,
        conn.local_port,
        conn.remote_ip,
        conn.remote_port,
        seq,
        conn.ack,
        flags,
        window,
        payload,
    );
    if flags.intersects(TcpFlags::SYN | TcpFlags::FIN) {
        conn.next_seq = conn.next_seq.wrapping_add(1);
    }
}

/// Push as much of `tx_buf` as the remote window allows into one segment,
/// without removing it from `tx_buf` (it is only dropped once ACKed).
fn pump_tx(device: &mut dyn LinkDevice, arp: &mut ArpTable, config: &Config, ip_id: &mut u16, conn: &mut TcpConnection) {
    let in_flight = conn.next_seq.wrapping_sub(conn.unack_seq) as usize;
    let available = (conn.remote_win as usize).saturating_sub(in_flight);
    let send_len = conn.tx_buf.len().min(available);
    if send_len == 0 {
        return;
    }
    let chunk: Vec<u8> = conn.tx_buf.iter().take(send_len).copied().collect();
    conn.next_seq = conn.next_seq.wrapping_add(send_len as u32);
    tcp_send(device, arp, config, ip_id, conn, TcpFlags::ACK, &chunk);
}

/// Handle one inbound TCP segment.
#[allow(clippy::too_many_arguments)]
pub fn tcp_in(
    device: &mut dyn LinkDevice,
    arp: &mut ArpTable,
    config: &Config,
    ip_id: &mut u16,
    table: &mut TcpConnectionTable,
    payload: &[u8],
    src_ip: Ipv4Addr,
) {
    if payload.len() < TCP_HEADER_LEN {
        debug!("tcp: segment shorter than header, dropping");
        return;
    }

    let mut csum_buf = Buffer::from_bytes(payload);
    let stored_csum = u16::from_be_bytes([payload[16], payload[17]]);
    csum_buf.data_mut()[16..18].copy_from_slice(&[0, 0]);
    let computed = checksum::pseudo_header_checksum(&mut csum_buf, &src_ip, &config.ip, IpProtocol::Tcp.as_u8());
    if computed != stored_csum {
        debug!("tcp: checksum mismatch, dropping");
        return;
    }

    let src_port = Port::from_network_bytes([payload[0], payload[1]]);
    let dst_port = Port::from_network_bytes([payload[2], payload[3]]);

    if !table.listeners.contains_key(&dst_port) {
        debug!("tcp: no listener on port {dst_port}, dropping");
        return;
    }

    let seq = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let seg_ack = u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]);
    let data_offset = ((payload[12] >> 4) as usize) * 4;
    let flags = TcpFlags::from_bits_truncate(payload[13]);
    let window = u16::from_be_bytes([payload[14], payload[15]]);
    if data_offset < TCP_HEADER_LEN || data_offset > payload.len() {
        debug!("tcp: bad data offset, dropping");
        return;
    }
    let data = &payload[data_offset..];

    let key: TcpKey = (src_ip, src_port, dst_port);
    if !table.connections.contains_key(&key) {
        table.connections.insert(key, TcpConnection::new_listen(config.ip, dst_port, src_ip, src_port));
    }

    if table.connections.get(&key).map(|c| c.state) == Some(TcpState::Listen) {
        if flags.contains(TcpFlags::RST) {
            table.connections.remove(&key);
            return;
        }
        if !flags.contains(TcpFlags::SYN) {
            send_raw_segment(device, arp, config, ip_id, dst_port, src_ip, src_port, 0, seq.wrapping_add(1), TcpFlags::RST | TcpFlags::ACK, 0, &[]);
            table.connections.remove(&key);
            return;
        }
        let isn = table.rng.next_u32();
        let conn = table.connections.get_mut(&key).unwrap();
        conn.unack_seq = isn;
        conn.next_seq = isn;
        conn.ack = seq.wrapping_add(1);
        conn.remote_win = window;
        conn.state = TcpState::SynRcvd;
        tcp_send(device, arp, config, ip_id, conn, TcpFlags::SYN | TcpFlags::ACK, &[]);
        return;
    }

    let expected_ack = table.connections.get(&key).unwrap().ack;
    if seq != expected_ack {
        let next_seq = table.connections.get(&key).unwrap().next_seq;
        send_raw_segment(device, arp, config, ip_id, dst_port, src_ip, src_port, next_seq, seq.wrapping_add(1), TcpFlags::RST | TcpFlags::ACK, 0, &[]);
        debug!("tcp: out-of-order segment (seq={seq}, expected={expected_ack}), RST sent and segment dropped");
        return;
    }

    if flags.contains(TcpFlags::RST) {
        table.connections.remove(&key);
        return;
    }

    let conn = table.connections.get_mut(&key).unwrap();
    match conn.state {
        TcpState::Listen => unreachable!("LISTEN handled above"),
        TcpState::SynRcvd => {
            if !flags.contains(TcpFlags::ACK) {
                debug!("tcp: SYN_RCVD expected ACK, dropping");
                return;
            }
            conn.unack_seq = conn.unack_seq.wrapping_add(1);
            conn.state = TcpState::Established;
            if let Some(handler) = table.listeners.get_mut(&dst_port) {
                handler(conn, TcpEvent::Connected);
            }
        }
        TcpState::Established => {
            if flags.contains(TcpFlags::ACK) && acks_new_data(conn.unack_seq, seg_ack, conn.next_seq) {
                drain_front(&mut conn.tx_buf, seg_ack.wrapping_sub(conn.unack_seq) as usize);
                conn.unack_seq = seg_ack;
            }
            if !data.is_empty() {
                conn.rx_buf.extend(data.iter().copied());
                conn.ack = conn.ack.wrapping_add(data.len() as u32);
            }
            if flags.contains(TcpFlags::FIN) {
                conn.ack = conn.ack.wrapping_add(1);
                conn.state = TcpState::LastAck;
                tcp_send(device, arp, config, ip_id, conn, TcpFlags::FIN | TcpFlags::ACK, &[]);
            } else if !data.is_empty() {
                if let Some(handler) = table.listeners.get_mut(&dst_port) {
                    handler(conn, TcpEvent::DataRecv);
                }
                pump_tx(device, arp, config, ip_id, conn);
                tcp_send(device, arp, config, ip_id, conn, TcpFlags::ACK, &[]);
            }
        }
        TcpState::FinWait1 => {
            if flags.contains(TcpFlags::FIN) && flags.contains(TcpFlags::ACK) {
                table.connections.remove(&key);
            } else if flags.contains(TcpFlags::ACK) {
                conn.state = TcpState::FinWait2;
            }
        }
        TcpState::FinWait2 => {
            if flags.contains(TcpFlags::FIN) {
                conn.ack = conn.ack.wrapping_add(1);
                tcp_send(device, arp, config, ip_id, conn, TcpFlags::ACK, &[]);
                table.connections.remove(&key);
            }
        }
        TcpState::LastAck => {
            if flags.contains(TcpFlags::ACK) {
                if let Some(handler) = table.listeners.get_mut(&dst_port) {
                    handler(conn, TcpEvent::Closed);
                }
                table.connections.remove(&key);
            }
        }
    }
}

/// Append `data` to `conn`'s outbound buffer, flushing eagerly if it would
/// overflow local capacity. Returns the number of bytes accepted (0 if the
/// remote window is already full, or if local capacity forced a flush).
pub fn tcp_connect_write(
    device: &mut dyn LinkDevice,
    arp: &mut ArpTable,
    config: &Config,
    ip_id: &mut u16,
    conn: &mut TcpConnection,
    data: &[u8],
) -> usize {
    let in_flight = conn.next_seq.wrapping_sub(conn.unack_seq) as usize;
    if in_flight + data.len() >= conn.remote_win as usize {
        return 0;
    }
    let space = TX_BUF_CAPACITY.saturating_sub(conn.tx_buf.len());
    if data.len() > space {
        conn.tx_buf.extend(data[..space].iter().copied());
        pump_tx(device, arp, config, ip_id, conn);
        tcp_send(device, arp, config, ip_id, conn, TcpFlags::ACK, &[]);
        return 0;
    }
    conn.tx_buf.extend(data.iter().copied());
    data.len()
}

/// Drain up to `out.len()` bytes from `conn`'s inbound buffer.
pub fn tcp_connect_read(conn: &mut TcpConnection, out: &mut [u8]) -> usize {
    conn.read(out)
}

/// Close `conn`: flush any buffered output with FIN|ACK and move to
/// FIN_WAIT_1 if established, otherwise release it immediately.
pub fn tcp_connect_close(device: &mut dyn LinkDevice, arp: &mut ArpTable, config: &Config, ip_id: &mut u16, table: &mut TcpConnectionTable, key: &TcpKey) {
    let Some(conn) = table.connections.get_mut(key) else {
        return;
    };
    if conn.state == TcpState::Established {
        let in_flight = conn.next_seq.wrapping_sub(conn.unack_seq) as usize;
        let available = (conn.remote_win as usize).saturating_sub(in_flight);
        let send_len = conn.tx_buf.len().min(available);
        let chunk: Vec<u8> = conn.tx_buf.iter().take(send_len).copied().collect();
        conn.next_seq = conn.next_seq.wrapping_add(send_len as u32);
        tcp_send(device, arp, config, ip_id, conn, TcpFlags::FIN | TcpFlags::ACK, &chunk);
        conn.state = TcpState::FinWait1;
    } else {
        table.connections.remove(key);
    }
}

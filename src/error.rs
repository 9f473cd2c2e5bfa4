//! The bounded-failure error type for the public application API.
//!
//! Per-frame silent drops (malformed header, bad checksum, address mismatch)
//! are never surfaced here — they are logged at `trace`/`debug` and nothing
//! more. `NetError` exists only for the handful of operations that can fail
//! in a way the caller needs to observe: binding a port that is already
//! taken, writing past a full buffer, looking up a connection that is gone.

use thiserror::Error;

/// Errors returned by the public UDP/TCP application API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum NetError {
    /// A UDP or TCP port is already open with a registered handler.
    #[error("address already in use")]
    AddressInUse,
    /// An argument was out of range (e.g. a payload too large for one datagram).
    #[error("invalid argument")]
    InvalidArgument,
    /// A fixed-capacity table (port table, connection table, ARP table) is full.
    #[error("no buffer space available")]
    NoBufferSpace,
    /// The destination is not reachable (no route, unresolved ARP exhausted).
    #[error("network unreachable")]
    NetworkUnreachable,
    /// Operation attempted on a connection that does not exist or has closed.
    #[error("socket not connected")]
    NotConnected,
    /// The peer reset the connection.
    #[error("connection reset by peer")]
    ConnectionReset,
}

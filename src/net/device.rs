//! The link-layer driver boundary.
//!
//! Establishes the boundary between the raw frame driver (which moves bytes)
//! and the protocol stack (which understands protocols), simplified for a
//! single-threaded, single-consumer poll loop: no interior mutability or
//! registry lock is needed here, since the stack owns its device exclusively.

use std::io;

/// A raw Ethernet frame source/sink, e.g. a tap device or raw socket.
///
/// Corresponds to the `driver_send`/`driver_recv` pair: `send` returns
/// `Ok(())` on success, `recv` returns the number of bytes written into
/// `out` (`0` if no frame is currently available).
pub trait LinkDevice {
    /// Transmit one complete Ethernet frame.
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Attempt to receive one frame into `out`, non-blocking.
    ///
    /// Returns `Ok(0)` if no frame is currently available, `Ok(n)` for an
    /// `n`-byte frame, or `Err` on a driver failure.
    fn recv(&mut self, out: &mut [u8]) -> io::Result<usize>;
}

/// An in-memory device for tests: frames written via [`LinkDevice::send`]
/// queue up for inspection, and frames pushed with [`LoopbackDevice::inject`]
/// are returned by the next [`LinkDevice::recv`].
#[derive(Default)]
pub struct LoopbackDevice {
    pub sent: Vec<Vec<u8>>,
    inbox: std::collections::VecDeque<Vec<u8>>,
}

impl LoopbackDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame to be returned by the next `recv`.
    pub fn inject(&mut self, frame: Vec<u8>) {
        self.inbox.push_back(frame);
    }
}

impl LinkDevice for LoopbackDevice {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.sent.push(frame.to_vec());
        Ok(())
    }

    fn recv(&mut self, out: &mut [u8]) -> io::Result<usize> {
        match self.inbox.pop_front() {
            Some(frame) => {
                let n = frame.len().min(out.len());
                out[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }
}

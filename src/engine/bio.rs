//! Ciphertext queues connecting the TLS engine to its caller.
//!
//! The engine never touches a socket: peer bytes go into the inbound queue,
//! bytes destined for the peer accumulate in the outbound queue, and the
//! caller moves both ends. The OpenSSL connection object holds one clone of
//! the handle as its transport; the engine keeps another to fill and drain
//! the queues.

use bytes::{Buf, BytesMut};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Queues {
    /// Ciphertext received from the peer, awaiting decryption.
    inbound: BytesMut,
    /// Ciphertext produced by the engine, awaiting transmission.
    outbound: BytesMut,
}

/// Cloneable handle over one connection's ciphertext queues.
///
/// Reads report `WouldBlock` once the inbound queue is drained so the TLS
/// stack treats the transport as a non-blocking socket; writes always
/// succeed and grow the outbound queue.
#[derive(Clone, Default)]
pub(crate) struct QueuePair {
    shared: Arc<Mutex<Queues>>,
}

impl QueuePair {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_inbound(&self, data: &[u8]) {
        self.shared.lock().unwrap().inbound.extend_from_slice(data);
    }

    pub fn inbound_len(&self) -> usize {
        self.shared.lock().unwrap().inbound.len()
    }

    pub fn outbound_len(&self) -> usize {
        self.shared.lock().unwrap().outbound.len()
    }

    /// Moves up to `buf.len()` outbound bytes into `buf`, returning the count.
    pub fn drain_outbound(&self, buf: &mut [u8]) -> usize {
        let mut q = self.shared.lock().unwrap();
        let n = buf.len().min(q.outbound.len());
        buf[..n].copy_from_slice(&q.outbound[..n]);
        q.outbound.advance(n);
        n
    }

    pub fn clear(&self) {
        let mut q = self.shared.lock().unwrap();
        q.inbound.clear();
        q.outbound.clear();
    }
}

impl Read for QueuePair {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut q = self.shared.lock().unwrap();
        if q.inbound.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "inbound queue empty"));
        }
        let n = buf.len().min(q.inbound.len());
        buf[..n].copy_from_slice(&q.inbound[..n]);
        q.inbound.advance(n);
        Ok(n)
    }
}

impl Write for QueuePair {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.shared.lock().unwrap().outbound.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_preserves_order() {
        let q = QueuePair::new();
        q.push_inbound(b"hel");
        q.push_inbound(b"lo");

        let mut handle = q.clone();
        let mut buf = [0u8; 8];
        let n = handle.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn test_empty_inbound_would_block() {
        let mut q = QueuePair::new();
        let mut buf = [0u8; 4];
        let err = q.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_outbound_partial_drain() {
        let q = QueuePair::new();
        q.clone().write_all(b"abcdef").unwrap();
        assert_eq!(q.outbound_len(), 6);

        let mut buf = [0u8; 4];
        assert_eq!(q.drain_outbound(&mut buf), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(q.outbound_len(), 2);
        assert_eq!(q.drain_outbound(&mut buf), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(q.drain_outbound(&mut buf), 0);
    }

    #[test]
    fn test_clear_drops_both_queues() {
        let q = QueuePair::new();
        q.push_inbound(b"in");
        q.clone().write_all(b"out").unwrap();
        q.clear();
        assert_eq!(q.inbound_len(), 0);
        assert_eq!(q.outbound_len(), 0);
    }
}

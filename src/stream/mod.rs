//! Asynchronous TLS stream: a TCP socket spliced to a TLS engine.
//!
//! The stream owns one connection at a time. `connect` resolves the host,
//! opens a socket of the matching address family, applies TCP options, and
//! drives the engine's handshake to completion before returning; dropping
//! the in-flight `connect` future cancels the attempt and closes the
//! half-open socket without ever reporting a completion. After that the
//! stream is an ordinary [`AsyncRead`]/[`AsyncWrite`] transport until
//! [`close`](TlsStream::close) performs the half-close (close_notify,
//! flush, TCP shutdown).

use crate::context::TlsContext;
use crate::engine::{Engine, HandshakeState, ReadStatus};
use crate::error::{Error, Result};
use bytes::{Buf, BytesMut};
use log::{debug, warn};
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};

/// Scratch buffer size for ciphertext moved between socket and engine.
const NET_BUF_SIZE: usize = 16 * 1024;

/// A TLS client stream over TCP.
pub struct TlsStream {
    context: TlsContext,
    keepalive: Option<Duration>,
    nodelay: bool,
    conn: Option<Connected>,
}

struct Connected {
    tcp: TcpStream,
    engine: Engine,
    /// Scratch for ciphertext in either direction.
    net_buf: Box<[u8]>,
    /// Ciphertext staged for the socket but not yet written.
    staged: BytesMut,
    read_closed: bool,
    sent_close: bool,
}

impl TlsStream {
    /// Creates a disconnected stream bound to a context.
    pub fn new(context: TlsContext) -> Self {
        TlsStream {
            context,
            keepalive: None,
            nodelay: false,
            conn: None,
        }
    }

    /// Resolves `host`, connects, and completes the TLS handshake. Any
    /// previous connection is discarded first. On failure the half-open
    /// socket is closed and the error reported exactly once.
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        if host.trim().is_empty() {
            return Err(Error::Config("hostname must not be empty".to_string()));
        }
        self.disconnect();

        let addr = lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("hostname {host:?} did not resolve"),
                ))
            })?;
        debug!("connecting to {host}:{port} via {addr}");

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }?;
        let tcp = socket.connect(addr).await?;
        tcp.set_nodelay(self.nodelay)?;
        apply_keepalive(&tcp, self.keepalive)?;

        let engine = self.context.new_engine(host)?;
        let mut conn = Connected {
            tcp,
            engine,
            net_buf: vec![0u8; NET_BUF_SIZE].into_boxed_slice(),
            staged: BytesMut::new(),
            read_closed: false,
            sent_close: false,
        };
        conn.run_handshake().await?;
        debug!(
            "connected to {host}:{port}, alpn={:?}",
            conn.engine.get_alpn()
        );
        self.conn = Some(conn);
        Ok(())
    }

    /// Negotiated ALPN protocol of the current connection.
    pub fn alpn(&self) -> Option<&str> {
        self.conn.as_ref().and_then(|c| c.engine.get_alpn())
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Enables TCP keepalive with the given probe delay, or disables it.
    /// Applies to the current connection and to future connects.
    pub fn set_keepalive(&mut self, delay: Option<Duration>) -> Result<()> {
        self.keepalive = delay;
        if let Some(conn) = &self.conn {
            apply_keepalive(&conn.tcp, delay)?;
        }
        Ok(())
    }

    /// Sets TCP_NODELAY for the current connection and future connects.
    pub fn set_nodelay(&mut self, nodelay: bool) -> Result<()> {
        self.nodelay = nodelay;
        if let Some(conn) = &self.conn {
            conn.tcp.set_nodelay(nodelay)?;
        }
        Ok(())
    }

    /// Drops the current connection immediately, without a TLS close. The
    /// stream can connect again afterwards.
    pub fn disconnect(&mut self) {
        if self.conn.take().is_some() {
            debug!("discarding previous connection");
        }
    }

    /// Performs the orderly half-close: emits close_notify, flushes all
    /// staged ciphertext, and shuts the TCP write side down. Plaintext
    /// already delivered to the caller is unaffected.
    pub async fn close(&mut self) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        if !conn.staged.is_empty() {
            conn.tcp.write_all(&conn.staged).await?;
            conn.staged.clear();
        }
        let mut buf = [0u8; 512];
        let n = conn.engine.close(&mut buf);
        if n > 0 {
            conn.tcp.write_all(&buf[..n]).await?;
        }
        while conn.engine.pending_outbound() > 0 {
            let n = conn.engine.drain_outbound(&mut buf);
            conn.tcp.write_all(&buf[..n]).await?;
        }
        conn.tcp.shutdown().await?;
        Ok(())
    }
}

impl Connected {
    /// Pumps ciphertext between the socket and the engine until the
    /// handshake completes or fails.
    async fn run_handshake(&mut self) -> Result<()> {
        let mut incoming = vec![0u8; NET_BUF_SIZE];
        let mut fed = 0usize;
        loop {
            let state = loop {
                let (state, produced) = self.engine.handshake(&incoming[..fed], &mut self.net_buf);
                fed = 0;
                if produced == 0 {
                    break state;
                }
                self.tcp.write_all(&self.net_buf[..produced]).await?;
            };

            match state {
                HandshakeState::Complete => return Ok(()),
                HandshakeState::Error => {
                    let message = self.engine.strerror().to_string();
                    return Err(if self.engine.verify_failed() {
                        Error::Verify(message)
                    } else {
                        Error::Handshake(message)
                    });
                }
                HandshakeState::Before | HandshakeState::Continue => {
                    let n = self.tcp.read(&mut incoming).await?;
                    if n == 0 {
                        return Err(Error::Handshake(
                            "connection closed during handshake".to_string(),
                        ));
                    }
                    fed = n;
                }
            }
        }
    }

    fn poll_read_inner(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.read_closed {
            return Poll::Ready(Ok(()));
        }
        let mut fed = 0usize;
        loop {
            let dst = buf.initialize_unfilled();
            if dst.is_empty() {
                return Poll::Ready(Ok(()));
            }
            let (status, n) = self
                .engine
                .read(&self.net_buf[..fed], dst)
                .map_err(io::Error::other)?;
            fed = 0;
            buf.advance(n);
            match status {
                ReadStatus::Eof => {
                    self.read_closed = true;
                    return Poll::Ready(Ok(()));
                }
                ReadStatus::MoreAvailable => continue,
                ReadStatus::HasWrite => {
                    self.stage_ciphertext();
                    // opportunistic flush; staged bytes survive a Pending
                    if let Poll::Ready(Err(e)) = self.poll_flush_staged(cx) {
                        return Poll::Ready(Err(e));
                    }
                }
                ReadStatus::Ok | ReadStatus::ReadAgain => {
                    if n > 0 {
                        return Poll::Ready(Ok(()));
                    }
                    let mut net = ReadBuf::new(&mut self.net_buf);
                    ready!(Pin::new(&mut self.tcp).poll_read(cx, &mut net))?;
                    fed = net.filled().len();
                    if fed == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed without close_notify",
                        )));
                    }
                }
            }
        }
    }

    fn poll_write_inner(&mut self, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        // at most one write's ciphertext may be outstanding
        ready!(self.poll_flush_staged(cx))?;

        let (n, _more) = self
            .engine
            .write(data, &mut self.net_buf)
            .map_err(io::Error::other)?;
        self.staged.extend_from_slice(&self.net_buf[..n]);
        self.stage_ciphertext();

        if let Poll::Ready(Err(e)) = self.poll_flush_staged(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(data.len()))
    }

    /// Moves all queued engine ciphertext into the staging buffer.
    fn stage_ciphertext(&mut self) {
        while self.engine.pending_outbound() > 0 {
            let n = self.engine.drain_outbound(&mut self.net_buf);
            if n == 0 {
                break;
            }
            self.staged.extend_from_slice(&self.net_buf[..n]);
        }
    }

    fn poll_flush_staged(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.staged.is_empty() {
            let n = ready!(Pin::new(&mut self.tcp).poll_write(cx, &self.staged))?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket refused staged ciphertext",
                )));
            }
            self.staged.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for TlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.conn.as_mut() {
            Some(conn) => conn.poll_read_inner(cx, buf),
            None => Poll::Ready(Err(not_connected())),
        }
    }
}

impl AsyncWrite for TlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.conn.as_mut() {
            Some(conn) => conn.poll_write_inner(cx, data),
            None => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.conn.as_mut() {
            Some(conn) => {
                ready!(conn.poll_flush_staged(cx))?;
                Pin::new(&mut conn.tcp).poll_flush(cx)
            }
            None => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(conn) = this.conn.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        if !conn.sent_close {
            let mut buf = [0u8; 512];
            let n = conn.engine.close(&mut buf);
            conn.staged.extend_from_slice(&buf[..n]);
            conn.stage_ciphertext();
            conn.sent_close = true;
        }
        if let Err(e) = ready!(conn.poll_flush_staged(cx)) {
            warn!("discarding close_notify: {e}");
        }
        Pin::new(&mut conn.tcp).poll_shutdown(cx)
    }
}

fn apply_keepalive(tcp: &TcpStream, delay: Option<Duration>) -> Result<()> {
    let sock = SockRef::from(tcp);
    match delay {
        Some(delay) => {
            sock.set_keepalive(true)?;
            sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(delay))?;
        }
        None => sock.set_keepalive(false)?,
    }
    Ok(())
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream is not connected")
}

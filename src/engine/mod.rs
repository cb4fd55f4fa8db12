//! The TLS engine: a buffer-in/buffer-out client handshake state machine.
//!
//! An engine never touches a socket. Ciphertext received from the peer is
//! fed into it, ciphertext to send is drained out of it, and plaintext is
//! exchanged on the application side. The caller owns all I/O and
//! scheduling; the engine's calls are synchronous and bounded by the
//! buffers handed to them.

mod bio;

pub(crate) use bio::QueuePair;

use crate::context::{TlsContext, VerifyFn};
use crate::error::{Error, Result};
use log::{debug, trace};
use openssl::ssl::{
    ErrorCode, HandshakeError, MidHandshakeSslStream, Ssl, SslSession, SslStream, SslVerifyMode,
};
use openssl::x509::{X509Ref, X509StoreContextRef, X509VerifyResult};
use std::mem;
use std::net::IpAddr;
use std::sync::Arc;

/// Handshake progress of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// No handshake bytes exchanged yet.
    Before,
    /// Handshake in flight; the engine needs more peer bytes or has bytes
    /// to send.
    Continue,
    /// Handshake finished; application data may flow.
    Complete,
    /// Unrecoverable failure; see [`Engine::strerror`].
    Error,
}

/// Outcome of [`Engine::read`], telling the caller how to schedule next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// No further progress without more peer bytes.
    Ok,
    /// Buffered ciphertext or backend-internal data can produce more
    /// plaintext on an immediate re-call, without any socket I/O.
    MoreAvailable,
    /// The engine produced ciphertext that must be sent to the peer before
    /// it can make further progress.
    HasWrite,
    /// The peer closed cleanly with close_notify.
    Eof,
    /// The caller supplied no bytes and the engine cannot progress.
    ReadAgain,
}

enum Conn {
    /// Configured but idle; no ClientHello sent.
    Idle(Box<Ssl>),
    Handshaking(Box<MidHandshakeSslStream<QueuePair>>),
    Established(SslStream<QueuePair>),
    Failed,
}

/// Per-connection TLS state machine minted by [`TlsContext::new_engine`].
pub struct Engine {
    context: TlsContext,
    host: String,
    target_ip: Option<IpAddr>,
    queues: QueuePair,
    conn: Conn,
    /// Resumption blob captured on [`reset`](Engine::reset).
    session: Option<Vec<u8>>,
    last_error: String,
    verify_failed: bool,
}

impl Engine {
    pub(crate) fn new(context: TlsContext, host: &str) -> Result<Self> {
        let target_ip = host.parse::<IpAddr>().ok();
        let ssl = configure_ssl(&context, host, target_ip)?;
        Ok(Engine {
            context,
            host: host.to_string(),
            target_ip,
            queues: QueuePair::new(),
            conn: Conn::Idle(Box::new(ssl)),
            session: None,
            last_error: String::new(),
            verify_failed: false,
        })
    }

    /// Current handshake progress.
    pub fn handshake_state(&self) -> HandshakeState {
        match &self.conn {
            Conn::Idle(_) => HandshakeState::Before,
            Conn::Handshaking(_) => HandshakeState::Continue,
            Conn::Established(_) => HandshakeState::Complete,
            Conn::Failed => HandshakeState::Error,
        }
    }

    /// Feeds peer ciphertext (may be empty) and drives the handshake.
    /// Ciphertext produced for the peer is drained into `output`; if it
    /// does not fit, the remainder stays queued and a repeated call with
    /// empty input drains more.
    pub fn handshake(&mut self, input: &[u8], output: &mut [u8]) -> (HandshakeState, usize) {
        if !input.is_empty() {
            self.queues.push_inbound(input);
        }
        let conn = mem::replace(&mut self.conn, Conn::Failed);
        self.conn = match conn {
            Conn::Idle(ssl) => self.start_handshake(*ssl),
            Conn::Handshaking(mid) => self.drive_handshake(mid.handshake()),
            done => done,
        };
        let produced = self.queues.drain_outbound(output);
        if self.context.debug_level() > 0 {
            trace!(
                "handshake[{}]: state={:?} in={} out={}",
                self.host,
                self.handshake_state(),
                input.len(),
                produced
            );
        }
        (self.handshake_state(), produced)
    }

    /// Negotiated ALPN protocol; only meaningful once the handshake is
    /// complete.
    pub fn get_alpn(&self) -> Option<&str> {
        match &self.conn {
            Conn::Established(stream) => stream
                .ssl()
                .selected_alpn_protocol()
                .and_then(|p| std::str::from_utf8(p).ok()),
            _ => None,
        }
    }

    /// Encrypts `plaintext`, draining produced ciphertext into `output`.
    /// Returns the bytes drained and whether more ciphertext remains
    /// queued beyond what fit.
    pub fn write(&mut self, plaintext: &[u8], output: &mut [u8]) -> Result<(usize, bool)> {
        let Conn::Established(stream) = &mut self.conn else {
            return Err(Error::Handshake(
                "write attempted before handshake completion".to_string(),
            ));
        };
        let mut written = 0;
        let mut failure = None;
        while written < plaintext.len() {
            match stream.ssl_write(&plaintext[written..]) {
                Ok(n) => written += n,
                Err(e) => {
                    failure = Some(e.to_string());
                    break;
                }
            }
        }
        if let Some(message) = failure {
            self.fail(&message);
            return Err(Error::Crypto(message));
        }
        let produced = self.queues.drain_outbound(output);
        Ok((produced, self.queues.outbound_len() > 0))
    }

    /// Feeds peer ciphertext (may be empty) and decrypts into `plaintext`.
    /// The returned status tells the caller whether to re-call immediately
    /// (`MoreAvailable`), flush outbound ciphertext (`HasWrite`), treat the
    /// stream as cleanly closed (`Eof`), or wait for more peer bytes.
    pub fn read(&mut self, input: &[u8], plaintext: &mut [u8]) -> Result<(ReadStatus, usize)> {
        if !input.is_empty() {
            self.queues.push_inbound(input);
        }
        let Conn::Established(stream) = &mut self.conn else {
            return Err(Error::Handshake(
                "read attempted before handshake completion".to_string(),
            ));
        };

        let mut total = 0;
        let mut eof = false;
        let mut want_read = false;
        let mut failure = None;
        while total < plaintext.len() {
            match stream.ssl_read(&mut plaintext[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) => {
                    let code = e.code();
                    if code == ErrorCode::WANT_READ {
                        want_read = true;
                    } else if code == ErrorCode::ZERO_RETURN {
                        eof = true;
                    } else {
                        failure = Some(e.to_string());
                    }
                    break;
                }
            }
        }
        let backend_pending = stream.ssl().pending() > 0;

        if let Some(message) = failure {
            self.fail(&message);
            return Err(Error::Crypto(message));
        }

        let status = if eof {
            ReadStatus::Eof
        } else if want_read {
            if self.queues.outbound_len() > 0 {
                ReadStatus::HasWrite
            } else if total == 0 && input.is_empty() {
                ReadStatus::ReadAgain
            } else {
                ReadStatus::Ok
            }
        } else if self.queues.inbound_len() > 0 || backend_pending {
            ReadStatus::MoreAvailable
        } else if total == 0 && input.is_empty() {
            ReadStatus::ReadAgain
        } else {
            ReadStatus::Ok
        };
        Ok((status, total))
    }

    /// Emits close_notify into `output`. After a failure this produces
    /// nothing.
    pub fn close(&mut self, output: &mut [u8]) -> usize {
        match &mut self.conn {
            Conn::Established(stream) => {
                // best effort; the peer may already be gone
                let _ = stream.shutdown();
                self.queues.drain_outbound(output)
            }
            Conn::Failed => 0,
            _ => self.queues.drain_outbound(output),
        }
    }

    /// Returns the engine to [`HandshakeState::Before`] so it can drive the
    /// next connection. An established session is captured for resumption;
    /// if it cannot be serialized, the previously captured one is kept.
    pub fn reset(&mut self) -> Result<()> {
        if let Conn::Established(stream) = &self.conn {
            match stream.ssl().session().map(|s| s.to_der()) {
                Some(Ok(der)) => self.session = Some(der),
                Some(Err(e)) => debug!("session not captured, keeping previous: {e}"),
                None => {}
            }
        }
        self.queues.clear();
        self.last_error.clear();
        self.verify_failed = false;
        let ssl = configure_ssl(&self.context, &self.host, self.target_ip)?;
        self.conn = Conn::Idle(Box::new(ssl));
        Ok(())
    }

    /// Human-readable description of the last error; empty when none
    /// occurred. The string stays valid until the next failure.
    pub fn strerror(&self) -> &str {
        &self.last_error
    }

    /// Ciphertext queued for the peer and not yet drained.
    pub fn pending_outbound(&self) -> usize {
        self.queues.outbound_len()
    }

    /// Moves queued outbound ciphertext into `output` without driving the
    /// state machine.
    pub fn drain_outbound(&mut self, output: &mut [u8]) -> usize {
        self.queues.drain_outbound(output)
    }

    /// Whether the last failure was a certificate verification rejection.
    pub fn verify_failed(&self) -> bool {
        self.verify_failed
    }

    fn start_handshake(&mut self, mut ssl: Ssl) -> Conn {
        if let Some(blob) = &self.session {
            match SslSession::from_der(blob) {
                // SAFETY: the session was serialized from a connection minted
                // off the same context; OpenSSL takes its own reference for
                // the duration of the call.
                Ok(session) => unsafe {
                    if let Err(e) = ssl.set_session(&session) {
                        debug!("unable to offer resumption session: {e}");
                    }
                },
                Err(e) => debug!("discarding unparseable resumption session: {e}"),
            }
        }
        let result = ssl.connect(self.queues.clone());
        self.drive_handshake(result)
    }

    fn drive_handshake(
        &mut self,
        result: std::result::Result<SslStream<QueuePair>, HandshakeError<QueuePair>>,
    ) -> Conn {
        match result {
            Ok(stream) => {
                trace!("handshake complete for {}", self.host);
                Conn::Established(stream)
            }
            Err(HandshakeError::WouldBlock(mid)) => Conn::Handshaking(Box::new(mid)),
            Err(HandshakeError::Failure(mid)) => {
                let verify = mid.ssl().verify_result();
                let message = if verify != X509VerifyResult::OK {
                    self.verify_failed = true;
                    format!("certificate verify failed: {}", verify.error_string())
                } else {
                    mid.error().to_string()
                };
                debug!("handshake failed for {}: {message}", self.host);
                self.last_error = message;
                Conn::Failed
            }
            Err(HandshakeError::SetupFailure(stack)) => {
                self.last_error = stack.to_string();
                Conn::Failed
            }
        }
    }

    fn fail(&mut self, message: &str) {
        self.last_error = message.to_string();
        self.conn = Conn::Failed;
    }
}

fn configure_ssl(context: &TlsContext, host: &str, target_ip: Option<IpAddr>) -> Result<Ssl> {
    let mut ssl = Ssl::new(context.ssl())?;
    if target_ip.is_none() {
        // SNI carries DNS names only
        ssl.set_hostname(host)?;
    }
    ssl.param_mut().set_host(host)?;

    let verifier = context.verifier();
    ssl.set_verify_callback(SslVerifyMode::PEER, move |preverify, x509_ctx| {
        verify_connection(preverify, x509_ctx, target_ip, verifier.as_ref())
    });
    Ok(ssl)
}

/// Per-depth verification hook.
///
/// At depth 0 a name mismatch against an IP-literal target is patched by
/// walking the leaf's iPAddress subject-alt-names and comparing raw
/// 4/16-byte encodings. When an application verifier is registered,
/// intermediates are accepted unconditionally and the leaf's trust verdict
/// is delegated to it. The two steps are independent: a patched name
/// mismatch never bypasses the verifier, and a mismatch the patch cannot
/// clear stays fatal regardless of the verifier's verdict.
fn verify_connection(
    preverify: bool,
    x509_ctx: &mut X509StoreContextRef,
    target_ip: Option<IpAddr>,
    verifier: Option<&Arc<VerifyFn>>,
) -> bool {
    let depth = x509_ctx.error_depth();

    let hostname_mismatch =
        unsafe { X509VerifyResult::from_raw(openssl_sys::X509_V_ERR_HOSTNAME_MISMATCH) };
    let mut ok = preverify;
    if !ok && depth == 0 && x509_ctx.error() == hostname_mismatch {
        ok = match (target_ip, x509_ctx.current_cert()) {
            (Some(ip), Some(cert)) => cert_matches_ip(cert, ip),
            _ => false,
        };
        if !ok {
            return false;
        }
    }

    if let Some(verify) = verifier {
        if depth > 0 {
            return true;
        }
        let trusted = x509_ctx
            .current_cert()
            .map(|cert| (**verify)(cert))
            .unwrap_or(false);
        if !trusted {
            x509_ctx.set_error(X509VerifyResult::APPLICATION_VERIFICATION);
        }
        return trusted;
    }

    ok
}

fn cert_matches_ip(cert: &X509Ref, ip: IpAddr) -> bool {
    let Some(names) = cert.subject_alt_names() else {
        return false;
    };
    let v4;
    let v6;
    let octets: &[u8] = match ip {
        IpAddr::V4(addr) => {
            v4 = addr.octets();
            &v4
        }
        IpAddr::V6(addr) => {
            v6 = addr.octets();
            &v6
        }
    };
    names.iter().any(|name| name.ipaddress() == Some(octets))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> TlsContext {
        TlsContext::builder()
            .alpn_protocols(["h2", "http/1.1"])
            .build()
            .unwrap()
    }

    #[test]
    fn test_new_engine_starts_before() {
        let engine = context().new_engine("example.com").unwrap();
        assert_eq!(engine.handshake_state(), HandshakeState::Before);
        assert_eq!(engine.get_alpn(), None);
        assert_eq!(engine.strerror(), "");
        assert_eq!(engine.pending_outbound(), 0);
    }

    #[test]
    fn test_first_handshake_call_emits_client_hello() {
        let mut engine = context().new_engine("example.com").unwrap();
        let mut out = vec![0u8; 4096];
        let (state, n) = engine.handshake(&[], &mut out);
        assert_eq!(state, HandshakeState::Continue);
        assert!(n > 0);
        // TLS handshake record
        assert_eq!(out[0], 0x16);
    }

    #[test]
    fn test_undersized_output_buffer_leaves_remainder_queued() {
        let mut engine = context().new_engine("example.com").unwrap();
        let mut tiny = [0u8; 8];
        let (state, n) = engine.handshake(&[], &mut tiny);
        assert_eq!(state, HandshakeState::Continue);
        assert_eq!(n, tiny.len());
        assert!(engine.pending_outbound() > 0);

        // repeated calls with no input drain the rest
        let mut rest = vec![0u8; 4096];
        let (state, n) = engine.handshake(&[], &mut rest);
        assert_eq!(state, HandshakeState::Continue);
        assert!(n > 0);
        assert_eq!(engine.pending_outbound(), 0);
    }

    #[test]
    fn test_read_write_before_completion_fail() {
        let mut engine = context().new_engine("example.com").unwrap();
        let mut buf = [0u8; 128];
        assert!(matches!(
            engine.write(b"data", &mut buf),
            Err(Error::Handshake(_))
        ));
        assert!(matches!(engine.read(&[], &mut buf), Err(Error::Handshake(_))));
    }

    #[test]
    fn test_close_before_handshake_emits_nothing() {
        let mut engine = context().new_engine("example.com").unwrap();
        let mut buf = [0u8; 128];
        assert_eq!(engine.close(&mut buf), 0);
    }

    #[test]
    fn test_reset_discards_in_flight_state() {
        let mut engine = context().new_engine("example.com").unwrap();
        let mut out = vec![0u8; 4096];
        engine.handshake(&[], &mut out);
        assert_eq!(engine.handshake_state(), HandshakeState::Continue);

        engine.reset().unwrap();
        assert_eq!(engine.handshake_state(), HandshakeState::Before);
        assert_eq!(engine.pending_outbound(), 0);
    }

    #[test]
    fn test_ip_literal_target_is_parsed() {
        let engine = context().new_engine("127.0.0.1").unwrap();
        assert_eq!(engine.target_ip, Some("127.0.0.1".parse().unwrap()));
        let engine = context().new_engine("::1").unwrap();
        assert_eq!(engine.target_ip, Some("::1".parse().unwrap()));
        let engine = context().new_engine("example.com").unwrap();
        assert_eq!(engine.target_ip, None);
    }
}

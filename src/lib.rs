//! tlslink: client-side TLS engine with a tokio stream adapter
//!
//! This crate splits TLS into two layers so higher-level network code can
//! drive encrypted streams without caring which cryptographic library
//! handles records:
//!
//! 1. [`Engine`] is a buffer-in/buffer-out state machine. It consumes
//!    ciphertext received from the peer, produces ciphertext to send, and
//!    exchanges plaintext with the application. It never performs I/O.
//! 2. [`TlsStream`] is an asynchronous adapter owning a TCP socket and one
//!    engine, pumping bytes in both directions and exposing the result as
//!    `AsyncRead`/`AsyncWrite`.
//!
//! Engines are minted from a shared [`TlsContext`] carrying trust anchors,
//! ALPN preference, an optional client identity, and an optional
//! application verifier for the peer's leaf certificate. Private keys come
//! in two shapes with one signing surface: in-memory keys and keys
//! resident on PKCS#11 tokens.
//!
//! # Examples
//!
//! ```no_run
//! use tlslink::{TlsContext, TlsStream};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! # async fn run() -> tlslink::Result<()> {
//! let ctx = TlsContext::builder()
//!     .alpn_protocols(["h2", "http/1.1"])
//!     .build()?;
//!
//! let mut stream = TlsStream::new(ctx);
//! stream.connect("example.com", 443).await?;
//! assert!(stream.alpn().is_some());
//!
//! stream.write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n").await?;
//! let mut response = Vec::new();
//! stream.read_to_end(&mut response).await?;
//! stream.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Driving the engine directly, without the adapter:
//!
//! ```no_run
//! use tlslink::{HandshakeState, TlsContext};
//!
//! # fn run() -> tlslink::Result<()> {
//! let ctx = TlsContext::with_defaults()?;
//! let mut engine = ctx.new_engine("example.com")?;
//!
//! let mut out = vec![0u8; 16 * 1024];
//! let (state, n) = engine.handshake(&[], &mut out);
//! assert_eq!(state, HandshakeState::Continue);
//! // send out[..n] to the peer, feed its reply back into handshake()
//! # let _ = n;
//! # Ok(())
//! # }
//! ```

pub mod cert;
pub mod context;
pub mod engine;
pub mod error;
pub mod key;
pub mod stream;

pub use cert::{generate_csr, parse_pkcs7_certs, verify_signature, CertChain, HashAlgo};
pub use context::{TlsContext, TlsContextBuilder};
pub use engine::{Engine, HandshakeState, ReadStatus};
pub use error::{Error, Result, TokenError};
pub use key::{KeyAlgorithm, PrivateKey, PublicKey, TokenConfig, TokenKey};
pub use stream::TlsStream;

/// Version of this crate.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

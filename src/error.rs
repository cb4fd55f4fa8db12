//! Error types for TLS engine, context, key, and stream operations.

use openssl::error::ErrorStack;

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, Error>;

/// TLS operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("certificate verification failed: {0}")]
    Verify(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("crypto operation failed: {0}")]
    Crypto(String),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] ErrorStack),
}

/// Hardware token (PKCS#11) errors
///
/// Each failure site gets its own kind so callers can distinguish a missing
/// driver from a bad PIN. The `reason` strings carry the token return code's
/// human-readable form.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("failed to load PKCS#11 driver {path}: {reason}")]
    DriverLoad { path: String, reason: String },

    #[error("failed to open session on slot {slot}: {reason}")]
    SessionOpen { slot: u64, reason: String },

    #[error("token login failed: {reason}")]
    Pin { reason: String },

    #[error("token object not found: {query}")]
    ObjectNotFound { query: String },

    #[error("token operation failed: {0}")]
    Operation(String),
}

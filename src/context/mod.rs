//! Cryptographic context: the factory for TLS engines.
//!
//! A context is built once, carries the trust anchors, ALPN preference,
//! optional client identity, and optional custom peer verifier, and then
//! mints one engine per connection. The handle is cheap to clone and safe
//! to share; engines hold a clone, so the context always outlives them.

use crate::cert::CertChain;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::key::PrivateKey;
use log::{debug, warn};
use openssl::ssl::{SslContext, SslContextBuilder, SslMethod, SslSessionCacheMode, SslVerifyMode};
use openssl::x509::{X509Ref, X509};
use std::path::Path;
use std::sync::Arc;

// Possible certificate bundle files; the first readable one wins.
#[cfg(unix)]
const CA_BUNDLE_PATHS: &[&str] = &[
    "/etc/ssl/certs/ca-certificates.crt",                // Debian/Ubuntu/Gentoo etc.
    "/etc/pki/tls/certs/ca-bundle.crt",                  // Fedora/RHEL 6
    "/etc/ssl/ca-bundle.pem",                            // OpenSUSE
    "/etc/pki/tls/cacert.pem",                           // OpenELEC
    "/etc/pki/ca-trust/extracted/pem/tls-ca-bundle.pem", // CentOS/RHEL 7
    "/etc/ssl/cert.pem",                                 // macOS
];

/// Environment variable raising handshake diagnostic verbosity.
const DEBUG_ENV: &str = "TLSLINK_DEBUG";

/// Application-delegated verification of the peer's leaf certificate.
pub(crate) type VerifyFn = dyn Fn(&X509Ref) -> bool + Send + Sync;

struct Inner {
    ssl: SslContext,
    alpn: Vec<String>,
    verifier: Option<Arc<VerifyFn>>,
    debug_level: u8,
}

/// Shared TLS configuration (immutable after building).
#[derive(Clone)]
pub struct TlsContext {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("alpn", &self.inner.alpn)
            .field("has_verifier", &self.inner.verifier.is_some())
            .field("debug_level", &self.inner.debug_level)
            .finish()
    }
}

impl TlsContext {
    /// Creates a new configuration builder.
    pub fn builder() -> TlsContextBuilder {
        TlsContextBuilder::new()
    }

    /// Builds a context with the platform default trust store and no ALPN,
    /// identity, or custom verifier.
    pub fn with_defaults() -> Result<Self> {
        Self::builder().build()
    }

    /// Mints a new engine for a connection to `host`. The host is used for
    /// SNI and certificate name checking; an IPv4/IPv6 literal enables
    /// IP-SAN matching instead.
    pub fn new_engine(&self, host: &str) -> Result<Engine> {
        if host.trim().is_empty() {
            return Err(Error::Config("hostname must not be empty".to_string()));
        }
        Engine::new(self.clone(), host)
    }

    /// The configured ALPN preference list, most preferred first.
    pub fn alpn_protocols(&self) -> &[String] {
        &self.inner.alpn
    }

    /// Name and version of the TLS backend.
    pub fn backend_version() -> &'static str {
        openssl::version::version()
    }

    pub(crate) fn ssl(&self) -> &SslContext {
        &self.inner.ssl
    }

    pub(crate) fn verifier(&self) -> Option<Arc<VerifyFn>> {
        self.inner.verifier.clone()
    }

    pub(crate) fn debug_level(&self) -> u8 {
        self.inner.debug_level
    }
}

/// Builder for [`TlsContext`].
pub struct TlsContextBuilder {
    ca: Option<Vec<u8>>,
    alpn: Vec<String>,
    own_cert: Option<CertChain>,
    own_key: Option<PrivateKey>,
    cert_error: Option<String>,
    verifier: Option<Arc<VerifyFn>>,
}

impl TlsContextBuilder {
    fn new() -> Self {
        TlsContextBuilder {
            ca: None,
            alpn: Vec::new(),
            own_cert: None,
            own_key: None,
            cert_error: None,
            verifier: None,
        }
    }

    /// Sets the trust anchors from a PEM buffer or a bundle file path.
    /// Without this the platform default trust store is probed.
    pub fn ca_bundle(mut self, ca: impl Into<Vec<u8>>) -> Self {
        self.ca = Some(ca.into());
        self
    }

    /// Sets the ALPN preference list, most preferred first. The identifiers
    /// are presented verbatim during the handshake.
    pub fn alpn_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alpn = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the client certificate (PEM/DER buffer or path), parsed
    /// immediately. Requires [`own_key`](Self::own_key); a token key
    /// carrying a companion certificate makes this call optional.
    ///
    /// A certificate that fails to parse also drops a previously set key;
    /// the error is reported by [`build`](Self::build).
    pub fn own_cert(mut self, cert: impl Into<Vec<u8>>) -> Self {
        match CertChain::load(&cert.into()) {
            Ok(chain) => {
                self.own_cert = Some(chain);
                self.cert_error = None;
            }
            Err(e) => {
                self.own_cert = None;
                self.own_key = None;
                self.cert_error = Some(format!("failed to load own certificate: {e}"));
            }
        }
        self
    }

    /// Sets the client authentication key.
    pub fn own_key(mut self, key: PrivateKey) -> Self {
        self.own_key = Some(key);
        self
    }

    /// Installs an application verifier for the peer's leaf certificate.
    /// Intermediates are accepted unconditionally; the closure's verdict
    /// decides trust in the leaf.
    pub fn cert_verifier<F>(mut self, verify: F) -> Self
    where
        F: Fn(&X509Ref) -> bool + Send + Sync + 'static,
    {
        self.verifier = Some(Arc::new(verify));
        self
    }

    /// Builds the immutable context.
    pub fn build(self) -> Result<TlsContext> {
        let TlsContextBuilder {
            ca,
            alpn,
            own_cert,
            own_key,
            cert_error,
            verifier,
        } = self;

        if let Some(message) = cert_error {
            return Err(Error::Config(message));
        }

        let mut builder = SslContextBuilder::new(SslMethod::tls_client())?;
        builder.set_verify(SslVerifyMode::PEER);
        builder.set_session_cache_mode(SslSessionCacheMode::CLIENT);

        apply_trust(&mut builder, ca.as_deref())?;

        if !alpn.is_empty() {
            let wire = encode_alpn(&alpn)?;
            builder.set_alpn_protos(&wire)?;
        }

        if let Some(key) = &own_key {
            let chain = match own_cert {
                Some(chain) => chain,
                None => key.certificate()?.ok_or_else(|| {
                    Error::Config("own key has no associated certificate".to_string())
                })?,
            };
            let Some(pkey) = key.software_pkey() else {
                return Err(Error::Config(
                    "token-backed keys cannot serve as the handshake identity with the OpenSSL backend"
                        .to_string(),
                ));
            };
            builder.set_certificate(chain.leaf())?;
            for extra in chain.iter().skip(1) {
                builder.add_extra_chain_cert(extra.to_owned())?;
            }
            builder.set_private_key(pkey)?;
            builder.check_private_key().map_err(|e| {
                Error::Config(format!("certificate does not match private key: {e}"))
            })?;
        } else if own_cert.is_some() {
            return Err(Error::Config(
                "own certificate set without a private key".to_string(),
            ));
        }

        let debug_level = std::env::var(DEBUG_ENV)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);

        Ok(TlsContext {
            inner: Arc::new(Inner {
                ssl: builder.build(),
                alpn,
                verifier,
                debug_level,
            }),
        })
    }
}

/// Wire-encodes the ALPN list as length-prefixed identifiers.
fn encode_alpn(protocols: &[String]) -> Result<Vec<u8>> {
    let mut wire = Vec::new();
    for proto in protocols {
        if proto.is_empty() || proto.len() > 255 {
            return Err(Error::Config(format!("invalid ALPN protocol {proto:?}")));
        }
        wire.push(proto.len() as u8);
        wire.extend_from_slice(proto.as_bytes());
    }
    Ok(wire)
}

fn apply_trust(builder: &mut SslContextBuilder, ca: Option<&[u8]>) -> Result<()> {
    let Some(buf) = ca else {
        return apply_default_trust(builder);
    };

    if let Ok(certs) = X509::stack_from_pem(buf) {
        if !certs.is_empty() {
            let store = builder.cert_store_mut();
            for cert in certs {
                store.add_cert(cert)?;
            }
            return Ok(());
        }
    }

    if let Ok(path) = std::str::from_utf8(buf) {
        let path = path.trim_end_matches('\0').trim();
        if Path::new(path).is_file() {
            builder
                .set_ca_file(path)
                .map_err(|e| Error::Config(format!("failed to load CA bundle {path}: {e}")))?;
            return Ok(());
        }
    }

    Err(Error::Config("unable to parse CA bundle".to_string()))
}

fn apply_default_trust(builder: &mut SslContextBuilder) -> Result<()> {
    #[cfg(unix)]
    {
        for path in CA_BUNDLE_PATHS {
            if Path::new(path).is_file() {
                debug!("using system CA bundle {path}");
                builder
                    .set_ca_file(path)
                    .map_err(|e| Error::Config(format!("failed to load CA bundle {path}: {e}")))?;
                return Ok(());
            }
        }
        warn!("no system CA bundle found, using the backend's default verify paths");
    }

    builder.set_default_verify_paths()?;
    Ok(())
}

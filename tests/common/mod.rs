//! Shared test support: certificate generation and threaded TLS servers.
#![allow(dead_code)] // each test binary uses its own subset

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::ssl::{AlpnError, ErrorCode, Ssl, SslContext, SslContextBuilder, SslMethod};
use openssl::x509::extension::{BasicConstraints, SubjectAlternativeName};
use openssl::x509::{X509Name, X509NameBuilder, X509NameRef, X509};
use std::io::Write;
use std::net::{SocketAddr, TcpListener};
use std::thread::{self, JoinHandle};

pub struct TestCert {
    pub cert: X509,
    pub key: PKey<Private>,
}

impl TestCert {
    pub fn cert_pem(&self) -> Vec<u8> {
        self.cert.to_pem().unwrap()
    }
}

fn name(cn: &str) -> X509Name {
    let mut builder = X509NameBuilder::new().unwrap();
    builder.append_entry_by_text("CN", cn).unwrap();
    builder.build()
}

fn random_serial() -> openssl::asn1::Asn1Integer {
    let mut serial = BigNum::new().unwrap();
    serial.rand(127, MsbOption::MAYBE_ZERO, false).unwrap();
    serial.to_asn1_integer().unwrap()
}

fn base_builder(subject: &X509NameRef, issuer: &X509NameRef, key: &PKey<Private>) -> openssl::x509::X509Builder {
    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&random_serial()).unwrap();
    builder.set_subject_name(subject).unwrap();
    builder.set_issuer_name(issuer).unwrap();
    builder.set_pubkey(key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(30).unwrap())
        .unwrap();
    builder
}

/// Self-signed certificate authority.
pub fn authority(cn: &str) -> TestCert {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let subject = name(cn);
    let mut builder = base_builder(&subject, &subject, &key);
    builder
        .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    TestCert {
        cert: builder.build(),
        key,
    }
}

/// End-entity certificate signed by `ca`, with optional DNS and IP SANs.
pub fn issued(ca: &TestCert, cn: &str, dns: &[&str], ips: &[&str]) -> TestCert {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let subject = name(cn);
    let mut builder = base_builder(&subject, ca.cert.subject_name(), &key);

    if !dns.is_empty() || !ips.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for d in dns {
            san.dns(d);
        }
        for ip in ips {
            san.ip(ip);
        }
        let ext = san.build(&builder.x509v3_context(Some(&ca.cert), None)).unwrap();
        builder.append_extension(ext).unwrap();
    }

    builder.sign(&ca.key, MessageDigest::sha256()).unwrap();
    TestCert {
        cert: builder.build(),
        key,
    }
}

/// Self-signed end-entity certificate.
pub fn self_signed(cn: &str, dns: &[&str], ips: &[&str]) -> TestCert {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let subject = name(cn);
    let mut builder = base_builder(&subject, &subject, &key);
    if !dns.is_empty() || !ips.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for d in dns {
            san.dns(d);
        }
        for ip in ips {
            san.ip(ip);
        }
        let ext = san.build(&builder.x509v3_context(None, None)).unwrap();
        builder.append_extension(ext).unwrap();
    }
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    TestCert {
        cert: builder.build(),
        key,
    }
}

/// Server-side SSL context with an optional ALPN allow list.
pub fn server_ssl_context(cert: &TestCert, alpn: &[&str]) -> SslContext {
    let mut builder = SslContextBuilder::new(SslMethod::tls_server()).unwrap();
    builder.set_certificate(&cert.cert).unwrap();
    builder.set_private_key(&cert.key).unwrap();
    builder.check_private_key().unwrap();

    if !alpn.is_empty() {
        let supported: Vec<Vec<u8>> = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        builder.set_alpn_select_callback(move |_ssl, client_protos| {
            let mut pos = 0;
            while pos < client_protos.len() {
                let len = client_protos[pos] as usize;
                pos += 1;
                if pos + len > client_protos.len() {
                    break;
                }
                let candidate = &client_protos[pos..pos + len];
                if supported.iter().any(|p| p.as_slice() == candidate) {
                    return Ok(candidate);
                }
                pos += len;
            }
            Err(AlpnError::NOACK)
        });
    }
    builder.build()
}

/// Accepts one TLS connection, echoes until the peer closes, then shuts
/// down. Returns whether the peer closed cleanly with close_notify.
pub fn spawn_echo_server(ctx: SslContext) -> (SocketAddr, JoinHandle<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (tcp, _) = listener.accept().unwrap();
        let ssl = Ssl::new(&ctx).unwrap();
        let mut stream = match ssl.accept(tcp) {
            Ok(stream) => stream,
            Err(_) => return false,
        };
        let mut buf = [0u8; 4096];
        loop {
            match stream.ssl_read(&mut buf) {
                Ok(0) => return false,
                Ok(n) => {
                    if stream.ssl_write(&buf[..n]).is_err() {
                        return false;
                    }
                    let _ = stream.flush();
                }
                Err(e) if e.code() == ErrorCode::ZERO_RETURN => {
                    let _ = stream.shutdown();
                    return true;
                }
                Err(_) => return false,
            }
        }
    });
    (addr, handle)
}

/// Accepts one TLS connection, writes `payload`, and closes cleanly.
pub fn spawn_send_then_close_server(
    ctx: SslContext,
    payload: &'static [u8],
) -> (SocketAddr, JoinHandle<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (tcp, _) = listener.accept().unwrap();
        let ssl = Ssl::new(&ctx).unwrap();
        let mut stream = match ssl.accept(tcp) {
            Ok(stream) => stream,
            Err(_) => return false,
        };
        if stream.ssl_write(payload).is_err() {
            return false;
        }
        let _ = stream.flush();
        stream.shutdown().is_ok()
    });
    (addr, handle)
}

/// Accepts one TCP connection but never speaks TLS, then exits.
pub fn spawn_stalled_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        if let Ok((conn, _)) = listener.accept() {
            thread::sleep(std::time::Duration::from_secs(2));
            drop(conn);
        }
    });
    addr
}

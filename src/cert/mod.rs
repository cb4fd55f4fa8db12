//! X.509 certificate chains and signature verification.
//!
//! A chain is an ordered list of certificates, leaf first. Chains load from
//! PEM buffers, DER buffers, or filesystem paths, emit PEM for the leaf or
//! the whole chain, and verify detached signatures against a certificate's
//! public key, including raw ECDSA signatures from hardware tokens, which
//! are rewrapped as DER `SEQUENCE { INTEGER r, INTEGER s }` and retried.

mod csr;
pub(crate) mod der;
mod pkcs7;

pub use csr::generate_csr;
pub use pkcs7::parse_pkcs7_certs;

use crate::error::{Error, Result};
use openssl::bn::BigNum;
use openssl::ecdsa::EcdsaSig;
use openssl::hash::MessageDigest;
use openssl::pkey::Id;
use openssl::sign::Verifier;
use openssl::x509::{X509Ref, X509};
use std::path::Path;

/// Digest algorithm used for signing and verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgo {
    pub(crate) fn digest(self) -> MessageDigest {
        match self {
            HashAlgo::Sha256 => MessageDigest::sha256(),
            HashAlgo::Sha384 => MessageDigest::sha384(),
            HashAlgo::Sha512 => MessageDigest::sha512(),
        }
    }
}

/// Ordered certificate chain, leaf first.
#[derive(Debug, Clone)]
pub struct CertChain {
    certs: Vec<X509>,
}

impl CertChain {
    /// Builds a chain from parsed certificates. Fails on an empty list.
    pub fn from_certs(certs: Vec<X509>) -> Result<Self> {
        if certs.is_empty() {
            return Err(Error::Protocol("certificate chain is empty".to_string()));
        }
        Ok(CertChain { certs })
    }

    /// Loads a chain from a PEM buffer, a DER buffer, or a filesystem path.
    pub fn load(source: &[u8]) -> Result<Self> {
        if let Ok(certs) = X509::stack_from_pem(source) {
            if !certs.is_empty() {
                return Self::from_certs(certs);
            }
        }
        if let Ok(cert) = X509::from_der(source) {
            return Self::from_certs(vec![cert]);
        }
        if let Ok(path) = std::str::from_utf8(source) {
            let path = path.trim_end_matches('\0').trim();
            if Path::new(path).is_file() {
                let bytes = std::fs::read(path)?;
                return Self::load(&bytes);
            }
        }
        Err(Error::Protocol("unable to parse certificate source".to_string()))
    }

    pub fn leaf(&self) -> &X509Ref {
        &self.certs[0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &X509Ref> {
        self.certs.iter().map(|c| c.as_ref())
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Emits PEM for the leaf only, or for the full chain leaf-first.
    pub fn to_pem(&self, full_chain: bool) -> Result<String> {
        let mut out = String::new();
        for cert in &self.certs {
            let pem = cert.to_pem()?;
            out.push_str(std::str::from_utf8(&pem).map_err(|_| {
                Error::Protocol("certificate PEM is not valid UTF-8".to_string())
            })?);
            if !full_chain {
                break;
            }
        }
        Ok(out)
    }
}

/// Verifies `sig` over `data` against the certificate's public key.
///
/// Data is hashed with the requested algorithm. For ECDSA keys a failed
/// verification is retried with the signature rewrapped from the raw
/// fixed-width `r || s` form into DER, which is what PKCS#11 tokens emit.
pub fn verify_signature(cert: &X509Ref, algo: HashAlgo, data: &[u8], sig: &[u8]) -> Result<()> {
    let pkey = cert.public_key()?;
    let mut verifier = Verifier::new(algo.digest(), &pkey)?;
    if verifier.verify_oneshot(sig, data).unwrap_or(false) {
        return Ok(());
    }

    if pkey.id() == Id::EC {
        let der = ecdsa_raw_to_der(sig)?;
        let mut verifier = Verifier::new(algo.digest(), &pkey)?;
        if verifier.verify_oneshot(&der, data).unwrap_or(false) {
            return Ok(());
        }
    }

    Err(Error::Crypto("signature verification failed".to_string()))
}

/// Rewraps a raw fixed-width ECDSA signature as DER by splitting the buffer
/// in half into `r` and `s`.
pub(crate) fn ecdsa_raw_to_der(sig: &[u8]) -> Result<Vec<u8>> {
    if sig.is_empty() || sig.len() % 2 != 0 {
        return Err(Error::Crypto(format!(
            "raw ECDSA signature has odd length {}",
            sig.len()
        )));
    }
    let half = sig.len() / 2;
    let r = BigNum::from_slice(&sig[..half])?;
    let s = BigNum::from_slice(&sig[half..])?;
    let wrapped = EcdsaSig::from_private_components(r, s)?;
    Ok(wrapped.to_der()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::asn1::Asn1Time;
    use openssl::ec::{EcGroup, EcKey};
    use openssl::nid::Nid;
    use openssl::pkey::{PKey, Private};
    use openssl::rsa::Rsa;
    use openssl::sign::Signer;
    use openssl::x509::X509NameBuilder;

    fn make_cert(key: &PKey<Private>, cn: &str) -> X509 {
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", cn).unwrap();
        let name = name.build();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(30).unwrap())
            .unwrap();
        builder.sign(key, MessageDigest::sha256()).unwrap();
        builder.build()
    }

    fn rsa_key() -> PKey<Private> {
        PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
    }

    fn ec_key() -> PKey<Private> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
    }

    #[test]
    fn test_pem_roundtrip() {
        let key = rsa_key();
        let leaf = make_cert(&key, "leaf");
        let issuer = make_cert(&key, "issuer");
        let chain = CertChain::from_certs(vec![leaf, issuer]).unwrap();

        let pem = chain.to_pem(true).unwrap();
        let reparsed = CertChain::load(pem.as_bytes()).unwrap();
        assert_eq!(reparsed.len(), 2);
        assert_eq!(reparsed.to_pem(true).unwrap(), pem);

        let leaf_only = chain.to_pem(false).unwrap();
        assert_eq!(CertChain::load(leaf_only.as_bytes()).unwrap().len(), 1);
    }

    #[test]
    fn test_load_from_der_and_path() {
        let key = rsa_key();
        let cert = make_cert(&key, "der");
        let der = cert.to_der().unwrap();
        assert_eq!(CertChain::load(&der).unwrap().len(), 1);

        let path = std::env::temp_dir().join(format!("tlslink-cert-{}.pem", std::process::id()));
        std::fs::write(&path, cert.to_pem().unwrap()).unwrap();
        let loaded = CertChain::load(path.to_str().unwrap().as_bytes()).unwrap();
        assert_eq!(loaded.len(), 1);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_rejects_garbage() {
        assert!(CertChain::load(b"not a certificate").is_err());
    }

    #[test]
    fn test_verify_rsa_signature() {
        let key = rsa_key();
        let cert = make_cert(&key, "signer");
        let data = b"signed payload";

        let mut signer = Signer::new(MessageDigest::sha256(), &key).unwrap();
        let sig = signer.sign_oneshot_to_vec(data).unwrap();

        verify_signature(&cert, HashAlgo::Sha256, data, &sig).unwrap();
        assert!(verify_signature(&cert, HashAlgo::Sha256, b"other payload", &sig).is_err());
        assert!(verify_signature(&cert, HashAlgo::Sha384, data, &sig).is_err());
    }

    #[test]
    fn test_verify_ecdsa_raw_signature_fallback() {
        let key = ec_key();
        let cert = make_cert(&key, "ec-signer");
        let data = b"token payload";

        let mut signer = Signer::new(MessageDigest::sha256(), &key).unwrap();
        let der_sig = signer.sign_oneshot_to_vec(data).unwrap();
        verify_signature(&cert, HashAlgo::Sha256, data, &der_sig).unwrap();

        // Convert to the raw fixed-width form a PKCS#11 token would return.
        let parsed = EcdsaSig::from_der(&der_sig).unwrap();
        let mut raw = vec![0u8; 64];
        let r = parsed.r().to_vec();
        let s = parsed.s().to_vec();
        raw[32 - r.len()..32].copy_from_slice(&r);
        raw[64 - s.len()..].copy_from_slice(&s);

        verify_signature(&cert, HashAlgo::Sha256, data, &raw).unwrap();
    }

    #[test]
    fn test_ecdsa_rewrap_rejects_odd_length() {
        assert!(ecdsa_raw_to_der(&[1, 2, 3]).is_err());
        assert!(ecdsa_raw_to_der(&[]).is_err());
    }
}

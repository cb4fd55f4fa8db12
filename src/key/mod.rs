//! Private key abstraction over in-memory keys and PKCS#11 token keys.
//!
//! Both variants expose the same capability set: sign a payload under a
//! chosen digest, export the public half, and (for token keys) fetch or
//! store the companion certificate resident on the device. Signing returns
//! the backend-native signature format: DER for software ECDSA keys, raw
//! `r || s` for token ECDSA keys. Verification helpers accept either.

pub mod token;

pub use token::{TokenConfig, TokenKey};

use crate::cert::{ecdsa_raw_to_der, CertChain, HashAlgo};
use crate::error::{Error, Result};
use openssl::ec::{EcGroup, EcKey};
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey, Private, Public};
use openssl::sign::{Signer, Verifier};
use std::path::Path;

/// Signing algorithm family of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa,
    Ecdsa,
}

/// A signing-capable private key.
pub enum PrivateKey {
    Software(SoftwareKey),
    Token(TokenKey),
}

impl PrivateKey {
    /// Loads a software key from a PEM buffer, a DER buffer, or a path.
    pub fn load(source: &[u8]) -> Result<Self> {
        if let Ok(pkey) = PKey::private_key_from_pem(source) {
            return Ok(PrivateKey::Software(SoftwareKey::from_pkey(pkey)?));
        }
        if let Ok(pkey) = PKey::private_key_from_der(source) {
            return Ok(PrivateKey::Software(SoftwareKey::from_pkey(pkey)?));
        }
        if let Ok(path) = std::str::from_utf8(source) {
            let path = path.trim_end_matches('\0').trim();
            if Path::new(path).is_file() {
                let bytes = std::fs::read(path)?;
                return Self::load(&bytes);
            }
        }
        Err(Error::Config("unable to parse private key source".to_string()))
    }

    /// Generates a fresh software key (EC P-256).
    pub fn generate() -> Result<Self> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        let ec = EcKey::generate(&group)?;
        Ok(PrivateKey::Software(SoftwareKey::from_pkey(PKey::from_ec_key(ec)?)?))
    }

    /// Loads a key resident on a PKCS#11 token.
    pub fn from_token(config: &TokenConfig) -> Result<Self> {
        Ok(PrivateKey::Token(TokenKey::load(config)?))
    }

    /// Signs `data` hashed with `algo`, returning the backend-native
    /// signature format.
    pub fn sign(&self, algo: HashAlgo, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            PrivateKey::Software(key) => key.sign(algo, data),
            PrivateKey::Token(key) => Ok(key.sign(algo, data)?),
        }
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            PrivateKey::Software(key) => key.algorithm(),
            PrivateKey::Token(key) => key.algorithm(),
        }
    }

    pub fn public_key(&self) -> Result<PublicKey> {
        let spki = match self {
            PrivateKey::Software(key) => key.pkey.public_key_to_der()?,
            PrivateKey::Token(key) => key.public_key_der().to_vec(),
        };
        PublicKey::from_der(&spki)
    }

    /// Emits the private key as PKCS#8 PEM. Token keys never leave the
    /// device and cannot be exported.
    pub fn to_pem(&self) -> Result<String> {
        match self {
            PrivateKey::Software(key) => {
                let pem = key.pkey.private_key_to_pem_pkcs8()?;
                String::from_utf8(pem)
                    .map_err(|_| Error::Crypto("key PEM is not valid UTF-8".to_string()))
            }
            PrivateKey::Token(_) => Err(Error::Config(
                "token-resident keys cannot be exported".to_string(),
            )),
        }
    }

    /// Returns the certificate stored alongside a token key, if any.
    /// Software keys carry no companion certificate.
    pub fn certificate(&self) -> Result<Option<CertChain>> {
        match self {
            PrivateKey::Software(_) => Ok(None),
            PrivateKey::Token(key) => Ok(key.certificate()?),
        }
    }

    /// Stores a certificate next to a token key on the device.
    pub fn store_certificate(&self, cert: &openssl::x509::X509Ref) -> Result<()> {
        match self {
            PrivateKey::Software(_) => Err(Error::Config(
                "software keys have no certificate store".to_string(),
            )),
            PrivateKey::Token(key) => Ok(key.store_certificate(cert)?),
        }
    }

    /// The resident OpenSSL key for software keys; `None` for token keys,
    /// whose private material is not available to the process.
    pub(crate) fn software_pkey(&self) -> Option<&PKey<Private>> {
        match self {
            PrivateKey::Software(key) => Some(&key.pkey),
            PrivateKey::Token(_) => None,
        }
    }
}

/// An in-memory private key.
pub struct SoftwareKey {
    pkey: PKey<Private>,
}

impl SoftwareKey {
    fn from_pkey(pkey: PKey<Private>) -> Result<Self> {
        match pkey.id() {
            Id::RSA | Id::EC => Ok(SoftwareKey { pkey }),
            other => Err(Error::Config(format!("unsupported key type {other:?}"))),
        }
    }

    fn algorithm(&self) -> KeyAlgorithm {
        match self.pkey.id() {
            Id::RSA => KeyAlgorithm::Rsa,
            _ => KeyAlgorithm::Ecdsa,
        }
    }

    fn sign(&self, algo: HashAlgo, data: &[u8]) -> Result<Vec<u8>> {
        let mut signer = Signer::new(algo.digest(), &self.pkey)?;
        Ok(signer.sign_oneshot_to_vec(data)?)
    }
}

/// The public half of a key.
pub struct PublicKey {
    pkey: PKey<Public>,
}

impl PublicKey {
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        Ok(PublicKey {
            pkey: PKey::public_key_from_pem(pem)?,
        })
    }

    pub fn from_der(der: &[u8]) -> Result<Self> {
        Ok(PublicKey {
            pkey: PKey::public_key_from_der(der)?,
        })
    }

    pub fn to_pem(&self) -> Result<String> {
        let pem = self.pkey.public_key_to_pem()?;
        String::from_utf8(pem).map_err(|_| Error::Crypto("key PEM is not valid UTF-8".to_string()))
    }

    /// SubjectPublicKeyInfo encoding.
    pub fn to_der(&self) -> Result<Vec<u8>> {
        Ok(self.pkey.public_key_to_der()?)
    }

    /// Verifies `sig` over `data` hashed with `algo`. Raw fixed-width ECDSA
    /// signatures are rewrapped as DER and retried.
    pub fn verify(&self, algo: HashAlgo, data: &[u8], sig: &[u8]) -> Result<()> {
        let mut verifier = Verifier::new(algo.digest(), &self.pkey)?;
        if verifier.verify_oneshot(sig, data).unwrap_or(false) {
            return Ok(());
        }
        if self.pkey.id() == Id::EC {
            let der = ecdsa_raw_to_der(sig)?;
            let mut verifier = Verifier::new(algo.digest(), &self.pkey)?;
            if verifier.verify_oneshot(&der, data).unwrap_or(false) {
                return Ok(());
            }
        }
        Err(Error::Crypto("signature verification failed".to_string()))
    }
}

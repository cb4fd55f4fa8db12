//! PKCS#11 token-resident keys.
//!
//! A key is identified by `(driver path, slot id, PIN, key id | label)`;
//! exactly one of id or label selects the object. The driver library is
//! loaded and initialized at most once per process; every key owns its own
//! token session, so destroying one key never tears down a driver other
//! keys still use. Private material never leaves the device; the public
//! half is reconstructed from token attributes so the rest of the system
//! can treat the handle as an ordinary signing key.

use crate::cert::{der, CertChain, HashAlgo};
use crate::error::TokenError;
use crate::key::KeyAlgorithm;
use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, AttributeType, CertificateType, KeyType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::types::AuthPin;
use log::debug;
use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::{EcGroup, EcKey, EcPoint};
use openssl::hash::hash;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::{X509Ref, X509};
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Mutex, OnceLock};

/// DER-encoded namedCurve OID for P-256 (1.2.840.10045.3.1.7).
const EC_PARAMS_P256: &[u8] = &[0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];
/// P-384 (1.3.132.0.34).
const EC_PARAMS_P384: &[u8] = &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x22];
/// P-521 (1.3.132.0.35).
const EC_PARAMS_P521: &[u8] = &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x23];

/// Identity of a key on a PKCS#11 token. No `Debug` impl; the PIN stays
/// out of logs.
#[derive(Clone)]
pub struct TokenConfig {
    driver: String,
    slot: u64,
    pin: String,
    selector: Selector,
}

#[derive(Debug, Clone)]
enum Selector {
    /// CKA_ID, hex-decoded.
    Id(Vec<u8>),
    /// CKA_LABEL, UTF-8.
    Label(String),
}

impl Selector {
    fn describe(&self) -> String {
        match self {
            Selector::Id(id) => format!("id={}", encode_hex(id)),
            Selector::Label(label) => format!("label={label}"),
        }
    }

    fn attribute(&self) -> Attribute {
        match self {
            Selector::Id(id) => Attribute::Id(id.clone()),
            Selector::Label(label) => Attribute::Label(label.as_bytes().to_vec()),
        }
    }
}

impl TokenConfig {
    /// Builds a token key identity. `slot` is a numeric string, `id` a
    /// hex-encoded object id, `label` a UTF-8 string; exactly one of
    /// `id`/`label` must be non-empty.
    pub fn new(
        driver: &str,
        slot: &str,
        pin: &str,
        id: &str,
        label: &str,
    ) -> Result<Self, TokenError> {
        let slot = slot.trim().parse::<u64>().map_err(|_| {
            TokenError::Operation(format!("slot id {slot:?} is not numeric"))
        })?;
        let selector = match (id.is_empty(), label.is_empty()) {
            (false, true) => Selector::Id(decode_hex(id)?),
            (true, false) => Selector::Label(label.to_string()),
            _ => {
                return Err(TokenError::Operation(
                    "exactly one of key id or label must be set".to_string(),
                ))
            }
        };
        Ok(TokenConfig {
            driver: driver.to_string(),
            slot,
            pin: pin.to_string(),
            selector,
        })
    }
}

/// A private key resident on a PKCS#11 token.
pub struct TokenKey {
    session: Mutex<Session>,
    private: ObjectHandle,
    algorithm: KeyAlgorithm,
    /// Cached SubjectPublicKeyInfo of the public half.
    spki: Vec<u8>,
    selector: Selector,
}

/// Loaded drivers, keyed by library path. A driver is initialized once and
/// never finalized while the process runs; keys only own sessions.
static DRIVERS: OnceLock<Mutex<HashMap<String, Pkcs11>>> = OnceLock::new();

fn load_driver(path: &str) -> Result<Pkcs11, TokenError> {
    let mut drivers = DRIVERS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap();
    if let Some(driver) = drivers.get(path) {
        return Ok(driver.clone());
    }
    let driver = Pkcs11::new(path).map_err(|e| TokenError::DriverLoad {
        path: path.to_string(),
        reason: e.to_string(),
    })?;
    driver
        .initialize(CInitializeArgs::OsThreads)
        .map_err(|e| TokenError::DriverLoad {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
    debug!("initialized PKCS#11 driver {path}");
    drivers.insert(path.to_string(), driver.clone());
    Ok(driver)
}

fn open_session(config: &TokenConfig) -> Result<Session, TokenError> {
    let driver = load_driver(&config.driver)?;
    let slot = driver
        .get_slots_with_token()
        .map_err(operation)?
        .into_iter()
        .find(|s| s.id() == config.slot)
        .ok_or(TokenError::SessionOpen {
            slot: config.slot,
            reason: "no token present in slot".to_string(),
        })?;
    let session = driver
        .open_rw_session(slot)
        .map_err(|e| TokenError::SessionOpen {
            slot: config.slot,
            reason: e.to_string(),
        })?;
    session
        .login(UserType::User, Some(&AuthPin::new(config.pin.clone())))
        .map_err(|e| TokenError::Pin {
            reason: e.to_string(),
        })?;
    Ok(session)
}

fn find_object(
    session: &Session,
    class: ObjectClass,
    selector: &Selector,
) -> Result<ObjectHandle, TokenError> {
    let template = vec![Attribute::Class(class), selector.attribute()];
    session
        .find_objects(&template)
        .map_err(operation)?
        .into_iter()
        .next()
        .ok_or_else(|| TokenError::ObjectNotFound {
            query: format!("{:?} {}", class, selector.describe()),
        })
}

fn operation(e: impl Display) -> TokenError {
    TokenError::Operation(e.to_string())
}

impl TokenKey {
    /// Opens a session on the configured slot, authenticates, and locates
    /// the private key object and its public half.
    pub fn load(config: &TokenConfig) -> Result<Self, TokenError> {
        let session = open_session(config)?;
        let private = find_object(&session, ObjectClass::PRIVATE_KEY, &config.selector)?;

        let attrs = session
            .get_attributes(private, &[AttributeType::KeyType])
            .map_err(operation)?;
        let key_type = attrs
            .iter()
            .find_map(|a| match a {
                Attribute::KeyType(k) => Some(*k),
                _ => None,
            })
            .ok_or_else(|| operation("private key has no CKA_KEY_TYPE"))?;

        let (algorithm, spki) = if key_type == KeyType::RSA {
            (KeyAlgorithm::Rsa, rsa_spki(&session, &config.selector, private)?)
        } else if key_type == KeyType::EC {
            (KeyAlgorithm::Ecdsa, ec_spki_by_selector(&session, &config.selector)?)
        } else {
            return Err(operation(format!("unsupported token key type {key_type:?}")));
        };
        debug!("loaded token key {} ({algorithm:?})", config.selector.describe());

        Ok(TokenKey {
            session: Mutex::new(session),
            private,
            algorithm,
            spki,
            selector: config.selector.clone(),
        })
    }

    /// Generates a fresh EC P-256 keypair on the token under the configured
    /// id or label.
    pub fn generate(config: &TokenConfig) -> Result<Self, TokenError> {
        let session = open_session(config)?;
        let pub_template = vec![
            Attribute::Token(true),
            Attribute::Verify(true),
            Attribute::EcParams(EC_PARAMS_P256.to_vec()),
            config.selector.attribute(),
        ];
        let priv_template = vec![
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sign(true),
            config.selector.attribute(),
        ];
        let (public, private) = session
            .generate_key_pair(&Mechanism::EccKeyPairGen, &pub_template, &priv_template)
            .map_err(operation)?;
        let spki = ec_spki(&session, public)?;

        Ok(TokenKey {
            session: Mutex::new(session),
            private,
            algorithm: KeyAlgorithm::Ecdsa,
            spki,
            selector: config.selector.clone(),
        })
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// SubjectPublicKeyInfo of the cached public half.
    pub fn public_key_der(&self) -> &[u8] {
        &self.spki
    }

    /// Signs the digest of `data` on the token. RSA keys sign a DigestInfo
    /// under CKM_RSA_PKCS; EC keys sign the bare digest under CKM_ECDSA and
    /// return the token's raw fixed-width signature unchanged.
    pub fn sign(&self, algo: HashAlgo, data: &[u8]) -> Result<Vec<u8>, TokenError> {
        let digest = hash(algo.digest(), data).map_err(operation)?;
        let session = self.session.lock().unwrap();
        match self.algorithm {
            KeyAlgorithm::Rsa => {
                let mut message = digest_info_prefix(algo).to_vec();
                message.extend_from_slice(&digest);
                session
                    .sign(&Mechanism::RsaPkcs, self.private, &message)
                    .map_err(operation)
            }
            KeyAlgorithm::Ecdsa => session
                .sign(&Mechanism::Ecdsa, self.private, &digest)
                .map_err(operation),
        }
    }

    /// Fetches the X.509 certificate stored under the key's id or label.
    pub fn certificate(&self) -> Result<Option<CertChain>, TokenError> {
        let session = self.session.lock().unwrap();
        let template = vec![
            Attribute::Class(ObjectClass::CERTIFICATE),
            Attribute::CertificateType(CertificateType::X_509),
            self.selector.attribute(),
        ];
        let Some(handle) = session
            .find_objects(&template)
            .map_err(operation)?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };
        let attrs = session
            .get_attributes(handle, &[AttributeType::Value])
            .map_err(operation)?;
        let value = attrs
            .into_iter()
            .find_map(|a| match a {
                Attribute::Value(v) => Some(v),
                _ => None,
            })
            .ok_or_else(|| operation("certificate object has no CKA_VALUE"))?;
        let cert = X509::from_der(&value).map_err(operation)?;
        let chain = CertChain::from_certs(vec![cert]).map_err(operation)?;
        Ok(Some(chain))
    }

    /// Stores a certificate on the token under the key's id or label.
    pub fn store_certificate(&self, cert: &X509Ref) -> Result<(), TokenError> {
        let der = cert.to_der().map_err(operation)?;
        let session = self.session.lock().unwrap();
        let template = vec![
            Attribute::Class(ObjectClass::CERTIFICATE),
            Attribute::CertificateType(CertificateType::X_509),
            Attribute::Token(true),
            Attribute::Value(der),
            self.selector.attribute(),
        ];
        session.create_object(&template).map_err(operation)?;
        Ok(())
    }
}

fn rsa_spki(
    session: &Session,
    selector: &Selector,
    private: ObjectHandle,
) -> Result<Vec<u8>, TokenError> {
    // modulus and exponent are readable off the public object when present,
    // otherwise off the private one
    let source = find_object(session, ObjectClass::PUBLIC_KEY, selector).unwrap_or(private);
    let attrs = session
        .get_attributes(source, &[AttributeType::Modulus, AttributeType::PublicExponent])
        .map_err(operation)?;
    let mut modulus = None;
    let mut exponent = None;
    for attr in attrs {
        match attr {
            Attribute::Modulus(m) => modulus = Some(m),
            Attribute::PublicExponent(e) => exponent = Some(e),
            _ => {}
        }
    }
    let (modulus, exponent) = modulus
        .zip(exponent)
        .ok_or_else(|| operation("RSA key is missing modulus or exponent"))?;
    let rsa = Rsa::from_public_components(
        BigNum::from_slice(&modulus).map_err(operation)?,
        BigNum::from_slice(&exponent).map_err(operation)?,
    )
    .map_err(operation)?;
    PKey::from_rsa(rsa)
        .and_then(|k| k.public_key_to_der())
        .map_err(operation)
}

fn ec_spki_by_selector(session: &Session, selector: &Selector) -> Result<Vec<u8>, TokenError> {
    let public = find_object(session, ObjectClass::PUBLIC_KEY, selector)?;
    ec_spki(session, public)
}

fn ec_spki(session: &Session, public: ObjectHandle) -> Result<Vec<u8>, TokenError> {
    let attrs = session
        .get_attributes(public, &[AttributeType::EcParams, AttributeType::EcPoint])
        .map_err(operation)?;
    let mut params = None;
    let mut point = None;
    for attr in attrs {
        match attr {
            Attribute::EcParams(p) => params = Some(p),
            Attribute::EcPoint(p) => point = Some(p),
            _ => {}
        }
    }
    let (params, point) = params
        .zip(point)
        .ok_or_else(|| operation("EC key is missing params or point"))?;

    let nid = curve_from_params(&params)?;
    let group = EcGroup::from_curve_name(nid).map_err(operation)?;
    let raw_point = unwrap_ec_point(&point);
    let mut ctx = BigNumContext::new().map_err(operation)?;
    let ec_point = EcPoint::from_bytes(&group, raw_point, &mut ctx).map_err(operation)?;
    EcKey::from_public_key(&group, &ec_point)
        .and_then(PKey::from_ec_key)
        .and_then(|k| k.public_key_to_der())
        .map_err(operation)
}

fn curve_from_params(params: &[u8]) -> Result<Nid, TokenError> {
    match params {
        EC_PARAMS_P256 => Ok(Nid::X9_62_PRIME256V1),
        EC_PARAMS_P384 => Ok(Nid::SECP384R1),
        EC_PARAMS_P521 => Ok(Nid::SECP521R1),
        _ => Err(operation("unsupported EC curve parameters")),
    }
}

/// CKA_EC_POINT is a DER OCTET STRING around the uncompressed point; some
/// tokens hand back the bare point instead.
fn unwrap_ec_point(point: &[u8]) -> &[u8] {
    let mut reader = der::Reader::new(point);
    if let Ok(inner) = reader.expect(der::TAG_OCTET_STRING) {
        if reader.is_empty() {
            return inner;
        }
    }
    point
}

fn digest_info_prefix(algo: HashAlgo) -> &'static [u8] {
    match algo {
        HashAlgo::Sha256 => &[
            0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
            0x01, 0x05, 0x00, 0x04, 0x20,
        ],
        HashAlgo::Sha384 => &[
            0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
            0x02, 0x05, 0x00, 0x04, 0x30,
        ],
        HashAlgo::Sha512 => &[
            0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
            0x03, 0x05, 0x00, 0x04, 0x40,
        ],
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>, TokenError> {
    let s = s.trim();
    if s.is_empty() || s.len() % 2 != 0 {
        return Err(TokenError::Operation(format!("invalid hex id {s:?}")));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| TokenError::Operation(format!("invalid hex id {s:?}")))
        })
        .collect()
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

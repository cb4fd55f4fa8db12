//! X.509 certificate signing request generation.
//!
//! The request is assembled as DER and signed with SHA-256 through the
//! uniform key capability, so software keys and token-resident keys take
//! the same path. Key usage is written with no bits set and the Netscape
//! cert-type marks an SSL client.

use super::der;
use super::HashAlgo;
use crate::error::{Error, Result};
use crate::key::{KeyAlgorithm, PrivateKey};
use openssl::base64;
use openssl::ecdsa::EcdsaSig;

/// sha256WithRSAEncryption: 1.2.840.113549.1.1.11
const OID_SHA256_RSA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0b];
/// ecdsa-with-SHA256: 1.2.840.10045.4.3.2
const OID_ECDSA_SHA256: &[u8] = &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x02];
/// pkcs-9 extensionRequest: 1.2.840.113549.1.9.14
const OID_EXTENSION_REQUEST: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x09, 0x0e];
/// id-ce-keyUsage: 2.5.29.15
const OID_KEY_USAGE: &[u8] = &[0x55, 0x1d, 0x0f];
/// netscape-cert-type: 2.16.840.1.113730.1.1
const OID_NS_CERT_TYPE: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x86, 0xf8, 0x42, 0x01, 0x01];

fn rdn_oid(key: &str) -> Result<&'static [u8]> {
    match key.to_ascii_uppercase().as_str() {
        "CN" => Ok(&[0x55, 0x04, 0x03]),
        "C" => Ok(&[0x55, 0x04, 0x06]),
        "L" => Ok(&[0x55, 0x04, 0x07]),
        "ST" => Ok(&[0x55, 0x04, 0x08]),
        "O" => Ok(&[0x55, 0x04, 0x0a]),
        "OU" => Ok(&[0x55, 0x04, 0x0b]),
        "DC" => Ok(&[0x09, 0x92, 0x26, 0x89, 0x93, 0xf2, 0x2c, 0x64, 0x01, 0x19]),
        "EMAILADDRESS" => Ok(&[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x09, 0x01]),
        other => Err(Error::Config(format!("unsupported subject attribute {other:?}"))),
    }
}

/// Generates a PEM-encoded CSR for `key` with the given subject, one RDN
/// per `(attribute, value)` pair in order.
pub fn generate_csr(key: &PrivateKey, subject: &[(&str, &str)]) -> Result<String> {
    let mut name = Vec::new();
    for (attr, value) in subject {
        let atv = der::sequence(&[&der::oid(rdn_oid(attr)?), &der::utf8_string(value)]);
        name.extend_from_slice(&der::set(&[&atv]));
    }
    let name = der::tlv(der::TAG_SEQUENCE, &name);

    let spki = key.public_key()?.to_der()?;

    let key_usage = der::sequence(&[
        &der::oid(OID_KEY_USAGE),
        &der::octet_string(&der::bit_string(0, &[])),
    ]);
    let ns_cert_type = der::sequence(&[
        &der::oid(OID_NS_CERT_TYPE),
        &der::octet_string(&der::bit_string(7, &[0x80])), // SSL client
    ]);
    let extension_request = der::sequence(&[
        &der::oid(OID_EXTENSION_REQUEST),
        &der::set(&[&der::sequence(&[&key_usage, &ns_cert_type])]),
    ]);
    let attributes = der::tlv(der::context(0), &extension_request);

    let request_info = der::sequence(&[&der::integer_zero(), &name, &spki, &attributes]);

    let signature = normalize_signature(key.algorithm(), key.sign(HashAlgo::Sha256, &request_info)?)?;
    let algorithm = match key.algorithm() {
        KeyAlgorithm::Rsa => der::sequence(&[&der::oid(OID_SHA256_RSA), &der::null()]),
        KeyAlgorithm::Ecdsa => der::sequence(&[&der::oid(OID_ECDSA_SHA256)]),
    };

    let request = der::sequence(&[
        &request_info,
        &algorithm,
        &der::bit_string(0, &signature),
    ]);

    Ok(pem_wrap("CERTIFICATE REQUEST", &request))
}

/// ECDSA signatures must be embedded in DER form; token keys hand back the
/// raw fixed-width `r || s` encoding, which is rewrapped here.
fn normalize_signature(algorithm: KeyAlgorithm, sig: Vec<u8>) -> Result<Vec<u8>> {
    if algorithm == KeyAlgorithm::Rsa {
        return Ok(sig);
    }
    if sig.first() == Some(&0x30) && EcdsaSig::from_der(&sig).is_ok() {
        return Ok(sig);
    }
    super::ecdsa_raw_to_der(&sig)
}

fn pem_wrap(label: &str, der: &[u8]) -> String {
    let encoded = base64::encode_block(der);
    let mut out = format!("-----BEGIN {label}-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).unwrap());
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::nid::Nid;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::X509Req;

    fn rsa_key() -> PrivateKey {
        let pkey = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        PrivateKey::load(&pkey.private_key_to_pem_pkcs8().unwrap()).unwrap()
    }

    #[test]
    fn test_rsa_csr_verifies_with_public_half() {
        let key = rsa_key();
        let pem = generate_csr(&key, &[("CN", "client"), ("O", "test")]).unwrap();

        let req = X509Req::from_pem(pem.as_bytes()).unwrap();
        assert_eq!(req.version(), 0);

        let public = PKey::public_key_from_pem(key.public_key().unwrap().to_pem().unwrap().as_bytes())
            .unwrap();
        assert!(req.verify(&public).unwrap());

        let subject = req.subject_name();
        let cn = subject
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .unwrap()
            .data()
            .as_utf8()
            .unwrap();
        assert_eq!(&**cn, "client");
        let org = subject
            .entries_by_nid(Nid::ORGANIZATIONNAME)
            .next()
            .unwrap()
            .data()
            .as_utf8()
            .unwrap();
        assert_eq!(&**org, "test");
    }

    #[test]
    fn test_ec_csr_verifies_with_public_half() {
        let key = PrivateKey::generate().unwrap();
        let pem = generate_csr(&key, &[("CN", "ec-client")]).unwrap();

        let req = X509Req::from_pem(pem.as_bytes()).unwrap();
        let public = PKey::public_key_from_pem(key.public_key().unwrap().to_pem().unwrap().as_bytes())
            .unwrap();
        assert!(req.verify(&public).unwrap());
    }

    #[test]
    fn test_raw_ecdsa_signature_is_rewrapped() {
        let key = PrivateKey::generate().unwrap();
        let der_sig = key.sign(HashAlgo::Sha256, b"payload").unwrap();

        // flatten to the raw form a token would return, then normalize
        let parsed = EcdsaSig::from_der(&der_sig).unwrap();
        let mut raw = vec![0u8; 64];
        let r = parsed.r().to_vec();
        let s = parsed.s().to_vec();
        raw[32 - r.len()..32].copy_from_slice(&r);
        raw[64 - s.len()..].copy_from_slice(&s);

        let normalized = normalize_signature(KeyAlgorithm::Ecdsa, raw).unwrap();
        let reparsed = EcdsaSig::from_der(&normalized).unwrap();
        assert_eq!(reparsed.r().to_vec(), parsed.r().to_vec());
        assert_eq!(reparsed.s().to_vec(), parsed.s().to_vec());
    }

    #[test]
    fn test_unknown_subject_attribute_rejected() {
        let key = rsa_key();
        assert!(matches!(
            generate_csr(&key, &[("X500Whatever", "v")]),
            Err(Error::Config(_))
        ));
    }
}

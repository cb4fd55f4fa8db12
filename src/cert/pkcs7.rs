//! PKCS#7 SignedData chain parsing.
//!
//! Accepts the Base64-encoded, certificates-only SignedData containers used
//! to transport certificate chains. The expected structure is walked
//! explicitly; any deviation fails the parse.

use super::der::{self, Reader};
use super::CertChain;
use crate::error::{Error, Result};
use openssl::base64;
use openssl::x509::X509;

/// pkcs7-signedData: 1.2.840.113549.1.7.2
const OID_SIGNED_DATA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x02];
/// pkcs7-data: 1.2.840.113549.1.7.1
const OID_DATA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x01];

/// Parses a Base64-encoded PKCS#7 SignedData blob into a certificate chain,
/// leaf first.
pub fn parse_pkcs7_certs(pkcs7: &str) -> Result<CertChain> {
    let compact: String = pkcs7.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let der = base64::decode_block(&compact)
        .map_err(|e| Error::Protocol(format!("invalid base64: {e}")))?;

    // ContentInfo ::= SEQUENCE { contentType OID, content [0] EXPLICIT ANY }
    let mut outer = Reader::new(&der);
    let content_info = outer.expect(der::TAG_SEQUENCE)?;

    let mut content_info = Reader::new(content_info);
    let content_type = content_info.expect(der::TAG_OID)?;
    if content_type != OID_SIGNED_DATA {
        return Err(Error::Protocol("content type is not pkcs7-signedData".to_string()));
    }
    let explicit = content_info.expect(der::context(0))?;

    // SignedData ::= SEQUENCE { version, digestAlgorithms, contentInfo,
    //                           certificates [0] IMPLICIT, ... }
    let mut explicit = Reader::new(explicit);
    let signed_data = explicit.expect(der::TAG_SEQUENCE)?;

    let mut signed_data = Reader::new(signed_data);
    signed_data.expect(der::TAG_INTEGER)?;
    signed_data.expect(der::TAG_SET)?;

    let inner_info = signed_data.expect(der::TAG_SEQUENCE)?;
    let mut inner_info = Reader::new(inner_info);
    let inner_type = inner_info.expect(der::TAG_OID)?;
    if inner_type != OID_DATA {
        return Err(Error::Protocol("inner content type is not pkcs7-data".to_string()));
    }

    let cert_block = signed_data.expect(der::context(0))?;
    let mut cert_block = Reader::new(cert_block);
    let mut certs = Vec::new();
    while !cert_block.is_empty() {
        if cert_block.peek_tag() != Some(der::TAG_SEQUENCE) {
            return Err(Error::Protocol("unexpected element in certificate set".to_string()));
        }
        let raw = cert_block.raw_element()?;
        let cert = X509::from_der(raw)
            .map_err(|e| Error::Protocol(format!("invalid certificate in chain: {e}")))?;
        certs.push(cert);
    }

    CertChain::from_certs(certs)
}

// SPDX-License-Identifier: MIT

//! The `application/cert-chain+cbor` format referenced by a signed
//! exchange's `cert-url`, and the content-addressed name under which the
//! chain is served.

use base64::prelude::*;
use ciborium::value::Value;
use openssl::error::ErrorStack;
use openssl::hash::{hash, MessageDigest};
use openssl::x509::X509;

/// Magic first element of the chain array: U+1F4DC SCROLL, U+26D3 CHAINS.
const MAGIC: &str = "\u{1F4DC}\u{26D3}";

/// The chain's addressing key: unpadded base64url of the SHA-256 of the
/// DER-encoded leaf. Stable for the lifetime of the certificate.
pub fn cert_name(leaf: &X509) -> Result<String, ErrorStack> {
    let digest = hash(MessageDigest::sha256(), &leaf.to_der()?)?;
    Ok(BASE64_URL_SAFE_NO_PAD.encode(digest))
}

/// Serializes the chain with the current OCSP response attached to the
/// leaf's entry. Map keys are emitted in canonical order.
pub fn encode_cert_chain(certs: &[X509], ocsp: &[u8]) -> Result<Vec<u8>, EncodeError> {
    let mut elements = Vec::with_capacity(certs.len() + 1);
    elements.push(Value::Text(MAGIC.to_string()));
    for (i, cert) in certs.iter().enumerate() {
        let mut entry = vec![(
            Value::Text("cert".to_string()),
            Value::Bytes(cert.to_der()?),
        )];
        if i == 0 {
            entry.push((Value::Text("ocsp".to_string()), Value::Bytes(ocsp.to_vec())));
        }
        elements.push(Value::Map(entry));
    }
    let mut encoded = Vec::new();
    ciborium::into_writer(&Value::Array(elements), &mut encoded)?;
    Ok(encoded)
}

/// A parsed cert-chain document.
#[derive(Debug)]
pub struct CertChain {
    pub certs: Vec<Vec<u8>>,
    pub ocsp: Option<Vec<u8>>,
    pub sct: Option<Vec<u8>>,
}

/// Parses a cert-chain CBOR document, as produced by [`encode_cert_chain`].
pub fn decode_cert_chain(encoded: &[u8]) -> Result<CertChain, DecodeError> {
    let value: Value = ciborium::from_reader(encoded)?;
    let Value::Array(elements) = value else {
        return Err(DecodeError::Malformed("top level is not an array"));
    };
    let mut elements = elements.into_iter();
    match elements.next() {
        Some(Value::Text(magic)) if magic == MAGIC => {}
        _ => return Err(DecodeError::Malformed("missing magic string")),
    }
    let mut chain = CertChain {
        certs: Vec::new(),
        ocsp: None,
        sct: None,
    };
    for (i, element) in elements.enumerate() {
        let Value::Map(entry) = element else {
            return Err(DecodeError::Malformed("chain entry is not a map"));
        };
        let mut cert = None;
        for (key, value) in entry {
            let (Value::Text(key), Value::Bytes(bytes)) = (key, value) else {
                return Err(DecodeError::Malformed("entry key/value types"));
            };
            match key.as_str() {
                "cert" => cert = Some(bytes),
                "ocsp" if i == 0 => chain.ocsp = Some(bytes),
                "sct" if i == 0 => chain.sct = Some(bytes),
                _ => return Err(DecodeError::Malformed("unexpected entry key")),
            }
        }
        chain
            .certs
            .push(cert.ok_or(DecodeError::Malformed("entry missing cert"))?);
    }
    if chain.certs.is_empty() {
        return Err(DecodeError::Malformed("empty chain"));
    }
    Ok(chain)
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("one or more openssl errors occurred: {0}")]
    Ssl(#[from] ErrorStack),

    #[error("CBOR serialization failed: {0}")]
    Cbor(#[from] ciborium::ser::Error<std::io::Error>),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("CBOR deserialization failed: {0}")]
    Cbor(#[from] ciborium::de::Error<std::io::Error>),

    #[error("malformed cert-chain: {0}")]
    Malformed(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed() -> X509 {
        crate::sxg::testing::generate_sxg_cert().0
    }

    #[test]
    fn cert_name_is_base64url_of_leaf_digest() {
        let cert = self_signed();
        let name = cert_name(&cert).unwrap();
        assert_eq!(name.len(), 43, "unpadded base64 of 32 bytes");
        assert!(!name.contains('='));
        assert!(!name.contains('+'));
        assert!(!name.contains('/'));
        // Content-addressed: same input, same name.
        assert_eq!(name, cert_name(&cert).unwrap());
    }

    #[test]
    fn chain_round_trips_with_ocsp_on_leaf_only() {
        let cert = self_signed();
        let encoded = encode_cert_chain(&[cert.clone(), cert.clone()], b"ocsp-bytes").unwrap();
        let chain = decode_cert_chain(&encoded).unwrap();
        assert_eq!(chain.certs.len(), 2);
        assert_eq!(chain.certs[0], cert.to_der().unwrap());
        assert_eq!(chain.ocsp.as_deref(), Some(&b"ocsp-bytes"[..]));
        assert!(chain.sct.is_none());
    }

    #[test]
    fn encoding_starts_with_magic() {
        let cert = self_signed();
        let encoded = encode_cert_chain(&[cert], b"o").unwrap();
        // 0x82: 2-element array; 0x67: 7-byte text string (the magic is 4
        // plus 3 bytes of UTF-8).
        assert_eq!(encoded[0], 0x82);
        assert_eq!(encoded[1], 0x67);
        assert_eq!(&encoded[2..9], MAGIC.as_bytes());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode_cert_chain(b"not cbor").is_err());
    }
}

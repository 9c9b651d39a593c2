// SPDX-License-Identifier: MIT

//! The Signed HTTP Exchange wire format (versions b2 and b3).
//!
//! An exchange is: an 8-byte magic, the fallback URL, a structured-header
//! signature, a canonical CBOR encoding of the response headers, and the
//! MI-encoded payload. The signature covers a fixed-layout message binding
//! the certificate, validity window, URLs, and header bytes together.

use std::fmt;
use std::str::FromStr;

use base64::prelude::*;
use chrono::{DateTime, Utc};
use ciborium::value::Value;
use http::HeaderMap;
use openssl::error::ErrorStack;
use openssl::hash::{hash, MessageDigest};
use openssl::pkey::{PKey, Private};
use openssl::sign::Signer;
use openssl::x509::X509;
use url::Url;

use crate::mice;

/// The exchange versions this packager can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    B2,
    B3,
}

impl Version {
    pub fn label(self) -> &'static str {
        match self {
            Version::B2 => "b2",
            Version::B3 => "b3",
        }
    }

    pub fn magic(self) -> &'static [u8; 8] {
        match self {
            Version::B2 => b"sxg1-b2\0",
            Version::B3 => b"sxg1-b3\0",
        }
    }

    fn context_string(self) -> &'static str {
        match self {
            Version::B2 => "HTTP Exchange 1 b2",
            Version::B3 => "HTTP Exchange 1 b3",
        }
    }

    /// The `Content-Type` of the serialized exchange.
    pub fn media_type(self) -> String {
        format!("application/signed-exchange;v={}", self.label())
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "b2" => Ok(Version::B2),
            "b3" => Ok(Version::B3),
            other => Err(format!("unsupported SXG version {other:?}")),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The signing identity and validity window for one exchange.
pub struct SignatureParams<'a> {
    pub cert: &'a X509,
    pub key: &'a PKey<Private>,
    pub cert_url: Url,
    pub validity_url: Url,
    pub date: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum SxgError {
    #[error("one or more openssl errors occurred: {0}")]
    Ssl(#[from] ErrorStack),

    #[error("CBOR serialization failed: {0}")]
    Cbor(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("{0} exceeds its length field")]
    TooLarge(&'static str),
}

/// Builds a complete serialized exchange.
///
/// `headers` are the final response headers; the MI `Content-Encoding` and
/// `Digest` entries are added here, after the payload is encoded. The
/// signature binds the resulting header block, so callers must not modify
/// headers afterward.
pub fn seal_exchange(
    version: Version,
    fallback_url: &str,
    status: u16,
    headers: &HeaderMap,
    payload: &[u8],
    params: &SignatureParams<'_>,
) -> Result<Vec<u8>, SxgError> {
    let (digest, encoded_payload) = mice::encode(payload, mice::RECORD_SIZE)?;

    let mut all_headers: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    for name in headers.keys() {
        let values: Vec<&[u8]> = headers.get_all(name).iter().map(|v| v.as_bytes()).collect();
        all_headers.push((name.as_str().as_bytes().to_vec(), values.join(&b","[..])));
    }
    all_headers.push((b"content-encoding".to_vec(), b"mi-sha256-03".to_vec()));
    all_headers.push((
        b"digest".to_vec(),
        format!("mi-sha256-03={}", BASE64_STANDARD.encode(&digest)).into_bytes(),
    ));

    let header_bytes = encode_headers(version, status, &all_headers)?;
    if header_bytes.len() >= 1 << 19 {
        // The draft caps the header block well below the 3-byte length
        // field, to bound what validators must buffer.
        return Err(SxgError::TooLarge("header block"));
    }

    let cert_sha256 = hash(MessageDigest::sha256(), &params.cert.to_der()?)?.to_vec();
    let message = signed_message(
        version,
        &cert_sha256,
        params.validity_url.as_str(),
        params.date,
        params.expires,
        fallback_url,
        &header_bytes,
    );
    let mut signer = Signer::new(MessageDigest::sha256(), params.key)?;
    let signature = signer.sign_oneshot_to_vec(&message)?;

    let signature_header = format!(
        "sig;cert-sha256=*{}*;cert-url=\"{}\";date={};expires={};integrity=\"digest/mi-sha256-03\";sig=*{}*;validity-url=\"{}\"",
        BASE64_STANDARD.encode(&cert_sha256),
        params.cert_url,
        params.date.timestamp(),
        params.expires.timestamp(),
        BASE64_STANDARD.encode(&signature),
        params.validity_url,
    );

    envelope(version, fallback_url, signature_header.as_bytes(), &header_bytes, &encoded_payload)
}

fn envelope(
    version: Version,
    fallback_url: &str,
    signature: &[u8],
    header_bytes: &[u8],
    payload: &[u8],
) -> Result<Vec<u8>, SxgError> {
    let fallback = fallback_url.as_bytes();
    if fallback.len() > u16::MAX as usize {
        return Err(SxgError::TooLarge("fallback URL"));
    }
    if signature.len() >= 1 << 24 {
        return Err(SxgError::TooLarge("signature"));
    }
    let mut out = Vec::with_capacity(
        8 + 2 + fallback.len() + 6 + signature.len() + header_bytes.len() + payload.len(),
    );
    out.extend_from_slice(version.magic());
    out.extend_from_slice(&(fallback.len() as u16).to_be_bytes());
    out.extend_from_slice(fallback);
    out.extend_from_slice(&u24(signature.len()));
    out.extend_from_slice(&u24(header_bytes.len()));
    out.extend_from_slice(signature);
    out.extend_from_slice(header_bytes);
    out.extend_from_slice(payload);
    Ok(out)
}

fn u24(len: usize) -> [u8; 3] {
    [(len >> 16) as u8, (len >> 8) as u8, len as u8]
}

/// Canonical CBOR encoding of the response headers, plus `:status`. For b2
/// the response map is wrapped in a two-element array after a request map
/// holding only `:method: GET`.
fn encode_headers(
    version: Version,
    status: u16,
    headers: &[(Vec<u8>, Vec<u8>)],
) -> Result<Vec<u8>, SxgError> {
    let mut entries: Vec<(Vec<u8>, Vec<u8>)> = headers.to_vec();
    entries.push((b":status".to_vec(), status.to_string().into_bytes()));
    // Canonical CBOR orders map keys by encoded length, then bytewise.
    entries.sort_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));

    let response_map = Value::Map(
        entries
            .into_iter()
            .map(|(name, value)| (Value::Bytes(name), Value::Bytes(value)))
            .collect(),
    );
    let document = match version {
        Version::B3 => response_map,
        Version::B2 => Value::Array(vec![
            Value::Map(vec![(
                Value::Bytes(b":method".to_vec()),
                Value::Bytes(b"GET".to_vec()),
            )]),
            response_map,
        ]),
    };
    let mut encoded = Vec::new();
    ciborium::into_writer(&document, &mut encoded)?;
    Ok(encoded)
}

/// The fixed-layout byte string the ECDSA signature covers.
pub fn signed_message(
    version: Version,
    cert_sha256: &[u8],
    validity_url: &str,
    date: DateTime<Utc>,
    expires: DateTime<Utc>,
    fallback_url: &str,
    header_bytes: &[u8],
) -> Vec<u8> {
    let mut message = Vec::new();
    message.resize(64, 0x20);
    message.extend_from_slice(version.context_string().as_bytes());
    message.push(0x00);
    message.push(32);
    message.extend_from_slice(cert_sha256);
    message.extend_from_slice(&(validity_url.len() as u64).to_be_bytes());
    message.extend_from_slice(validity_url.as_bytes());
    message.extend_from_slice(&(date.timestamp() as u64).to_be_bytes());
    message.extend_from_slice(&(expires.timestamp() as u64).to_be_bytes());
    message.extend_from_slice(&(fallback_url.len() as u64).to_be_bytes());
    message.extend_from_slice(fallback_url.as_bytes());
    message.extend_from_slice(&(header_bytes.len() as u64).to_be_bytes());
    message.extend_from_slice(header_bytes);
    message
}

/// A deserialized exchange, for verification.
#[derive(Debug)]
pub struct ParsedExchange {
    pub fallback_url: String,
    pub signature: String,
    pub status: u16,
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    /// Still MI-encoded; decode with [`mice::decode`] and the `Digest`
    /// header's root.
    pub payload: Vec<u8>,
    /// The raw header block, needed to re-derive the signed message.
    pub header_bytes: Vec<u8>,
}

impl ParsedExchange {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n == name.as_bytes())
            .map(|(_, v)| v.as_slice())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("exchange is truncated")]
    Truncated,

    #[error("bad magic for version {0}")]
    BadMagic(Version),

    #[error("CBOR deserialization failed: {0}")]
    Cbor(#[from] ciborium::de::Error<std::io::Error>),

    #[error("malformed header block: {0}")]
    Malformed(&'static str),
}

/// Parses a serialized exchange of the given version.
pub fn parse_exchange(bytes: &[u8], version: Version) -> Result<ParsedExchange, ParseError> {
    let take = |bytes: &mut &[u8], n: usize| -> Result<Vec<u8>, ParseError> {
        if bytes.len() < n {
            return Err(ParseError::Truncated);
        }
        let (head, tail) = bytes.split_at(n);
        *bytes = tail;
        Ok(head.to_vec())
    };
    let mut rest = bytes;
    if take(&mut rest, 8)? != version.magic() {
        return Err(ParseError::BadMagic(version));
    }
    let fallback_len = u16::from_be_bytes(take(&mut rest, 2)?.try_into().unwrap_or_default());
    let fallback_url = String::from_utf8_lossy(&take(&mut rest, fallback_len as usize)?).into_owned();
    let sig_len = read_u24(&take(&mut rest, 3)?);
    let header_len = read_u24(&take(&mut rest, 3)?);
    let signature = String::from_utf8_lossy(&take(&mut rest, sig_len)?).into_owned();
    let header_bytes = take(&mut rest, header_len)?;
    let payload = rest.to_vec();

    let document: Value = ciborium::from_reader(header_bytes.as_slice())?;
    let response_map = match (version, document) {
        (Version::B3, map @ Value::Map(_)) => map,
        (Version::B2, Value::Array(mut elements)) if elements.len() == 2 => elements.remove(1),
        _ => return Err(ParseError::Malformed("unexpected header document shape")),
    };
    let Value::Map(entries) = response_map else {
        return Err(ParseError::Malformed("response headers are not a map"));
    };
    let mut status = 0;
    let mut headers = Vec::new();
    for (key, value) in entries {
        let (Value::Bytes(key), Value::Bytes(value)) = (key, value) else {
            return Err(ParseError::Malformed("header key/value types"));
        };
        if key == b":status" {
            status = String::from_utf8_lossy(&value).parse().unwrap_or(0);
        } else {
            headers.push((key, value));
        }
    }
    Ok(ParsedExchange {
        fallback_url,
        signature,
        status,
        headers,
        payload,
        header_bytes,
    })
}

fn read_u24(bytes: &[u8]) -> usize {
    (bytes[0] as usize) << 16 | (bytes[1] as usize) << 8 | bytes[2] as usize
}

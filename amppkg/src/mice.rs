// SPDX-License-Identifier: MIT

//! Merkle Integrity Content Encoding (`mi-sha256-03`).
//!
//! The payload of a signed exchange is split into fixed-size records, each
//! followed by the SHA-256 proof of everything after it, so a consumer can
//! verify the stream incrementally. The root proof is carried separately in
//! the `Digest` response header and bound into the signature.

use openssl::error::ErrorStack;
use openssl::hash::{hash, MessageDigest};

/// The record size used for every encode. Browsers are known to accept
/// records this small, and small records keep the proof overhead bounded
/// without buffering large chunks.
pub const RECORD_SIZE: usize = 16 * 1024;

/// Encodes `payload`, returning `(root_digest, encoded_stream)`.
///
/// An empty payload produces a stream holding only the record-size prefix,
/// and its digest is the hash of a lone terminal-record marker.
pub fn encode(payload: &[u8], record_size: usize) -> Result<(Vec<u8>, Vec<u8>), ErrorStack> {
    if payload.is_empty() {
        let digest = hash(MessageDigest::sha256(), &[0u8])?;
        let mut encoded = Vec::with_capacity(8);
        encoded.extend_from_slice(&(record_size as u64).to_be_bytes());
        return Ok((digest.to_vec(), encoded));
    }

    let records: Vec<&[u8]> = payload.chunks(record_size).collect();

    // Proofs chain from the last record backward: the final record is
    // hashed with a 0x00 terminator, every earlier one with its successor's
    // proof and a 0x01 continuation marker.
    let mut proofs: Vec<Vec<u8>> = vec![Vec::new(); records.len()];
    for (i, record) in records.iter().enumerate().rev() {
        let mut input = Vec::with_capacity(record.len() + 33);
        input.extend_from_slice(record);
        if i == records.len() - 1 {
            input.push(0x00);
        } else {
            input.extend_from_slice(&proofs[i + 1]);
            input.push(0x01);
        }
        proofs[i] = hash(MessageDigest::sha256(), &input)?.to_vec();
    }

    let mut encoded = Vec::with_capacity(8 + payload.len() + 32 * (records.len() - 1));
    encoded.extend_from_slice(&(record_size as u64).to_be_bytes());
    encoded.extend_from_slice(records[0]);
    for (record, proof) in records[1..].iter().zip(&proofs[1..]) {
        encoded.extend_from_slice(proof);
        encoded.extend_from_slice(record);
    }
    Ok((proofs[0].clone(), encoded))
}

/// Decodes an encoded stream, verifying every proof against `root_digest`.
pub fn decode(encoded: &[u8], root_digest: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let record_size = encoded
        .get(..8)
        .map(|prefix| u64::from_be_bytes(prefix.try_into().unwrap_or([0; 8])))
        .ok_or(DecodeError::Truncated)?;
    let record_size = usize::try_from(record_size).map_err(|_| DecodeError::BadRecordSize)?;
    if record_size == 0 {
        return Err(DecodeError::BadRecordSize);
    }
    let mut remaining = &encoded[8..];
    if remaining.is_empty() {
        let expected = hash(MessageDigest::sha256(), &[0u8])?;
        if expected.as_ref() != root_digest {
            return Err(DecodeError::ProofMismatch);
        }
        return Ok(Vec::new());
    }

    let mut payload = Vec::new();
    let mut expected_proof = root_digest.to_vec();
    loop {
        if remaining.len() <= record_size {
            // Terminal record.
            let mut input = remaining.to_vec();
            input.push(0x00);
            let actual = hash(MessageDigest::sha256(), &input)?;
            if actual.as_ref() != expected_proof.as_slice() {
                return Err(DecodeError::ProofMismatch);
            }
            payload.extend_from_slice(remaining);
            return Ok(payload);
        }
        let (record, rest) = remaining.split_at(record_size);
        let next_proof = rest.get(..32).ok_or(DecodeError::Truncated)?;
        let mut input = Vec::with_capacity(record_size + 33);
        input.extend_from_slice(record);
        input.extend_from_slice(next_proof);
        input.push(0x01);
        let actual = hash(MessageDigest::sha256(), &input)?;
        if actual.as_ref() != expected_proof.as_slice() {
            return Err(DecodeError::ProofMismatch);
        }
        payload.extend_from_slice(record);
        expected_proof = next_proof.to_vec();
        remaining = &rest[32..];
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("encoded stream ends mid-record")]
    Truncated,

    #[error("record size prefix is invalid")]
    BadRecordSize,

    #[error("record proof does not match")]
    ProofMismatch,

    #[error("one or more openssl errors occurred: {0}")]
    Ssl(#[from] ErrorStack),
}

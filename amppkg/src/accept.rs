// SPDX-License-Identifier: MIT

//! Content-negotiation predicates for the signer.
//!
//! Two inbound headers decide whether a caching intermediary actually wants
//! a signed exchange: `Accept` must list the exact signed-exchange media
//! type and version this packager produces, and `AMP-Cache-Transform` must
//! name a destination cache and transform version we can satisfy. When
//! either check fails the signer proxies unsigned; these are negotiation
//! outcomes, not errors.

use crate::sxg::Version;

/// The transform version this packager's transformer implements.
pub const TRANSFORM_VERSION: u64 = 1;

/// Destination caches this packager can produce exchanges for.
const VALID_IDENTIFIERS: [&str; 2] = ["any", "google"];

/// True iff the `Accept` value includes
/// `application/signed-exchange;v=<version>` with the exact version and no
/// wildcarding. `q` values are ignored; presence is what matters.
pub fn can_satisfy(accept: &str, version: Version) -> bool {
    accept.split(',').any(|part| {
        let mut params = part.trim().split(';').map(str::trim);
        if params.next() != Some("application/signed-exchange") {
            return false;
        }
        params.any(|param| match param.split_once('=') {
            Some((name, value)) => {
                name.trim() == "v" && value.trim().trim_matches('"') == version.label()
            }
            None => false,
        })
    })
}

/// Interprets an `AMP-Cache-Transform` request header, a structured-header
/// parameterised list of destination cache identifiers with an optional `v`
/// parameter listing acceptable transform version ranges.
///
/// Returns the response header value to echo back (identifier plus the
/// selected version) when some listed identifier is a cache we can serve at
/// a version we implement, else `None`.
pub fn should_send_sxg(header_value: &str) -> Option<String> {
    let identifiers = match parse_parameterised_list(header_value) {
        Ok(identifiers) => identifiers,
        Err(reason) => {
            tracing::debug!(header_value, reason, "unparseable AMP-Cache-Transform");
            return None;
        }
    };
    for identifier in identifiers {
        if !VALID_IDENTIFIERS.contains(&identifier.id.as_str()) {
            continue;
        }
        let satisfiable = match identifier.param("v") {
            // No version constraint means any version is acceptable.
            None => true,
            Some(spec) => match parse_version_ranges(spec) {
                Ok(ranges) => ranges
                    .iter()
                    .any(|&(min, max)| min <= TRANSFORM_VERSION && TRANSFORM_VERSION <= max),
                Err(reason) => {
                    tracing::debug!(header_value, reason, "bad v param in AMP-Cache-Transform");
                    continue;
                }
            },
        };
        if satisfiable {
            return Some(format!("{};v=\"{}\"", identifier.id, TRANSFORM_VERSION));
        }
    }
    None
}

struct ParameterisedIdentifier {
    id: String,
    params: Vec<(String, String)>,
}

impl ParameterisedIdentifier {
    fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

// A subset of the structured-headers draft parameterised list: identifiers
// with string-valued parameters, which is all the AMP-Cache-Transform spec
// uses.
fn parse_parameterised_list(input: &str) -> Result<Vec<ParameterisedIdentifier>, &'static str> {
    let mut bytes = input.as_bytes().iter().copied().peekable();
    let mut items = Vec::new();
    loop {
        let item = parse_parameterised_identifier(&mut bytes)?;
        items.push(item);
        discard_ows(&mut bytes);
        match bytes.next() {
            None => return Ok(items),
            Some(b',') => {
                discard_ows(&mut bytes);
                if bytes.peek().is_none() {
                    return Err("expected another param-id");
                }
            }
            Some(_) => return Err("expected ','"),
        }
    }
}

type Bytes<'a> = std::iter::Peekable<std::iter::Copied<std::slice::Iter<'a, u8>>>;

fn parse_parameterised_identifier(
    bytes: &mut Bytes<'_>,
) -> Result<ParameterisedIdentifier, &'static str> {
    let id = parse_identifier(bytes)?;
    let mut params = Vec::new();
    loop {
        discard_ows(bytes);
        if bytes.peek() != Some(&b';') {
            break;
        }
        bytes.next();
        discard_ows(bytes);
        let name = parse_identifier(bytes)?;
        if params.iter().any(|(n, _)| *n == name) {
            return Err("duplicate param");
        }
        if bytes.next() != Some(b'=') {
            return Err("expected '='");
        }
        let value = parse_string(bytes)?;
        params.push((name, value));
    }
    Ok(ParameterisedIdentifier { id, params })
}

fn parse_identifier(bytes: &mut Bytes<'_>) -> Result<String, &'static str> {
    let mut output = String::new();
    match bytes.next_if(u8::is_ascii_lowercase) {
        Some(c) => output.push(c as char),
        None => return Err("expected lowercase alpha"),
    }
    while let Some(c) = bytes.next_if(|c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(*c, b'_' | b'-' | b'*' | b'/')
    }) {
        output.push(c as char);
    }
    Ok(output)
}

fn parse_string(bytes: &mut Bytes<'_>) -> Result<String, &'static str> {
    if bytes.next() != Some(b'"') {
        return Err("expected '\"'");
    }
    let mut value = String::new();
    loop {
        match bytes.next() {
            None => return Err("unterminated string"),
            Some(b'"') => return Ok(value),
            Some(b'\\') => match bytes.next() {
                Some(c @ (b'"' | b'\\')) => value.push(c as char),
                _ => return Err("bad backslash escape"),
            },
            Some(c) if c <= 0x1f || c == 0x7f => return Err("invalid string char"),
            Some(c) => value.push(c as char),
        }
    }
}

fn discard_ows(bytes: &mut Bytes<'_>) {
    while bytes.next_if(|c| matches!(*c, b' ' | b'\t')).is_some() {}
}

// "1", "1..3", or a comma-separated list of those.
fn parse_version_ranges(spec: &str) -> Result<Vec<(u64, u64)>, &'static str> {
    spec.split(',')
        .map(|range| {
            let range = range.trim();
            match range.split_once("..") {
                None => range.parse().map(|v| (v, v)).map_err(|_| "bad version"),
                Some((min, max)) => {
                    let min = min.trim().parse().map_err(|_| "bad version")?;
                    let max = max.trim().parse().map_err(|_| "bad version")?;
                    Ok((min, max))
                }
            }
        })
        .collect()
}

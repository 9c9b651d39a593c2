// SPDX-License-Identifier: MIT

//! Header policy shared by the signing pipeline.
//!
//! Three fixed name sets (which request headers to forward upstream, which
//! response headers survive into a signed exchange, which headers a 304
//! carries) plus `Cache-Control` interpretation for the cacheability gate and
//! the freshness-based client cache hints.

use chrono::{DateTime, TimeZone, Utc};
use http::HeaderMap;

/// Request headers forwarded to the origin. Everything else from the client
/// is dropped; the packager speaks for itself.
pub const CONDITIONAL_REQUEST_HEADERS: [&str; 5] = [
    "if-match",
    "if-none-match",
    "if-modified-since",
    "if-unmodified-since",
    "if-range",
];

/// Headers copied onto a synthesized 304 response.
pub const NOT_MODIFIED_HEADERS: [&str; 6] = [
    "cache-control",
    "content-location",
    "date",
    "etag",
    "expires",
    "vary",
];

/// Headers whose meaning is tied to the origin connection rather than the
/// document. A signed exchange served later from a cache must not carry
/// them; depending on configuration their presence either downgrades the
/// response to an unsigned proxy or they are silently stripped.
pub const STATEFUL_RESPONSE_HEADERS: [&str; 13] = [
    "authentication-control",
    "authentication-info",
    "clear-site-data",
    "optional-www-authenticate",
    "proxy-authenticate",
    "proxy-authentication-info",
    "public-key-pins",
    "sec-websocket-accept",
    "set-cookie",
    "set-cookie2",
    "setprofile",
    "strict-transport-security",
    "www-authenticate",
];

/// Hop-by-hop headers per RFC 7230 section 6.1, always stripped.
pub const HOP_BY_HOP_HEADERS: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "via",
];

/// Stateful headers present in `headers`, lowercased. Empty means the
/// response is safe to sign (after the unconditional strips).
pub fn stateful_headers_present(headers: &HeaderMap) -> Vec<&'static str> {
    STATEFUL_RESPONSE_HEADERS
        .iter()
        .copied()
        .filter(|name| headers.contains_key(*name))
        .collect()
}

/// Why a response may not be cached by a shared cache, per its
/// `Cache-Control` directives. Empty means publicly cacheable.
pub fn non_cacheable_reasons(headers: &HeaderMap) -> Vec<&'static str> {
    let mut reasons = Vec::new();
    for directive in ["no-store", "private"] {
        if has_directive(headers, directive) {
            reasons.push(directive);
        }
    }
    reasons
}

/// When the response stops being fresh, for sizing client cache hints.
///
/// Precedence is `s-maxage`, then `max-age`, then the `Expires` header. A
/// `no-store`, `no-cache`, or `private` directive means never fresh. A
/// response that states no lifetime at all is treated as fresh forever; the
/// signature window bounds it in practice.
pub fn freshness_expiry(headers: &HeaderMap, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    for directive in ["no-store", "no-cache", "private"] {
        if has_directive(headers, directive) {
            return None;
        }
    }
    for directive in ["s-maxage", "max-age"] {
        if let Some(secs) = directive_value(headers, directive) {
            return Some(now + chrono::Duration::seconds(secs));
        }
    }
    if let Some(expires) = headers.get("expires").and_then(|v| v.to_str().ok()) {
        return DateTime::parse_from_rfc2822(expires)
            .ok()
            .map(|t| t.with_timezone(&Utc));
    }
    Some(far_future())
}

/// A sentinel well past any plausible signature expiry.
pub fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 1, 1, 0, 0, 0).unwrap()
}

fn cache_control_directives(headers: &HeaderMap) -> impl Iterator<Item = (String, Option<String>)> + '_ {
    headers
        .get_all("cache-control")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|directive| {
            let directive = directive.trim();
            if directive.is_empty() {
                return None;
            }
            match directive.split_once('=') {
                Some((name, value)) => Some((
                    name.trim().to_ascii_lowercase(),
                    Some(value.trim().trim_matches('"').to_string()),
                )),
                None => Some((directive.to_ascii_lowercase(), None)),
            }
        })
}

fn has_directive(headers: &HeaderMap, name: &str) -> bool {
    cache_control_directives(headers).any(|(n, _)| n == name)
}

fn directive_value(headers: &HeaderMap, name: &str) -> Option<i64> {
    cache_control_directives(headers)
        .find(|(n, _)| n == name)
        .and_then(|(_, v)| v)
        .and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use http::header::{HeaderName, HeaderValue};

    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn detects_stateful_headers() {
        let map = headers(&[("set-cookie", "a=b"), ("content-type", "text/html")]);
        assert_eq!(stateful_headers_present(&map), vec!["set-cookie"]);
    }

    #[test]
    fn no_store_and_private_block_caching() {
        let map = headers(&[("cache-control", "private, no-store, max-age=60")]);
        assert_eq!(non_cacheable_reasons(&map), vec!["no-store", "private"]);
        assert_eq!(freshness_expiry(&map, Utc::now()), None);
    }

    #[test]
    fn public_response_is_cacheable() {
        let map = headers(&[("cache-control", "public, max-age=300")]);
        assert!(non_cacheable_reasons(&map).is_empty());
    }

    #[test]
    fn s_maxage_wins_over_max_age() {
        let now = Utc::now();
        let map = headers(&[("cache-control", "max-age=60, s-maxage=600")]);
        assert_eq!(
            freshness_expiry(&map, now),
            Some(now + chrono::Duration::seconds(600))
        );
    }

    #[test]
    fn expires_header_is_a_fallback() {
        let map = headers(&[("expires", "Wed, 21 Oct 2015 07:28:00 GMT")]);
        let expiry = freshness_expiry(&map, Utc::now()).unwrap();
        assert_eq!(expiry, Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap());
    }

    #[test]
    fn silence_means_fresh_forever() {
        let map = HeaderMap::new();
        assert_eq!(freshness_expiry(&map, Utc::now()), Some(far_future()));
    }

    #[test]
    fn directives_split_across_multiple_header_lines() {
        let map = headers(&[("cache-control", "public"), ("cache-control", "no-store")]);
        assert_eq!(non_cacheable_reasons(&map), vec!["no-store"]);
    }
}

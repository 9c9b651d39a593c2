// SPDX-License-Identifier: MIT

//! The request-handling pipeline: resolve URLs against policy, fetch the
//! origin document, gate on negotiation and cacheability, transform, and
//! emit a signed exchange.
//!
//! The overriding rule is that packaging failures are invisible to end
//! users. Every gate or processing failure after a successful origin fetch
//! logs its reason and degrades to proxying the origin response unsigned;
//! only malformed client input (400) and an unreachable origin (502) are
//! surfaced as errors.

use std::sync::Arc;
use std::time::Duration;

use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use http::header::{HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use http::StatusCode;
use openssl::pkey::{PKey, Private};
use url::Url;

use crate::accept;
use crate::cert_cache::CertCache;
use crate::error::RequestError;
use crate::headers;
use crate::rtv::RuntimeVersionSource;
use crate::sxg::{self, SignatureParams, Version};
use crate::transformer::Transformer;
use crate::urlset::{MatchedUrls, UrlSets};

pub const CERT_URL_PREFIX: &str = "/amppkg/cert";
pub const VALIDITY_MAP_PATH: &str = "/amppkg/validity";

/// Origin bodies are truncated here rather than rejected; an over-long
/// document simply produces an exchange that fails AMP validation, while a
/// rejection would be a DoS lever.
const MAX_BODY_LENGTH: usize = 4 << 20;

/// Spoofed so origins serve the mobile rendition an AMP cache would fetch.
const FETCH_USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 6.0.1; Nexus 5X Build/MMB29P) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/41.0.2272.96 Mobile \
    Safari/537.36 (compatible; amppkg/0.1.0)";

/// The Content-Security-Policy in use by the AMP cache today, hardcoded so
/// a signed document behaves identically however it is served.
const CONTENT_SECURITY_POLICY: &str = "default-src * blob: data:; \
    script-src blob: https://cdn.ampproject.org/rtv/ https://cdn.ampproject.org/v0.js \
    https://cdn.ampproject.org/v0/ https://cdn.ampproject.org/viewer/; object-src 'none'; \
    style-src 'unsafe-inline' https://cdn.ampproject.org/rtv/ \
    https://cdn.materialdesignicons.com https://cloud.typography.com https://fast.fonts.net \
    https://fonts.googleapis.com https://maxcdn.bootstrapcdn.com https://p.typekit.net \
    https://pro.fontawesome.com https://use.fontawesome.com https://use.typekit.net; \
    report-uri https://csp-collector.appspot.com/csp/amp";

pub struct Signer {
    cert_cache: Arc<CertCache>,
    key: PKey<Private>,
    client: reqwest::Client,
    url_sets: UrlSets,
    version: Version,
    require_headers: bool,
    dev_mode: bool,
    packager_base: Option<Url>,
    transformer: Arc<dyn Transformer>,
    rtv: Arc<dyn RuntimeVersionSource>,
}

/// An origin response, buffered and bounded.
struct OriginResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Signer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cert_cache: Arc<CertCache>,
        key: PKey<Private>,
        url_sets: UrlSets,
        version: Version,
        require_headers: bool,
        dev_mode: bool,
        packager_base: Option<Url>,
        transformer: Arc<dyn Transformer>,
        rtv: Arc<dyn RuntimeVersionSource>,
    ) -> anyhow::Result<Self> {
        // Redirects pass through to the caller rather than being followed;
        // following one could leak a signable URL onto a different path.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            cert_cache,
            key,
            client,
            url_sets,
            version,
            require_headers,
            dev_mode,
            packager_base,
            transformer,
            rtv,
        })
    }

    /// Handles one signing request. `fetch` and `sign` are the raw URL
    /// strings the server extracted from the query or path.
    pub async fn handle(
        &self,
        fetch: Option<&str>,
        sign: &str,
        inbound: &HeaderMap,
    ) -> Response {
        let matched = match self.url_sets.match_urls(fetch, sign) {
            Ok(matched) => matched,
            Err(error) => return error.into_response(),
        };
        let origin = match self.fetch_origin(&matched.fetch_url, inbound).await {
            Ok(origin) => origin,
            Err(error) => return error.into_response(),
        };

        if !self.dev_mode && !self.cert_cache.is_healthy().await {
            tracing::info!("not packaging because the certificate cache is unhealthy");
            return proxy(&origin);
        }

        let mut transform_echo = None;
        if self.require_headers {
            let act = inbound
                .get("amp-cache-transform")
                .and_then(|v| v.to_str().ok())
                .and_then(accept::should_send_sxg);
            match act {
                Some(echo) => transform_echo = Some(echo),
                None => {
                    tracing::info!(
                        "not packaging because AMP-Cache-Transform request header is missing or unsatisfiable"
                    );
                    return proxy(&origin);
                }
            }
            let accept_ok = inbound
                .get("accept")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|value| accept::can_satisfy(value, self.version));
            if !accept_ok {
                tracing::info!(
                    version = %self.version,
                    "not packaging because Accept request header lacks the signed-exchange media type"
                );
                return proxy(&origin);
            }
        }

        match origin.status {
            StatusCode::OK => self.sign_or_proxy(&origin, &matched, transform_echo).await,
            StatusCode::NOT_MODIFIED => not_modified(&origin),
            _ => proxy(&origin),
        }
    }

    async fn fetch_origin(
        &self,
        fetch_url: &Url,
        inbound: &HeaderMap,
    ) -> Result<OriginResponse, RequestError> {
        tracing::debug!(url = %fetch_url, "fetching origin document");
        let mut request = self
            .client
            .get(fetch_url.as_str())
            .header(http::header::USER_AGENT, FETCH_USER_AGENT);
        // Only revalidation headers flow from the client to the origin.
        for name in headers::CONDITIONAL_REQUEST_HEADERS {
            if let Some(value) = inbound.get(name) {
                request = request.header(name, value);
            }
        }
        let mut response = request
            .send()
            .await
            .map_err(|error| RequestError::Upstream(format!("error fetching: {error}")))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = read_capped(&mut response, MAX_BODY_LENGTH)
            .await
            .map_err(|error| RequestError::Upstream(format!("error reading body: {error}")))?;
        Ok(OriginResponse {
            status,
            headers,
            body,
        })
    }

    async fn sign_or_proxy(
        &self,
        origin: &OriginResponse,
        matched: &MatchedUrls,
        transform_echo: Option<String>,
    ) -> Response {
        if let Err(reason) = validate_fetch(&origin.headers) {
            tracing::info!(reason, "not packaging because of invalid fetch");
            return proxy(origin);
        }
        let stateful = headers::stateful_headers_present(&origin.headers);
        if matched.error_on_stateful_headers && !stateful.is_empty() {
            tracing::info!(
                headers = ?stateful,
                "not packaging because the fetch response contains stateful headers"
            );
            return proxy(origin);
        }

        let html = String::from_utf8_lossy(&origin.body);
        let transformed = match self.transformer.transform(
            &html,
            &matched.sign_url,
            &self.rtv.current_version(),
            &self.rtv.current_css(),
        ) {
            Ok(transformed) => transformed,
            Err(error) => {
                tracing::warn!(%error, "not packaging because the transform failed");
                return proxy(origin);
            }
        };

        let signed_headers = self.signed_headers(&origin.headers, transformed.len());
        let now = Utc::now();
        let params = SignatureParams {
            cert: self.cert_cache.leaf(),
            key: &self.key,
            cert_url: match self.cert_url(&matched.sign_url) {
                Ok(url) => url,
                Err(error) => {
                    tracing::warn!(%error, "not packaging because the cert URL is unbuildable");
                    return proxy(origin);
                }
            },
            validity_url: match matched.sign_url.join(VALIDITY_MAP_PATH) {
                Ok(url) => url,
                Err(error) => {
                    tracing::warn!(%error, "not packaging because the validity URL is unbuildable");
                    return proxy(origin);
                }
            },
            // Backdating absorbs clock skew on the serving intermediary;
            // with the 6-day cap the window stays inside the protocol's
            // 7-day ceiling.
            date: now - chrono::Duration::hours(24),
            expires: now + chrono::Duration::days(6),
        };
        let exchange = match sxg::seal_exchange(
            self.version,
            matched.sign_url.as_str(),
            origin.status.as_u16(),
            &signed_headers,
            transformed.as_bytes(),
            &params,
        ) {
            Ok(exchange) => exchange,
            Err(error) => {
                tracing::warn!(%error, "not packaging because exchange construction failed");
                return proxy(origin);
            }
        };

        let mut response = Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, self.version.media_type())
            // Intermediaries must not alter signed bytes.
            .header(CACHE_CONTROL, "no-transform")
            .header("x-content-type-options", "nosniff")
            .header("x-amppkg-version", env!("CARGO_PKG_VERSION"));
        if let Some(echo) = transform_echo {
            response = response.header("amp-cache-transform", echo);
        }
        response
            .body(axum::body::Body::from(exchange))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }

    /// The response headers that get signed into the exchange.
    fn signed_headers(&self, origin_headers: &HeaderMap, content_length: usize) -> HeaderMap {
        let mut signed = HeaderMap::new();
        for (name, value) in origin_headers {
            let name_str = name.as_str();
            if headers::STATEFUL_RESPONSE_HEADERS.contains(&name_str)
                || headers::HOP_BY_HOP_HEADERS.contains(&name_str)
                // No privacy-violating rel=preload leaks.
                || name_str == "link"
                || name_str == "content-length"
                || name_str == "content-type"
            {
                continue;
            }
            signed.append(name.clone(), value.clone());
        }
        // charset=utf-8 would be redundant; a valid AMPHTML document
        // declares it in <meta>.
        signed.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        if let Ok(csp) = HeaderValue::from_str(CONTENT_SECURITY_POLICY) {
            signed.insert("content-security-policy", csp);
        }
        if let Ok(length) = HeaderValue::from_str(&content_length.to_string()) {
            signed.insert("content-length", length);
        }
        signed
    }

    /// Where validators can fetch the cert-chain CBOR. A configured base
    /// keeps its path prefix (its trailing slash is validated at startup);
    /// otherwise the sign URL's origin serves the chain directly.
    fn cert_url(&self, sign_url: &Url) -> anyhow::Result<Url> {
        let name = self.cert_cache.cert_name();
        let url = match &self.packager_base {
            Some(base) => base.join(&format!(
                "{}/{}",
                CERT_URL_PREFIX.trim_start_matches('/'),
                name
            ))?,
            None => sign_url.join(&format!("{CERT_URL_PREFIX}/{name}"))?,
        };
        Ok(url)
    }
}

/// The pre-signing checks on the origin response.
/// Reads at most `limit` bytes of the body, chunk by chunk. Bytes past the
/// limit are never buffered; dropping the response aborts the transfer.
pub(crate) async fn read_capped(
    response: &mut reqwest::Response,
    limit: usize,
) -> reqwest::Result<Bytes> {
    let mut body = BytesMut::new();
    while let Some(chunk) = response.chunk().await? {
        let room = limit - body.len();
        if chunk.len() >= room {
            body.extend_from_slice(&chunk[..room]);
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

fn validate_fetch(origin_headers: &HeaderMap) -> Result<(), &'static str> {
    // Only publicly cacheable documents may be signed; a shared cache will
    // serve the exchange to everyone.
    if !headers::non_cacheable_reasons(origin_headers).is_empty() {
        return Err("response is not publicly cacheable");
    }
    // A leftover Content-Encoding means the body was compressed with
    // something the client could not decode.
    if origin_headers.contains_key("content-encoding") {
        return Err("response has unexpected content-encoding");
    }
    let content_type = origin_headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or("response has no content-type")?;
    let mut parts = content_type.split(';');
    let media_type = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    if media_type != "text/html" {
        return Err("content-type is not text/html");
    }
    // A non-UTF-8 charset would override <meta charset>.
    for param in parts {
        if let Some((name, value)) = param.split_once('=') {
            if name.trim().eq_ignore_ascii_case("charset")
                && !value.trim().trim_matches('"').eq_ignore_ascii_case("utf-8")
            {
                return Err("charset is not utf-8");
            }
        }
    }
    Ok(())
}

/// Copies the origin response through unsigned.
fn proxy(origin: &OriginResponse) -> Response {
    let mut builder = Response::builder().status(origin.status);
    for (name, value) in &origin.headers {
        // The buffered body's length may differ from the origin's framing.
        if name == http::header::CONTENT_LENGTH || name == http::header::TRANSFER_ENCODING {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(axum::body::Body::from(origin.body.clone()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Synthesizes a 304 carrying only the RFC 7232 revalidation headers.
fn not_modified(origin: &OriginResponse) -> Response {
    let mut builder = Response::builder().status(StatusCode::NOT_MODIFIED);
    for name in headers::NOT_MODIFIED_HEADERS {
        let name = HeaderName::from_static(name);
        for value in origin.headers.get_all(&name) {
            builder = builder.header(&name, value);
        }
    }
    builder
        .body(axum::body::Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

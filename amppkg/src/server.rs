// SPDX-License-Identifier: MIT

//! The HTTP frontend.
//!
//! Routing is done by hand against the raw request URI rather than with
//! the router's pattern matching. The `/priv/doc/<url>` form embeds a full
//! URL in the path, and any percent-escapes in it must reach the signer
//! exactly as the client sent them; a router would decode them first.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use http::header::{CACHE_CONTROL, CONTENT_TYPE, ETAG};
use http::{Method, StatusCode};

use crate::cert_cache::CertCache;
use crate::signer::{Signer, CERT_URL_PREFIX, VALIDITY_MAP_PATH};

const DOC_QUERY_PATH: &str = "/priv/doc";
const DOC_PATH_PREFIX: &str = "/priv/doc/";

/// An empty CBOR map. No signatures are updated in place yet, so every
/// exchange's validity data is the same trivial document.
const VALIDITY_MAP: [u8; 1] = [0xA0];
const VALIDITY_MAX_AGE_SECONDS: u32 = 604800;

#[derive(Clone)]
pub struct AppState {
    pub signer: Arc<Signer>,
    pub cert_cache: Arc<CertCache>,
}

pub fn router(state: AppState) -> Router {
    Router::new().fallback(dispatch).with_state(state)
}

async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    if request.method() != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    // http::Uri keeps the path as received, percent-escapes included.
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);

    if let Some(name) = path.strip_prefix(&format!("{CERT_URL_PREFIX}/")) {
        return serve_cert(&state, name).await;
    }
    match path.as_str() {
        VALIDITY_MAP_PATH => serve_validity(),
        "/healthz" => serve_healthz(&state).await,
        DOC_QUERY_PATH => serve_doc_by_query(&state, request.headers(), query.as_deref()).await,
        _ => {
            if let Some(embedded) = path.strip_prefix(DOC_PATH_PREFIX) {
                serve_doc_by_path(&state, request.headers(), embedded, query.as_deref()).await
            } else {
                (StatusCode::NOT_FOUND, "404 page not found\n").into_response()
            }
        }
    }
}

/// `/priv/doc?fetch=...&sign=...`, both values percent-decoded by the
/// query parser.
async fn serve_doc_by_query(
    state: &AppState,
    headers: &http::HeaderMap,
    query: Option<&str>,
) -> Response {
    let mut fetch = None;
    let mut sign = None;
    for (name, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
        let slot = match name.as_ref() {
            "fetch" => &mut fetch,
            "sign" => &mut sign,
            other => {
                return bad_request(format!("unexpected query parameter {other:?}"));
            }
        };
        if slot.replace(value.into_owned()).is_some() {
            return bad_request(format!("duplicate query parameter {:?}", name.as_ref()));
        }
    }
    let Some(sign) = sign else {
        return bad_request("sign query parameter is missing".to_string());
    };
    state
        .signer
        .handle(fetch.as_deref(), &sign, headers)
        .await
}

/// `/priv/doc/<url>`: the remainder of the raw path is the sign URL, with
/// the raw query string reattached.
async fn serve_doc_by_path(
    state: &AppState,
    headers: &http::HeaderMap,
    embedded: &str,
    query: Option<&str>,
) -> Response {
    let sign = embedded_sign_url(embedded, query);
    state.signer.handle(None, &sign, headers).await
}

/// Reattaches the raw query string to the path-embedded URL. Neither part
/// is decoded; escapes in the original URL must survive into the exchange's
/// fallback URL.
fn embedded_sign_url(embedded: &str, query: Option<&str>) -> String {
    match query {
        Some(query) => format!("{embedded}?{query}"),
        None => embedded.to_string(),
    }
}

async fn serve_cert(state: &AppState, name: &str) -> Response {
    // Cert names are unpadded base64url, but a client may still escape
    // characters that need no escaping.
    let name = match percent_encoding::percent_decode_str(name).decode_utf8() {
        Ok(name) => name,
        Err(_) => return (StatusCode::NOT_FOUND, "cert not found\n").into_response(),
    };
    if name != state.cert_cache.cert_name() {
        return (StatusCode::NOT_FOUND, "cert not found\n").into_response();
    }
    match state.cert_cache.chain_response().await {
        Ok((cbor, max_age)) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/cert-chain+cbor")
            .header(CACHE_CONTROL, format!("public, max-age={max_age}"))
            .header(ETAG, format!("\"{name}\""))
            .header("x-content-type-options", "nosniff")
            .body(axum::body::Body::from(cbor))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(error) => {
            tracing::error!(%error, "failed to serialize certificate chain");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn serve_validity() -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/cbor")
        .header(
            CACHE_CONTROL,
            format!("public, max-age={VALIDITY_MAX_AGE_SECONDS}"),
        )
        .body(axum::body::Body::from(VALIDITY_MAP.to_vec()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn serve_healthz(state: &AppState) -> Response {
    if state.cert_cache.is_healthy().await {
        (StatusCode::OK, "ok\n").into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "cert cache is unhealthy\n").into_response()
    }
}

fn bad_request(reason: String) -> Response {
    crate::error::RequestError::BadRequest(reason).into_response()
}

// SPDX-License-Identifier: MIT

//! Error types for the packager.
//!
//! Lower layers return these causes; the signer and certificate cache
//! boundaries classify them into external behavior (an HTTP status, a log
//! line, or a silent fallback to unsigned proxying). Lower layers never
//! decide the external behavior themselves.

use std::path::PathBuf;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};

/// Errors from the [`crate::storage::Updateable`] implementations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The backing file could not be opened.
    ///
    /// The parent directory of the cache path must exist and be writable
    /// before the service starts; this is an operator error.
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    /// An advisory lock could not be acquired.
    ///
    /// Locks are taken with try-lock semantics, so heavy multi-process
    /// contention surfaces here as a transient error rather than a queued
    /// wait. Retrying on the next read is expected to succeed.
    #[error("unable to obtain {kind} lock for {path}: {source}")]
    Lock {
        kind: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    /// Reading or writing the backing file failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Errors from OCSP response validation.
///
/// These never propagate to request-serving paths; the certificate cache
/// keeps serving its last-known-good bytes and reports itself unhealthy
/// instead.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum OcspError {
    /// No OCSP response has been fetched yet.
    #[error("OCSP response not yet fetched")]
    Missing,

    /// The certificate chain does not contain the leaf's issuer.
    ///
    /// This is a permanent configuration error; the fetcher will not hammer
    /// the responder over it.
    #[error("cannot find issuer certificate in the configured chain")]
    IssuerNotFound,

    /// The leaf certificate carries no OCSP responder URL.
    #[error("certificate is missing an OCSP responder URL")]
    NoResponder,

    /// The certificate could not be re-parsed for extension inspection.
    #[error("failed to parse certificate: {0}")]
    CertParse(String),

    /// An OpenSSL operation failed, including OCSP parse and signature
    /// verification failures.
    #[error("one or more openssl errors occurred: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),

    /// The responder answered, but not with a successful response.
    #[error("OCSP responder status: {0}")]
    ResponderStatus(String),

    /// The response does not cover the signing certificate.
    #[error("OCSP response is not for the signing certificate")]
    CertMismatch,

    /// The certificate status is not Good.
    #[error("OCSP certificate status is {0}")]
    CertStatus(String),

    /// A thisUpdate/nextUpdate timestamp could not be interpreted.
    #[error("malformed OCSP timestamp: {0}")]
    Timestamp(String),

    /// `nextUpdate - thisUpdate` exceeds the seven days allowed for
    /// cross-origin trust.
    #[error("OCSP validity spans more than 7 days ({this_update} to {next_update})")]
    ExcessiveValidity {
        this_update: DateTime<Utc>,
        next_update: DateTime<Utc>,
    },

    /// The cached response's nextUpdate has passed.
    #[error("cached OCSP response is stale, nextUpdate: {0}")]
    Stale(DateTime<Utc>),
}

/// Errors raised while validating the loaded configuration.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("URLSet.{index}.{side}: {reason}")]
    UrlPattern {
        index: usize,
        side: &'static str,
        reason: String,
    },

    #[error("must specify one or more [[urlset]] entries")]
    NoUrlSets,

    #[error("packager_base {0:?} must be an absolute http or https URL ending in a slash")]
    InvalidBase(String),
}

/// Request-boundary errors with a defined external behavior.
///
/// Only two shapes exist: malformed input from the client (a legitimate
/// 400), and an unreachable upstream (a 502, distinguishable from packaging
/// failures because there is no content at all to proxy). Packaging failures
/// are deliberately *not* errors; they degrade to unsigned proxying.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Upstream(String),
}

impl RequestError {
    pub fn status(&self) -> StatusCode {
        match self {
            RequestError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RequestError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        tracing::info!(error = %self, status = %self.status(), "rejecting request");
        (self.status(), format!("{self}\n")).into_response()
    }
}

// SPDX-License-Identifier: MIT

//! OCSP fetching and validation.
//!
//! The refresh policy follows the well-known stapling guidance: re-fetch at
//! the midpoint of the current response's validity window, honor an earlier
//! expiry the responder advertised over HTTP, and never let a failed fetch
//! destroy the previously cached response. Requests conform to the
//! Lightweight OCSP Profile (RFC 5019): SHA-1 CertIDs, GET when the encoded
//! request is small enough, POST otherwise.

use std::cmp::Ordering;

use base64::prelude::*;
use chrono::{DateTime, NaiveDateTime, Utc};
use openssl::asn1::Asn1GeneralizedTimeRef;
use openssl::hash::MessageDigest;
use openssl::ocsp::{OcspCertId, OcspCertStatus, OcspFlag, OcspRequest, OcspResponse, OcspResponseStatus};
use openssl::stack::Stack;
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::verify::X509VerifyFlags;
use openssl::x509::X509;
use url::Url;

use crate::error::OcspError;
use crate::headers;

/// Responses are capped at this size; anything larger is not a plausible
/// OCSP response.
const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// The validity window of a verified OCSP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OcspSummary {
    pub this_update: DateTime<Utc>,
    pub next_update: DateTime<Utc>,
}

impl OcspSummary {
    /// The refresh trigger: halfway through the validity window.
    pub fn midpoint(&self) -> DateTime<Utc> {
        self.this_update + (self.next_update - self.this_update) / 2
    }
}

/// Verifies OCSP responses against a particular certificate chain and knows
/// how to address that chain's responder.
///
/// Split out as a capability so tests can drive the certificate cache with
/// synthetic responses instead of a real responder and CA.
pub trait OcspVerifier: Send + Sync {
    /// Cryptographically verifies `der` and confirms it vouches for the
    /// signing certificate with status Good.
    fn verify(&self, der: &[u8]) -> Result<OcspSummary, OcspError>;

    /// The responder URL from the certificate's Authority Information
    /// Access extension.
    fn responder_url(&self) -> Result<Url, OcspError>;

    /// A DER-encoded OCSP request for the signing certificate.
    fn build_request(&self) -> Result<Vec<u8>, OcspError>;
}

/// The production [`OcspVerifier`], backed by the configured chain.
pub struct ChainVerifier {
    leaf: X509,
    leaf_der: Vec<u8>,
    issuer: Option<X509>,
    // OCSP_basic_verify inputs: the issuer as an explicitly trusted signer,
    // and a store allowing partial chains for delegated responder certs.
    trusted_signers: Stack<X509>,
    store: X509Store,
}

impl ChainVerifier {
    /// Builds a verifier from the configured chain, leaf first.
    ///
    /// A chain whose leaf's issuer is absent still constructs; every
    /// verification then fails with [`OcspError::IssuerNotFound`], which the
    /// refresh policy treats as permanent rather than retrying.
    pub fn new(chain: &[X509]) -> Result<Self, OcspError> {
        let leaf = chain.first().ok_or(OcspError::CertParse("empty chain".into()))?;
        let issuer = find_issuer(leaf, chain)?;
        let mut trusted_signers = Stack::new()?;
        let mut store = X509StoreBuilder::new()?;
        if let Some(issuer) = &issuer {
            trusted_signers.push(issuer.clone())?;
            store.add_cert(issuer.clone())?;
        }
        store.set_flags(X509VerifyFlags::PARTIAL_CHAIN)?;
        Ok(Self {
            leaf: leaf.clone(),
            leaf_der: leaf.to_der()?,
            issuer,
            trusted_signers,
            store: store.build(),
        })
    }

    fn issuer(&self) -> Result<&X509, OcspError> {
        self.issuer.as_ref().ok_or(OcspError::IssuerNotFound)
    }

    fn cert_id(&self) -> Result<OcspCertId, OcspError> {
        // SHA-1 is mandated by the Lightweight OCSP Profile.
        Ok(OcspCertId::from_cert(
            MessageDigest::sha1(),
            &self.leaf,
            self.issuer()?,
        )?)
    }
}

impl OcspVerifier for ChainVerifier {
    fn verify(&self, der: &[u8]) -> Result<OcspSummary, OcspError> {
        self.issuer()?;
        let response = OcspResponse::from_der(der)?;
        if response.status() != OcspResponseStatus::SUCCESSFUL {
            return Err(OcspError::ResponderStatus(format!(
                "{:?}",
                response.status()
            )));
        }
        let basic = response.basic()?;
        basic.verify(&self.trusted_signers, &self.store, OcspFlag::TRUST_OTHER)?;
        let cert_id = self.cert_id()?;
        let status = basic
            .find_status(&cert_id)
            .ok_or(OcspError::CertMismatch)?;
        if status.status != OcspCertStatus::GOOD {
            return Err(OcspError::CertStatus(format!("{:?}", status.status)));
        }
        let this_update = parse_asn1_time(status.this_update)?;
        let next_update = parse_asn1_time(status.next_update)?;
        // Cross-origin trust limits OCSP validity to a week.
        if next_update - this_update > chrono::Duration::days(7) {
            return Err(OcspError::ExcessiveValidity {
                this_update,
                next_update,
            });
        }
        Ok(OcspSummary {
            this_update,
            next_update,
        })
    }

    fn responder_url(&self) -> Result<Url, OcspError> {
        let raw = ocsp_responder_from_der(&self.leaf_der)?;
        Url::parse(&raw).map_err(|error| OcspError::CertParse(format!("bad responder URL: {error}")))
    }

    fn build_request(&self) -> Result<Vec<u8>, OcspError> {
        let mut request = OcspRequest::new()?;
        request.add_id(self.cert_id()?)?;
        Ok(request.to_der()?)
    }
}

fn find_issuer(leaf: &X509, chain: &[X509]) -> Result<Option<X509>, OcspError> {
    // RFC 3280 guarantees the issuer's subject matches the leaf's issuer
    // under canonical name comparison, which X509_NAME_cmp implements.
    for cert in chain {
        if leaf.issuer_name().try_cmp(cert.subject_name())? == Ordering::Equal {
            return Ok(Some(cert.clone()));
        }
    }
    Ok(None)
}

/// The first OCSP URI in the leaf's Authority Information Access extension.
fn ocsp_responder_from_der(leaf_der: &[u8]) -> Result<String, OcspError> {
    use x509_parser::extensions::{GeneralName, ParsedExtension};
    use x509_parser::prelude::FromDer;

    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(leaf_der)
        .map_err(|error| OcspError::CertParse(error.to_string()))?;
    for extension in cert.extensions() {
        if let ParsedExtension::AuthorityInfoAccess(aia) = extension.parsed_extension() {
            for desc in &aia.accessdescs {
                // id-ad-ocsp
                if desc.access_method == x509_parser::der_parser::oid!(1.3.6.1.5.5.7.48.1) {
                    if let GeneralName::URI(uri) = &desc.access_location {
                        return Ok(uri.to_string());
                    }
                }
            }
        }
    }
    Err(OcspError::NoResponder)
}

fn parse_asn1_time(time: &Asn1GeneralizedTimeRef) -> Result<DateTime<Utc>, OcspError> {
    // ASN1_GENERALIZEDTIME_print renders e.g. "Jan  2 15:04:05 2026 GMT".
    let text = time.to_string();
    NaiveDateTime::parse_from_str(&text, "%b %e %H:%M:%S %Y GMT")
        .map(|naive| naive.and_utc())
        .map_err(|_| OcspError::Timestamp(text))
}

/// Decides whether the cached OCSP bytes warrant a network refresh.
///
/// `update_after` is the earlier-firing expiry hint taken from the
/// responder's HTTP cache headers on the last successful fetch.
pub fn should_update(
    verifier: &dyn OcspVerifier,
    contents: &[u8],
    now: DateTime<Utc>,
    update_after: DateTime<Utc>,
) -> bool {
    if contents.is_empty() {
        tracing::debug!("updating OCSP; none cached yet");
        return true;
    }
    match verifier.verify(contents) {
        Err(OcspError::IssuerNotFound) => {
            // Permanent configuration problem; re-fetching cannot fix it.
            tracing::warn!("cannot find issuer certificate in the configured chain");
            false
        }
        Err(error) => {
            tracing::debug!(%error, "updating OCSP; cached response failed verification");
            true
        }
        Ok(summary) => {
            if now > summary.midpoint() {
                tracing::debug!(midpoint = %summary.midpoint(), "updating OCSP; after midpoint");
                true
            } else if now > update_after {
                tracing::debug!(%update_after, "updating OCSP; expired by HTTP cache headers");
                true
            } else {
                false
            }
        }
    }
}

/// The outcome of [`fetch`]: the bytes to cache (possibly the unchanged
/// originals) and, only after a fully successful fetch, the HTTP cache
/// expiry hint for the next refresh decision.
pub struct FetchOutcome {
    pub contents: Vec<u8>,
    pub update_after: Option<DateTime<Utc>>,
}

/// Fetches a fresh OCSP response from the certificate's responder.
///
/// Every failure path logs and returns the original bytes; staleness is the
/// caller's problem, losing the last-known-good response would be ours.
pub async fn fetch(
    client: &reqwest::Client,
    verifier: &dyn OcspVerifier,
    orig: Vec<u8>,
) -> FetchOutcome {
    match try_fetch(client, verifier).await {
        Ok(outcome) => outcome,
        Err(error) => {
            tracing::warn!(%error, "OCSP fetch failed; keeping cached response");
            FetchOutcome {
                contents: orig,
                update_after: None,
            }
        }
    }
}

async fn try_fetch(
    client: &reqwest::Client,
    verifier: &dyn OcspVerifier,
) -> Result<FetchOutcome, anyhow::Error> {
    use anyhow::Context;

    let responder = verifier.responder_url()?;
    let request_der = verifier.build_request()?;

    // RFC 5019 prefers GET when the request fits in a short URL. The
    // base64 is the standard alphabet, so '/' and '+' need path escaping.
    let encoded = BASE64_STANDARD
        .encode(&request_der)
        .replace('/', "%2F")
        .replace('+', "%2B");
    let get_url = format!("{}/{}", responder.as_str().trim_end_matches('/'), encoded);
    let mut response = if get_url.len() <= 255 {
        client.get(&get_url).send().await
    } else {
        client
            .post(responder.as_str())
            .header("Content-Type", "application/ocsp-request")
            .body(request_der)
            .send()
            .await
    }
    .context("issuing OCSP request")?;

    let header_map = response.headers().clone();
    let body = crate::signer::read_capped(&mut response, MAX_RESPONSE_BYTES)
        .await
        .context("reading OCSP response")?;

    let summary = verifier.verify(&body).context("verifying OCSP response")?;
    let now = Utc::now();
    if summary.this_update > now {
        anyhow::bail!("OCSP thisUpdate in the future: {}", summary.this_update);
    }
    if summary.next_update < now {
        anyhow::bail!("OCSP nextUpdate in the past: {}", summary.next_update);
    }

    // The responder may advertise an expiry earlier than the midpoint via
    // ordinary HTTP caching headers (RFC 5019 section 6.1).
    let update_after = headers::freshness_expiry(&header_map, now).unwrap_or_else(headers::far_future);
    Ok(FetchOutcome {
        contents: body.to_vec(),
        update_after: Some(update_after),
    })
}


#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::testing::{FakeVerifier, NoIssuerVerifier};
    use super::*;

    fn window(hours_ago: i64, hours_ahead: i64) -> OcspSummary {
        let now = Utc::now();
        OcspSummary {
            this_update: now - chrono::Duration::hours(hours_ago),
            next_update: now + chrono::Duration::hours(hours_ahead),
        }
    }

    fn encoded(summary: &OcspSummary) -> Vec<u8> {
        FakeVerifier::encode_window(summary.this_update, summary.next_update)
    }

    #[test]
    fn empty_cache_triggers_update() {
        let verifier = FakeVerifier::new("http://ocsp.example/");
        assert!(should_update(&verifier, b"", Utc::now(), headers::far_future()));
    }

    #[test]
    fn missing_issuer_is_permanent() {
        assert!(!should_update(
            &NoIssuerVerifier,
            b"anything",
            Utc::now(),
            headers::far_future(),
        ));
    }

    #[test]
    fn fresh_response_before_midpoint_is_kept() {
        let verifier = FakeVerifier::new("http://ocsp.example/");
        let summary = window(1, 100);
        assert!(!should_update(
            &verifier,
            &encoded(&summary),
            Utc::now(),
            headers::far_future(),
        ));
    }

    #[test]
    fn past_midpoint_triggers_update() {
        let verifier = FakeVerifier::new("http://ocsp.example/");
        let summary = window(100, 1);
        assert!(should_update(
            &verifier,
            &encoded(&summary),
            Utc::now(),
            headers::far_future(),
        ));
    }

    #[test]
    fn http_expiry_hint_fires_before_midpoint() {
        let verifier = FakeVerifier::new("http://ocsp.example/");
        let summary = window(1, 100);
        let update_after = Utc::now() - chrono::Duration::minutes(5);
        assert!(should_update(
            &verifier,
            &encoded(&summary),
            Utc::now(),
            update_after,
        ));
    }

    #[test]
    fn unparseable_cache_triggers_update() {
        let verifier = FakeVerifier::new("http://ocsp.example/");
        assert!(should_update(
            &verifier,
            b"garbage",
            Utc::now(),
            headers::far_future(),
        ));
    }

    #[test]
    fn midpoint_is_centered() {
        let now = Utc::now();
        let summary = OcspSummary {
            this_update: now,
            next_update: now + chrono::Duration::days(6),
        };
        assert_eq!(summary.midpoint(), summary.this_update + chrono::Duration::days(3));
    }

    #[tokio::test]
    async fn fetch_uses_get_for_small_requests() {
        let server = MockServer::start().await;
        let summary = window(1, 100);
        Mock::given(method("GET"))
            .and(path_regex("^/.+"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(encoded(&summary))
                    .insert_header("Cache-Control", "max-age=3600"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let verifier = FakeVerifier::new(&server.uri());
        let client = reqwest::Client::new();
        let outcome = fetch(&client, &verifier, b"old".to_vec()).await;
        assert_eq!(outcome.contents, encoded(&summary));
        let update_after = outcome.update_after.unwrap();
        assert!(update_after > Utc::now() + chrono::Duration::minutes(55));
        assert!(update_after < Utc::now() + chrono::Duration::minutes(65));
    }

    #[tokio::test]
    async fn fetch_uses_post_for_large_requests() {
        let server = MockServer::start().await;
        let summary = window(1, 100);
        Mock::given(method("POST"))
            .and(header("Content-Type", "application/ocsp-request"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(encoded(&summary)))
            .expect(1)
            .mount(&server)
            .await;

        let mut verifier = FakeVerifier::new(&server.uri());
        verifier.request = vec![0x42; 400];
        let client = reqwest::Client::new();
        let outcome = fetch(&client, &verifier, b"old".to_vec()).await;
        assert_eq!(outcome.contents, encoded(&summary));
    }

    #[tokio::test]
    async fn fetch_failure_keeps_original_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex("^/.+"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let verifier = FakeVerifier::new(&server.uri());
        let client = reqwest::Client::new();
        let outcome = fetch(&client, &verifier, b"old".to_vec()).await;
        assert_eq!(outcome.contents, b"old");
        assert!(outcome.update_after.is_none());
    }

    #[tokio::test]
    async fn invalid_window_keeps_original_bytes() {
        let server = MockServer::start().await;
        // nextUpdate already in the past.
        let stale = window(100, 0);
        let stale = OcspSummary {
            next_update: Utc::now() - chrono::Duration::hours(1),
            ..stale
        };
        Mock::given(method("GET"))
            .and(path_regex("^/.+"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(encoded(&stale)))
            .mount(&server)
            .await;

        let verifier = FakeVerifier::new(&server.uri());
        let client = reqwest::Client::new();
        let outcome = fetch(&client, &verifier, b"old".to_vec()).await;
        assert_eq!(outcome.contents, b"old");
        assert!(outcome.update_after.is_none());
    }

    #[tokio::test]
    async fn eight_day_window_keeps_original_bytes() {
        let server = MockServer::start().await;
        let wide = OcspSummary {
            this_update: Utc::now() - chrono::Duration::hours(1),
            next_update: Utc::now() + chrono::Duration::days(8),
        };
        Mock::given(method("GET"))
            .and(path_regex("^/.+"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(encoded(&wide))
                    .insert_header("Cache-Control", "max-age=3600"),
            )
            .mount(&server)
            .await;

        let verifier = FakeVerifier::new(&server.uri());
        let client = reqwest::Client::new();
        let outcome = fetch(&client, &verifier, b"old".to_vec()).await;
        assert_eq!(outcome.contents, b"old");
        assert!(outcome.update_after.is_none(), "a rejected response must not extend the expiry hint");
    }
}

// SPDX-License-Identifier: MIT

//! Shared scaffolding for integration tests: a throwaway signing
//! certificate, a synthetic OCSP verifier, and a fully wired packager
//! listening on a local port.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use url::Url;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use amppkg::cert_cache::{CertCache, RefreshHandle};
use amppkg::error::OcspError;
use amppkg::ocsp::{OcspSummary, OcspVerifier};
use amppkg::rtv::StaticRuntime;
use amppkg::server::{self, AppState};
use amppkg::signer::Signer;
use amppkg::storage::InMemory;
use amppkg::sxg::Version;
use amppkg::transformer::IdentityTransformer;
use amppkg::urlset::{PatternConfig, UrlSetConfig, UrlSets};

pub const SIGN_DOMAIN: &str = "amppackageexample.com";

/// A self-signed P-256 certificate for [`SIGN_DOMAIN`].
pub fn generate_cert() -> (X509, PKey<Private>) {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", SIGN_DOMAIN).unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(90).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (builder.build(), key)
}

/// Treats OCSP bytes as a `this_update|next_update` RFC 3339 pair, so the
/// mock responder controls freshness without real DER or a CA.
pub struct WindowVerifier {
    responder: Url,
}

impl WindowVerifier {
    pub fn new(responder: &str) -> Self {
        Self {
            responder: Url::parse(responder).unwrap(),
        }
    }

    pub fn encode_window(this_update: DateTime<Utc>, next_update: DateTime<Utc>) -> Vec<u8> {
        format!("{}|{}", this_update.to_rfc3339(), next_update.to_rfc3339()).into_bytes()
    }
}

impl OcspVerifier for WindowVerifier {
    fn verify(&self, der: &[u8]) -> Result<OcspSummary, OcspError> {
        let text =
            std::str::from_utf8(der).map_err(|_| OcspError::CertParse("not utf-8".into()))?;
        let (this_update, next_update) = text
            .split_once('|')
            .ok_or_else(|| OcspError::CertParse("missing separator".into()))?;
        let parse = |s: &str| {
            DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| OcspError::Timestamp(e.to_string()))
        };
        Ok(OcspSummary {
            this_update: parse(this_update)?,
            next_update: parse(next_update)?,
        })
    }

    fn responder_url(&self) -> Result<Url, OcspError> {
        Ok(self.responder.clone())
    }

    fn build_request(&self) -> Result<Vec<u8>, OcspError> {
        Ok(b"test-ocsp-request".to_vec())
    }
}

pub struct TestApp {
    pub base: String,
    pub cert_name: String,
    pub origin: MockServer,
    server_task: tokio::task::JoinHandle<()>,
    ocsp_refresh: RefreshHandle,
    _responder: MockServer,
}

impl TestApp {
    /// The fetch URL that pairs with [`sign_url`] under the test policy.
    ///
    /// [`sign_url`]: TestApp::sign_url
    pub fn fetch_url(&self) -> String {
        format!("http://{}/index.html", self.origin.address())
    }

    pub fn sign_url(&self) -> String {
        format!("https://{SIGN_DOMAIN}/index.html")
    }

    pub fn doc_endpoint(&self) -> String {
        let fetch: String =
            url::form_urlencoded::byte_serialize(self.fetch_url().as_bytes()).collect();
        let sign: String =
            url::form_urlencoded::byte_serialize(self.sign_url().as_bytes()).collect();
        format!("{}/priv/doc?fetch={fetch}&sign={sign}", self.base)
    }

    pub async fn halt(self) {
        self.server_task.abort();
        self.ocsp_refresh.shutdown().await.unwrap();
    }
}

/// Wires up origin mock, OCSP responder mock, certificate cache, signer,
/// and HTTP listener.
pub async fn start_app(require_headers: bool) -> TestApp {
    let origin = MockServer::start().await;

    let responder = MockServer::start().await;
    let window = WindowVerifier::encode_window(
        Utc::now() - chrono::Duration::hours(1),
        Utc::now() + chrono::Duration::days(6),
    );
    Mock::given(method("GET"))
        .and(path_regex("^/.+"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(window))
        .mount(&responder)
        .await;

    let (cert, key) = generate_cert();
    let verifier = Arc::new(WindowVerifier::new(&responder.uri()));
    let cert_cache = Arc::new(
        CertCache::new(
            vec![cert],
            verifier,
            Arc::new(InMemory::new()),
            reqwest::Client::new(),
        )
        .unwrap(),
    );
    cert_cache.init().await.unwrap();
    let cert_name = cert_cache.cert_name().to_string();
    let ocsp_refresh = cert_cache.spawn_refresh();

    let config = vec![UrlSetConfig {
        fetch: Some(PatternConfig {
            domain: Some(origin.address().to_string()),
            ..Default::default()
        }),
        sign: PatternConfig {
            domain: Some(SIGN_DOMAIN.into()),
            ..Default::default()
        },
    }];
    let signer = Arc::new(
        Signer::new(
            Arc::clone(&cert_cache),
            key,
            UrlSets::new(&config).unwrap(),
            Version::B3,
            require_headers,
            false,
            None,
            Arc::new(IdentityTransformer),
            Arc::new(StaticRuntime::default()),
        )
        .unwrap(),
    );

    let router = server::router(AppState { signer, cert_cache });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let server_task = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestApp {
        base,
        cert_name,
        origin,
        server_task,
        ocsp_refresh,
        _responder: responder,
    }
}

// SPDX-License-Identifier: MIT

//! The certificate cache.
//!
//! Owns the signing chain for the process lifetime and keeps a validated
//! OCSP response stapled to it. The OCSP bytes live in a two-tier
//! [`Updateable`]: the in-memory cell serves requests, the disk cell lets
//! co-located replicas share a single responder fetch. A background task
//! re-evaluates staleness hourly; request paths consult [`is_healthy`] and
//! degrade to unsigned proxying when the cached response can no longer be
//! verified.
//!
//! [`is_healthy`]: CertCache::is_healthy

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use openssl::x509::X509;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::certurl;
use crate::error::OcspError;
use crate::headers;
use crate::ocsp::{self, OcspVerifier};
use crate::storage::{Updateable, UpdateFn};

/// How often the background task re-checks whether the staple needs
/// refreshing. Staleness is evaluated on each tick; at most one responder
/// fetch happens per staleness window.
const OCSP_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug)]
struct OcspState {
    contents: Vec<u8>,
    /// Expiry hint from the responder's HTTP cache headers; fires earlier
    /// than the midpoint when set.
    update_after: DateTime<Utc>,
}

pub struct CertCache {
    cert_name: String,
    certs: Vec<X509>,
    verifier: Arc<dyn OcspVerifier>,
    client: reqwest::Client,
    storage: Arc<dyn Updateable>,
    state: RwLock<OcspState>,
}

/// Handle to the cache's background refresh task.
///
/// The owning process must call [`shutdown`] before exit; dropping the
/// handle detaches the task.
///
/// [`shutdown`]: RefreshHandle::shutdown
pub struct RefreshHandle {
    task: tokio::task::JoinHandle<()>,
    halt_token: CancellationToken,
}

impl RefreshHandle {
    pub(crate) fn new(task: tokio::task::JoinHandle<()>, halt_token: CancellationToken) -> Self {
        Self { task, halt_token }
    }

    pub async fn shutdown(self) -> Result<(), tokio::task::JoinError> {
        self.halt_token.cancel();
        self.task.await
    }
}

impl CertCache {
    pub fn new(
        certs: Vec<X509>,
        verifier: Arc<dyn OcspVerifier>,
        storage: Arc<dyn Updateable>,
        client: reqwest::Client,
    ) -> Result<Self, OcspError> {
        let leaf = certs.first().ok_or(OcspError::CertParse("empty chain".into()))?;
        Ok(Self {
            cert_name: certurl::cert_name(leaf)?,
            certs,
            verifier,
            client,
            storage,
            state: RwLock::new(OcspState {
                contents: Vec::new(),
                update_after: headers::far_future(),
            }),
        })
    }

    /// The content-addressed name the chain is served under.
    pub fn cert_name(&self) -> &str {
        &self.cert_name
    }

    pub fn leaf(&self) -> &X509 {
        &self.certs[0]
    }

    /// Primes the memory and disk tiers so serving can start immediately.
    ///
    /// Fails when no valid OCSP response can be produced at all, from disk
    /// or network; a service that starts must be able to sign.
    pub async fn init(&self) -> anyhow::Result<()> {
        self.maybe_update().await.context("initializing certificate cache")
    }

    /// Spawns the hourly refresh task.
    pub fn spawn_refresh(self: &Arc<Self>) -> RefreshHandle {
        let halt_token = CancellationToken::new();
        let halt = halt_token.clone();
        let cache = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(OCSP_CHECK_INTERVAL);
            // The first tick completes immediately; init() already primed.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = halt.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(error) = cache.maybe_update().await {
                            tracing::warn!(%error, "OCSP update failed; cached response may expire");
                        }
                    }
                }
            }
            tracing::info!("OCSP refresh task halted");
        });
        RefreshHandle { task, halt_token }
    }

    /// Reads current OCSP bytes through the storage tiers, refreshing them
    /// first if stale, and publishes the result to the in-memory state.
    async fn maybe_update(&self) -> anyhow::Result<()> {
        let update_after = self.state.read().await.update_after;
        let verifier = Arc::clone(&self.verifier);
        let is_expired = move |contents: &[u8]| {
            ocsp::should_update(verifier.as_ref(), contents, Utc::now(), update_after)
        };
        let update = OcspUpdate {
            client: self.client.clone(),
            verifier: Arc::clone(&self.verifier),
            update_after: std::sync::Mutex::new(None),
        };
        let contents = self
            .storage
            .read(&is_expired, &update)
            .await
            .context("updating OCSP cache")?;
        if contents.is_empty() {
            anyhow::bail!("missing OCSP response");
        }
        self.summary_if_healthy(&contents)
            .context("OCSP failed health check")?;

        let mut state = self.state.write().await;
        state.contents = contents;
        if let Some(update_after) = update.taken() {
            // A fetch actually ran and produced a new HTTP cache expiry.
            state.update_after = update_after;
        }
        Ok(())
    }

    /// Whether signing is currently permitted.
    ///
    /// Re-reads the cached bytes (which may trigger a refresh) and demands
    /// that they verify with `now` inside the validity window. When this is
    /// false the signer proxies unsigned instead.
    pub async fn is_healthy(&self) -> bool {
        if let Err(error) = self.maybe_update().await {
            tracing::warn!(%error, "OCSP refresh during health check failed");
        }
        let state = self.state.read().await;
        match self.summary_if_healthy(&state.contents) {
            Ok(_) => true,
            Err(error) => {
                tracing::info!(%error, "certificate cache is unhealthy");
                false
            }
        }
    }

    fn summary_if_healthy(&self, contents: &[u8]) -> Result<ocsp::OcspSummary, OcspError> {
        if contents.is_empty() {
            return Err(OcspError::Missing);
        }
        let summary = self.verifier.verify(contents)?;
        let now = Utc::now();
        if summary.this_update > now || summary.next_update < now {
            return Err(OcspError::Stale(summary.next_update));
        }
        Ok(summary)
    }

    /// The CBOR cert-chain document and the number of seconds it may be
    /// cached: until the OCSP midpoint, when a fresher staple will exist.
    pub async fn chain_response(&self) -> Result<(Vec<u8>, u32), certurl::EncodeError> {
        let state = self.state.read().await;
        let cbor = certurl::encode_cert_chain(&self.certs, &state.contents)?;
        let max_age = match self.verifier.verify(&state.contents) {
            Ok(summary) => (summary.midpoint() - Utc::now()).num_seconds().max(0) as u32,
            Err(_) => 0,
        };
        Ok((cbor, max_age))
    }
}

/// The storage update callback: a responder fetch, with the resulting HTTP
/// cache expiry smuggled back out.
struct OcspUpdate {
    client: reqwest::Client,
    verifier: Arc<dyn OcspVerifier>,
    update_after: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl OcspUpdate {
    fn taken(&self) -> Option<DateTime<Utc>> {
        self.update_after.lock().ok().and_then(|mut slot| slot.take())
    }
}

#[async_trait]
impl UpdateFn for OcspUpdate {
    async fn update(&self, orig: Vec<u8>) -> Vec<u8> {
        let outcome = ocsp::fetch(&self.client, self.verifier.as_ref(), orig).await;
        if let Some(update_after) = outcome.update_after {
            if let Ok(mut slot) = self.update_after.lock() {
                *slot = Some(update_after);
            }
        }
        outcome.contents
    }
}

// SPDX-License-Identifier: MIT

//! The AMP runtime version cache.
//!
//! The transformer pins each document to the runtime version and inline CSS
//! that were current when it was signed. Values come from the AMP CDN's
//! metadata endpoint and refresh hourly; a failed poll keeps the previous
//! values.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

const DEFAULT_RTV_HOST: &str = "https://cdn.ampproject.org";
const POLL_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Read access to the current runtime version and CSS.
pub trait RuntimeVersionSource: Send + Sync {
    fn current_version(&self) -> String;
    fn current_css(&self) -> String;
}

/// Fixed values, for development mode and tests.
#[derive(Debug, Default)]
pub struct StaticRuntime {
    pub version: String,
    pub css: String,
}

impl RuntimeVersionSource for StaticRuntime {
    fn current_version(&self) -> String {
        self.version.clone()
    }

    fn current_css(&self) -> String {
        self.css.clone()
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
struct RtvData {
    #[serde(rename = "ampRuntimeVersion")]
    version: String,
    #[serde(rename = "ampCssUrl")]
    css_url: String,
    #[serde(skip)]
    css: String,
}

/// Polls the AMP CDN for runtime metadata.
pub struct RtvCache {
    client: reqwest::Client,
    host: String,
    data: RwLock<RtvData>,
}

impl RtvCache {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_host(client, DEFAULT_RTV_HOST)
    }

    pub fn with_host(client: reqwest::Client, host: &str) -> Self {
        Self {
            client,
            host: host.trim_end_matches('/').to_string(),
            data: RwLock::new(RtvData::default()),
        }
    }

    /// Performs the initial poll; startup fails if no version is available.
    pub async fn init(&self) -> anyhow::Result<()> {
        self.poll().await.context("initializing runtime version cache")
    }

    pub fn spawn_refresh(self: &Arc<Self>) -> crate::cert_cache::RefreshHandle {
        let halt_token = CancellationToken::new();
        let halt = halt_token.clone();
        let cache = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = halt.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(error) = cache.poll().await {
                            tracing::warn!(%error, "runtime version poll failed; keeping cached values");
                        }
                    }
                }
            }
        });
        crate::cert_cache::RefreshHandle::new(task, halt_token)
    }

    async fn poll(&self) -> anyhow::Result<()> {
        let url = format!("{}/rtv/metadata", self.host);
        let mut data: RtvData = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("fetching {url}"))?
            .json()
            .await
            .context("parsing runtime metadata")?;
        if data.version.is_empty() || data.css_url.is_empty() {
            anyhow::bail!("runtime metadata is missing version or CSS URL");
        }

        // Unchanged version; skip the CSS fetch.
        if let Ok(current) = self.data.read() {
            if current.version == data.version {
                return Ok(());
            }
        }
        data.css = self
            .client
            .get(&data.css_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("fetching {}", data.css_url))?
            .text()
            .await
            .context("reading runtime CSS")?;

        if let Ok(mut current) = self.data.write() {
            *current = data;
        }
        Ok(())
    }
}

impl RuntimeVersionSource for RtvCache {
    fn current_version(&self) -> String {
        self.data.read().map(|d| d.version.clone()).unwrap_or_default()
    }

    fn current_css(&self) -> String {
        self.data.read().map(|d| d.css.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    async fn mount_metadata(server: &MockServer, version: &str) {
        let css_url = format!("{}/rtv/{}/v0.css", server.uri(), version);
        Mock::given(method("GET"))
            .and(path("/rtv/metadata"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ampRuntimeVersion": version,
                "ampCssUrl": css_url,
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/rtv/{version}/v0.css")))
            .respond_with(ResponseTemplate::new(200).set_body_string("body{margin:0}"))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn init_populates_version_and_css() {
        let server = MockServer::start().await;
        mount_metadata(&server, "012345").await;

        let cache = RtvCache::with_host(reqwest::Client::new(), &server.uri());
        cache.init().await.unwrap();
        assert_eq!(cache.current_version(), "012345");
        assert_eq!(cache.current_css(), "body{margin:0}");
    }

    #[tokio::test]
    async fn init_fails_on_missing_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rtv/metadata"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let cache = RtvCache::with_host(reqwest::Client::new(), &server.uri());
        assert!(cache.init().await.is_err());
    }

    #[tokio::test]
    async fn unchanged_version_skips_css_fetch() {
        let server = MockServer::start().await;
        let css_url = format!("{}/css", server.uri());
        Mock::given(method("GET"))
            .and(path("/rtv/metadata"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ampRuntimeVersion": "1",
                "ampCssUrl": css_url,
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/css"))
            .respond_with(ResponseTemplate::new(200).set_body_string("css"))
            .expect(1)
            .mount(&server)
            .await;

        let cache = RtvCache::with_host(reqwest::Client::new(), &server.uri());
        cache.init().await.unwrap();
        cache.poll().await.unwrap();
        assert_eq!(cache.current_css(), "css");
    }
}

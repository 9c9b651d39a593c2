// SPDX-License-Identifier: MIT

use std::sync::Arc;

use amppkg::cert_cache::CertCache;
use amppkg::config::{self, Config};
use amppkg::ocsp::ChainVerifier;
use amppkg::rtv::RtvCache;
use amppkg::server::{self, AppState};
use amppkg::signer::Signer;
use amppkg::storage::{Chained, InMemory, LocalFile};
use amppkg::transformer::IdentityTransformer;
use amppkg::urlset::UrlSets;
use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, EnvFilter};

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = cli::Cli::parse();

    // Unfortunately we can't use clap's value_parser since EnvFilter does not
    // implement Clone.
    let log_filter = EnvFilter::builder().parse(&opts.log_filter).context(
        "AMPPKG_LOG contains an invalid log directive; refer to \
        https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/\
        filter/struct.EnvFilter.html#directives for format details.",
    )?;
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(log_filter);
    tracing::subscriber::set_global_default(registry)
        .expect("Programming error: set_global_default should only be called once.");

    let config = Config::load(&opts.config)?;
    let version = config.sxg_version()?;
    let url_sets = UrlSets::new(&config.url_sets)?;
    let packager_base = config.packager_base()?;

    let certs = config::load_chain(&config.cert_file)?;
    let key = config::load_key(&config.key_file, &certs[0])?;
    if config.dev_mode {
        tracing::warn!(
            "development mode is enabled; exchanges will not validate in production user agents"
        );
    } else {
        config::verify_can_sign_http_exchanges(&certs[0])?;
    }

    let client = reqwest::Client::new();
    let verifier = Arc::new(ChainVerifier::new(&certs)?);
    let storage = Arc::new(Chained::new(
        InMemory::new(),
        LocalFile::new(&config.ocsp_cache),
    ));
    let cert_cache = Arc::new(CertCache::new(
        certs,
        verifier,
        storage,
        client.clone(),
    )?);
    if let Err(error) = cert_cache.init().await {
        if config.dev_mode {
            tracing::warn!(%error, "starting without a valid OCSP response");
        } else {
            return Err(error);
        }
    }

    let rtv = Arc::new(RtvCache::new(client));
    if let Err(error) = rtv.init().await {
        if config.dev_mode {
            tracing::warn!(%error, "starting without AMP runtime metadata");
        } else {
            return Err(error);
        }
    }

    let signer = Arc::new(Signer::new(
        Arc::clone(&cert_cache),
        key,
        url_sets,
        version,
        config.require_headers,
        config.dev_mode,
        packager_base,
        Arc::new(IdentityTransformer),
        Arc::clone(&rtv) as Arc<dyn amppkg::rtv::RuntimeVersionSource>,
    )?);

    let ocsp_refresh = cert_cache.spawn_refresh();
    let rtv_refresh = rtv.spawn_refresh();
    let halt_token = CancellationToken::new();
    tokio::spawn(signal_handler(halt_token.clone()));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, version = %version, "amppkg listening");
    let router = server::router(AppState { signer, cert_cache });
    axum::serve(listener, router)
        .with_graceful_shutdown(halt_token.cancelled_owned())
        .await
        .context("server error")?;

    ocsp_refresh.shutdown().await?;
    rtv_refresh.shutdown().await?;
    Ok(())
}

/// Install and manage signal handlers for the process.
///
/// # SIGTERM and SIGINT
///
/// Sending SIGTERM or SIGINT to the process will cause it to stop accepting
/// new connections. In-flight requests are allowed to complete before the
/// process shuts down.
async fn signal_handler(halt_token: CancellationToken) -> Result<(), anyhow::Error> {
    let mut sigterm_stream = signal(SignalKind::terminate()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGTERM signal handler");
    })?;
    let mut sigint_stream = signal(SignalKind::interrupt()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGINT signal handler");
    })?;

    loop {
        tokio::select! {
            _ = sigterm_stream.recv() => {
                tracing::info!("SIGTERM received, beginning service shutdown");
                halt_token.cancel();
            }
            _ = sigint_stream.recv() => {
                tracing::info!("SIGINT received, beginning service shutdown");
                halt_token.cancel();
            }
        }
    }
}

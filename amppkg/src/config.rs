// SPDX-License-Identifier: MIT

//! Service configuration.
//!
//! A single TOML document supplies the listener port, the signing material,
//! the OCSP cache path, and the URL policy. Everything is validated at
//! startup; configuration problems abort the process rather than surfacing
//! at request time.

use std::path::{Path, PathBuf};

use anyhow::Context;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use serde::Deserialize;
use url::Url;

use crate::error::ConfigError;
use crate::sxg::Version;
use crate::urlset::UrlSetConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Port for the plain-HTTP listener. A fronting layer terminates TLS.
    #[serde(default = "default_port")]
    pub port: u16,

    /// PEM file holding the full certificate chain, leaf first.
    pub cert_file: PathBuf,

    /// PEM file holding the leaf certificate's private key.
    pub key_file: PathBuf,

    /// Writable file for the shared OCSP cache. The parent directory must
    /// exist before the service starts.
    pub ocsp_cache: PathBuf,

    /// Base URL used to build `cert-url` instead of the sign URL's origin.
    /// Only needed when serving from a non-public base, e.g. local testing.
    #[serde(default)]
    pub packager_base: Option<String>,

    /// The signed-exchange version to emit, `b2` or `b3`.
    #[serde(default = "default_sxg_version")]
    pub sxg_version: String,

    /// Require satisfiable `AMP-Cache-Transform` and `Accept` headers
    /// before signing. Disable only for manual testing with plain clients.
    #[serde(default = "default_true")]
    pub require_headers: bool,

    /// Development mode: skip the certificate-extension and OCSP health
    /// gates. Exchanges produced this way will not validate in production
    /// user agents.
    #[serde(default)]
    pub dev_mode: bool,

    #[serde(default, rename = "urlset")]
    pub url_sets: Vec<UrlSetConfig>,
}

fn default_port() -> u16 {
    8080
}

fn default_sxg_version() -> String {
    "b3".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration from {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("configuration file {} is invalid", path.display()))?;
        Ok(config)
    }

    pub fn sxg_version(&self) -> anyhow::Result<Version> {
        self.sxg_version
            .parse()
            .map_err(|reason: String| anyhow::anyhow!(reason))
    }

    /// The validated `packager_base` override, if configured.
    pub fn packager_base(&self) -> Result<Option<Url>, ConfigError> {
        let Some(base) = &self.packager_base else {
            return Ok(None);
        };
        let url = Url::parse(base).map_err(|_| ConfigError::InvalidBase(base.clone()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidBase(base.clone()));
        }
        // The cert and validity paths are resolved relative to the base, so
        // a missing trailing slash would silently drop its last segment.
        if !url.path().ends_with('/') {
            return Err(ConfigError::InvalidBase(base.clone()));
        }
        Ok(Some(url))
    }
}

/// Loads the PEM certificate chain, leaf first.
pub fn load_chain(path: &Path) -> anyhow::Result<Vec<X509>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("failed to read certificates from {}", path.display()))?;
    let chain = X509::stack_from_pem(&pem)
        .with_context(|| format!("failed to parse certificates from {}", path.display()))?;
    if chain.is_empty() {
        anyhow::bail!("{} contains no certificates", path.display());
    }
    Ok(chain)
}

/// Loads the signing key and checks it matches the leaf certificate.
pub fn load_key(path: &Path, leaf: &X509) -> anyhow::Result<PKey<Private>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("failed to read private key from {}", path.display()))?;
    let key = PKey::private_key_from_pem(&pem)
        .with_context(|| format!("failed to parse private key from {}", path.display()))?;
    if !leaf
        .public_key()
        .context("reading leaf public key")?
        .public_eq(&key)
    {
        anyhow::bail!("private key does not match the leaf certificate");
    }
    Ok(key)
}

/// Verifies the leaf carries the CanSignHttpExchanges extension required
/// by validators. Skipped in development mode.
pub fn verify_can_sign_http_exchanges(leaf: &X509) -> anyhow::Result<()> {
    use x509_parser::prelude::FromDer;

    let der = leaf.to_der().context("serializing leaf certificate")?;
    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(&der)
        .map_err(|error| anyhow::anyhow!("failed to parse leaf certificate: {error}"))?;
    let can_sign = x509_parser::der_parser::oid!(1.3.6.1.4.1.11129.2.1.22);
    if cert.extensions().iter().any(|ext| ext.oid == can_sign) {
        Ok(())
    } else {
        anyhow::bail!("certificate is missing the CanSignHttpExchanges extension")
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const MINIMAL: &str = r#"
        cert_file = "/etc/amppkg/cert.pem"
        key_file = "/etc/amppkg/key.pem"
        ocsp_cache = "/var/cache/amppkg/ocsp"

        [[urlset]]
        [urlset.sign]
        domain = "amppackageexample.com"
    "#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.sxg_version().unwrap(), Version::B3);
        assert!(config.require_headers);
        assert!(!config.dev_mode);
        assert!(config.packager_base().unwrap().is_none());
        assert_eq!(config.url_sets.len(), 1);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result = toml::from_str::<Config>(&format!("{MINIMAL}\nnot_a_key = 1"));
        assert!(result.is_err());
    }

    #[test]
    fn packager_base_must_be_http() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.packager_base = Some("ftp://example.com/".into());
        assert!(matches!(
            config.packager_base(),
            Err(ConfigError::InvalidBase(_))
        ));
        config.packager_base = Some("https://localhost:8080/".into());
        assert!(config.packager_base().unwrap().is_some());
    }

    #[test]
    fn packager_base_requires_a_trailing_slash() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.packager_base = Some("https://localhost:8080/prefix".into());
        assert!(matches!(
            config.packager_base(),
            Err(ConfigError::InvalidBase(_))
        ));
    }

    #[test]
    fn bad_sxg_version_is_rejected() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.sxg_version = "b9".into();
        assert!(config.sxg_version().is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let error = Config::load(Path::new("/nonexistent/amppkg.toml")).unwrap_err();
        assert!(error.to_string().contains("failed to read configuration"));
    }

    #[test]
    fn plain_cert_fails_extension_check() {
        let (cert, _key) = crate::sxg::testing::generate_sxg_cert();
        assert!(verify_can_sign_http_exchanges(&cert).is_err());
    }

    #[test]
    fn chain_loads_from_pem() {
        let (cert, key) = crate::sxg::testing::generate_sxg_cert();
        let mut cert_file = tempfile::NamedTempFile::new().unwrap();
        cert_file.write_all(&cert.to_pem().unwrap()).unwrap();
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        key_file
            .write_all(&key.private_key_to_pem_pkcs8().unwrap())
            .unwrap();

        let chain = load_chain(cert_file.path()).unwrap();
        assert_eq!(chain.len(), 1);
        let loaded = load_key(key_file.path(), &chain[0]).unwrap();
        assert!(loaded.public_eq(&chain[0].public_key().unwrap()));
    }
}

// SPDX-License-Identifier: MIT

//! Administrator URL policy.
//!
//! Each `[[urlset]]` block in the configuration pairs a mandatory sign
//! pattern with an optional fetch pattern. An inbound request's (fetch,
//! sign) URL pair must match some configured set before any origin fetch
//! happens; the list is an ordered whitelist and the first matching set
//! wins. Patterns are validated and their regexes compiled once at startup.

use regex::Regex;
use serde::Deserialize;
use url::Url;

use crate::error::{ConfigError, RequestError};

/// One `[[urlset]]` block as deserialized from the configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UrlSetConfig {
    pub sign: PatternConfig,
    pub fetch: Option<PatternConfig>,
}

/// The raw, not-yet-validated shape of a URL pattern.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PatternConfig {
    pub scheme: Vec<String>,
    pub domain: Option<String>,
    pub domain_re: Option<String>,
    pub path_re: Option<String>,
    pub path_exclude_re: Vec<String>,
    pub query_re: Option<String>,
    pub error_on_stateful_headers: bool,
    pub max_length: Option<usize>,
    pub same_path: Option<bool>,
}

const ALLOWED_FETCH_SCHEMES: [&str; 2] = ["http", "https"];

/// The outcome of a successful policy match.
#[derive(Debug)]
pub struct MatchedUrls {
    pub fetch_url: Url,
    pub sign_url: Url,
    pub error_on_stateful_headers: bool,
}

/// The validated, compiled form of every configured URL set.
#[derive(Debug)]
pub struct UrlSets {
    sets: Vec<ValidatedSet>,
}

#[derive(Debug)]
struct ValidatedSet {
    sign: SignPattern,
    fetch: Option<FetchPattern>,
}

#[derive(Debug)]
struct SignPattern {
    domain: String,
    error_on_stateful_headers: bool,
    common: CommonPattern,
}

#[derive(Debug)]
struct FetchPattern {
    schemes: Vec<String>,
    domain: DomainRule,
    same_path: bool,
    common: CommonPattern,
}

#[derive(Debug)]
enum DomainRule {
    Exact(String),
    Matching(Regex),
}

#[derive(Debug)]
struct CommonPattern {
    path_re: Regex,
    path_exclude_re: Vec<Regex>,
    query_re: Regex,
    max_length: usize,
}

impl UrlSets {
    pub fn new(configs: &[UrlSetConfig]) -> Result<Self, ConfigError> {
        if configs.is_empty() {
            return Err(ConfigError::NoUrlSets);
        }
        let sets = configs
            .iter()
            .enumerate()
            .map(|(index, config)| {
                Ok(ValidatedSet {
                    sign: SignPattern::validate(index, &config.sign)?,
                    fetch: config
                        .fetch
                        .as_ref()
                        .map(|fetch| FetchPattern::validate(index, fetch))
                        .transpose()?,
                })
            })
            .collect::<Result<_, ConfigError>>()?;
        Ok(Self { sets })
    }

    /// Resolves raw `fetch` and `sign` strings against the policy.
    ///
    /// When no set carries a fetch pattern the caller must omit `fetch`,
    /// and the sign URL doubles as the fetch URL.
    pub fn match_urls(
        &self,
        fetch: Option<&str>,
        sign: &str,
    ) -> Result<MatchedUrls, RequestError> {
        let fetch_url = fetch.map(|raw| parse_url(raw, "fetch")).transpose()?;
        let sign_url = parse_url(sign, "sign")?;
        for set in &self.sets {
            if set.matches(fetch_url.as_ref(), &sign_url) {
                return Ok(MatchedUrls {
                    fetch_url: fetch_url.unwrap_or_else(|| sign_url.clone()),
                    sign_url,
                    error_on_stateful_headers: set.sign.error_on_stateful_headers,
                });
            }
        }
        Err(RequestError::BadRequest(
            "fetch/sign URLs do not match config".into(),
        ))
    }
}

impl ValidatedSet {
    fn matches(&self, fetch_url: Option<&Url>, sign_url: &Url) -> bool {
        match (&self.fetch, fetch_url) {
            // A sign-only set matches only requests without a fetch URL.
            (None, Some(_)) => return false,
            (None, None) => {}
            (Some(_), None) => return false,
            (Some(pattern), Some(url)) => {
                if !pattern.matches(url) {
                    return false;
                }
                if pattern.same_path && request_uri(url) != request_uri(sign_url) {
                    return false;
                }
            }
        }
        self.sign.matches(sign_url)
    }
}

impl SignPattern {
    fn validate(index: usize, config: &PatternConfig) -> Result<Self, ConfigError> {
        let fail = |reason: &str| ConfigError::UrlPattern {
            index,
            side: "sign",
            reason: reason.to_string(),
        };
        if !config.scheme.is_empty() {
            return Err(fail("scheme not allowed here"));
        }
        if config.domain_re.is_some() {
            // The sign domain determines cryptographic identity; a regex
            // form would only suit wildcard certificates.
            return Err(fail("domain_re not allowed here"));
        }
        if config.same_path.is_some() {
            return Err(fail("same_path not allowed here"));
        }
        let domain = config
            .domain
            .clone()
            .filter(|domain| !domain.is_empty())
            .ok_or_else(|| fail("domain must be specified"))?;
        Ok(Self {
            domain,
            error_on_stateful_headers: config.error_on_stateful_headers,
            common: CommonPattern::validate(index, "sign", config)?,
        })
    }

    fn matches(&self, url: &Url) -> bool {
        // Only https may be signed.
        url.scheme() == "https" && host(url) == self.domain && self.common.matches(url)
    }
}

impl FetchPattern {
    fn validate(index: usize, config: &PatternConfig) -> Result<Self, ConfigError> {
        let fail = |reason: String| ConfigError::UrlPattern {
            index,
            side: "fetch",
            reason,
        };
        let schemes = if config.scheme.is_empty() {
            ALLOWED_FETCH_SCHEMES.map(String::from).to_vec()
        } else {
            for scheme in &config.scheme {
                if !ALLOWED_FETCH_SCHEMES.contains(&scheme.as_str()) {
                    return Err(fail(format!("scheme contains invalid value {scheme:?}")));
                }
            }
            config.scheme.clone()
        };
        let domain = match (&config.domain, &config.domain_re) {
            (Some(domain), None) if !domain.is_empty() => DomainRule::Exact(domain.clone()),
            (None, Some(re)) => DomainRule::Matching(
                full_match_regex(re)
                    .map_err(|error| fail(format!("domain_re is invalid: {error}")))?,
            ),
            (None, None) => return Err(fail("domain or domain_re must be specified".into())),
            _ => return Err(fail("only one of domain or domain_re should be specified".into())),
        };
        if config.error_on_stateful_headers {
            return Err(fail("error_on_stateful_headers not allowed here".into()));
        }
        Ok(Self {
            schemes,
            domain,
            same_path: config.same_path.unwrap_or(true),
            common: CommonPattern::validate(index, "fetch", config)?,
        })
    }

    fn matches(&self, url: &Url) -> bool {
        if !self.schemes.iter().any(|scheme| scheme == url.scheme()) {
            return false;
        }
        let matches_domain = match &self.domain {
            DomainRule::Exact(domain) => host(url) == *domain,
            DomainRule::Matching(re) => re.is_match(&host(url)),
        };
        matches_domain && self.common.matches(url)
    }
}

impl CommonPattern {
    fn validate(
        index: usize,
        side: &'static str,
        config: &PatternConfig,
    ) -> Result<Self, ConfigError> {
        let fail = |field: &str, error: regex::Error| ConfigError::UrlPattern {
            index,
            side,
            reason: format!("{field} is invalid: {error}"),
        };
        Ok(Self {
            path_re: full_match_regex(config.path_re.as_deref().unwrap_or(".*"))
                .map_err(|e| fail("path_re", e))?,
            path_exclude_re: config
                .path_exclude_re
                .iter()
                .map(|re| full_match_regex(re).map_err(|e| fail("path_exclude_re", e)))
                .collect::<Result<_, _>>()?,
            // An absent query_re admits only URLs without a query.
            query_re: full_match_regex(config.query_re.as_deref().unwrap_or(""))
                .map_err(|e| fail("query_re", e))?,
            max_length: config.max_length.unwrap_or(2000),
        })
    }

    fn matches(&self, url: &Url) -> bool {
        self.path_re.is_match(url.path())
            && !self
                .path_exclude_re
                .iter()
                .any(|re| re.is_match(url.path()))
            && self.query_re.is_match(url.query().unwrap_or(""))
            && url.as_str().len() <= self.max_length
    }
}

/// Anchors `pattern` so it must match the entire input.
fn full_match_regex(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(r"\A(?:{pattern})\z"))
}

/// The URL's host, with the port appended when one is explicit. Patterns
/// for non-default ports must spell the port in their `domain`.
fn host(url: &Url) -> String {
    let host = url.host_str().unwrap_or("");
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn request_uri(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

fn parse_url(raw: &str, name: &str) -> Result<Url, RequestError> {
    if raw.is_empty() {
        return Err(RequestError::BadRequest(format!("{name} URL is unspecified")));
    }
    // Relative URLs fail to parse on their own, which is what we want: a
    // fetch URL has no base to resolve against, and the exchange format
    // requires an absolute sign URL. Parsing also collapses "/.." path
    // segments, so they cannot sneak past path_re.
    let url = Url::parse(raw)
        .map_err(|error| RequestError::BadRequest(format!("error parsing {name} URL: {error}")))?;
    if url.cannot_be_a_base() {
        return Err(RequestError::BadRequest(format!("{name} URL is opaque")));
    }
    if !url.username().is_empty() || url.password().is_some() {
        // More likely an attack than a legitimate request.
        return Err(RequestError::BadRequest(format!("{name} URL contains user")));
    }
    Ok(url)
}

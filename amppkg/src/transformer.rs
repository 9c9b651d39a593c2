// SPDX-License-Identifier: MIT

//! The AMP HTML transformer capability.
//!
//! The content mutations themselves (server-side rendering, runtime
//! pinning, CSS inlining) live in an external library; the signer only
//! needs a function from a document to its transformed form. A transform
//! failure is never fatal: the signer falls back to proxying the original
//! document unsigned.

use url::Url;

#[derive(Debug, thiserror::Error)]
#[error("transform failed: {0}")]
pub struct TransformError(pub String);

pub trait Transformer: Send + Sync {
    /// Rewrites `html` for serving from an AMP cache, pinned to the given
    /// runtime version and CSS.
    fn transform(
        &self,
        html: &str,
        document_url: &Url,
        runtime_version: &str,
        runtime_css: &str,
    ) -> Result<String, TransformError>;
}

/// Passes documents through untouched. Used when no transform library is
/// wired in; the exchange is still valid, just unoptimized.
#[derive(Debug, Default)]
pub struct IdentityTransformer;

impl Transformer for IdentityTransformer {
    fn transform(
        &self,
        html: &str,
        _document_url: &Url,
        _runtime_version: &str,
        _runtime_css: &str,
    ) -> Result<String, TransformError> {
        Ok(html.to_string())
    }
}

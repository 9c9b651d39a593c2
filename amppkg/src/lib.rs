// SPDX-License-Identifier: MIT

/*!
# amppkg

An AMP packager. It fetches AMP HTML documents from a publisher's origin,
runs them through an AMP transformer, and wraps the result in a Signed HTTP
Exchange (SXG) so that a caching intermediary can serve the content under
the publisher's own origin identity.

## Components

The service has two core subsystems. The first is the [certificate
cache](cert_cache), which keeps a fresh OCSP response stapled to the signing
certificate. The OCSP blob is refreshed in the background, persisted to disk
so that co-located replicas coordinate around a single responder fetch, and
served over HTTP in the CBOR cert-chain format that signed exchanges
reference. The cache's health predicate gates whether signing is permitted
at all.

The second is the [signer](signer): a per-request pipeline that validates
the requested fetch/sign URL pair against administrator [URL
patterns](urlset), fetches the origin document, enforces cacheability and
header policy, invokes the transformer, and emits a binary Signed HTTP
Exchange. Whenever any precondition fails, the signer degrades to proxying
the origin response unsigned; an end user never sees an error page because
packaging failed.

The HTML transformer and the AMP runtime-version poller are external
collaborators, consumed through the [`transformer::Transformer`] and
[`rtv::RuntimeVersionSource`] capabilities.
*/

pub mod accept;
pub mod cert_cache;
pub mod certurl;
pub mod config;
pub mod error;
pub mod headers;
pub mod mice;
pub mod ocsp;
pub mod rtv;
pub mod server;
pub mod signer;
pub mod storage;
pub mod sxg;
pub mod transformer;
pub mod urlset;

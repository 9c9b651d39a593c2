// SPDX-License-Identifier: MIT

//! Define the command-line interface.

use std::path::PathBuf;

use clap::Parser;

/// The AMP packager.
///
/// Fetches AMP documents from a backend, transforms them, and serves them
/// as signed HTTP exchanges, along with the certificate chain and validity
/// endpoints the format requires. Run it behind your frontend server and
/// reverse-proxy `/amppkg/` plus an internal route to `/priv/doc` to it.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// The path to the packager's configuration file.
    #[arg(long, short, env = "AMPPKG_CONFIG")]
    pub config: PathBuf,

    /// A set of one or more comma-separated directives to filter logs.
    ///
    /// The general format is "target_name[span_name{field=value}]=level" where level is
    /// one of TRACE, DEBUG, INFO, WARN, ERROR.
    ///
    /// Details: https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[arg(long, env = "AMPPKG_LOG", default_value = "WARN,amppkg=INFO")]
    pub log_filter: String,
}

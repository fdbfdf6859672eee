//! Named error variants that callers match on. Everything else flows through
//! `anyhow`, following the split the teacher repo uses between a small set of
//! `thiserror` types at component boundaries and `anyhow::Context` everywhere
//! else.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file is malformed: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("failed to write state file")]
    Write(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("SNI {sni:?} does not match any configured whitelist")]
    NoMatch { sni: String },
    #[error("invalid SNI whitelist pattern {pattern:?}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("ACME certificate for {domain} is not yet available")]
    AcmeNotReady { domain: String },
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

#[derive(Debug, Error)]
pub enum ExfilError {
    #[error("path escapes the exfil root")]
    PathEscape,
    #[error("empty path")]
    EmptyPath,
    #[error("exfil I/O failed")]
    Io(#[source] std::io::Error),
}

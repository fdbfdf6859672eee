//! SNI whitelist matching (spec §4.4): filepath-style globs (`*` wildcard),
//! matched case-insensitively against the Punycoded SNI. Grounded on the
//! teacher workspace's own `glob = "0.3"` dependency (used by its `json`
//! crate for path matching).

use crate::error::TlsError;

#[derive(Debug, Clone)]
pub struct Whitelist {
    patterns: Vec<glob::Pattern>,
}

impl Whitelist {
    pub fn new(patterns: &[String]) -> Result<Self, TlsError> {
        let compiled = patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(&p.to_ascii_lowercase()).map_err(|source| {
                    TlsError::InvalidPattern {
                        pattern: p.clone(),
                        source,
                    }
                })
            })
            .collect::<Result<Vec<_>, TlsError>>()?;
        Ok(Self { patterns: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// `sni` should already be normalized (lowercase ASCII/Punycode);
    /// `"*"` matches every SNI including the empty one.
    pub fn matches(&self, sni: &str) -> bool {
        let options = glob::MatchOptions {
            case_sensitive: false,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };
        self.patterns
            .iter()
            .any(|pattern| pattern.matches_with(sni, options))
    }
}

/// Normalize a hostname (SNI or Host header) to lowercase ASCII/Punycode.
pub fn normalize_host(host: &str) -> String {
    idna::domain_to_ascii(host).unwrap_or_else(|_| host.to_ascii_lowercase())
}

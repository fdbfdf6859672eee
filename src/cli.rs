//! Command-line surface (spec §6). One flat struct, matching the `-server`
//! vs. default client-mode split described there rather than a subcommand
//! tree: the flags that matter to each mode simply go unused in the other.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// A tasking and static-file server for implants, fronted by a self-signed
/// or Let's Encrypt TLS listener, with an interactive operator client.
#[derive(Debug, Parser, serde::Serialize)]
#[command(about, version)]
pub struct Cli {
    /// Working directory holding state.json, the log, cached certs, the
    /// static file root, and the exfil drop directory.
    #[arg(long, default_value = ".", env = "PLONK_DIR")]
    pub dir: PathBuf,

    /// Run as the server. Without this flag, run the interactive operator
    /// client against a server already listening on `op.sock` in `dir`.
    #[arg(long, env = "PLONK_SERVER")]
    pub server: bool,

    /// Operator name to announce when connecting in client mode.
    #[arg(long, default_value = "", env = "PLONK_NAME")]
    pub name: String,

    /// Address the plaintext implant listener binds.
    #[arg(long, default_value = "0.0.0.0:80", env = "PLONK_HTTP_ADDR")]
    pub http_addr: SocketAddr,

    /// Address the TLS implant listener binds.
    #[arg(long, default_value = "0.0.0.0:443", env = "PLONK_HTTPS_ADDR")]
    pub https_addr: SocketAddr,

    /// Domains served a Let's Encrypt certificate, comma-delimited glob
    /// patterns matched against normalized SNI/Host.
    #[arg(long = "le-domain", env = "PLONK_LE_DOMAINS", value_delimiter = ',')]
    pub le_domains: Vec<String>,

    /// Domains served the shared self-signed certificate, comma-delimited
    /// glob patterns matched against normalized SNI/Host.
    #[arg(long = "ss-domain", env = "PLONK_SS_DOMAINS", value_delimiter = ',')]
    pub ss_domains: Vec<String>,

    /// Use the Let's Encrypt staging directory instead of production.
    #[arg(long, env = "PLONK_ACME_STAGING")]
    pub acme_staging: bool,

    /// Contact email registered with the ACME account.
    #[arg(long, env = "PLONK_ACME_EMAIL")]
    pub acme_email: Option<String>,

    /// Maximum bytes kept per `/p` upload; 0 disables the exfil route
    /// entirely (spec §4.5.3).
    #[arg(long, default_value = "0", env = "PLONK_EXFIL_MAX")]
    pub exfil_max: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_server_invocation() {
        let cli = Cli::parse_from(["plonk", "--server"]);
        assert!(cli.server);
        assert_eq!(cli.exfil_max, 0);
        assert!(cli.le_domains.is_empty());
    }

    #[test]
    fn splits_comma_delimited_domain_lists() {
        let cli = Cli::parse_from([
            "plonk",
            "--server",
            "--le-domain",
            "a.example.com,b.example.com",
            "--ss-domain",
            "*.internal",
        ]);
        assert_eq!(cli.le_domains, vec!["a.example.com", "b.example.com"]);
        assert_eq!(cli.ss_domains, vec!["*.internal"]);
    }
}

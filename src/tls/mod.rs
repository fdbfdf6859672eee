//! C4: the TLS certificate engine (spec §4.4).
//!
//! `CertResolver` implements `rustls::server::ResolvesServerCert` and is
//! installed directly into the `rustls::ServerConfig` the implant server
//! hands to `axum-server`. Per handshake it normalizes the SNI, then tries,
//! in order: the in-flight ACME-ALPN-01 challenge cert (if the client
//! negotiated `acme-tls/1`), the Let's Encrypt whitelist (served from the
//! ACME engine's in-memory map), then the self-signed whitelist (the shared
//! `eztls` certificate). No match fails the handshake.

pub mod acme;
pub mod cache;
pub mod selfsigned;
pub mod whitelist;

use std::sync::{Arc, RwLock};

use anyhow::Context;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use sha2::{Digest, Sha256};

use acme::AcmeEngine;
use cache::DiskCertCache;
use whitelist::{normalize_host, Whitelist};

use crate::error::TlsError;

const ACME_TLS_ALPN_PROTOCOL: &[u8] = b"acme-tls/1";
const SELFSIGNED_CACHE_KEY: &str = "selfsigned";

pub struct CertResolver {
    le_whitelist: Whitelist,
    ss_whitelist: Whitelist,
    acme: Option<Arc<AcmeEngine>>,
    selfsigned: RwLock<Option<Arc<CertifiedKey>>>,
    ss_cache: DiskCertCache,
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver").finish_non_exhaustive()
    }
}

impl CertResolver {
    pub fn new(
        le_whitelist: Whitelist,
        ss_whitelist: Whitelist,
        acme: Option<Arc<AcmeEngine>>,
        ss_cache: DiskCertCache,
    ) -> Self {
        Self {
            le_whitelist,
            ss_whitelist,
            acme,
            selfsigned: RwLock::new(None),
            ss_cache,
        }
    }

    /// Load the cached `eztls` certificate, generating and caching a fresh
    /// one if absent or expired. Must complete before the implant server
    /// starts accepting connections that might need the SS whitelist.
    pub async fn load_or_generate_selfsigned(&self) -> anyhow::Result<()> {
        let record = match self.ss_cache.get(SELFSIGNED_CACHE_KEY).await? {
            Some(record) if record.is_currently_valid() => record,
            _ => {
                let record = selfsigned::generate()?;
                self.ss_cache.put(SELFSIGNED_CACHE_KEY, &record).await?;
                record
            }
        };
        let certified = certified_key_from_pem(&record.chain_pem, &record.key_pem)?;
        *self.selfsigned.write().unwrap() = Some(Arc::new(certified));
        Ok(())
    }

    /// Would a handshake for `host` right now be served the self-signed
    /// `eztls` certificate rather than an ACME one? Used by `/c` (spec
    /// §4.5.5) to decide whether to include a pinned-pubkey fingerprint,
    /// without actually performing a handshake.
    pub fn serves_selfsigned(&self, host: &str) -> bool {
        let host = normalize_host(host);
        if self.le_whitelist.matches(&host) {
            if let Some(acme) = &self.acme {
                if acme.cert_for(&host).is_some() {
                    return false;
                }
            }
        }
        self.ss_whitelist.matches(&host)
    }

    /// `base64(sha256(DER(SubjectPublicKeyInfo)))` of the self-signed
    /// certificate, pinned into generated implant scripts (spec §4.5.3) so
    /// an implant can verify it is talking to the genuine server even over
    /// an otherwise-untrusted self-signed connection.
    pub fn selfsigned_pubkey_fingerprint(&self) -> Option<String> {
        self.selfsigned
            .read()
            .unwrap()
            .as_ref()
            .and_then(|ck| fingerprint_of(ck))
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name().unwrap_or_default();
        let host = normalize_host(sni);

        let wants_alpn_challenge = client_hello
            .alpn()
            .map(|mut protocols| protocols.any(|p| p == ACME_TLS_ALPN_PROTOCOL))
            .unwrap_or(false);
        if wants_alpn_challenge {
            if let Some(acme) = &self.acme {
                if let Some(cert) = acme.challenge_cert_for(&host) {
                    return Some(cert);
                }
            }
            // A client asking for the ALPN challenge protocol with no
            // matching in-flight challenge has nothing else to fall back to.
            return None;
        }

        if self.le_whitelist.matches(&host) {
            if let Some(acme) = &self.acme {
                if let Some(cert) = acme.cert_for(&host) {
                    return Some(cert);
                }
                let err = TlsError::AcmeNotReady { domain: host.clone() };
                tracing::warn!(error = %err, "no certificate issued for this SNI yet");
            }
        }

        if self.ss_whitelist.matches(&host) {
            return self.selfsigned.read().unwrap().clone();
        }

        let err = TlsError::NoMatch { sni: host.clone() };
        tracing::debug!(error = %err, "no whitelist matched this SNI");
        None
    }
}

pub fn certified_key_from_pem(chain_pem: &str, key_pem: &str) -> anyhow::Result<CertifiedKey> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut chain_pem.as_bytes())
        .collect::<Result<_, _>>()
        .context("parsing certificate chain PEM")?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .context("parsing private key PEM")?
        .context("PEM contained no private key")?;
    let signing_key = rustls::crypto::aws_lc_rs::sign::any_ecdsa_type(&key)
        .map_err(TlsError::Rustls)
        .context("loading ECDSA signing key")?;
    Ok(CertifiedKey::new(certs, signing_key))
}

pub(crate) fn certified_key_from_der(cert_der: Vec<u8>, key_der: Vec<u8>) -> anyhow::Result<CertifiedKey> {
    let cert = CertificateDer::from(cert_der);
    let key = PrivateKeyDer::try_from(key_der).map_err(|err| anyhow::anyhow!("{err}"))?;
    let signing_key = rustls::crypto::aws_lc_rs::sign::any_ecdsa_type(&key)
        .map_err(TlsError::Rustls)
        .context("loading ECDSA signing key")?;
    Ok(CertifiedKey::new(vec![cert], signing_key))
}

fn fingerprint_of(ck: &CertifiedKey) -> Option<String> {
    let leaf = ck.cert.first()?;
    let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref()).ok()?;
    let spki_der = parsed.public_key().raw;
    Some(base64::encode(Sha256::digest(spki_der)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn selfsigned_round_trips_through_disk_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCertCache::new(dir.path().to_path_buf());
        let resolver = CertResolver::new(
            Whitelist::new(&[]).unwrap(),
            Whitelist::new(&["*".to_string()]).unwrap(),
            None,
            cache,
        );
        resolver.load_or_generate_selfsigned().await.unwrap();
        let fp_first = resolver.selfsigned_pubkey_fingerprint().unwrap();

        let dir2_cache = DiskCertCache::new(dir.path().to_path_buf());
        let resolver2 = CertResolver::new(
            Whitelist::new(&[]).unwrap(),
            Whitelist::new(&["*".to_string()]).unwrap(),
            None,
            dir2_cache,
        );
        resolver2.load_or_generate_selfsigned().await.unwrap();
        let fp_second = resolver2.selfsigned_pubkey_fingerprint().unwrap();

        assert_eq!(fp_first, fp_second, "cached cert should survive a reload");
    }
}

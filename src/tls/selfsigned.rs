//! Self-signed certificate generation (spec §4.4): a single certificate with
//! CommonName `eztls` and one DNS SAN `*`, ECDSA P-256 key, 10-year validity,
//! generated on first need and cached both in memory and on disk.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use time::{Duration, OffsetDateTime};

use super::cache::CertRecord;

const VALIDITY_YEARS: i64 = 10;

/// Build a fresh self-signed `eztls` certificate.
pub fn generate() -> anyhow::Result<CertRecord> {
    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;

    let mut params = CertificateParams::new(vec!["*".to_string()])?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "eztls");
    params.distinguished_name = dn;

    let not_before = OffsetDateTime::now_utc();
    let not_after = not_before + Duration::days(365 * VALIDITY_YEARS);
    params.not_before = not_before;
    params.not_after = not_after;

    let cert = params.self_signed(&key_pair)?;

    Ok(CertRecord {
        chain_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
        not_before,
        not_after,
    })
}

//! The TLS certificate disk cache: PEM-encoded chain+key, re-loadable across
//! restarts (spec §4.4, §6). Keyed by an opaque string — `"selfsigned"` for
//! the one shared self-signed certificate, or a domain name for ACME
//! certificates — matching the `Get/Put/Delete by string key` shape the
//! design notes (§9) ascribe to the (externally-provided) ACME client's own
//! cache.

use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::paths::set_file_mode;

#[derive(Debug, Clone)]
pub struct CertRecord {
    pub chain_pem: String,
    pub key_pem: String,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

impl CertRecord {
    pub fn is_currently_valid(&self) -> bool {
        let now = OffsetDateTime::now_utc();
        now >= self.not_before && now <= self.not_after
    }
}

#[derive(Serialize, Deserialize)]
struct OnDisk {
    chain_pem: String,
    key_pem: String,
    #[serde(with = "time::serde::rfc3339")]
    not_before: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    not_after: OffsetDateTime,
}

#[derive(Clone)]
pub struct DiskCertCache {
    dir: PathBuf,
}

impl DiskCertCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let sanitized: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{sanitized}.json"))
    }

    pub async fn get(&self, key: &str) -> anyhow::Result<Option<CertRecord>> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("reading TLS cache entry"),
        };
        let on_disk: OnDisk = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(key, error = %err, "discarding malformed TLS cache entry");
                return Ok(None);
            }
        };
        Ok(Some(CertRecord {
            chain_pem: on_disk.chain_pem,
            key_pem: on_disk.key_pem,
            not_before: on_disk.not_before,
            not_after: on_disk.not_after,
        }))
    }

    pub async fn put(&self, key: &str, record: &CertRecord) -> anyhow::Result<()> {
        let path = self.path_for(key);
        let on_disk = OnDisk {
            chain_pem: record.chain_pem.clone(),
            key_pem: record.key_pem.clone(),
            not_before: record.not_before,
            not_after: record.not_after,
        };
        let data = serde_json::to_vec_pretty(&on_disk)?;
        tokio::fs::write(&path, &data)
            .await
            .with_context(|| format!("writing TLS cache entry {}", path.display()))?;
        set_file_mode(&path)?;
        Ok(())
    }

    #[allow(dead_code)]
    pub async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("deleting TLS cache entry"),
        }
    }
}

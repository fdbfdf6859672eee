use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::Request;
use plonk::bus::Bus;
use plonk::implant::fileserver::FileServer;
use plonk::implant::AppState;
use plonk::paths::Layout;
use plonk::state::StateStore;
use plonk::tls::cache::DiskCertCache;
use plonk::tls::whitelist::Whitelist;
use plonk::tls::CertResolver;
use tokio_util::sync::CancellationToken;

/// A fully wired `AppState` over a scratch directory, with the self-signed
/// certificate already generated. `_dir` must stay alive for the harness's
/// lifetime — it owns the scratch directory.
pub struct Harness {
    pub _dir: tempfile::TempDir,
    pub app: Arc<AppState>,
    pub cert_resolver: Arc<CertResolver>,
}

pub async fn build(exfil_max: u64, ss_domains: &[&str]) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let layout = Layout::new(dir.path().to_path_buf());
    layout.bootstrap().unwrap();
    let state = Arc::new(StateStore::open(layout.state_json()).await.unwrap());
    let bus = Bus::new();
    let ss_cache = DiskCertCache::new(layout.tls_cache_dir());
    let ss_whitelist = Whitelist::new(
        &ss_domains
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>(),
    )
    .unwrap();
    let cert_resolver = Arc::new(CertResolver::new(
        Whitelist::new(&[]).unwrap(),
        ss_whitelist,
        None,
        ss_cache,
    ));
    cert_resolver.load_or_generate_selfsigned().await.unwrap();

    let files = FileServer::new(layout.files_dir());
    let app = Arc::new(AppState {
        state,
        bus,
        cert_resolver: cert_resolver.clone(),
        layout,
        files,
        exfil_max,
        seen_ids: Default::default(),
        shutdown: CancellationToken::new(),
    });
    Harness {
        _dir: dir,
        app,
        cert_resolver,
    }
}

/// Build a request carrying the `ConnectInfo` extension every implant route
/// extracts, since `Router::oneshot` (unlike a real listener bound with
/// `into_make_service_with_connect_info`) never attaches one itself.
pub fn request(method: &str, uri: &str, body: Body) -> Request<Body> {
    let mut req = Request::builder()
        .method(method)
        .uri(uri)
        .body(body)
        .unwrap();
    let remote: SocketAddr = "127.0.0.1:40000".parse().unwrap();
    req.extensions_mut().insert(ConnectInfo(remote));
    req
}

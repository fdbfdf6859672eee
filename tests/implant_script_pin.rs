//! S6 and Testable Property 7: an `SS`-whitelisted TLS connection pins the
//! self-signed certificate's fingerprint into two identical
//! `--pinnedpubkey` clauses in the rendered implant script.

mod common;

use axum::body::{to_bytes, Body};
use plonk::implant::SniInfo;
use tower::ServiceExt;

#[tokio::test]
async fn script_over_ss_matched_sni_contains_two_matching_pin_clauses() {
    let harness = common::build(0, &["foo.com"]).await;
    let expected_fp = harness
        .cert_resolver
        .selfsigned_pubkey_fingerprint()
        .expect("self-signed cert should already be generated");

    let mut req = common::request("GET", "/c", Body::empty());
    req.extensions_mut().insert(SniInfo {
        sni: Some("foo.com".to_string()),
        is_tls: true,
    });

    let router = plonk::implant::build_router(harness.app.clone());
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let script = String::from_utf8(body.to_vec()).unwrap();

    let clause = format!("--pinnedpubkey \"sha256//{expected_fp}\"");
    assert_eq!(script.matches(clause.as_str()).count(), 2);
    assert!(script.contains("https://foo.com"));
}

#[tokio::test]
async fn script_over_plain_http_omits_pin_clause() {
    let harness = common::build(0, &["foo.com"]).await;

    let mut req = common::request("GET", "/c", Body::empty());
    req.headers_mut().insert(
        axum::http::header::HOST,
        axum::http::HeaderValue::from_static("foo.com"),
    );

    let router = plonk::implant::build_router(harness.app.clone());
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let script = String::from_utf8(body.to_vec()).unwrap();

    assert!(!script.contains("pinnedpubkey"));
    assert!(script.contains("http://foo.com"));
}

//! `GET /f/{rel}` (spec §4.5.4): a real file placed under `files/` must be
//! served back verbatim. Regression coverage for the `/f/` route prefix
//! being passed straight through to `ServeDir`, which resolves paths
//! relative to its root and has no idea the route itself was mounted under
//! `/f/`.

mod common;

use axum::body::Body;
use tower::ServiceExt;

#[tokio::test]
async fn file_under_files_dir_is_served_at_its_relative_path() {
    let harness = common::build(0, &[]).await;
    tokio::fs::write(harness.app.layout.files_dir().join("hello.txt"), b"hi there")
        .await
        .unwrap();

    let router = plonk::implant::build_router(harness.app.clone());
    let resp = router
        .oneshot(common::request("GET", "/f/hello.txt", Body::empty()))
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(body, b"hi there".as_slice());
}

#[tokio::test]
async fn nested_path_under_files_dir_is_served() {
    let harness = common::build(0, &[]).await;
    let nested = harness.app.layout.files_dir().join("assets/app.js");
    tokio::fs::create_dir_all(nested.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&nested, b"console.log(1)").await.unwrap();

    let router = plonk::implant::build_router(harness.app.clone());
    let resp = router
        .oneshot(common::request("GET", "/f/assets/app.js", Body::empty()))
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(body, b"console.log(1)".as_slice());
}

#[tokio::test]
async fn missing_file_is_a_404_not_index_html() {
    let harness = common::build(0, &[]).await;
    let router = plonk::implant::build_router(harness.app.clone());
    let resp = router
        .oneshot(common::request("GET", "/f/nope.txt", Body::empty()))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

//! S1 (FIFO tasking) and Testable Properties 2-4 (at-most-once, empty-ID
//! inertness, seen-table invariants).

mod common;

use axum::body::Body;
use tower::ServiceExt;

#[tokio::test]
async fn s1_tasks_dequeue_in_fifo_order() {
    let harness = common::build(0, &[]).await;
    {
        let mut guard = harness.app.state.lock().await;
        guard.push_task("k", "a".to_string());
        guard.push_task("k", "b".to_string());
        guard.push_task("k", "c".to_string());
        guard.unlock_and_write();
    }

    let router = plonk::implant::build_router(harness.app.clone());
    for expected in ["a\n", "b\n", "c\n", ""] {
        let req = common::request("GET", "/t/k", Body::empty());
        let resp = router.clone().oneshot(req).await.unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body, expected.as_bytes());
    }
}

#[tokio::test]
async fn empty_id_requests_mutate_nothing() {
    let harness = common::build(0, &[]).await;
    {
        let mut guard = harness.app.state.lock().await;
        guard.push_task("k", "should-not-be-touched".to_string());
        guard.unlock_and_write();
    }
    // A real `index.html` makes this test non-vacuous: an empty-ID request
    // must be an unconditional empty 200, never the decoy landing page
    // `default_file` serves for genuinely unmatched paths.
    tokio::fs::write(harness.app.layout.index_html(), b"<html>decoy</html>")
        .await
        .unwrap();
    let router = plonk::implant::build_router(harness.app.clone());

    for uri in ["/t/", "/t", "/o/", "/o"] {
        let req = common::request("GET", uri, Body::empty());
        let resp = router.clone().oneshot(req).await.unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(body.is_empty(), "{uri} should be an empty 200, got {body:?}");
    }

    let mut guard = harness.app.state.lock().await;
    assert_eq!(guard.queue_len("k"), 1);
    guard.unlock();
}

#[tokio::test]
async fn seen_table_dedups_and_orders_most_recent_first() {
    let harness = common::build(0, &[]).await;
    {
        let mut guard = harness.app.state.lock().await;
        guard.saw("a", "127.0.0.1:1".parse().unwrap(), time::OffsetDateTime::now_utc());
        guard.saw("b", "127.0.0.1:2".parse().unwrap(), time::OffsetDateTime::now_utc());
        guard.saw("a", "127.0.0.1:3".parse().unwrap(), time::OffsetDateTime::now_utc());
        guard.unlock_and_write();
    }
    let guard = harness.app.state.lock().await;
    assert_eq!(guard.last_seen[0].id, "a");
    let ids: Vec<&str> = guard.last_seen.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids.iter().filter(|id| **id == "a").count(), 1);
    guard.unlock();
}

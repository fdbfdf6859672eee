//! S2 (streamed output batching): two separate `POST /o/{id}` requests must
//! surface as two distinct `Output` events, and `LastSeen[0].id` must be the
//! implant that posted (Testable Property 2's seen-table half, exercised
//! here via a real streamed POST rather than a direct `saw()` call).

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use plonk::event_stream::EventStream;
use plonk::log_ring::LogRing;
use plonk::operator::OperatorHandle;
use tokio::sync::{Mutex, RwLock};
use tower::ServiceExt;

#[tokio::test]
async fn two_posts_become_two_output_events() {
    let harness = common::build(0, &[]).await;

    let (server_half, client_half) = tokio::net::UnixStream::pair().unwrap();
    let (server_r, server_w) = server_half.into_split();
    let operator_stream = Arc::new(EventStream::new(server_r, server_w));
    harness
        .app
        .bus
        .attach(OperatorHandle {
            cnum: 1,
            name: Arc::new(RwLock::new("tester".to_string())),
            stream: operator_stream,
            log_ring: Arc::new(LogRing::new(16)),
        })
        .await;

    let (client_r, client_w) = client_half.into_split();
    let client_stream = Arc::new(EventStream::new(client_r, client_w));
    let outputs = Arc::new(Mutex::new(Vec::<String>::new()));
    {
        let outputs = outputs.clone();
        client_stream.on("Output", move |data| {
            let outputs = outputs.clone();
            async move {
                if let Some(output) = data.get("output").and_then(|v| v.as_str()) {
                    outputs.lock().await.push(output.to_string());
                }
            }
        });
    }
    let client_run = {
        let client_stream = client_stream.clone();
        tokio::spawn(async move { client_stream.run().await })
    };

    let router = plonk::implant::build_router(harness.app.clone());
    let first = router
        .clone()
        .oneshot(common::request("POST", "/o/k", Body::from("line1\n")));
    tokio::time::timeout(Duration::from_secs(2), first)
        .await
        .unwrap()
        .unwrap();

    let second = router
        .clone()
        .oneshot(common::request("POST", "/o/k", Body::from("line2\n")));
    tokio::time::timeout(Duration::from_secs(2), second)
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    client_stream.close();
    let _ = client_run.await;

    let outputs = outputs.lock().await;
    assert_eq!(outputs.as_slice(), ["line1", "line2"]);

    let guard = harness.app.state.lock().await;
    assert_eq!(guard.last_seen[0].id, "k");
    guard.unlock();
}

//! S5 (operator fan-out): one `Output` event delivered through the implant
//! routes must reach every attached operator exactly once.

mod common;

use std::sync::Arc;

use axum::body::Body;
use plonk::event_stream::EventStream;
use plonk::log_ring::LogRing;
use plonk::operator::OperatorHandle;
use tokio::sync::{Mutex, RwLock};
use tower::ServiceExt;

async fn attach_operator(
    app: &Arc<plonk::implant::AppState>,
    cnum: u64,
) -> (
    Arc<EventStream<tokio::net::unix::OwnedReadHalf, tokio::net::unix::OwnedWriteHalf>>,
    Arc<Mutex<Vec<String>>>,
    tokio::task::JoinHandle<anyhow::Result<()>>,
) {
    let (server_half, client_half) = tokio::net::UnixStream::pair().unwrap();
    let (server_r, server_w) = server_half.into_split();
    let server_stream = Arc::new(EventStream::new(server_r, server_w));
    app.bus
        .attach(OperatorHandle {
            cnum,
            name: Arc::new(RwLock::new(format!("op{cnum}"))),
            stream: server_stream,
            log_ring: Arc::new(LogRing::new(16)),
        })
        .await;

    let (client_r, client_w) = client_half.into_split();
    let client_stream = Arc::new(EventStream::new(client_r, client_w));
    let received = Arc::new(Mutex::new(Vec::<String>::new()));
    {
        let received = received.clone();
        client_stream.on("Output", move |data| {
            let received = received.clone();
            async move {
                if let Some(output) = data.get("output").and_then(|v| v.as_str()) {
                    received.lock().await.push(output.to_string());
                }
            }
        });
    }
    let handle = {
        let client_stream = client_stream.clone();
        tokio::spawn(async move { client_stream.run().await })
    };
    (client_stream, received, handle)
}

#[tokio::test]
async fn single_event_reaches_every_attached_operator() {
    let harness = common::build(0, &[]).await;
    let (stream_a, received_a, run_a) = attach_operator(&harness.app, 1).await;
    let (stream_b, received_b, run_b) = attach_operator(&harness.app, 2).await;

    let router = plonk::implant::build_router(harness.app.clone());
    router
        .oneshot(common::request("POST", "/o/k", Body::from("hi\n")))
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    stream_a.close();
    stream_b.close();
    let _ = run_a.await;
    let _ = run_b.await;

    assert_eq!(received_a.lock().await.as_slice(), ["hi"]);
    assert_eq!(received_b.lock().await.as_slice(), ["hi"]);
}

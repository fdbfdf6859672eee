//! C3: a bidirectional JSON-message stream over a byte pipe.
//!
//! Each event is framed as `{"N":name,"D":payload}` with a 4-byte
//! length-delimited prefix (`tokio_util::codec::LengthDelimitedCodec`), the
//! same building block the teacher reaches for whenever it needs a framed
//! byte stream (`tokio-util` is already in its dependency stack for exactly
//! this). `run()` reads frames sequentially and invokes the matching handler
//! inline, which is what gives per-connection ordering (spec §4.3): the next
//! frame is not read until the current handler returns.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex as StdMutex;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "N")]
    pub name: String,
    #[serde(rename = "D")]
    pub data: serde_json::Value,
}

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type Handler = std::sync::Arc<dyn Fn(serde_json::Value) -> HandlerFuture + Send + Sync>;

/// The empty string is reserved for the handler invoked when no named
/// handler matches (spec §4.3's "empty-name handler").
const DEFAULT_HANDLER_KEY: &str = "";

pub struct EventStream<R, W> {
    reader: AsyncMutex<Option<R>>,
    writer: AsyncMutex<FramedWrite<W, LengthDelimitedCodec>>,
    handlers: StdMutex<HashMap<String, Handler>>,
    /// Held for the duration of every handler invocation; `wait_for_handlers`
    /// simply acquires and releases it, which blocks until whichever
    /// handler (if any) is currently running has returned.
    handler_lock: std::sync::Arc<AsyncMutex<()>>,
    cancel: CancellationToken,
}

impl<R, W> EventStream<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: AsyncMutex::new(Some(reader)),
            writer: AsyncMutex::new(FramedWrite::new(writer, LengthDelimitedCodec::new())),
            handlers: StdMutex::new(HashMap::new()),
            handler_lock: std::sync::Arc::new(AsyncMutex::new(())),
            cancel: CancellationToken::new(),
        }
    }

    /// Register a handler for `name`. Pass `""` to register the handler
    /// invoked for otherwise-unrecognized event names.
    pub fn on<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: Handler = std::sync::Arc::new(move |v| Box::pin(handler(v)));
        self.handlers.lock().unwrap().insert(name.into(), boxed);
    }

    pub fn on_default<F, Fut>(&self, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on(DEFAULT_HANDLER_KEY, handler);
    }

    /// Serialize and send one event. Concurrent callers are serialized by
    /// `writer`'s mutex.
    pub async fn send(&self, name: &str, data: serde_json::Value) -> anyhow::Result<()> {
        let frame = Frame {
            name: name.to_string(),
            data,
        };
        let bytes = serde_json::to_vec(&frame)?;
        let mut writer = self.writer.lock().await;
        writer.send(bytes::Bytes::from(bytes)).await?;
        Ok(())
    }

    /// Run the reader loop until EOF, a read error, or `close()`. Handlers
    /// for a single connection run sequentially, in reception order. Calling
    /// this more than once is a no-op on every call after the first — the
    /// reader half is consumed by whichever call wins the race to take it.
    pub async fn run(&self) -> anyhow::Result<()> {
        let Some(reader) = self.reader.lock().await.take() else {
            return Ok(());
        };
        let mut framed = FramedRead::new(reader, LengthDelimitedCodec::new());

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                item = framed.next() => item,
            };
            let bytes = match next {
                Some(Ok(bytes)) => bytes,
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(()),
            };
            let frame: Frame = match serde_json::from_slice(&bytes) {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::warn!(error = %err, "discarding malformed event frame");
                    continue;
                }
            };

            let handler = {
                let handlers = self.handlers.lock().unwrap();
                handlers
                    .get(&frame.name)
                    .or_else(|| handlers.get(DEFAULT_HANDLER_KEY))
                    .cloned()
            };
            if let Some(handler) = handler {
                let _guard = self.handler_lock.clone().lock_owned().await;
                handler(frame.data).await;
            }
        }
    }

    /// Interrupt the reader loop. Any handler already running is allowed to
    /// complete.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Block until no handler invocation is in flight.
    pub async fn wait_for_handlers(&self) {
        let _ = self.handler_lock.lock().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn handlers_run_in_order_and_send_roundtrips() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_r, client_w) = tokio::io::split(client);
        let (server_r, server_w) = tokio::io::split(server);

        let server_stream = Arc::new(EventStream::new(server_r, server_w));
        let received = Arc::new(StdMutex::new(Vec::<i64>::new()));
        {
            let received = received.clone();
            server_stream.on("n", move |data| {
                let received = received.clone();
                async move {
                    received
                        .lock()
                        .unwrap()
                        .push(data.as_i64().unwrap_or_default());
                }
            });
        }
        let run_handle = {
            let server_stream = server_stream.clone();
            tokio::spawn(async move { server_stream.run().await })
        };

        let client_stream = EventStream::new(client_r, client_w);
        for i in 0..5 {
            client_stream
                .send("n", serde_json::json!(i))
                .await
                .unwrap();
        }

        // Give the reader loop a moment to drain and process everything.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        server_stream.close();
        let _ = run_handle.await;

        assert_eq!(*received.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn unknown_name_dispatches_default_handler() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_r, client_w) = tokio::io::split(client);
        let (server_r, server_w) = tokio::io::split(server);

        let server_stream = Arc::new(EventStream::new(server_r, server_w));
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = hits.clone();
            server_stream.on_default(move |_| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        let run_handle = {
            let server_stream = server_stream.clone();
            tokio::spawn(async move { server_stream.run().await })
        };

        let client_stream = EventStream::new(client_r, client_w);
        client_stream
            .send("totally-unknown", serde_json::json!(null))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        server_stream.close();
        let _ = run_handle.await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}

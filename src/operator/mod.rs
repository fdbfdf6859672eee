//! C6: the operator server.
//!
//! Listens on a local Unix domain socket (`op.sock`), and for each accepted
//! connection: assigns a monotonic `cnum`, builds an `EventStream` over the
//! socket halves, registers the three operator-facing handlers (`name`,
//! `enqueue`, `listseen`), publishes `op-connected`/`op-disconnected` on the
//! bus, and runs the stream until it closes.

mod handlers;

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, Event, EventName};
use crate::event_stream::EventStream;
use crate::log_ring::LogRing;
use crate::state::StateStore;

pub type UnixEventStream = EventStream<OwnedReadHalf, OwnedWriteHalf>;

/// How long a freshly-accepted connection has to send a `name` event before
/// we log a warning and continue with an empty name (spec §4.6, T=10s).
const NAME_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection replay buffer capacity. Not load-bearing for fan-out
/// (see `Bus::publish`'s doc comment) but part of the operator-connection
/// data model (spec §3) and used by the interactive client for its own
/// focused-buffering behavior.
const LOG_RING_CAPACITY: usize = 256;

/// A cheaply-clonable view of one connected operator, handed to the bus for
/// fan-out and retained by `OperatorServer` for bookkeeping.
#[derive(Clone)]
pub struct OperatorHandle {
    pub cnum: u64,
    pub name: Arc<RwLock<String>>,
    pub stream: Arc<UnixEventStream>,
    pub log_ring: Arc<LogRing>,
}

pub struct OperatorServer {
    listener: UnixListener,
    next_cnum: AtomicU64,
    bus: Arc<Bus>,
    state: Arc<StateStore>,
    shutdown: CancellationToken,
}

impl OperatorServer {
    /// Bind `op.sock`, restricting it to owner+group (spec §4.6).
    pub fn bind(
        path: &Path,
        bus: Arc<Bus>,
        state: Arc<StateStore>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Self> {
        let _ = std::fs::remove_file(path);
        let listener =
            UnixListener::bind(path).with_context(|| format!("binding {}", path.display()))?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))
            .with_context(|| format!("setting permissions on {}", path.display()))?;
        Ok(Self {
            listener,
            next_cnum: AtomicU64::new(1),
            bus,
            state,
            shutdown,
        })
    }

    /// Accept connections until `shutdown` fires.
    pub async fn serve(self: Arc<Self>) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (socket, _addr) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(error = %err, "operator accept failed");
                    continue;
                }
            };
            let this = self.clone();
            tokio::spawn(async move {
                this.handle_connection(socket).await;
            });
        }
    }

    async fn handle_connection(&self, socket: UnixStream) {
        let cnum = self.next_cnum.fetch_add(1, Ordering::SeqCst);
        let (read_half, write_half) = socket.into_split();
        let stream = Arc::new(EventStream::new(read_half, write_half));
        let name = Arc::new(RwLock::new(String::new()));
        let log_ring = Arc::new(LogRing::new(LOG_RING_CAPACITY));

        let handle = OperatorHandle {
            cnum,
            name: name.clone(),
            stream: stream.clone(),
            log_ring,
        };

        handlers::register(&stream, &name, &self.state, &self.bus, cnum);

        self.bus.attach(handle.clone()).await;
        self.bus
            .publish(Event::new(
                EventName::OperatorConnected,
                serde_json::json!({ "opname": "", "cnum": cnum }),
            ))
            .await;

        let stream_for_timeout = stream.clone();
        let name_for_timeout = name.clone();
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(NAME_TIMEOUT).await;
            if name_for_timeout.read().await.is_empty() {
                tracing::warn!(cnum, "operator connected without sending a name");
            }
            drop(stream_for_timeout);
        });

        // Only one branch may ever call `stream.run()`: a second call would
        // try to take the reader half a second time. `close()` alone is
        // enough to make an in-flight `run()` (branch below) observe
        // cancellation and return.
        let run_result = tokio::select! {
            _ = self.shutdown.cancelled() => {
                stream.close();
                Ok(())
            }
            result = stream.run() => result,
        };
        if let Err(err) = run_result {
            tracing::debug!(cnum, error = %err, "operator stream ended");
        }
        watchdog.abort();

        self.bus.detach(cnum).await;
        let opname = name.read().await.clone();
        self.bus
            .publish(Event::new(
                EventName::OperatorDisconnected,
                serde_json::json!({ "opname": opname, "cnum": cnum }),
            ))
            .await;
    }
}

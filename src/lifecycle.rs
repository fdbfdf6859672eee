//! C8: server lifecycle (spec §4.8). Owns the single shutdown signal and the
//! single error-waiter shared by every caller of `wait()`.

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::bus::Bus;
use crate::state::StateStore;

/// How long the HTTP listeners are given to drain in-flight requests during
/// shutdown before being dropped outright (spec §4.8).
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct Lifecycle {
    bus: std::sync::Arc<Bus>,
    state: std::sync::Arc<StateStore>,
    shutdown: CancellationToken,
    final_error: StdMutex<Option<String>>,
    stopped_tx: watch::Sender<bool>,
    stopped_rx: watch::Receiver<bool>,
}

impl Lifecycle {
    pub fn new(bus: std::sync::Arc<Bus>, state: std::sync::Arc<StateStore>) -> std::sync::Arc<Self> {
        let (stopped_tx, stopped_rx) = watch::channel(false);
        std::sync::Arc::new(Self {
            bus,
            state,
            shutdown: CancellationToken::new(),
            final_error: StdMutex::new(None),
            stopped_tx,
            stopped_rx,
        })
    }

    /// The token every long-running task (HTTP handlers, operator
    /// connections, background loops) selects against to notice shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// `Stop(err)` (spec §4.8): valediction to every operator, stop taking
    /// new ones, signal shutdown to everything selecting on the token, flush
    /// state one last time, then release anyone blocked in `wait()`.
    pub async fn stop(&self, err: Option<anyhow::Error>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let message = err.as_ref().map(|e| e.to_string()).unwrap_or_default();
        *self.final_error.lock().unwrap() = Some(message.clone());

        for op in self.bus.operators().await {
            let _ = op
                .stream
                .send("goodbye", serde_json::json!({ "message": message }))
                .await;
            op.stream.wait_for_handlers().await;
            op.stream.close();
        }

        self.shutdown.cancel();

        if let Err(flush_err) = self.state.flush_now().await {
            tracing::error!(error = %flush_err, "final state flush failed");
        }

        let _ = self.stopped_tx.send(true);
    }

    /// Blocks until `stop()` has run; returns the error it was stopped with,
    /// if any (spec Testable Property 9: "`Wait` returns an error that wraps
    /// `err`").
    pub async fn wait(&self) -> anyhow::Result<()> {
        let mut rx = self.stopped_rx.clone();
        let _ = rx.wait_for(|stopped| *stopped).await;
        match self.final_error.lock().unwrap().clone() {
            Some(message) if !message.is_empty() => Err(anyhow::anyhow!(message)),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;

    #[tokio::test]
    async fn stop_without_error_yields_ok_wait() {
        let dir = tempfile::tempdir().unwrap();
        let state = std::sync::Arc::new(
            StateStore::open(dir.path().join("state.json")).await.unwrap(),
        );
        let bus = Bus::new();
        let lifecycle = Lifecycle::new(bus, state);

        let waiter = lifecycle.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        lifecycle.stop(None).await;
        assert!(handle.await.unwrap().is_ok());
        assert!(lifecycle.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn stop_with_error_is_reflected_in_wait() {
        let dir = tempfile::tempdir().unwrap();
        let state = std::sync::Arc::new(
            StateStore::open(dir.path().join("state.json")).await.unwrap(),
        );
        let bus = Bus::new();
        let lifecycle = Lifecycle::new(bus, state);
        lifecycle.stop(Some(anyhow::anyhow!("listener died"))).await;
        let err = lifecycle.wait().await.unwrap_err();
        assert!(err.to_string().contains("listener died"));
    }
}

//! The interactive operator client (spec §C supplement): a thin line reader
//! over stdin speaking the same event-stream protocol the operator server
//! does. Deliberately minimal — no prompt library, no color, no history —
//! but a real enough driver of `task`/`seen`/`quit` to exercise the server
//! end-to-end.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use crate::cli::Cli;
use crate::event_stream::EventStream;
use crate::paths::Layout;

type ClientStream = EventStream<OwnedReadHalf, OwnedWriteHalf>;

/// Bus-published event names (`bus::EventName::as_str()`) rendered as plain
/// `[name] data` lines. `listseen` and `goodbye` get their own formatting
/// below since the operator server sends them directly rather than through
/// the bus's fan-out.
const RENDERED_EVENTS: &[&str] = &[
    "Implant generation",
    "New implant",
    "Task request",
    "Task queued",
    "Output",
    "Exfil",
    "Static file requested",
    "Operator connected",
    "Operator disconnected",
];

/// Connect to `op.sock`, announce `cli.name`, and loop reading commands from
/// stdin until `quit` or the server's `goodbye`.
pub async fn run(cli: &Cli) -> anyhow::Result<()> {
    let layout = Layout::new(cli.dir.clone());
    let socket_path = layout.op_sock();
    let socket = UnixStream::connect(&socket_path)
        .await
        .with_context(|| format!("connecting to {}", socket_path.display()))?;
    let (read_half, write_half) = socket.into_split();
    let stream: Arc<ClientStream> = Arc::new(EventStream::new(read_half, write_half));

    let closed = CancellationToken::new();

    for name in RENDERED_EVENTS {
        let name = name.to_string();
        stream.on(name.clone(), move |data| {
            let name = name.clone();
            async move { println!("[{name}] {data}") }
        });
    }
    stream.on("listseen", |data| async move { render_listseen(&data) });
    {
        let closed = closed.clone();
        stream.on("goodbye", move |data| {
            let closed = closed.clone();
            async move {
                let message = data.get("message").and_then(|v| v.as_str()).unwrap_or_default();
                println!("server is shutting down: {message}");
                closed.cancel();
            }
        });
    }

    let run_handle = {
        let stream = stream.clone();
        tokio::spawn(async move { stream.run().await })
    };

    stream
        .send("name", serde_json::json!({ "name": cli.name }))
        .await
        .context("announcing operator name")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = closed.cancelled() => break,
            line = lines.next_line() => line,
        };
        let Ok(Some(line)) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(3, ' ');
        match parts.next().unwrap_or_default() {
            "task" => {
                let (Some(id), Some(task)) = (parts.next(), parts.next()) else {
                    println!("usage: task <id> <command>");
                    continue;
                };
                let _ = stream
                    .send("enqueue", serde_json::json!({ "id": id, "task": task }))
                    .await;
            }
            "seen" => {
                let _ = stream.send("listseen", serde_json::Value::Null).await;
            }
            "quit" | "exit" => break,
            other => {
                println!("unknown command {other:?} (expected: task <id> <cmd>, seen, quit)");
            }
        }
    }

    stream.close();
    let _ = run_handle.await;
    Ok(())
}

fn render_listseen(data: &serde_json::Value) {
    println!("seen:");
    let Some(entries) = data.as_array() else {
        return;
    };
    for entry in entries {
        let id = entry.get("id").and_then(|v| v.as_str()).unwrap_or_default();
        if id.is_empty() {
            continue;
        }
        println!(
            "  {id}  from={}  when={}",
            entry.get("from").and_then(|v| v.as_str()).unwrap_or_default(),
            entry.get("when").and_then(|v| v.as_str()).unwrap_or_default(),
        );
    }
}

//! The three operator-facing event handlers registered on every accepted
//! connection (spec §4.6 step 3).

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::RwLock;

use crate::bus::{Bus, Event, EventName};
use crate::state::SEEN_CAPACITY;
use crate::state::StateStore;

use super::UnixEventStream;

#[derive(Debug, Deserialize)]
struct NamePayload {
    name: String,
}

#[derive(Debug, Deserialize)]
struct EnqueuePayload {
    id: String,
    task: String,
}

pub fn register(
    stream: &Arc<UnixEventStream>,
    name: &Arc<RwLock<String>>,
    state: &Arc<StateStore>,
    bus: &Arc<Bus>,
    cnum: u64,
) {
    {
        let name = name.clone();
        stream.on("name", move |data| {
            let name = name.clone();
            async move {
                match serde_json::from_value::<NamePayload>(data) {
                    Ok(payload) => *name.write().await = payload.name,
                    Err(err) => tracing::warn!(error = %err, "malformed name event"),
                }
            }
        });
    }

    {
        let state = state.clone();
        let bus = bus.clone();
        let name = name.clone();
        stream.on("enqueue", move |data| {
            let state = state.clone();
            let bus = bus.clone();
            let name = name.clone();
            async move {
                let payload = match serde_json::from_value::<EnqueuePayload>(data) {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(error = %err, "malformed enqueue event");
                        return;
                    }
                };
                if payload.id.is_empty() {
                    tracing::warn!(cnum, "enqueue with empty implant id ignored");
                    return;
                }
                let qlen = {
                    let mut guard = state.lock().await;
                    let qlen = guard.push_task(&payload.id, payload.task.clone());
                    guard.unlock_and_write();
                    qlen
                };
                let opname = name.read().await.clone();
                bus.publish(Event::new(
                    EventName::TaskQueued,
                    serde_json::json!({
                        "id": payload.id,
                        "task": payload.task,
                        "opname": opname,
                        "qlen": qlen,
                    }),
                ))
                .await;
            }
        });
    }

    {
        let state = state.clone();
        let stream_for_closure = stream.clone();
        stream.on("listseen", move |_data| {
            let state = state.clone();
            let stream = stream_for_closure.clone();
            async move {
                let mut entries: Vec<serde_json::Value> = {
                    let guard = state.lock().await;
                    guard
                        .last_seen
                        .iter()
                        .map(|e| {
                            serde_json::json!({
                                "id": e.id,
                                "from": e.from,
                                "when": e.when,
                            })
                        })
                        .collect()
                };
                // Pad to the fixed wire length (spec §4.7's catalogue: "length N").
                while entries.len() < SEEN_CAPACITY {
                    entries.push(serde_json::json!({ "id": "", "from": "", "when": null }));
                }
                if let Err(err) = stream.send("listseen", serde_json::json!(entries)).await {
                    tracing::debug!(cnum, error = %err, "failed to reply to listseen");
                }
            }
        });
    }
}

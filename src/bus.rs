//! C7: the event bus and log fan-out.
//!
//! `Bus::publish` is the single call site C5 and C6 use for every
//! interesting implant/operator event (spec §4.7). It always does two
//! things: emit one structured `tracing` event (picked up by the JSON log
//! layer installed in `logging.rs`, satisfying Testable Property 8 — one log
//! line per event, same fields) and fan the event out to every currently
//! connected operator.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::operator::OperatorHandle;

/// Request attributes carried by every event that arose from an HTTP
/// request (spec §4.7, final paragraph).
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestAttrs {
    pub host: Option<String>,
    pub method: Option<String>,
    pub remote_address: Option<String>,
    pub url: Option<String>,
    pub sni: Option<String>,
}

/// The closed set of event names (spec §4.7's catalogue).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventName {
    ImplantGeneration,
    NewImplant,
    TaskRequest,
    TaskQueued,
    Output,
    Exfil,
    StaticFileRequested,
    OperatorConnected,
    OperatorDisconnected,
    ListSeen,
    Goodbye,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::ImplantGeneration => "Implant generation",
            EventName::NewImplant => "New implant",
            EventName::TaskRequest => "Task request",
            EventName::TaskQueued => "Task queued",
            EventName::Output => "Output",
            EventName::Exfil => "Exfil",
            EventName::StaticFileRequested => "Static file requested",
            EventName::OperatorConnected => "Operator connected",
            EventName::OperatorDisconnected => "Operator disconnected",
            EventName::ListSeen => "listseen",
            EventName::Goodbye => "goodbye",
        }
    }
}

/// An event ready to publish: its wire name, its payload, and optionally the
/// request that caused it.
pub struct Event {
    pub name: EventName,
    pub payload: serde_json::Value,
    pub request: Option<RequestAttrs>,
    pub level: tracing::Level,
}

impl Event {
    pub fn new(name: EventName, payload: impl Serialize) -> Self {
        Self {
            name,
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
            request: None,
            level: tracing::Level::INFO,
        }
    }

    pub fn with_request(mut self, request: RequestAttrs) -> Self {
        self.request = Some(request);
        self
    }

    /// Override the log level (spec §4.5.1: task dispatch is INFO, an empty
    /// queue is DEBUG, though both are the same `Task request` event).
    pub fn with_level(mut self, level: tracing::Level) -> Self {
        self.level = level;
        self
    }
}

/// Tracks every currently-attached operator connection so `publish` can fan
/// out to each of them without C5 ever touching C6's internals directly.
#[derive(Default)]
pub struct Bus {
    operators: RwLock<Vec<OperatorHandle>>,
}

impl Bus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn attach(&self, handle: OperatorHandle) {
        self.operators.write().await.push(handle);
    }

    pub async fn detach(&self, cnum: u64) {
        self.operators.write().await.retain(|o| o.cnum != cnum);
    }

    pub async fn operators(&self) -> Vec<OperatorHandle> {
        self.operators.read().await.clone()
    }

    /// Publish `event`: one structured log line, then fan-out to every
    /// attached operator. Fan-out failures close that operator's connection
    /// (spec §4.6, backpressure) but never propagate to the caller — C5's
    /// critical path must never block on a slow operator.
    pub async fn publish(&self, event: Event) {
        log_event(&event);

        let operators = self.operators.read().await.clone();
        for op in operators {
            let name = event.name.as_str().to_string();
            let payload = event.payload.clone();
            tokio::spawn(async move {
                if op.stream.send(&name, payload).await.is_err() {
                    op.stream.close();
                }
            });
        }
    }
}

/// `tracing`'s level must be a compile-time literal, so the one dynamic
/// input (`event.level`) has to be dispatched by hand across the five
/// macros rather than passed as a value.
macro_rules! log_at {
    ($macro:path, $event:expr) => {{
        let payload = &$event.payload;
        match $event.request.as_ref() {
            Some(req) => {
                $macro!(
                    event = $event.name.as_str(),
                    data = %payload,
                    host = req.host.as_deref(),
                    method = req.method.as_deref(),
                    remote_address = req.remote_address.as_deref(),
                    url = req.url.as_deref(),
                    sni = req.sni.as_deref(),
                    "event"
                );
            }
            None => {
                $macro!(event = $event.name.as_str(), data = %payload, "event");
            }
        }
    }};
}

fn log_event(event: &Event) {
    match event.level {
        tracing::Level::ERROR => log_at!(tracing::error, event),
        tracing::Level::WARN => log_at!(tracing::warn, event),
        tracing::Level::INFO => log_at!(tracing::info, event),
        tracing::Level::DEBUG => log_at!(tracing::debug, event),
        tracing::Level::TRACE => log_at!(tracing::trace, event),
    }
}

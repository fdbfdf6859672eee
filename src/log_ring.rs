//! C2: a fixed-capacity ring buffer of formatted log strings, one per
//! operator. Used by C6 to buffer events an operator has missed while
//! "focused" on a specific implant and its own terminal is busy rendering
//! something else.

use std::collections::VecDeque;
use std::sync::Mutex;

use time::OffsetDateTime;

pub struct LogRing {
    cap: usize,
    messages: Mutex<VecDeque<String>>,
}

impl LogRing {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            messages: Mutex::new(VecDeque::with_capacity(cap)),
        }
    }

    /// Append one formatted, timestamp-prefixed message, dropping the oldest
    /// entry if the ring is already at capacity.
    pub fn push(&self, message: impl AsRef<str>) {
        if self.cap == 0 {
            return;
        }
        let line = format!(
            "[{}] {}",
            OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_default(),
            message.as_ref()
        );
        let mut messages = self.messages.lock().unwrap();
        if messages.len() == self.cap {
            messages.pop_front();
        }
        messages.push_back(line);
    }

    /// Drain and return every buffered message, in insertion order.
    pub fn messages_and_clear(&self) -> Vec<String> {
        let mut messages = self.messages.lock().unwrap();
        messages.drain(..).collect()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Append-only, size-bounded chat history.
//!
//! The log is the single source of truth for what was said.  Messages are
//! never edited or removed individually; once the retention bound is reached
//! the oldest entries are trimmed in FIFO order.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::logging::format_iso8601;

/// Author id used for synthesized departure notices.
pub const SYSTEM_AUTHOR_ID: &str = "system";

/// A single chat message.  Wire field names match the browser widget.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: u64,
    pub text: String,
    #[serde(rename = "user")]
    pub author_name: String,
    #[serde(rename = "userId")]
    pub author_id: String,
    #[serde(rename = "timestamp")]
    pub timestamp_iso: String,
}

pub struct MessageLog {
    entries: VecDeque<ChatMessage>,
    retain: usize,
    last_id: u64,
}

impl MessageLog {
    pub fn new(retain: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            retain,
            last_id: 0,
        }
    }

    /// Append a message, assigning its id from wall-clock milliseconds.
    ///
    /// Ids are strictly monotonic: when the clock has not advanced past the
    /// previous id (same-millisecond appends, or a clock step backwards) the
    /// new id is the previous id plus one.
    pub fn append(
        &mut self,
        now_ms: u64,
        text: String,
        author_name: String,
        author_id: String,
    ) -> ChatMessage {
        let id = now_ms.max(self.last_id + 1);
        self.last_id = id;

        let msg = ChatMessage {
            id,
            text,
            author_name,
            author_id,
            timestamp_iso: format_iso8601(now_ms),
        };
        self.entries.push_back(msg.clone());
        while self.entries.len() > self.retain {
            self.entries.pop_front();
        }
        msg
    }

    /// All retained messages with `id > cutoff`, in ascending id order.
    pub fn since(&self, cutoff: u64) -> Vec<ChatMessage> {
        self.entries
            .iter()
            .filter(|m| m.id > cutoff)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Id of the most recently appended message, 0 when nothing was appended.
    pub fn last_id(&self) -> u64 {
        self.last_id
    }
}

//! Parked long-poll requests awaiting new messages.
//!
//! Each waiter owns the sending half of a oneshot channel; its poll future
//! holds the receiving half.  A waiter leaves the queue in the same critical
//! section that consumes its sender, so a poll can be answered at most once
//! no matter which of fan-out, deadline, or client cancellation wins the
//! race.  There are no timer handles to release: the deadline lives inside
//! the poll future and dies with it.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::message_log::ChatMessage;

/// Queue-assigned handle identifying a parked poll.
pub type WaiterToken = u64;

struct Waiter {
    cutoff_id: u64,
    tx: oneshot::Sender<Vec<ChatMessage>>,
}

#[derive(Default)]
pub struct WaiterQueue {
    waiters: HashMap<WaiterToken, Waiter>,
    next_token: WaiterToken,
}

impl WaiterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a poll that found no backlog.  The caller awaits the returned
    /// receiver; delivery happens through [`complete_matching`].
    ///
    /// [`complete_matching`]: WaiterQueue::complete_matching
    pub fn park(&mut self, cutoff_id: u64) -> (WaiterToken, oneshot::Receiver<Vec<ChatMessage>>) {
        let token = self.next_token;
        self.next_token += 1;
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(token, Waiter { cutoff_id, tx });
        (token, rx)
    }

    /// Fan a freshly appended message out to every waiter whose cutoff is
    /// behind it.  Matching waiters are removed and completed with a
    /// single-element delivery.  Returns how many were woken.
    pub fn complete_matching(&mut self, msg: &ChatMessage) -> usize {
        let tokens: Vec<WaiterToken> = self
            .waiters
            .iter()
            .filter(|(_, w)| w.cutoff_id < msg.id)
            .map(|(token, _)| *token)
            .collect();
        for token in &tokens {
            if let Some(waiter) = self.waiters.remove(token) {
                // The receiver may already be gone (client vanished between
                // parking and fan-out); a failed send is fine.
                let _ = waiter.tx.send(vec![msg.clone()]);
            }
        }
        tokens.len()
    }

    /// Remove a waiter without answering it.  Used by both the deadline path
    /// and disconnect cleanup; a no-op when fan-out already consumed the
    /// token.
    pub fn cancel(&mut self, token: WaiterToken) -> bool {
        self.waiters.remove(&token).is_some()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

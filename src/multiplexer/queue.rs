//! Blocking queue handing received envelopes to caller threads.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::protocol::Envelope;

#[derive(Default)]
pub struct InboundQueue {
    items: Mutex<VecDeque<Envelope>>,
    ready: Condvar,
}

impl InboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<Envelope>> {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, envelope: Envelope) {
        self.items().push_back(envelope);
        self.ready.notify_one();
    }

    /// Take the oldest envelope. Without `block` this never waits; with it,
    /// waits up to `timeout` (forever when `None`).
    pub fn pop(&self, block: bool, timeout: Option<Duration>) -> Option<Envelope> {
        let mut items = self.items();
        if !block {
            return items.pop_front();
        }

        match timeout {
            Some(timeout) => {
                let (mut items, _) = self
                    .ready
                    .wait_timeout_while(items, timeout, |items| items.is_empty())
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                items.pop_front()
            }
            None => {
                while items.is_empty() {
                    items = self
                        .ready
                        .wait(items)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                items.pop_front()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }
}

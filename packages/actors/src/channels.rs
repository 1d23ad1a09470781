//! Per-queue admission channels.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_channel::{Receiver, Sender};

/// An anonymous "one more job may be claimed" signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionToken;

/// Unbounded MPMC channel of admission tokens for a single queue.
#[derive(Debug, Clone)]
pub struct AdmissionChannel {
    sender: Sender<AdmissionToken>,
    receiver: Receiver<AdmissionToken>,
}

impl AdmissionChannel {
    fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded();
        Self { sender, receiver }
    }

    /// Push `count` tokens. Returns how many were accepted (zero once closed).
    pub fn publish(&self, count: usize) -> usize {
        let mut published = 0;
        for _ in 0..count {
            if self.sender.try_send(AdmissionToken).is_err() {
                break;
            }
            published += 1;
        }
        published
    }

    /// Wait for the next token. `None` once the channel is closed and drained.
    pub async fn recv(&self) -> Option<AdmissionToken> {
        self.receiver.recv().await.ok()
    }

    /// Tokens published but not yet taken by a worker.
    pub fn queued(&self) -> usize {
        self.receiver.len()
    }

    pub fn close(&self) -> bool {
        self.sender.close()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Lazily created admission channels, one per queue name.
#[derive(Debug, Default)]
pub struct AdmissionChannels {
    channels: RwLock<HashMap<String, AdmissionChannel>>,
}

impl AdmissionChannels {
    pub fn new() -> Self {
        Self::default()
    }

    /// The channel for `queue`, created on first use.
    pub fn get_or_create(&self, queue: &str) -> AdmissionChannel {
        if let Some(channel) = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
        {
            return channel.clone();
        }

        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(queue.to_string())
            .or_insert_with(AdmissionChannel::new)
            .clone()
    }

    /// Close every channel, waking any worker blocked on `recv`.
    pub fn close_all(&self) {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        for channel in channels.values() {
            channel.close();
        }
    }
}

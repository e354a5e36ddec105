//! Playlist Queue
//!
//! FIFO of pending media plus the single item currently playing. The queue
//! never advances on its own: `add` only appends and the owner calls `next`
//! when the player is ready for another item. Every change of the current
//! item is pushed to the subscriber. Each queued item gets a fresh `seq`, so
//! repeated clips stay distinguishable.

use crate::media::MediaRef;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::debug;

/// Receives the new current item on every pointer change; `None` after a reset.
pub type PlaylistReceiver = mpsc::UnboundedReceiver<Option<MediaRef>>;

#[derive(Debug, Default)]
pub struct PlaylistQueue {
    pending: VecDeque<MediaRef>,
    current: Option<MediaRef>,
    subscriber: Option<mpsc::UnboundedSender<Option<MediaRef>>>,
    last_seq: u64,
}

impl PlaylistQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the single subscriber, replacing any previous one.
    pub fn subscribe(&mut self) -> PlaylistReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriber = Some(tx);
        rx
    }

    /// Appends to the pending list. Does not start playback.
    pub fn add(&mut self, items: impl IntoIterator<Item = MediaRef>) {
        for mut item in items {
            self.last_seq += 1;
            item.seq = self.last_seq;
            self.pending.push_back(item);
        }
    }

    /// Promotes the head of the pending list. No-op when nothing is pending.
    pub fn next(&mut self) -> Option<&MediaRef> {
        let item = self.pending.pop_front()?;
        debug!(uri = %item.uri, remaining = self.pending.len(), "Playlist advanced");
        self.current = Some(item);
        self.notify();
        self.current.as_ref()
    }

    /// Drops pending items without touching the current one.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Clears everything. The subscriber sees `None` if something was playing.
    pub fn reset(&mut self) {
        self.pending.clear();
        if self.current.take().is_some() {
            self.notify();
        }
    }

    /// Number of pending items.
    pub fn size(&self) -> usize {
        self.pending.len()
    }

    pub fn current(&self) -> Option<&MediaRef> {
        self.current.as_ref()
    }

    fn notify(&mut self) {
        if let Some(tx) = &self.subscriber {
            if tx.send(self.current.clone()).is_err() {
                self.subscriber = None;
            }
        }
    }
}

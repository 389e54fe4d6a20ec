// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! Channel registry
//!
//! Maps a channel to the viewers currently subscribed to it. Each viewer owns
//! a bounded chunk queue; the registry keeps the sending half and the
//! connection task reads the other end and writes whatever arrives to its
//! socket.
//!
//! A full queue evicts its oldest chunk, so a viewer that falls behind skips
//! ahead to live video instead of replaying a backlog. Broadcasting iterates
//! under the read lock and never waits on a viewer.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::metrics::set_subscribers;

/// Identifies one viewer connection for its whole lifetime
pub type ConnectionId = u64;

/// A registered viewer: the id to unsubscribe with and its chunk queue
#[derive(Debug)]
pub struct Subscription {
    pub id: ConnectionId,
    queue: broadcast::Receiver<Bytes>,
}

impl Subscription {
    /// Next chunk in order, skipping over evicted ones
    ///
    /// Returns `None` once the registry dropped this viewer and the queue is drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.queue.recv().await {
                Ok(chunk) => return Some(chunk),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(connection = self.id, skipped, "Viewer fell behind, skipping to newer chunks");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Like `recv`, but `None` also when nothing is queued right now
    pub fn try_recv(&mut self) -> Option<Bytes> {
        loop {
            match self.queue.try_recv() {
                Ok(chunk) => return Some(chunk),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Outcome of one broadcast
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Subscribers the chunk was queued for
    pub delivered: usize,
    /// Subscribers whose queue was full; their oldest queued chunk was evicted
    pub dropped: usize,
    /// Subscribers found closed and removed
    pub removed: usize,
}

pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, HashMap<ConnectionId, broadcast::Sender<Bytes>>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl ChannelRegistry {
    /// `buffer` is the per-viewer queue length in chunks, rounded up to a power of two
    pub fn new(buffer: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: buffer.max(1).next_power_of_two(),
        }
    }

    /// Register a new viewer on `channel`
    pub async fn subscribe(&self, channel: &str) -> Subscription {
        let (tx, rx) = broadcast::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut channels = self.channels.write().await;
        let subscribers = channels.entry(channel.to_string()).or_default();
        subscribers.insert(id, tx);
        let count = subscribers.len();
        drop(channels);

        set_subscribers(channel, count);
        info!(channel = %channel, connection = id, subscribers = count, "Viewer subscribed");

        Subscription { id, queue: rx }
    }

    /// Remove a viewer; returns false if it was not registered
    pub async fn unsubscribe(&self, channel: &str, id: ConnectionId) -> bool {
        let mut channels = self.channels.write().await;

        let Some(subscribers) = channels.get_mut(channel) else {
            return false;
        };
        let removed = subscribers.remove(&id).is_some();
        let count = subscribers.len();
        if count == 0 {
            channels.remove(channel);
        }
        drop(channels);

        if removed {
            set_subscribers(channel, count);
            info!(channel = %channel, connection = id, subscribers = count, "Viewer unsubscribed");
        }
        removed
    }

    /// Queue `chunk` for every viewer on `channel` without waiting on any of them
    pub async fn broadcast(&self, channel: &str, chunk: Bytes) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut closed = Vec::new();

        {
            let channels = self.channels.read().await;
            let Some(subscribers) = channels.get(channel) else {
                return report;
            };

            for (id, tx) in subscribers {
                let full = tx.len() >= self.capacity;
                match tx.send(chunk.clone()) {
                    Ok(_) => {
                        report.delivered += 1;
                        if full {
                            report.dropped += 1;
                            debug!(channel = %channel, connection = id, "Viewer queue full, oldest chunk dropped");
                        }
                    }
                    Err(_) => closed.push(*id),
                }
            }
        }

        if !closed.is_empty() {
            let mut channels = self.channels.write().await;
            if let Some(subscribers) = channels.get_mut(channel) {
                for id in &closed {
                    if subscribers.remove(id).is_some() {
                        report.removed += 1;
                        warn!(channel = %channel, connection = id, "Viewer gone mid-broadcast, removed");
                    }
                }
                let count = subscribers.len();
                if count == 0 {
                    channels.remove(channel);
                }
                set_subscribers(channel, count);
            }
        }

        report
    }

    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .await
            .get(channel)
            .map_or(0, HashMap::len)
    }

    /// Channels with at least one viewer, with their viewer counts
    pub async fn channels(&self) -> Vec<(String, usize)> {
        let channels = self.channels.read().await;
        let mut out: Vec<_> = channels
            .iter()
            .map(|(name, subs)| (name.clone(), subs.len()))
            .collect();
        out.sort();
        out
    }

    /// Drop every viewer. Their connection tasks see the queue close and hang up.
    pub async fn close_all(&self) -> usize {
        let mut channels = self.channels.write().await;
        let mut total = 0;
        for (channel, subscribers) in channels.drain() {
            total += subscribers.len();
            set_subscribers(&channel, 0);
        }
        info!(viewers = total, "Closed all viewer subscriptions");
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_broadcast_reaches_only_its_channel() {
        let registry = ChannelRegistry::new(8);
        let mut c = registry.subscribe("channel3").await;
        let mut other = registry.subscribe("channel4").await;

        let report = registry.broadcast("channel3", Bytes::from_static(b"frame")).await;
        assert_eq!(report.delivered, 1);

        assert_eq!(c.recv().await.unwrap(), Bytes::from_static(b"frame"));
        assert!(c.try_recv().is_none());
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unsubscribed_viewer_gets_nothing() {
        let registry = ChannelRegistry::new(8);
        let mut c = registry.subscribe("channel3").await;

        assert!(registry.unsubscribe("channel3", c.id).await);
        assert!(!registry.unsubscribe("channel3", c.id).await);

        let report = registry.broadcast("channel3", Bytes::from_static(b"x")).await;
        assert_eq!(report, BroadcastReport::default());
        assert_eq!(registry.subscriber_count("channel3").await, 0);
        assert!(registry.channels().await.is_empty());
        // The sender was dropped with the registry entry
        assert!(c.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_to_unknown_channel_is_noop() {
        let registry = ChannelRegistry::new(8);
        let report = registry.broadcast("nobody", Bytes::from_static(b"x")).await;
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn test_closed_viewer_removed_others_still_served() {
        let registry = ChannelRegistry::new(8);
        let gone = registry.subscribe("ch").await;
        let mut alive = registry.subscribe("ch").await;
        drop(gone);

        let report = registry.broadcast("ch", Bytes::from_static(b"a")).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(registry.subscriber_count("ch").await, 1);
        assert_eq!(alive.recv().await.unwrap(), Bytes::from_static(b"a"));
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest_for_slow_viewer_only() {
        let registry = ChannelRegistry::new(2);
        let mut slow = registry.subscribe("ch").await;
        let mut fast = registry.subscribe("ch").await;

        let mut dropped = 0;
        for i in 0..3u8 {
            let report = registry.broadcast("ch", Bytes::from(vec![i])).await;
            assert_eq!(report.delivered, 2);
            dropped += report.dropped;
            assert_eq!(fast.recv().await.unwrap(), Bytes::from(vec![i]));
        }
        assert_eq!(dropped, 1);

        // Slow viewer lost the oldest chunk and kept the newest two in order
        assert_eq!(slow.recv().await.unwrap(), Bytes::from(vec![1]));
        assert_eq!(slow.recv().await.unwrap(), Bytes::from(vec![2]));
        assert!(slow.try_recv().is_none());
        assert_eq!(registry.subscriber_count("ch").await, 2);
    }

    #[tokio::test]
    async fn test_close_all_hangs_up_everyone() {
        let registry = ChannelRegistry::new(8);
        let mut a = registry.subscribe("a").await;
        let mut b = registry.subscribe("b").await;

        assert_eq!(registry.close_all().await, 2);
        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
        assert!(registry.channels().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_churn_leaves_registry_consistent() {
        let registry = Arc::new(ChannelRegistry::new(4));

        let broadcaster = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for i in 0..500u32 {
                    registry
                        .broadcast("ch", Bytes::from(i.to_be_bytes().to_vec()))
                        .await;
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut clients = Vec::new();
        for n in 0..32 {
            let registry = Arc::clone(&registry);
            clients.push(tokio::spawn(async move {
                for _ in 0..20 {
                    let mut sub = registry.subscribe("ch").await;
                    let _ = sub.try_recv();
                    let id = sub.id;
                    if n % 2 == 0 {
                        // Abrupt disconnect; broadcast must clean it up or unsubscribe must
                        drop(sub);
                    }
                    registry.unsubscribe("ch", id).await;
                }
            }));
        }

        for client in clients {
            client.await.unwrap();
        }
        broadcaster.await.unwrap();

        assert_eq!(registry.subscriber_count("ch").await, 0);
        assert!(registry.channels().await.is_empty());

        let keeper = registry.subscribe("ch").await;
        assert_eq!(registry.subscriber_count("ch").await, 1);
        assert!(registry.unsubscribe("ch", keeper.id).await);
    }
}

// src/adapters/queue.rs
//! Small bounded hand-off between an adapter's reader and its bus publisher.
//! Overflow drops the oldest entry; the drop is counted by the caller.

use std::collections::VecDeque;
use std::sync::Arc;

use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::AdapterStats;
use crate::bus::EventBus;
use crate::item::Item;

#[derive(Debug)]
pub struct DropOldestQueue {
    inner: Mutex<VecDeque<Item>>,
    cap: usize,
    notify: Notify,
}

impl DropOldestQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            cap: cap.max(1),
            notify: Notify::new(),
        }
    }

    /// Enqueue; returns the evicted item when the queue was full.
    pub fn push(&self, item: Item) -> Option<Item> {
        let dropped = {
            let mut q = self.inner.lock();
            let dropped = if q.len() >= self.cap {
                q.pop_front()
            } else {
                None
            };
            q.push_back(item);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    pub fn try_pop(&self) -> Option<Item> {
        self.inner.lock().pop_front()
    }

    /// Wait for the next item. `None` once cancelled.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<Item> {
        loop {
            if let Some(it) = self.try_pop() {
                return Some(it);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Drain `queue` into the bus until cancelled.
pub fn spawn_publisher(
    queue: Arc<DropOldestQueue>,
    bus: Arc<EventBus>,
    channel: String,
    stats: Arc<AdapterStats>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = queue.pop(&cancel).await {
            let label = item.source.clone();
            match bus.try_publish(&channel, item, &label) {
                Ok(()) => stats.record_published(),
                Err(rej) => {
                    tracing::debug!(target: "adapter", adapter = %stats.name(), reason = rej.label(), "bus rejected item");
                }
            }
        }
    })
}

/// Push and account for an overflow drop.
pub fn enqueue(queue: &DropOldestQueue, stats: &AdapterStats, item: Item) {
    if let Some(old) = queue.push(item) {
        stats.record_queue_dropped();
        counter!("adapter_queue_dropped_total", "adapter" => stats.name().to_string()).increment(1);
        tracing::warn!(target: "adapter", adapter = %stats.name(), dropped = %old.id, "local queue full, dropped oldest");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn item(n: u32) -> Item {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Item::new("news", format!("t{n}"), "http://x", ts, "s", "p")
    }

    #[test]
    fn overflow_drops_oldest() {
        let q = DropOldestQueue::new(2);
        assert!(q.push(item(1)).is_none());
        assert!(q.push(item(2)).is_none());
        let dropped = q.push(item(3)).unwrap();
        assert_eq!(dropped.title, "t1");
        assert_eq!(q.try_pop().unwrap().title, "t2");
        assert_eq!(q.try_pop().unwrap().title, "t3");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn pop_returns_none_after_cancel() {
        let q = DropOldestQueue::new(2);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(q.pop(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn publisher_drains_into_bus() {
        let q = Arc::new(DropOldestQueue::new(8));
        let bus = Arc::new(EventBus::default());
        let stats = Arc::new(AdapterStats::new("test"));
        let cancel = CancellationToken::new();
        let h = spawn_publisher(
            Arc::clone(&q),
            Arc::clone(&bus),
            crate::bus::RAW_CHANNEL.into(),
            Arc::clone(&stats),
            cancel.clone(),
        );
        enqueue(&q, &stats, item(1));
        enqueue(&q, &stats, item(2));
        for _ in 0..100 {
            if bus.len(crate::bus::RAW_CHANNEL) == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        h.await.unwrap();
        assert_eq!(bus.len(crate::bus::RAW_CHANNEL), 2);
        assert_eq!(stats.snapshot().published, 2);
    }
}

// src/hub/view.rs
//! Bus-resident items merged with the scheduler's snapshot file.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::bus::{BusStats, EventBus};
use crate::item::Item;
use crate::scheduler::snapshot::{parse_snapshot, Snapshot};

#[derive(Default)]
struct SnapshotCache {
    mtime: Option<SystemTime>,
    snapshot: Arc<Snapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ViewStats {
    pub snapshot_items: usize,
    pub bus_items: usize,
    pub total_sources: usize,
    pub snapshot_last_updated: Option<DateTime<Utc>>,
    pub sources: Vec<String>,
    pub event_bus_stats: BusStats,
}

pub struct UnifiedView {
    bus: Arc<EventBus>,
    channel: String,
    snapshot_path: PathBuf,
    cache: Mutex<SnapshotCache>,
}

/// Bus items win over snapshot items with the same id; result is newest first.
pub fn merge(bus_items: Vec<Item>, snapshot_items: &[Item], limit: usize) -> Vec<Item> {
    let mut seen = HashSet::new();
    let mut out: Vec<Item> = bus_items
        .into_iter()
        .filter(|it| seen.insert(it.id.clone()))
        .collect();
    out.extend(
        snapshot_items
            .iter()
            .filter(|it| seen.insert(it.id.clone()))
            .cloned(),
    );
    out.sort_by(|a, b| b.published.cmp(&a.published));
    out.truncate(limit);
    out
}

pub fn matches_source(item: &Item, source: Option<&str>) -> bool {
    source.map_or(true, |s| item.source.eq_ignore_ascii_case(s))
}

impl UnifiedView {
    pub fn new(bus: Arc<EventBus>, channel: impl Into<String>, snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            bus,
            channel: channel.into(),
            snapshot_path: snapshot_path.into(),
            cache: Mutex::new(SnapshotCache::default()),
        }
    }

    /// Re-reads the file only when its mtime changed. A missing file is empty.
    /// A file that fails to parse is an error and the previous copy stays cached.
    pub async fn snapshot(&self) -> Result<Arc<Snapshot>> {
        let mtime = match tokio::fs::metadata(&self.snapshot_path).await {
            Ok(m) => m.modified().ok(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Arc::clone(&self.cache.lock().snapshot));
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("stat {}", self.snapshot_path.display()))
            }
        };
        {
            let cache = self.cache.lock();
            if mtime.is_some() && cache.mtime == mtime {
                return Ok(Arc::clone(&cache.snapshot));
            }
        }
        let body = tokio::fs::read_to_string(&self.snapshot_path)
            .await
            .with_context(|| format!("reading {}", self.snapshot_path.display()))?;
        let snap = Arc::new(parse_snapshot(&body)?);
        tracing::debug!(target: "hub", items = snap.items.len(), "snapshot reloaded");
        let mut cache = self.cache.lock();
        cache.mtime = mtime;
        cache.snapshot = Arc::clone(&snap);
        Ok(snap)
    }

    fn bus_items(&self, limit: usize) -> Vec<Item> {
        self.bus
            .recent(&self.channel, limit)
            .into_iter()
            .map(|m| m.item)
            .collect()
    }

    /// Up to `limit` merged items, optionally restricted to one source (case-insensitive).
    pub async fn latest(&self, limit: usize, source: Option<&str>) -> Result<Vec<Item>> {
        let snap = self.snapshot().await?;
        let mut items = merge(self.bus_items(limit * 2), &snap.items, limit * 2);
        items.retain(|it| matches_source(it, source));
        items.truncate(limit);
        Ok(items)
    }

    pub async fn stats(&self) -> Result<ViewStats> {
        let snap = self.snapshot().await?;
        let bus_items = self.bus_items(1000);
        let sources: BTreeSet<String> = snap
            .items
            .iter()
            .chain(bus_items.iter())
            .map(|it| it.source.clone())
            .collect();
        Ok(ViewStats {
            snapshot_items: snap.total_items,
            bus_items: bus_items.len(),
            total_sources: sources.len(),
            snapshot_last_updated: snap.last_updated,
            sources: sources.into_iter().collect(),
            event_bus_stats: self.bus.stats(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn item(title: &str, source: &str, minute: u32) -> Item {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, minute, 0).unwrap();
        Item::new("news", title, format!("https://x/{title}"), ts, source, "P")
    }

    #[test]
    fn merge_prefers_bus_copy_and_sorts_newest_first() {
        let mut bus_copy = item("a", "feed-a", 5);
        bus_copy.publisher = "bus".into();
        let mut snap_copy = bus_copy.clone();
        snap_copy.publisher = "snapshot".into();
        let older = item("b", "feed-b", 1);
        let newest = item("c", "feed-b", 9);

        let out = merge(vec![bus_copy], &[snap_copy, older, newest], 10);
        let titles: Vec<_> = out.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, ["c", "a", "b"]);
        assert_eq!(out[1].publisher, "bus");
    }

    #[test]
    fn source_filter_ignores_case() {
        let it = item("a", "Reuters", 0);
        assert!(matches_source(&it, Some("reuters")));
        assert!(!matches_source(&it, Some("bloomberg")));
        assert!(matches_source(&it, None));
    }

    #[tokio::test]
    async fn latest_reads_snapshot_and_bus() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latest.json");
        let snap = serde_json::json!({
            "items": [item("old", "feed-a", 0)],
            "last_updated": "2024-01-01T12:00:00Z",
            "total_items": 1
        });
        std::fs::write(&path, snap.to_string()).unwrap();

        let bus = Arc::new(EventBus::default());
        bus.publish(crate::bus::RAW_CHANNEL, item("new", "webhook:acme", 3), "webhook:acme");
        let view = UnifiedView::new(bus, crate::bus::RAW_CHANNEL, &path);

        let all = view.latest(10, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].title, "new");
        let only = view.latest(10, Some("FEED-A")).await.unwrap();
        assert_eq!(only.len(), 1);

        let stats = view.stats().await.unwrap();
        assert_eq!(stats.snapshot_items, 1);
        assert_eq!(stats.bus_items, 1);
        assert_eq!(stats.total_sources, 2);
    }

    #[tokio::test]
    async fn missing_snapshot_is_empty_and_corrupt_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latest.json");
        let view = UnifiedView::new(Arc::new(EventBus::default()), crate::bus::RAW_CHANNEL, &path);
        assert!(view.latest(5, None).await.unwrap().is_empty());
        std::fs::write(&path, "{not json").unwrap();
        assert!(view.latest(5, None).await.is_err());
    }
}

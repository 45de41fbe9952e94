// src/scheduler/snapshot.rs
//! Newest-first JSON file of recently polled items, read back by the hub.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::item::Item;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub items: Vec<Item>,
    pub last_updated: Option<DateTime<Utc>>,
    pub total_items: usize,
}

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    #[serde(default)]
    items: Vec<serde_json::Value>,
    #[serde(default)]
    last_updated: Option<String>,
}

/// Lenient parse: invalid entries are skipped, legacy `category` is read as `topic`.
pub fn parse_snapshot(s: &str) -> Result<Snapshot> {
    let raw: RawSnapshot = serde_json::from_str(s).context("snapshot json")?;
    let items: Vec<Item> = raw
        .items
        .into_iter()
        .filter_map(|v| Item::from_value(v).ok())
        .collect();
    let last_updated = raw
        .last_updated
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc));
    Ok(Snapshot {
        total_items: items.len(),
        items,
        last_updated,
    })
}

/// Missing file reads as an empty snapshot.
pub async fn load(path: &Path) -> Result<Snapshot> {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => parse_snapshot(&s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Snapshot::default()),
        Err(e) => Err(e).with_context(|| format!("reading snapshot {}", path.display())),
    }
}

/// Prepend `new_items`, cap, and write atomically (tmp + rename).
pub async fn append(path: &Path, new_items: Vec<Item>, cap: usize) -> Result<Snapshot> {
    let mut snap = match load(path).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(target: "scheduler", error = ?e, path = %path.display(), "unreadable snapshot, starting fresh");
            Snapshot::default()
        }
    };
    let mut items = new_items;
    items.append(&mut snap.items);
    items.truncate(cap);
    let snap = Snapshot {
        total_items: items.len(),
        items,
        last_updated: Some(Utc::now()),
    };
    write_atomic(path, &snap).await?;
    Ok(snap)
}

async fn write_atomic(path: &Path, snap: &Snapshot) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    let tmp: PathBuf = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(snap).context("encoding snapshot")?;
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

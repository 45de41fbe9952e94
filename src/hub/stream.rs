// src/hub/stream.rs
//! Per-connection stream protocol, independent of the transport.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::HubSettings;
use crate::item::Item;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Connected {
        client_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    InitialData {
        count: usize,
        items: Vec<Item>,
        total_available: usize,
        source_filter: Option<String>,
        timestamp: DateTime<Utc>,
    },
    NewItem {
        item: Item,
        client_id: String,
        timestamp: DateTime<Utc>,
    },
    BatchComplete {
        new_items_count: usize,
        total_items_tracking: usize,
        timestamp: DateTime<Utc>,
    },
    Heartbeat {
        client_id: String,
        items_tracking: usize,
        total_items_available: usize,
        last_data_update: Option<DateTime<Utc>>,
        uptime_checks: u64,
        timestamp: DateTime<Utc>,
    },
    Error {
        client_id: String,
        message: String,
        recoverable: bool,
        timestamp: DateTime<Utc>,
    },
    Disconnected {
        client_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Connected { .. } => "connected",
            StreamEvent::InitialData { .. } => "initial_data",
            StreamEvent::NewItem { .. } => "new_item",
            StreamEvent::BatchComplete { .. } => "batch_complete",
            StreamEvent::Heartbeat { .. } => "heartbeat",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Disconnected { .. } => "disconnected",
        }
    }
}

/// Liveness counters carried by heartbeats.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatInfo {
    pub total_items_available: usize,
    pub last_data_update: Option<DateTime<Utc>>,
}

/// Diff state for one client. Items passed in must already be filtered.
#[derive(Debug)]
pub struct StreamSession {
    client_id: String,
    source: Option<String>,
    last_seen: HashSet<String>,
    quanta: u64,
    heartbeat_every: u64,
    initial_batch: usize,
}

impl StreamSession {
    pub fn new(client_id: impl Into<String>, source: Option<String>, settings: &HubSettings) -> Self {
        Self {
            client_id: client_id.into(),
            source,
            last_seen: HashSet::new(),
            quanta: 0,
            heartbeat_every: u64::from(settings.heartbeat_every.max(1)),
            initial_batch: settings.initial_batch,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn tracking(&self) -> usize {
        self.last_seen.len()
    }

    pub fn connected(&self) -> StreamEvent {
        StreamEvent::Connected {
            client_id: self.client_id.clone(),
            message: "SSE stream established".into(),
            timestamp: Utc::now(),
        }
    }

    /// Everything currently visible becomes "seen"; only the first batch is sent.
    pub fn initial(&mut self, items: Vec<Item>) -> StreamEvent {
        self.last_seen = items.iter().map(|it| it.id.clone()).collect();
        let total = items.len();
        let batch: Vec<Item> = items.into_iter().take(self.initial_batch).collect();
        StreamEvent::InitialData {
            count: total,
            items: batch,
            total_available: total,
            source_filter: self.source.clone(),
            timestamp: Utc::now(),
        }
    }

    /// One poll quantum: new items (newest first), a batch summary when anything
    /// was new, then a heartbeat every `heartbeat_every` quanta.
    pub fn poll(&mut self, current: Vec<Item>, info: &HeartbeatInfo) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let current_ids: HashSet<String> = current.iter().map(|it| it.id.clone()).collect();
        let mut fresh: Vec<Item> = current
            .into_iter()
            .filter(|it| !self.last_seen.contains(&it.id))
            .collect();

        if !fresh.is_empty() {
            fresh.sort_by(|a, b| b.published.cmp(&a.published));
            let n = fresh.len();
            let now = Utc::now();
            events.extend(fresh.into_iter().map(|item| StreamEvent::NewItem {
                item,
                client_id: self.client_id.clone(),
                timestamp: now,
            }));
            events.push(StreamEvent::BatchComplete {
                new_items_count: n,
                total_items_tracking: current_ids.len(),
                timestamp: now,
            });
            self.last_seen = current_ids;
        }

        self.quanta += 1;
        if self.quanta % self.heartbeat_every == 0 {
            events.push(StreamEvent::Heartbeat {
                client_id: self.client_id.clone(),
                items_tracking: self.last_seen.len(),
                total_items_available: info.total_items_available,
                last_data_update: info.last_data_update,
                uptime_checks: self.quanta,
                timestamp: Utc::now(),
            });
        }
        events
    }

    pub fn error(&self, message: impl Into<String>) -> StreamEvent {
        StreamEvent::Error {
            client_id: self.client_id.clone(),
            message: message.into(),
            recoverable: true,
            timestamp: Utc::now(),
        }
    }

    pub fn disconnected(&self) -> StreamEvent {
        StreamEvent::Disconnected {
            client_id: self.client_id.clone(),
            message: "Stream ended".into(),
            timestamp: Utc::now(),
        }
    }
}

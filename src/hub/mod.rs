// src/hub/mod.rs
//! Streaming hub: read endpoints over the merged view plus the `/stream` SSE feed.

pub mod stream;
pub mod view;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use metrics::gauge;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::adapters::AdapterStats;
use crate::bus::EventBus;
use crate::config::{FeedSource, HubSettings, Settings};
use crate::scheduler::SchedulerStats;
use stream::{HeartbeatInfo, StreamEvent, StreamSession};
use view::UnifiedView;

const MAX_LATEST: usize = 500;
const DEFAULT_LATEST: usize = 50;

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct Features {
    pub rss_polling: bool,
    pub websockets: bool,
    /// The inbound route is always mounted.
    pub webhooks: bool,
    pub webhook_signature_required: bool,
    pub newswire: bool,
}

#[derive(Clone)]
pub struct HubState {
    pub view: Arc<UnifiedView>,
    settings: Arc<HubSettings>,
    feeds: Arc<Vec<FeedSource>>,
    features: Features,
    webhook_path: String,
    last_bus_update: Arc<Mutex<Option<DateTime<Utc>>>>,
    next_client: Arc<AtomicU64>,
    cancel: CancellationToken,
    scheduler: Option<Arc<Mutex<SchedulerStats>>>,
    adapters: Arc<Vec<Arc<AdapterStats>>>,
}

impl HubState {
    /// Builds the view and starts tracking bus arrivals for heartbeats.
    pub fn new(settings: &Settings, bus: Arc<EventBus>, cancel: CancellationToken) -> Self {
        let hub = settings.hub.clone();
        let last_bus_update = Arc::new(Mutex::new(None));
        let tracker = Arc::clone(&last_bus_update);
        bus.subscribe(&hub.channel, move |msg| {
            *tracker.lock() = Some(msg.received_at);
            Ok(())
        });
        let view = UnifiedView::new(bus, hub.channel.clone(), settings.scheduler.snapshot_path.clone());
        Self {
            view: Arc::new(view),
            settings: Arc::new(hub),
            feeds: Arc::new(settings.scheduler.feeds.clone()),
            features: Features {
                rss_polling: !settings.scheduler.feeds.is_empty(),
                websockets: !settings.websocket_sources.is_empty(),
                webhooks: true,
                webhook_signature_required: !settings.webhook.secret.is_empty(),
                newswire: !settings.newswire_sources.is_empty(),
            },
            webhook_path: settings.webhook.path.clone(),
            last_bus_update,
            next_client: Arc::new(AtomicU64::new(1)),
            cancel,
            scheduler: None,
            adapters: Arc::new(Vec::new()),
        }
    }

    /// Report scheduler counters under `/stats`.
    pub fn with_scheduler_stats(mut self, stats: Arc<Mutex<SchedulerStats>>) -> Self {
        self.scheduler = Some(stats);
        self
    }

    /// Report push adapter counters under `/stats`.
    pub fn with_adapter_stats(mut self, stats: Vec<Arc<AdapterStats>>) -> Self {
        self.adapters = Arc::new(stats);
        self
    }

    fn next_client_id(&self) -> String {
        format!("client-{}", self.next_client.fetch_add(1, Ordering::Relaxed))
    }

    /// Latest of the last bus arrival and the snapshot's own timestamp.
    pub async fn last_data_update(&self) -> Option<DateTime<Utc>> {
        let bus = *self.last_bus_update.lock();
        let snap = self.view.snapshot().await.ok().and_then(|s| s.last_updated);
        bus.max(snap)
    }
}

pub fn router(state: HubState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/latest", get(latest))
        .route("/stats", get(stats))
        .route("/sources", get(sources))
        .route("/health", get(health))
        .route("/stream", get(stream_items))
        .with_state(state)
}

fn internal_error(e: anyhow::Error, endpoint: &str) -> Response {
    tracing::error!(target: "hub", endpoint, error = ?e, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "detail": "Internal server error" })),
    )
        .into_response()
}

async fn root(State(state): State<HubState>) -> Json<serde_json::Value> {
    let mut endpoints = vec!["/latest", "/stream", "/stats", "/sources", "/health", "/metrics"];
    endpoints.extend([state.webhook_path.as_str(), "/push/health", "/push/stats"]);
    Json(json!({
        "name": "newsflow",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "active",
        "timestamp": Utc::now(),
        "endpoints": endpoints,
        "features": state.features,
        "sse_info": {
            "stream_endpoint": "/stream",
            "heartbeat_interval_secs": state.settings.poll_quantum_secs * u64::from(state.settings.heartbeat_every),
            "supports_source_filter": true,
        },
    }))
}

#[derive(Debug, Deserialize)]
pub struct LatestQuery {
    pub limit: Option<usize>,
    pub source: Option<String>,
}

async fn latest(State(state): State<HubState>, Query(q): Query<LatestQuery>) -> Response {
    let limit = q.limit.unwrap_or(DEFAULT_LATEST).clamp(1, MAX_LATEST);
    match state.view.latest(limit, q.source.as_deref()).await {
        Ok(items) => Json(json!({
            "count": items.len(),
            "items": items,
            "limit": limit,
            "source_filter": q.source,
            "timestamp": Utc::now(),
        }))
        .into_response(),
        Err(e) => internal_error(e, "/latest"),
    }
}

async fn stats(State(state): State<HubState>) -> Response {
    match state.view.stats().await {
        Ok(stats) => Json(json!({
            "stats": stats,
            "scheduler": state.scheduler.as_ref().map(|s| s.lock().clone()),
            "adapters": state.adapters.iter().map(|a| a.snapshot()).collect::<Vec<_>>(),
            "api_status": "active",
            "timestamp": Utc::now(),
        }))
        .into_response(),
        Err(e) => internal_error(e, "/stats"),
    }
}

async fn sources(State(state): State<HubState>) -> Json<serde_json::Value> {
    Json(json!({
        "sources": *state.feeds,
        "count": state.feeds.len(),
        "timestamp": Utc::now(),
    }))
}

async fn health(State(state): State<HubState>) -> Response {
    match state.view.stats().await {
        Ok(stats) => Json(json!({
            "status": "healthy",
            "api_version": env!("CARGO_PKG_VERSION"),
            "data_available": stats.snapshot_items + stats.bus_items > 0,
            "last_data_update": state.last_data_update().await,
            "timestamp": Utc::now(),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "error": e.to_string(),
                "timestamp": Utc::now(),
            })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub source: Option<String>,
}

async fn stream_items(
    State(state): State<HubState>,
    Query(q): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    Sse::new(client_stream(state, q.source)).keep_alive(KeepAlive::default())
}

fn sse(ev: &StreamEvent) -> Result<Event, axum::Error> {
    Event::default().json_data(ev)
}

/// Keeps `hub_clients` accurate however the stream ends.
struct ClientGuard {
    client_id: String,
}

impl ClientGuard {
    fn new(client_id: &str) -> Self {
        gauge!("hub_clients").increment(1.0);
        tracing::info!(target: "hub", client = %client_id, "stream client connected");
        Self {
            client_id: client_id.to_string(),
        }
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        gauge!("hub_clients").decrement(1.0);
        tracing::info!(target: "hub", client = %self.client_id, "stream client gone");
    }
}

/// Event sequence for one client: connected, initial_data, then one poll per
/// quantum until the hub is cancelled or the consumer drops the stream.
pub fn event_stream(state: HubState, source: Option<String>) -> impl Stream<Item = StreamEvent> {
    async_stream::stream! {
        let client_id = state.next_client_id();
        let _guard = ClientGuard::new(&client_id);
        let limit = state.settings.view_limit;
        let mut session = StreamSession::new(client_id, source, &state.settings);

        yield session.connected();

        let first = state.view.latest(limit, session.source()).await;
        match first {
            Ok(items) => yield session.initial(items),
            Err(e) => {
                tracing::error!(target: "hub", client = %session.client_id(), error = ?e, "stream initialization failed");
                yield session.error("Stream initialization failed");
                return;
            }
        }

        let quantum = Duration::from_secs(state.settings.poll_quantum_secs.max(1));
        let mut tick = tokio::time::interval(quantum);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            let stopped = tokio::select! {
                _ = state.cancel.cancelled() => true,
                _ = tick.tick() => false,
            };
            if stopped {
                yield session.disconnected();
                break;
            }
            let polled = state.view.latest(limit, session.source()).await;
            match polled {
                Ok(items) => {
                    let info = HeartbeatInfo {
                        total_items_available: items.len(),
                        last_data_update: state.last_data_update().await,
                    };
                    for ev in session.poll(items, &info) {
                        yield ev;
                    }
                }
                Err(e) => {
                    tracing::warn!(target: "hub", client = %session.client_id(), error = ?e, "stream poll failed");
                    yield session.error(e.to_string());
                }
            }
        }
    }
}

pub fn client_stream(
    state: HubState,
    source: Option<String>,
) -> impl Stream<Item = Result<Event, axum::Error>> {
    event_stream(state, source).map(|ev| sse(&ev))
}

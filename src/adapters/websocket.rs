// src/adapters/websocket.rs
//! Persistent WebSocket client, one per configured source.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::queue::{enqueue, DropOldestQueue};
use super::{Adapter, AdapterStats, ReconnectPolicy};
use crate::config::WebSocketSource;
use crate::error::TransportError;
use crate::item::IdGranularity;
use crate::normalize::{normalize, NormalizeContext};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HEARTBEAT_MARKERS: &[&str] = &["heartbeat", "ping", "pong", "keepalive"];

/// Heartbeat/ping frames carry a marker in a type-ish field, or are a bare
/// `{"heartbeat": ..}` / `{"ping": ..}` object.
pub fn is_heartbeat(v: &Value) -> bool {
    let Some(obj) = v.as_object() else {
        return false;
    };
    let typed = ["type", "message_type", "event", "op"].iter().any(|k| {
        obj.get(*k)
            .and_then(Value::as_str)
            .map(|s| HEARTBEAT_MARKERS.contains(&s.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    });
    typed || obj.contains_key("heartbeat") || obj.contains_key("ping")
}

pub struct WebSocketAdapter {
    cfg: WebSocketSource,
    ctx: NormalizeContext,
    stats: Arc<AdapterStats>,
    queue: Arc<DropOldestQueue>,
    stream: Option<WsStream>,
}

impl WebSocketAdapter {
    pub fn new(cfg: WebSocketSource, queue: Arc<DropOldestQueue>) -> Self {
        let ctx = NormalizeContext::websocket(cfg.name.clone())
            .with_vendor(cfg.vendor.clone())
            .with_topic(cfg.topic.clone())
            .with_publisher(cfg.publisher.clone());
        let stats = Arc::new(AdapterStats::new(format!("websocket:{}", cfg.name)));
        Self {
            cfg,
            ctx,
            stats,
            queue,
            stream: None,
        }
    }

    pub fn with_granularity(mut self, granularity: IdGranularity) -> Self {
        self.ctx = self.ctx.with_granularity(granularity);
        self
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::table(self.cfg.reconnect_backoff_secs.clone())
    }

    /// Decode, filter, map and enqueue one text frame.
    pub fn handle_text(&self, text: &str) {
        self.stats.record_message();
        let payload: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                self.stats.record_error();
                tracing::debug!(target: "adapter", adapter = %self.stats.name(), error = %e, "non-json frame");
                return;
            }
        };
        if is_heartbeat(&payload) {
            tracing::trace!(target: "adapter", adapter = %self.stats.name(), "heartbeat");
            return;
        }
        match normalize(&payload, &self.ctx) {
            Some(item) => enqueue(&self.queue, &self.stats, item),
            None => {
                self.stats.record_filtered();
                tracing::debug!(target: "adapter", adapter = %self.stats.name(), "frame did not map to an item");
            }
        }
    }
}

#[async_trait]
impl Adapter for WebSocketAdapter {
    fn name(&self) -> &str {
        self.stats.name()
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let mut req = self
            .cfg
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidConfig(format!("{}: {e}", self.cfg.url)))?;
        for (k, v) in &self.cfg.headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| TransportError::InvalidConfig(format!("header {k}: {e}")))?;
            let value = HeaderValue::from_str(v)
                .map_err(|e| TransportError::InvalidConfig(format!("header {k}: {e}")))?;
            req.headers_mut().insert(name, value);
        }
        tracing::info!(target: "adapter", adapter = %self.stats.name(), url = %self.cfg.url, "connecting");
        let limit = Duration::from_secs(self.cfg.connect_timeout_secs.max(1));
        let (stream, _resp) = tokio::time::timeout(limit, connect_async(req))
            .await
            .map_err(|_| TransportError::Timeout(limit))??;
        self.stream = Some(stream);
        Ok(())
    }

    async fn read_loop(&mut self, cancel: &CancellationToken) -> Result<(), TransportError> {
        let mut stream = self.stream.take().ok_or(TransportError::NotConnected)?;
        let period = Duration::from_secs(self.cfg.ping_interval_secs.max(1));
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        let res = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = ping.tick() => {
                    if let Err(e) = stream.send(Message::Ping(Default::default())).await {
                        break Err(e.into());
                    }
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                    Some(Ok(Message::Binary(bin))) => {
                        self.stats.touch();
                        tracing::warn!(target: "adapter", adapter = %self.stats.name(), bytes = bin.len(), "binary frame ignored");
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        self.stats.touch();
                        if let Err(e) = stream.send(Message::Pong(payload)).await {
                            break Err(e.into());
                        }
                    }
                    Some(Ok(Message::Pong(_))) => self.stats.touch(),
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(target: "adapter", adapter = %self.stats.name(), frame = ?frame, "server closed connection");
                        break Ok(());
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => break Err(e.into()),
                    None => break Ok(()),
                },
            }
        };
        self.stream = Some(stream);
        res
    }

    async fn close(&mut self) {
        if let Some(mut s) = self.stream.take() {
            let _ = s.close(None).await;
        }
    }

    fn stats(&self) -> Arc<AdapterStats> {
        Arc::clone(&self.stats)
    }
}

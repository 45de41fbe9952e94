// src/adapters/newswire.rs
//! Newswire clients. A line-delimited JSON socket (optionally TLS) is the one
//! concrete transport; vendor session APIs are declared but not available.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rustls_pki_types::ServerName;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use super::queue::{enqueue, spawn_publisher, DropOldestQueue};
use super::websocket::WebSocketAdapter;
use super::{Adapter, AdapterSet, AdapterStats, ReconnectPolicy};
use crate::bus::EventBus;
use crate::config::{NewswireSource, Settings};
use crate::error::TransportError;
use crate::item::IdGranularity;
use crate::normalize::{normalize, NormalizeContext};

const MAX_LINE_BYTES: usize = 1024 * 1024;
const HEARTBEAT_TYPES: &[&str] = &["ping", "heartbeat", "keepalive"];

/// `type` or `message_type` is one of ping/heartbeat/keepalive.
pub fn is_heartbeat(v: &Value) -> bool {
    ["type", "message_type"].iter().any(|k| {
        v.get(*k)
            .and_then(Value::as_str)
            .map(|s| HEARTBEAT_TYPES.contains(&s.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    })
}

trait LineIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> LineIo for T {}

type LineStream = Framed<Box<dyn LineIo>, LinesCodec>;

fn tls_connector() -> Result<TlsConnector, TransportError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| TransportError::Tls(e.to_string()))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

fn auth_line(auth: &Value) -> String {
    match auth {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Line-delimited JSON over TCP/TLS. Each line is one payload.
pub struct LineSocketClient {
    cfg: NewswireSource,
    ctx: NormalizeContext,
    stats: Arc<AdapterStats>,
    queue: Arc<DropOldestQueue>,
    stream: Option<LineStream>,
}

impl LineSocketClient {
    pub fn new(cfg: NewswireSource, queue: Arc<DropOldestQueue>) -> Self {
        let ctx = NormalizeContext::newswire(cfg.name.clone(), cfg.vendor.clone())
            .with_topic(cfg.topic.clone())
            .with_publisher(cfg.publisher.clone());
        let stats = Arc::new(AdapterStats::new(format!("newswire:{}", cfg.name)));
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

    pub fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        self.stats.record_message();
        let payload: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                self.stats.record_error();
                tracing::debug!(target: "adapter", adapter = %self.stats.name(), error = %e, "non-json line");
                return;
            }
        };
        if is_heartbeat(&payload) {
            return;
        }
        match normalize(&payload, &self.ctx) {
            Some(item) => enqueue(&self.queue, &self.stats, item),
            None => self.stats.record_filtered(),
        }
    }
}

async fn open(cfg: &NewswireSource) -> Result<Box<dyn LineIo>, TransportError> {
    let (Some(host), Some(port)) = (cfg.host.as_deref(), cfg.port) else {
        return Err(TransportError::InvalidConfig(format!(
            "newswire '{}' needs host and port",
            cfg.name
        )));
    };
    let read_timeout = Duration::from_secs(cfg.read_timeout_secs.max(1));
    let tcp = tokio::time::timeout(read_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| TransportError::Timeout(read_timeout))??;
    if !cfg.tls {
        return Ok(Box::new(tcp));
    }
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::InvalidConfig(format!("tls server name {host}: {e}")))?;
    let tls = tokio::time::timeout(read_timeout, tls_connector()?.connect(server_name, tcp))
        .await
        .map_err(|_| TransportError::Timeout(read_timeout))?
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    Ok(Box::new(tls))
}

fn codec_err(e: LinesCodecError) -> TransportError {
    match e {
        LinesCodecError::Io(e) => TransportError::Io(e),
        LinesCodecError::MaxLineLengthExceeded => {
            TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "line too long"))
        }
    }
}

#[async_trait]
impl Adapter for LineSocketClient {
    fn name(&self) -> &str {
        self.stats.name()
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        tracing::info!(
            target: "adapter",
            adapter = %self.stats.name(),
            host = ?self.cfg.host,
            port = ?self.cfg.port,
            tls = self.cfg.tls,
            "connecting"
        );
        let io = open(&self.cfg).await?;
        let mut stream = Framed::new(io, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        if let Some(auth) = &self.cfg.auth_message {
            stream.send(auth_line(auth)).await.map_err(codec_err)?;
            tracing::debug!(target: "adapter", adapter = %self.stats.name(), "auth message sent");
        }
        self.stream = Some(stream);
        Ok(())
    }

    async fn read_loop(&mut self, cancel: &CancellationToken) -> Result<(), TransportError> {
        let mut stream = self.stream.take().ok_or(TransportError::NotConnected)?;
        let read_timeout = Duration::from_secs(self.cfg.read_timeout_secs.max(1));

        let res = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                r = tokio::time::timeout(read_timeout, stream.next()) => r,
            };
            match next {
                Err(_) => {
                    tracing::debug!(target: "adapter", adapter = %self.stats.name(), "read timeout, sending keepalive");
                    if let Err(e) = stream.send(json!({"type": "ping"}).to_string()).await {
                        break Err(codec_err(e));
                    }
                }
                Ok(Some(Ok(line))) => self.handle_line(&line),
                Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                    self.stats.record_error();
                    tracing::warn!(target: "adapter", adapter = %self.stats.name(), max = MAX_LINE_BYTES, "oversized line skipped");
                }
                Ok(Some(Err(e))) => break Err(codec_err(e)),
                Ok(None) => break Ok(()),
            }
        };
        self.stream = Some(stream);
        res
    }

    async fn close(&mut self) {
        if let Some(mut s) = self.stream.take() {
            let _ = SinkExt::<String>::close(&mut s).await;
        }
    }

    fn stats(&self) -> Arc<AdapterStats> {
        Arc::clone(&self.stats)
    }
}

/// Placeholder for vendor SDK sessions. Connecting always fails fatally.
pub struct VendorSessionClient {
    vendor: String,
    stats: Arc<AdapterStats>,
}

impl VendorSessionClient {
    pub fn new(cfg: &NewswireSource) -> Self {
        Self {
            vendor: cfg.vendor.clone(),
            stats: Arc::new(AdapterStats::new(format!("newswire:{}", cfg.name))),
        }
    }
}

#[async_trait]
impl Adapter for VendorSessionClient {
    fn name(&self) -> &str {
        self.stats.name()
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        Err(TransportError::Unsupported(self.vendor.clone()))
    }

    async fn read_loop(&mut self, _cancel: &CancellationToken) -> Result<(), TransportError> {
        Err(TransportError::NotConnected)
    }

    async fn close(&mut self) {}

    fn stats(&self) -> Arc<AdapterStats> {
        Arc::clone(&self.stats)
    }
}

pub enum NewswireClient {
    LineSocket(LineSocketClient),
    VendorSession(VendorSessionClient),
}

/// Pick a client by vendor name. Unknown vendors fall back to the line socket.
pub fn create_newswire_client(
    cfg: NewswireSource,
    queue: Arc<DropOldestQueue>,
    granularity: IdGranularity,
) -> NewswireClient {
    let vendor = cfg.vendor.to_ascii_lowercase();
    if vendor.starts_with("bloomberg") || vendor.starts_with("reuters") {
        return NewswireClient::VendorSession(VendorSessionClient::new(&cfg));
    }
    if !matches!(vendor.as_str(), "tcp" | "socket" | "generic_tcp") {
        tracing::warn!(target: "adapter", source = %cfg.name, vendor = %cfg.vendor, "unknown newswire vendor, using line socket");
    }
    NewswireClient::LineSocket(LineSocketClient::new(cfg, queue).with_granularity(granularity))
}

impl NewswireClient {
    pub fn reconnect_policy(cfg: &NewswireSource) -> ReconnectPolicy {
        ReconnectPolicy::FixedThenEscalating {
            retry: Duration::from_secs(cfg.retry_delay_secs.max(1)),
            max: Duration::from_secs(cfg.max_retry_delay_secs.max(cfg.retry_delay_secs)),
        }
    }
}

#[async_trait]
impl Adapter for NewswireClient {
    fn name(&self) -> &str {
        match self {
            NewswireClient::LineSocket(c) => c.name(),
            NewswireClient::VendorSession(c) => c.name(),
        }
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        match self {
            NewswireClient::LineSocket(c) => c.connect().await,
            NewswireClient::VendorSession(c) => c.connect().await,
        }
    }

    async fn read_loop(&mut self, cancel: &CancellationToken) -> Result<(), TransportError> {
        match self {
            NewswireClient::LineSocket(c) => c.read_loop(cancel).await,
            NewswireClient::VendorSession(c) => c.read_loop(cancel).await,
        }
    }

    async fn close(&mut self) {
        match self {
            NewswireClient::LineSocket(c) => c.close().await,
            NewswireClient::VendorSession(c) => c.close().await,
        }
    }

    fn stats(&self) -> Arc<AdapterStats> {
        match self {
            NewswireClient::LineSocket(c) => c.stats(),
            NewswireClient::VendorSession(c) => c.stats(),
        }
    }
}

/// Start every configured websocket and newswire source, each with its own
/// drop-oldest queue drained into `bus`.
pub fn start_push_adapters(settings: &Settings, bus: Arc<EventBus>, set: &mut AdapterSet) {
    let channel = settings.hub.channel.clone();
    let granularity = settings.id_granularity;

    for src in &settings.websocket_sources {
        let queue = Arc::new(DropOldestQueue::new(src.max_queue_size));
        let adapter = WebSocketAdapter::new(src.clone(), Arc::clone(&queue)).with_granularity(granularity);
        let policy = adapter.reconnect_policy();
        let publisher = spawn_publisher(
            queue,
            Arc::clone(&bus),
            channel.clone(),
            adapter.stats(),
            set.cancel_token(),
        );
        set.start(adapter, policy);
        set.track(publisher);
    }

    for src in &settings.newswire_sources {
        let queue = Arc::new(DropOldestQueue::new(crate::config::default_queue_size()));
        let policy = NewswireClient::reconnect_policy(src);
        let client = create_newswire_client(src.clone(), Arc::clone(&queue), granularity);
        let publisher = spawn_publisher(
            queue,
            Arc::clone(&bus),
            channel.clone(),
            client.stats(),
            set.cancel_token(),
        );
        set.start(client, policy);
        set.track(publisher);
    }

    tracing::info!(target: "adapter", adapters = set.len(), "push adapters started");
}

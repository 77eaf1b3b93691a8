//! Realtime push channel, namespaced per vault.
//!
//! The channel delivers server-originated change notifications and
//! connectivity transitions as typed messages into a per-namespace
//! subscription. The session mailbox is the single consumer; there is no
//! listener bookkeeping to leak across reconnects.

use crate::clock::now_millis;
use crate::error::{SyncError, SyncResult};
use crate::retry::Backoff;
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite;
use vaultsync_protocol::{ChangeKind, EntityRecord};

/// Namespace of the cross-vault config scope.
pub const CONFIG_NAMESPACE: &str = "/config";

/// Returns the socket namespace for a vault.
pub fn vault_namespace(vault_id: &str) -> String {
    format!("/vault-{vault_id}")
}

/// A server-originated change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeEvent {
    /// The action performed on the server.
    pub action: ChangeKind,
    /// Entity kind the payload belongs to (e.g. `document`).
    pub entity_kind: String,
    /// Affected records; single-object payloads are normalized to one
    /// element.
    pub records: Vec<EntityRecord>,
}

impl RealtimeEvent {
    /// Parses a wire event of the shape
    /// `{"action": "create", "<entityKey>": object | [object]}`.
    pub fn from_wire(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let action = ChangeKind::from_action(obj.get("action")?.as_str()?)?;
        let (entity_kind, payload) = obj.iter().find(|(k, _)| k.as_str() != "action")?;
        let records = match payload {
            Value::Array(items) => items
                .iter()
                .filter_map(|v| v.as_object().cloned())
                .map(EntityRecord::from_map)
                .collect(),
            Value::Object(map) => vec![EntityRecord::from_map(map.clone())],
            _ => return None,
        };
        Some(Self {
            action,
            entity_kind: entity_kind.clone(),
            records,
        })
    }
}

/// A message delivered to a namespace subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    /// A change notification.
    Event(RealtimeEvent),
    /// The channel (re)gained connectivity.
    Online,
    /// The channel lost connectivity.
    Offline,
}

/// Bearer credentials for the connect handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    /// Access token.
    pub access_token: String,
    /// Expiry, epoch milliseconds.
    pub expires_at: i64,
}

impl Credentials {
    /// Returns true if the token has expired.
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at < now
    }
}

/// Resolves and refreshes the credentials used by the handshake.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns the current credentials, if the user is logged in.
    async fn credentials(&self) -> Option<Credentials>;

    /// Forces a refresh and returns the new credentials.
    async fn refresh_credentials(&self) -> Option<Credentials>;
}

/// A fixed-credential provider for tests.
#[derive(Debug, Default)]
pub struct StaticTokenProvider {
    credentials: Mutex<Option<Credentials>>,
    refreshes: AtomicU32,
}

impl StaticTokenProvider {
    /// Creates a provider with a non-expiring token.
    pub fn logged_in(token: impl Into<String>) -> Self {
        Self {
            credentials: Mutex::new(Some(Credentials {
                access_token: token.into(),
                expires_at: i64::MAX,
            })),
            refreshes: AtomicU32::new(0),
        }
    }

    /// Creates a provider with no credentials.
    pub fn logged_out() -> Self {
        Self::default()
    }

    /// Replaces the stored credentials.
    pub fn set_credentials(&self, credentials: Option<Credentials>) {
        *self.credentials.lock() = credentials;
    }

    /// Returns how many refreshes were requested.
    pub fn refresh_count(&self) -> u32 {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn credentials(&self) -> Option<Credentials> {
        self.credentials.lock().clone()
    }

    async fn refresh_credentials(&self) -> Option<Credentials> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.credentials.lock();
        if let Some(credentials) = guard.as_mut() {
            credentials.expires_at = i64::MAX;
        }
        guard.clone()
    }
}

/// A persistent, auto-reconnecting push connection.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    /// Connects a namespace. Calling connect on an already-connected
    /// namespace is a no-op.
    async fn connect(&self, namespace: &str) -> SyncResult<()>;

    /// Disconnects a namespace and stops its reconnect loop.
    async fn disconnect(&self, namespace: &str);

    /// Tears down and re-establishes every connected namespace.
    async fn reconnect_all(&self) -> SyncResult<()>;

    /// Subscribes to a namespace's messages. The previous subscription,
    /// if any, is replaced.
    fn subscribe(&self, namespace: &str) -> mpsc::Receiver<ChannelMessage>;
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

type Subscribers = Arc<Mutex<HashMap<String, mpsc::Sender<ChannelMessage>>>>;

struct Connection {
    alive: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

/// Websocket implementation of [`RealtimeChannel`].
pub struct WebsocketChannel {
    ws_base: String,
    client_id: String,
    tokens: Arc<dyn TokenProvider>,
    handshake_timeout: Duration,
    backoff: Backoff,
    connections: Mutex<HashMap<String, Connection>>,
    subscribers: Subscribers,
    reconnecting: AtomicBool,
}

impl WebsocketChannel {
    /// Creates a channel against the given service base URL.
    pub fn new(
        base_url: &str,
        client_id: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
        handshake_timeout: Duration,
        backoff: Backoff,
    ) -> Self {
        let ws_base = base_url
            .replacen("https", "wss", 1)
            .replacen("http", "ws", 1);
        Self {
            ws_base,
            client_id: client_id.into(),
            tokens,
            handshake_timeout,
            backoff,
            connections: Mutex::new(HashMap::new()),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            reconnecting: AtomicBool::new(false),
        }
    }

    fn endpoint(&self, namespace: &str, token: &str) -> String {
        format!(
            "{}/ws{}?clientId={}&token={}",
            self.ws_base, namespace, self.client_id, token
        )
    }

    /// Resolves usable credentials, refreshing an expired token first.
    async fn resolve_credentials(&self) -> SyncResult<Credentials> {
        let credentials = match self.tokens.credentials().await {
            Some(c) if c.is_expired(now_millis()) => self.tokens.refresh_credentials().await,
            other => other,
        };
        credentials.ok_or(SyncError::NotAuthenticated)
    }

    async fn dial(&self, namespace: &str) -> SyncResult<WsStream> {
        let credentials = self.resolve_credentials().await?;
        let endpoint = self.endpoint(namespace, &credentials.access_token);

        match Self::dial_endpoint(&endpoint, self.handshake_timeout).await {
            Ok(stream) => Ok(stream),
            Err(SyncError::NotAuthenticated) => {
                // token rejected mid-handshake: refresh once and retry
                let credentials = self
                    .tokens
                    .refresh_credentials()
                    .await
                    .ok_or(SyncError::NotAuthenticated)?;
                let endpoint = self.endpoint(namespace, &credentials.access_token);
                Self::dial_endpoint(&endpoint, self.handshake_timeout).await
            }
            Err(err) => Err(err),
        }
    }

    async fn dial_endpoint(endpoint: &str, ceiling: Duration) -> SyncResult<WsStream> {
        let attempt = timeout(ceiling, tokio_tungstenite::connect_async(endpoint))
            .await
            .map_err(|_| SyncError::Timeout)?;
        match attempt {
            Ok((stream, _response)) => Ok(stream),
            Err(tungstenite::Error::Http(response))
                if response.status() == tungstenite::http::StatusCode::UNAUTHORIZED =>
            {
                Err(SyncError::NotAuthenticated)
            }
            Err(err) => Err(SyncError::Channel(err.to_string())),
        }
    }

    async fn publish(subscribers: &Subscribers, namespace: &str, message: ChannelMessage) {
        let sender = subscribers.lock().get(namespace).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(message).await;
        }
    }

    fn spawn_reader(&self, namespace: String, alive: Arc<AtomicBool>, stream: WsStream) -> tokio::task::JoinHandle<()> {
        let subscribers = Arc::clone(&self.subscribers);
        let tokens = Arc::clone(&self.tokens);
        let ws_base = self.ws_base.clone();
        let client_id = self.client_id.clone();
        let ceiling = self.handshake_timeout;
        let backoff = self.backoff.clone();

        tokio::spawn(async move {
            let mut stream = Some(stream);
            let mut attempt = 1u32;

            while alive.load(Ordering::SeqCst) {
                let mut ws = match stream.take() {
                    Some(ws) => ws,
                    None => {
                        // reconnect with backoff
                        tokio::time::sleep(backoff.compute(attempt)).await;
                        attempt = attempt.saturating_add(1);
                        let token = match tokens.credentials().await {
                            Some(c) if !c.is_expired(now_millis()) => c.access_token,
                            _ => match tokens.refresh_credentials().await {
                                Some(c) => c.access_token,
                                None => continue,
                            },
                        };
                        let endpoint = format!(
                            "{ws_base}/ws{namespace}?clientId={client_id}&token={token}"
                        );
                        match Self::dial_endpoint(&endpoint, ceiling).await {
                            Ok(ws) => {
                                attempt = 1;
                                Self::publish(&subscribers, &namespace, ChannelMessage::Online)
                                    .await;
                                ws
                            }
                            Err(err) => {
                                tracing::debug!(%namespace, error = %err, "reconnect failed");
                                continue;
                            }
                        }
                    }
                };

                while alive.load(Ordering::SeqCst) {
                    match ws.next().await {
                        Some(Ok(tungstenite::Message::Text(text))) => {
                            let Ok(value) = serde_json::from_str::<Value>(&text) else {
                                continue;
                            };
                            if let Some(event) = RealtimeEvent::from_wire(&value) {
                                Self::publish(
                                    &subscribers,
                                    &namespace,
                                    ChannelMessage::Event(event),
                                )
                                .await;
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            tracing::debug!(%namespace, error = %err, "socket error");
                            break;
                        }
                        None => break,
                    }
                }

                if alive.load(Ordering::SeqCst) {
                    Self::publish(&subscribers, &namespace, ChannelMessage::Offline).await;
                }
            }
        })
    }
}

#[async_trait]
impl RealtimeChannel for WebsocketChannel {
    async fn connect(&self, namespace: &str) -> SyncResult<()> {
        {
            let connections = self.connections.lock();
            if let Some(connection) = connections.get(namespace) {
                if connection.alive.load(Ordering::SeqCst) {
                    return Ok(());
                }
            }
        }

        let stream = self.dial(namespace).await?;
        let alive = Arc::new(AtomicBool::new(true));
        let task = self.spawn_reader(namespace.to_string(), Arc::clone(&alive), stream);
        self.connections
            .lock()
            .insert(namespace.to_string(), Connection { alive, task });
        Self::publish(&self.subscribers, namespace, ChannelMessage::Online).await;
        Ok(())
    }

    async fn disconnect(&self, namespace: &str) {
        if let Some(connection) = self.connections.lock().remove(namespace) {
            connection.alive.store(false, Ordering::SeqCst);
            connection.task.abort();
        }
    }

    async fn reconnect_all(&self) -> SyncResult<()> {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let namespaces: Vec<String> = self.connections.lock().keys().cloned().collect();
        for namespace in &namespaces {
            self.disconnect(namespace).await;
        }
        let mut result = Ok(());
        for namespace in &namespaces {
            if let Err(err) = self.connect(namespace).await {
                result = Err(err);
            }
        }
        self.reconnecting.store(false, Ordering::SeqCst);
        result
    }

    fn subscribe(&self, namespace: &str) -> mpsc::Receiver<ChannelMessage> {
        let (tx, rx) = mpsc::channel(64);
        self.subscribers.lock().insert(namespace.to_string(), tx);
        rx
    }
}

/// In-process channel twin for tests: events are injected by hand and
/// connects are tracked for idempotency assertions.
#[derive(Default)]
pub struct MemoryChannel {
    subscribers: Mutex<HashMap<String, mpsc::Sender<ChannelMessage>>>,
    connected: Mutex<HashSet<String>>,
    connect_calls: Mutex<HashMap<String, u32>>,
}

impl MemoryChannel {
    /// Creates an empty channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Injects an event into a namespace's subscription.
    pub async fn emit(&self, namespace: &str, event: RealtimeEvent) -> bool {
        self.send(namespace, ChannelMessage::Event(event)).await
    }

    /// Injects a connectivity loss.
    pub async fn emit_offline(&self, namespace: &str) -> bool {
        self.send(namespace, ChannelMessage::Offline).await
    }

    /// Returns how many times `connect` was called for a namespace.
    pub fn connect_calls(&self, namespace: &str) -> u32 {
        self.connect_calls.lock().get(namespace).copied().unwrap_or(0)
    }

    /// Returns true if the namespace is currently connected.
    pub fn is_connected(&self, namespace: &str) -> bool {
        self.connected.lock().contains(namespace)
    }

    async fn send(&self, namespace: &str, message: ChannelMessage) -> bool {
        let sender = self.subscribers.lock().get(namespace).cloned();
        match sender {
            Some(sender) => sender.send(message).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl RealtimeChannel for MemoryChannel {
    async fn connect(&self, namespace: &str) -> SyncResult<()> {
        *self
            .connect_calls
            .lock()
            .entry(namespace.to_string())
            .or_insert(0) += 1;
        if self.connected.lock().insert(namespace.to_string()) {
            self.send(namespace, ChannelMessage::Online).await;
        }
        Ok(())
    }

    async fn disconnect(&self, namespace: &str) {
        self.connected.lock().remove(namespace);
    }

    async fn reconnect_all(&self) -> SyncResult<()> {
        let namespaces: Vec<String> = self.connected.lock().iter().cloned().collect();
        for namespace in namespaces {
            self.send(&namespace, ChannelMessage::Online).await;
        }
        Ok(())
    }

    fn subscribe(&self, namespace: &str) -> mpsc::Receiver<ChannelMessage> {
        let (tx, rx) = mpsc::channel(64);
        self.subscribers.lock().insert(namespace.to_string(), tx);
        rx
    }
}

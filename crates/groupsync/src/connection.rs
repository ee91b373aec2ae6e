/// Connection manager: one real-time channel subscription per group.
/// Reconnects with bounded exponential backoff and asks for a full resync
/// after every (re)connect, since the transport offers no replay or ordering
/// guarantee across disconnects.
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::{ChannelItem, GroupId, Result, ServerEvent, SyncConfig, SyncError};

pub type EventStream = BoxStream<'static, Result<ServerEvent>>;

/// Transport seam: opens one event stream for a group channel. Production
/// uses `WsConnector`; tests script connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, group_id: GroupId) -> Result<EventStream>;
}

/// WebSocket transport over tokio-tungstenite.
pub struct WsConnector {
    base_url: String,
}

impl WsConnector {
    /// `base_url` like `ws://host:port`; the group channel is addressed via
    /// the query string.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, group_id: GroupId) -> Result<EventStream> {
        let url = format!("{}/ws?group={}", self.base_url, group_id.0);
        let (ws, _) = connect_async(&url)
            .await
            .map_err(|e| SyncError::Channel(e.to_string()))?;

        let stream = ws.filter_map(|frame| async move {
            match frame {
                Ok(Message::Text(text)) => {
                    Some(serde_json::from_str::<ServerEvent>(&text).map_err(SyncError::from))
                }
                Ok(Message::Close(_)) => {
                    Some(Err(SyncError::Channel("server closed the channel".into())))
                }
                // Ping/pong and binary frames are transport noise here.
                Ok(_) => None,
                Err(e) => Some(Err(SyncError::Channel(e.to_string()))),
            }
        });
        Ok(stream.boxed())
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    config: SyncConfig,
    active: Arc<Mutex<HashSet<GroupId>>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, config: SyncConfig) -> Self {
        Self {
            connector,
            config,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Open the channel for a group. At most one live subscription per group
    /// per manager; a second attempt fails until the first is dropped.
    pub fn subscribe(&self, group_id: GroupId) -> Result<Subscription> {
        {
            let mut active = self
                .active
                .lock()
                .map_err(|_| SyncError::Channel("subscription registry poisoned".into()))?;
            if !active.insert(group_id) {
                return Err(SyncError::Channel(format!(
                    "already subscribed to group {}",
                    group_id.0
                )));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_channel(
            self.connector.clone(),
            group_id,
            self.config.clone(),
            tx,
        ));

        Ok(Subscription {
            group_id,
            events: rx,
            task,
            active: self.active.clone(),
        })
    }
}

/// A live group channel. Dropping it tears the channel down; events still in
/// flight are discarded, never delivered late.
pub struct Subscription {
    group_id: GroupId,
    events: mpsc::UnboundedReceiver<ChannelItem>,
    task: JoinHandle<()>,
    active: Arc<Mutex<HashSet<GroupId>>>,
}

impl Subscription {
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub async fn recv(&mut self) -> Option<ChannelItem> {
        self.events.recv().await
    }

    pub fn unsubscribe(self) {
        // Drop does the teardown.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.group_id);
        }
    }
}

async fn run_channel(
    connector: Arc<dyn Connector>,
    group_id: GroupId,
    config: SyncConfig,
    tx: mpsc::UnboundedSender<ChannelItem>,
) {
    let mut backoff = config.reconnect_base;

    loop {
        match connector.connect(group_id).await {
            Ok(mut stream) => {
                info!(group = %group_id.0, "channel connected");
                backoff = config.reconnect_base;

                // The channel cannot replay what was missed while away; the
                // consumer must fetch a fresh snapshot.
                if tx.send(ChannelItem::ResyncNeeded).is_err() {
                    return;
                }

                while let Some(item) = stream.next().await {
                    match item {
                        Ok(event) => {
                            if tx.send(ChannelItem::Event(event)).is_err() {
                                return;
                            }
                        }
                        Err(error) => {
                            warn!(group = %group_id.0, %error, "channel dropped");
                            break;
                        }
                    }
                }
            }
            Err(error) => {
                warn!(group = %group_id.0, %error, "channel connect failed");
            }
        }

        if tx.is_closed() {
            return;
        }
        debug!(group = %group_id.0, delay = ?backoff, "reconnecting after backoff");
        tokio::time::sleep(backoff).await;
        backoff = std::cmp::min(backoff * 2, config.reconnect_cap);
    }
}

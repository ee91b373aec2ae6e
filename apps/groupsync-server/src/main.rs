//! Development relay for the group channel.
//!
//! Accepts WebSocket connections at `/ws?group=<uuid>` and fans every event
//! frame out to the other members of the same group. Also owns the note lock
//! lifetimes: a lock that sees no activity for 60 seconds expires and a
//! synthetic `note_unlocked` event is broadcast, so an abandoned editor never
//! blocks a note forever.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use groupsync::{GroupId, NoteId, ServerEvent, UserId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};
use uuid::Uuid;

const LOCK_TTL: Duration = Duration::from_secs(60);

type Tx = mpsc::UnboundedSender<Message>;
type Rooms = Arc<RwLock<HashMap<GroupId, Room>>>;

struct LockEntry {
    holder: UserId,
    deadline: Instant,
}

/// One group's connected clients and live note locks.
#[derive(Default)]
struct Room {
    clients: HashMap<Uuid, Tx>,
    locks: HashMap<NoteId, LockEntry>,
}

impl Room {
    fn broadcast(&self, json: &str, exclude: Option<Uuid>) {
        for (client_id, tx) in &self.clients {
            if Some(*client_id) == exclude {
                continue;
            }
            let _ = tx.send(Message::Text(json.to_string()));
        }
    }

    /// Keep the lock table in step with the events flowing through the room.
    /// Content updates by the holder re-arm the TTL.
    fn observe(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::NoteLocked { note_id, locked_by } => {
                self.locks.insert(
                    *note_id,
                    LockEntry {
                        holder: *locked_by,
                        deadline: Instant::now() + LOCK_TTL,
                    },
                );
            }
            ServerEvent::NoteUnlocked { note_id } | ServerEvent::NoteDeleted { note_id } => {
                self.locks.remove(note_id);
            }
            ServerEvent::NoteUpdated { note } => {
                if let Some(entry) = self.locks.get_mut(&note.id) {
                    if Some(entry.holder) == note.last_editor {
                        entry.deadline = Instant::now() + LOCK_TTL;
                    }
                }
            }
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "groupsync_server=debug,groupsync=debug".into()),
        )
        .init();

    let addr = std::env::var("GROUPSYNC_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let listener = TcpListener::bind(&addr).await?;
    info!("group channel relay listening on {}", addr);

    let rooms: Rooms = Arc::new(RwLock::new(HashMap::new()));
    tokio::spawn(expire_locks(rooms.clone()));

    while let Ok((stream, peer)) = listener.accept().await {
        info!("new connection from {}", peer);
        tokio::spawn(handle_connection(stream, peer, rooms.clone()));
    }

    Ok(())
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, rooms: Rooms) {
    let mut group: Option<GroupId> = None;
    let callback = |req: &Request, resp: Response| {
        group = parse_group(req.uri().query());
        Ok(resp)
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", peer, e);
            return;
        }
    };

    let Some(group) = group else {
        warn!("{} connected without a group query parameter", peer);
        return;
    };

    let client_id = Uuid::new_v4();
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    // Outgoing frames for this client.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                error!("failed to send frame: {}", e);
                break;
            }
        }
    });

    rooms
        .write()
        .await
        .entry(group)
        .or_default()
        .clients
        .insert(client_id, tx.clone());
    info!("client {} joined group {}", client_id, group.0);

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                error!("error receiving frame from {}: {}", peer, e);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                let event: ServerEvent = match serde_json::from_str(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("dropping malformed event from {}: {}", peer, e);
                        continue;
                    }
                };

                let mut rooms_lock = rooms.write().await;
                if let Some(room) = rooms_lock.get_mut(&group) {
                    room.observe(&event);
                    room.broadcast(&text, Some(client_id));
                }
            }
            Message::Ping(data) => {
                let _ = tx.send(Message::Pong(data));
            }
            Message::Close(_) => {
                info!("client {} requested close", client_id);
                break;
            }
            _ => {}
        }
    }

    // Cleanup on disconnect.
    {
        let mut rooms_lock = rooms.write().await;
        let now_empty = match rooms_lock.get_mut(&group) {
            Some(room) => {
                room.clients.remove(&client_id);
                room.clients.is_empty()
            }
            None => false,
        };
        if now_empty {
            info!("group {} is empty, removing room", group.0);
            rooms_lock.remove(&group);
        }
    }

    send_task.abort();
    info!("connection closed: {}", peer);
}

fn parse_group(query: Option<&str>) -> Option<GroupId> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("group="))
        .and_then(|value| Uuid::parse_str(value).ok())
        .map(GroupId)
}

/// Expire note locks whose holders went silent and tell the room.
async fn expire_locks(rooms: Rooms) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tick.tick().await;

        let now = Instant::now();
        let mut rooms_lock = rooms.write().await;
        for (group_id, room) in rooms_lock.iter_mut() {
            let expired: Vec<NoteId> = room
                .locks
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(note_id, _)| *note_id)
                .collect();

            for note_id in expired {
                room.locks.remove(&note_id);
                info!(group = %group_id.0, note = %note_id.0, "note lock expired");
                match serde_json::to_string(&ServerEvent::NoteUnlocked { note_id }) {
                    Ok(json) => room.broadcast(&json, None),
                    Err(e) => error!("failed to serialize unlock event: {}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_group_from_query() {
        let id = Uuid::new_v4();
        let query = format!("group={id}");
        assert_eq!(parse_group(Some(&query)), Some(GroupId(id)));

        let query = format!("token=abc&group={id}");
        assert_eq!(parse_group(Some(&query)), Some(GroupId(id)));

        assert_eq!(parse_group(None), None);
        assert_eq!(parse_group(Some("group=not-a-uuid")), None);
    }
}

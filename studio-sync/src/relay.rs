//! WebSocket room relay.
//!
//! ```text
//! Client A ──┐
//!            ├── RelayRoom ("studio-{project}") ── replica Document
//! Client B ──┘        │                                 │
//!                     │                     catch-up snapshot on join
//!               BroadcastGroup
//!          ┌──────────┼───────────┐
//!          ▼          ▼           ▼
//!       Client A   Client B    Client C
//! ```
//!
//! The relay is not authoritative. It merges every document frame into an
//! in-memory replica only so that a late joiner can be handed the current
//! state, and it forgets a room once the last peer leaves.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::awareness::{AwarenessEntry, AwarenessUpdate};
use crate::broadcast::{BroadcastGroup, Outbound};
use crate::document::{Document, DocumentError, DocumentView};
use crate::protocol::{Frame, JoinInfo, MessageType, ProtocolError};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            max_peers_per_room: 100,
        }
    }
}

impl RelayConfig {
    pub fn with_addr(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    RoomFull(String),
    Protocol(ProtocolError),
    Document(DocumentError),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RoomFull(room) => write!(f, "Room {room} is full"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::Document(e) => write!(f, "Document error: {e}"),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<ProtocolError> for RelayError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<DocumentError> for RelayError {
    fn from(e: DocumentError) -> Self {
        Self::Document(e)
    }
}

/// One project room.
pub struct RelayRoom {
    key: String,
    replica: Mutex<Document>,
    group: BroadcastGroup,
    /// Last awareness clock announced by each connected client.
    awareness_clocks: Mutex<HashMap<Uuid, u32>>,
    max_peers: usize,
}

impl RelayRoom {
    pub fn new(key: impl Into<String>, broadcast_capacity: usize, max_peers: usize) -> Self {
        Self {
            key: key.into(),
            replica: Mutex::new(Document::new(Uuid::new_v4())),
            group: BroadcastGroup::new(broadcast_capacity),
            awareness_clocks: Mutex::new(HashMap::new()),
            max_peers,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Admit a peer. Returns its receiver and the encoded catch-up snapshot
    /// frame to deliver before anything else; the peer's join is announced
    /// to everyone already in the room.
    pub async fn join(
        &self,
        client_id: Uuid,
        info: JoinInfo,
    ) -> Result<(broadcast::Receiver<Outbound>, Vec<u8>), RelayError> {
        if self.group.peer_count().await >= self.max_peers {
            return Err(RelayError::RoomFull(self.key.clone()));
        }
        let hello = Frame::join(client_id, &info)?.encode()?;

        // Subscribe while the replica is locked: every merge lands either in
        // the catch-up or on the new receiver.
        let replica = self.replica.lock().await;
        let catch_up = Frame::snapshot(Uuid::nil(), replica.clock(), replica.snapshot()?).encode()?;
        log::info!("Peer {} ({client_id}) joined room {}", info.name, self.key);
        let rx = self.group.add_peer(client_id, info).await;
        self.group.broadcast(Outbound::new(client_id, hello));
        drop(replica);

        Ok((rx, catch_up))
    }

    /// Route one frame from `client_id`. Document frames are merged into the
    /// replica first; frames that fail to decode are dropped, not forwarded.
    pub async fn handle_frame(&self, client_id: Uuid, bytes: Vec<u8>) -> Result<(), RelayError> {
        let frame = Frame::decode(&bytes)?;
        if frame.client_id != client_id {
            log::warn!(
                "Dropping frame claiming client {} on connection of {client_id}",
                frame.client_id
            );
            return Ok(());
        }

        if frame.carries_document() {
            let changes = self.replica.lock().await.apply_remote(&frame.payload)?;
            log::debug!(
                "Room {}: {:?} from {client_id}, {} tracks touched",
                self.key,
                frame.msg_type,
                changes.tracks.len()
            );
            self.group.broadcast(Outbound::new(client_id, bytes));
            return Ok(());
        }

        match frame.msg_type {
            MessageType::Awareness => {
                let update = AwarenessUpdate::decode(&frame.payload)?;
                let mut clocks = self.awareness_clocks.lock().await;
                for entry in update.entries.iter().filter(|e| e.client_id == client_id) {
                    clocks.insert(client_id, entry.clock);
                }
                log::trace!("Room {}: awareness from {client_id}", self.key);
            }
            MessageType::Join => {
                log::debug!("Room {}: repeated join from {client_id} ignored", self.key);
                return Ok(());
            }
            MessageType::Leave | MessageType::Update | MessageType::Snapshot => {}
        }

        self.group.broadcast(Outbound::new(client_id, bytes));
        Ok(())
    }

    /// Remove a peer and tell the others it is gone.
    pub async fn leave(&self, client_id: Uuid) {
        let Some(info) = self.group.remove_peer(&client_id).await else {
            return;
        };
        log::info!("Peer {} ({client_id}) left room {}", info.name, self.key);

        if let Ok(bytes) = Frame::leave(client_id).encode() {
            self.group.broadcast(Outbound::new(client_id, bytes));
        }

        let last_clock = self.awareness_clocks.lock().await.remove(&client_id);
        if let Some(clock) = last_clock {
            let removal = AwarenessUpdate {
                entries: vec![AwarenessEntry {
                    client_id,
                    clock: clock.wrapping_add(1),
                    state: None,
                }],
            };
            let frame = removal
                .encode()
                .and_then(|payload| Frame::awareness(client_id, payload).encode());
            match frame {
                Ok(bytes) => {
                    self.group.broadcast(Outbound::new(client_id, bytes));
                }
                Err(e) => log::warn!("Failed to encode awareness removal: {e}"),
            }
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.group.peer_count().await
    }

    /// Current replica contents.
    pub async fn view(&self) -> DocumentView {
        self.replica.lock().await.view()
    }
}

/// Room key → room.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<RelayRoom>>>,
    broadcast_capacity: usize,
    max_peers_per_room: usize,
}

impl RoomManager {
    pub fn new(broadcast_capacity: usize, max_peers_per_room: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            broadcast_capacity,
            max_peers_per_room,
        }
    }

    pub async fn get_or_create(&self, key: &str) -> Arc<RelayRoom> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(key) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(RelayRoom::new(key, self.broadcast_capacity, self.max_peers_per_room))
            })
            .clone()
    }

    pub async fn get(&self, key: &str) -> Option<Arc<RelayRoom>> {
        self.rooms.read().await.get(key).cloned()
    }

    /// Drop a room once nobody is left in it.
    pub async fn remove_if_empty(&self, key: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(key) {
            let stats = room.group.stats().await;
            if stats.active_peers == 0 {
                rooms.remove(key);
                log::info!("Room {key} removed (empty, {} frames relayed)", stats.messages_sent);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        let config = RelayConfig::default();
        Self::new(config.broadcast_capacity, config.max_peers_per_room)
    }
}

/// The relay server.
#[derive(Clone)]
pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(
            config.broadcast_capacity,
            config.max_peers_per_room,
        ));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept loop on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<RelayStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let joined = Self::serve_peer(ws_stream, addr, &rooms, &stats).await;

        let mut s = stats.write().await;
        s.active_connections -= 1;
        s.active_rooms = rooms.room_count().await;
        joined
    }

    async fn serve_peer(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        addr: SocketAddr,
        rooms: &RoomManager,
        stats: &RwLock<RelayStats>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // Handshake: the first binary frame must be a Join.
        let (client_id, info) = loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    match Frame::decode(&bytes).and_then(|f| f.join_info().map(|i| (f.client_id, i))) {
                        Ok(joined) => break joined,
                        Err(e) => log::warn!("Expected join from {addr}: {e}"),
                    }
                }
                Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Err(e)) => return Err(e.into()),
                _ => {}
            }
        };

        let room_key = info.room.clone();
        let room = rooms.get_or_create(&room_key).await;
        let (mut broadcast_rx, catch_up) = match room.join(client_id, info).await {
            Ok(joined) => joined,
            Err(e) => {
                log::warn!("Rejecting {addr}: {e}");
                rooms.remove_if_empty(&room_key).await;
                ws_sender.send(Message::Close(None)).await?;
                return Ok(());
            }
        };
        stats.write().await.active_rooms = rooms.room_count().await;

        let served: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            ws_sender.send(Message::Binary(catch_up.into())).await?;

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += bytes.len() as u64;
                                }
                                if let Err(e) = room.handle_frame(client_id, bytes).await {
                                    log::warn!("Dropping frame from {addr}: {e}");
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    out = broadcast_rx.recv() => {
                        match out {
                            Ok(frame) if frame.from == client_id => {}
                            Ok(frame) => {
                                ws_sender.send(Message::Binary(frame.bytes.to_vec().into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Peer {client_id} lagged by {n} frames");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        room.leave(client_id).await;
        rooms.remove_if_empty(&room_key).await;
        served
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

//! Transport bindings.
//!
//! A transport turns `(room, hello)` into a [`Link`]: a pair of channels of
//! encoded frames. The link is live until `incoming` yields `None`; dropping
//! the link closes it. The session never sees sockets.
//!
//! - [`WsTransport`] — WebSocket client, URL `{endpoint}/{room}`
//! - [`MemoryTransport`] — in-process binding to relay rooms, with an
//!   online switch for simulating partitions

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{Frame, ProtocolError, RoomKey};
use crate::relay::{RelayError, RoomManager};

/// Per-direction channel depth.
const LINK_CAPACITY: usize = 256;

/// A live connection to a room.
pub struct Link {
    pub outgoing: mpsc::Sender<Vec<u8>>,
    pub incoming: mpsc::Receiver<Vec<u8>>,
}

impl Link {
    /// Two ends of an in-process link: `(session side, remote side)`.
    pub fn pair(capacity: usize) -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            Link { outgoing: a_tx, incoming: b_rx },
            Link { outgoing: b_tx, incoming: a_rx },
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    Unreachable(String),
    Rejected(String),
    Protocol(ProtocolError),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreachable(e) => write!(f, "Relay unreachable: {e}"),
            Self::Rejected(e) => write!(f, "Join rejected: {e}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<ProtocolError> for TransportError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<RelayError> for TransportError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::Protocol(p) => Self::Protocol(p),
            other => Self::Rejected(other.to_string()),
        }
    }
}

/// Opens links to rooms. `hello` is the `Join` frame; it goes out before
/// anything else on the link.
pub trait Transport: Send + Sync + 'static {
    fn connect(
        &self,
        room: &RoomKey,
        hello: Frame,
    ) -> impl Future<Output = Result<Link, TransportError>> + Send;
}

// ───────────────────────────────────────────────────────────────────
// WebSocket
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WsTransport {
    endpoint: String,
}

impl WsTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn url_for(&self, room: &RoomKey) -> String {
        format!("{}/{}", self.endpoint, room)
    }
}

impl Transport for WsTransport {
    fn connect(
        &self,
        room: &RoomKey,
        hello: Frame,
    ) -> impl Future<Output = Result<Link, TransportError>> + Send {
        let url = self.url_for(room);
        async move {
            let hello = hello.encode()?;
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::Unreachable(e.to_string()))?;
            let (mut ws_writer, mut ws_reader) = ws_stream.split();

            ws_writer
                .send(Message::Binary(hello.into()))
                .await
                .map_err(|e| TransportError::Unreachable(e.to_string()))?;

            let (session, mut remote) = Link::pair(LINK_CAPACITY);

            // Writer task: forward outgoing frames; close the socket when the
            // session drops its end.
            tokio::spawn(async move {
                while let Some(data) = remote.incoming.recv().await {
                    if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                        break;
                    }
                }
                let _ = ws_writer.send(Message::Close(None)).await;
            });

            // Reader task: forward binary frames until the socket closes.
            let to_session = remote.outgoing;
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => {
                            if to_session.send(data.into()).await.is_err() {
                                break;
                            }
                        }
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }
                log::debug!("WebSocket reader finished");
            });

            log::info!("Connected to {url}");
            Ok(session)
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Offline queue
// ───────────────────────────────────────────────────────────────────

/// Update frames produced while not connected, replayed in order on
/// reconnect.
pub struct OfflineQueue {
    queue: VecDeque<QueuedUpdate>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedUpdate {
    clock: u64,
    payload: Vec<u8>,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update. On overflow the queue is emptied and `false` is
    /// returned; the caller must fall back to a full resync.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            log::warn!(
                "Offline queue full ({} updates), dropping in favour of a full resync",
                self.queue.len()
            );
            self.queue.clear();
            return false;
        }
        self.queue.push_back(QueuedUpdate { clock, payload });
        true
    }

    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).map(|u| (u.clock, u.payload)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|u| u.payload.len()).sum()
    }
}

// ───────────────────────────────────────────────────────────────────
// In-process
// ───────────────────────────────────────────────────────────────────

/// Binds sessions straight to [`RoomManager`] rooms, no sockets involved.
#[derive(Clone)]
pub struct MemoryTransport {
    rooms: Arc<RoomManager>,
    online: Arc<watch::Sender<bool>>,
}

impl MemoryTransport {
    pub fn new(rooms: Arc<RoomManager>) -> Self {
        let (online, _) = watch::channel(true);
        Self {
            rooms,
            online: Arc::new(online),
        }
    }

    /// A transport sharing this one's rooms but with its own online switch,
    /// i.e. another client on the same relay.
    pub fn peer(&self) -> Self {
        Self::new(self.rooms.clone())
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    /// Going offline closes every open link of this transport and makes
    /// new connects fail until switched back on.
    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(Arc::new(RoomManager::default()))
    }
}

impl Transport for MemoryTransport {
    fn connect(
        &self,
        room: &RoomKey,
        hello: Frame,
    ) -> impl Future<Output = Result<Link, TransportError>> + Send {
        let rooms = self.rooms.clone();
        let mut online = self.online.subscribe();
        let key = room.to_string();
        async move {
            if !*online.borrow_and_update() {
                return Err(TransportError::Unreachable("offline".into()));
            }
            let info = hello.join_info()?;
            let client_id = hello.client_id;
            let relay_room = rooms.get_or_create(&key).await;
            let (mut broadcast_rx, catch_up) = match relay_room.join(client_id, info).await {
                Ok(joined) => joined,
                Err(e) => {
                    rooms.remove_if_empty(&key).await;
                    return Err(e.into());
                }
            };

            let (session, mut remote) = Link::pair(LINK_CAPACITY);
            let to_session = remote.outgoing;
            tokio::spawn(async move {
                if to_session.send(catch_up).await.is_ok() {
                    loop {
                        tokio::select! {
                            changed = online.changed() => {
                                if changed.is_err() || !*online.borrow_and_update() {
                                    break;
                                }
                            }
                            data = remote.incoming.recv() => match data {
                                Some(bytes) => {
                                    if let Err(e) = relay_room.handle_frame(client_id, bytes).await {
                                        log::warn!("Dropping frame from {client_id}: {e}");
                                    }
                                }
                                None => break,
                            },
                            out = broadcast_rx.recv() => match out {
                                Ok(frame) if frame.from == client_id => {}
                                Ok(frame) => {
                                    if to_session.send(frame.bytes.to_vec()).await.is_err() {
                                        break;
                                    }
                                }
                                Err(broadcast::error::RecvError::Lagged(n)) => {
                                    log::warn!("Peer {client_id} lagged by {n} frames");
                                }
                                Err(broadcast::error::RecvError::Closed) => break,
                            },
                        }
                    }
                }
                relay_room.leave(client_id).await;
                rooms.remove_if_empty(&key).await;
            });

            Ok(session)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JoinInfo, MessageType};
    use uuid::Uuid;

    fn hello(client_id: Uuid, name: &str) -> Frame {
        let info = JoinInfo {
            room: "studio-p1".into(),
            user_id: name.to_lowercase(),
            name: name.into(),
        };
        Frame::join(client_id, &info).unwrap()
    }

    #[test]
    fn test_offline_queue_order_and_overflow() {
        let mut queue = OfflineQueue::new(3);
        assert!(queue.enqueue(1, vec![1]));
        assert!(queue.enqueue(2, vec![2, 2]));
        assert_eq!(queue.total_bytes(), 3);

        assert!(queue.enqueue(3, vec![3]));
        assert!(!queue.enqueue(4, vec![4]));
        assert!(queue.is_empty());

        queue.enqueue(5, vec![5]);
        queue.enqueue(6, vec![6]);
        let clocks: Vec<u64> = queue.drain().into_iter().map(|(c, _)| c).collect();
        assert_eq!(clocks, vec![5, 6]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_ws_url() {
        let ws = WsTransport::new("ws://localhost:9090/");
        assert_eq!(
            ws.url_for(&RoomKey::for_project("p1")),
            "ws://localhost:9090/studio-p1"
        );
    }

    #[tokio::test]
    async fn test_memory_link_relays_between_peers() {
        let transport = MemoryTransport::default();
        let room = RoomKey::for_project("p1");
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let mut a = transport.connect(&room, hello(alice, "Alice")).await.unwrap();
        let first = Frame::decode(&a.incoming.recv().await.unwrap()).unwrap();
        assert_eq!(first.msg_type, MessageType::Snapshot);

        let mut b = transport.peer().connect(&room, hello(bob, "Bob")).await.unwrap();
        b.incoming.recv().await.unwrap(); // catch-up

        let joined = Frame::decode(&a.incoming.recv().await.unwrap()).unwrap();
        assert_eq!(joined.join_info().unwrap().name, "Bob");

        b.outgoing.send(Frame::leave(bob).encode().unwrap()).await.unwrap();
        let left = Frame::decode(&a.incoming.recv().await.unwrap()).unwrap();
        assert_eq!(left.msg_type, MessageType::Leave);
        assert_eq!(left.client_id, bob);
    }

    #[tokio::test]
    async fn test_memory_offline_closes_links() {
        let transport = MemoryTransport::default();
        let room = RoomKey::for_project("p1");
        let mut link = transport.connect(&room, hello(Uuid::new_v4(), "Alice")).await.unwrap();
        link.incoming.recv().await.unwrap();

        transport.set_online(false);
        assert!(link.incoming.recv().await.is_none());
        assert!(matches!(
            transport.connect(&room, hello(Uuid::new_v4(), "Alice")).await,
            Err(TransportError::Unreachable(_))
        ));

        transport.set_online(true);
        assert!(transport.connect(&room, hello(Uuid::new_v4(), "Alice")).await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_room_removed_after_last_leave() {
        let transport = MemoryTransport::default();
        let room = RoomKey::for_project("p1");
        let link = transport.connect(&room, hello(Uuid::new_v4(), "Alice")).await.unwrap();
        assert_eq!(transport.rooms().room_count().await, 1);

        drop(link);
        for _ in 0..100 {
            if transport.rooms().room_count().await == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(transport.rooms().room_count().await, 0);
    }
}

//! One collaboration instance: a project room joined as one local user.
//!
//! ```text
//!  SessionHandle (clone per caller)
//!        │ Command ─ mpsc ─┐
//!        ▼                 ▼
//!  ┌──────────────────────────────────────────────────────────┐
//!  │ actor task: tokio::select! over                          │
//!  │   commands · link frames · connect result ·              │
//!  │   reconnect timer · heartbeat ticker · resync ticker     │
//!  │                                                          │
//!  │   SessionCore (no I/O)                                   │
//!  │     Document · UndoManager · Awareness ·                 │
//!  │     ReconnectController · OfflineQueue                   │
//!  │        │ outbox (encoded frames)   │ events              │
//!  └────────┼───────────────────────────┼─────────────────────┘
//!           ▼                           ▼
//!       Link.outgoing          broadcast::Sender<SessionEvent>
//! ```
//!
//! Every state change happens on the actor task, so nothing is locked.
//! Local edits apply immediately whatever the connection state; while
//! offline their update frames wait in the offline queue.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::awareness::{
    Awareness, AwarenessChange, AwarenessUpdate, Cursor, DeviceClass, PresencePatch, UserPresence,
    HEARTBEAT_INTERVAL, OUTDATED_TIMEOUT,
};
use crate::document::{Actor, Applied, ChangeSet, Document, DocumentError, Op};
use crate::model::{
    ChatMessage, MasterPatch, MasterSettings, MixerPatch, MixerSettings, NewRegion, NewTrack,
    RegionKey, RegionPatch, Track, TrackPatch, TrackTimeline,
};
use crate::protocol::{Frame, JoinInfo, MessageType, ProtocolError, RoomKey};
use crate::reconnect::{BackoffPolicy, ConnectionState, ReconnectController};
use crate::scheduler::{Ticker, Timer};
use crate::transport::{Link, OfflineQueue, Transport, TransportError, WsTransport};
use crate::undo::{UndoManager, DEFAULT_CAPTURE_TIMEOUT, DEFAULT_MAX_DEPTH};

const COMMAND_CAPACITY: usize = 64;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay endpoint for [`CollabSession::connect_ws`]
    pub endpoint: String,
    pub backoff: BackoffPolicy,
    pub heartbeat_interval: Duration,
    /// How often the forced-resync condition is checked
    pub resync_check_interval: Duration,
    /// Minimum gap between two forced resyncs
    pub resync_min_gap: Duration,
    pub undo_capture_timeout: Duration,
    pub undo_max_depth: usize,
    /// Remote presence not refreshed within this window is dropped
    pub awareness_timeout: Duration,
    pub offline_queue_capacity: usize,
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:9090".to_string(),
            backoff: BackoffPolicy::default(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            resync_check_interval: Duration::from_secs(10),
            resync_min_gap: Duration::from_secs(5),
            undo_capture_timeout: DEFAULT_CAPTURE_TIMEOUT,
            undo_max_depth: DEFAULT_MAX_DEPTH,
            awareness_timeout: OUTDATED_TIMEOUT,
            offline_queue_capacity: 10_000,
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }
}

/// The already-authenticated local user.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalUser {
    pub user_id: String,
    pub name: String,
    pub device: DeviceClass,
}

impl LocalUser {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            device: DeviceClass::default(),
        }
    }

    pub fn device(mut self, device: DeviceClass) -> Self {
        self.device = device;
        self
    }
}

/// Everything a subscriber can observe. Document events fire for local and
/// remote changes alike.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    TracksChanged(Vec<String>),
    MixerChanged(Vec<String>),
    /// Track ids whose region lists changed
    TimelineChanged(Vec<String>),
    MasterChanged,
    MessageAppended(ChatMessage),
    UserJoined { client_id: Uuid, user: UserPresence },
    UserUpdated { client_id: Uuid, user: UserPresence },
    UserLeft { client_id: Uuid },
    ConnectionStatusChanged(ConnectionState),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// The session was destroyed (or every handle to it dropped).
    Destroyed,
    Document(DocumentError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Destroyed => write!(f, "Session destroyed"),
            Self::Document(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<DocumentError> for SessionError {
    fn from(e: DocumentError) -> Self {
        Self::Document(e)
    }
}

// ───────────────────────────────────────────────────────────────────
// Core
// ───────────────────────────────────────────────────────────────────

/// Session state machine without I/O. Produces encoded frames into an
/// outbox and events into a queue; the actor drains both.
pub struct SessionCore {
    client_id: Uuid,
    actor: Actor,
    room: RoomKey,
    doc: Document,
    undo: UndoManager,
    awareness: Awareness,
    reconnect: ReconnectController,
    offline: OfflineQueue,
    state: ConnectionState,
    awareness_timeout: Duration,
    outbox: Vec<Vec<u8>>,
    events: Vec<SessionEvent>,
}

impl SessionCore {
    pub fn new(project_id: &str, user: &LocalUser, config: &SessionConfig) -> Self {
        let client_id = Uuid::new_v4();
        Self {
            client_id,
            actor: Actor::new(user.user_id.clone(), user.name.clone()),
            room: RoomKey::for_project(project_id),
            doc: Document::new(client_id),
            undo: UndoManager::new(config.undo_capture_timeout, config.undo_max_depth),
            awareness: Awareness::new(client_id, &user.user_id, &user.name, user.device),
            reconnect: ReconnectController::new(config.backoff.clone(), config.resync_min_gap),
            offline: OfflineQueue::new(config.offline_queue_capacity),
            state: ConnectionState::Disconnected,
            awareness_timeout: config.awareness_timeout,
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn room(&self) -> &RoomKey {
        &self.room
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn awareness(&self) -> &Awareness {
        &self.awareness
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn pending_changes(&self) -> bool {
        self.reconnect.pending_changes()
    }

    pub fn offline_len(&self) -> usize {
        self.offline.len()
    }

    /// Remote users currently present, keyed by client id.
    pub fn active_users(&self) -> BTreeMap<Uuid, UserPresence> {
        self.awareness
            .remote_states()
            .map(|(id, state)| (*id, state.user.clone()))
            .collect()
    }

    /// Join frame opening every link.
    pub fn hello(&self) -> Result<Frame, ProtocolError> {
        Frame::join(
            self.client_id,
            &JoinInfo {
                room: self.room.to_string(),
                user_id: self.actor.user_id.clone(),
                name: self.actor.name.clone(),
            },
        )
    }

    // ── Local edits ──────────────────────────────────────────────

    pub fn edit(&mut self, op: Op, now: Instant) -> Result<(), DocumentError> {
        let applied = self.doc.apply_local(op, &self.actor)?;
        self.undo.capture(applied.undo.clone(), now);
        self.publish(applied)
    }

    /// Returns whether an undo item was consumed.
    pub fn undo(&mut self) -> Result<bool, DocumentError> {
        match self.undo.undo(&mut self.doc, &self.actor) {
            Some(applied) => self.publish(applied).map(|_| true),
            None => Ok(false),
        }
    }

    pub fn redo(&mut self) -> Result<bool, DocumentError> {
        match self.undo.redo(&mut self.doc, &self.actor) {
            Some(applied) => self.publish(applied).map(|_| true),
            None => Ok(false),
        }
    }

    /// Merge an out-of-band snapshot and share it with the room.
    pub fn import_snapshot(&mut self, bytes: &[u8]) -> Result<(), DocumentError> {
        let changes = self.doc.apply_remote(bytes)?;
        self.reconnect.mark_pending();
        if !changes.is_empty() {
            self.send_update(bytes.to_vec());
        }
        self.emit_changes(changes);
        Ok(())
    }

    pub fn export_snapshot(&self) -> Result<Vec<u8>, DocumentError> {
        self.doc.snapshot()
    }

    pub fn set_presence(&mut self, patch: PresencePatch) {
        let update = self.awareness.set_local_state(patch);
        self.send_awareness(update);
    }

    fn publish(&mut self, applied: Applied) -> Result<(), DocumentError> {
        if !applied.update.is_empty() {
            self.reconnect.mark_pending();
            let bytes = applied.update.encode()?;
            self.send_update(bytes);
        }
        self.emit_changes(applied.changes);
        Ok(())
    }

    // ── Outbound ─────────────────────────────────────────────────

    fn send_update(&mut self, bytes: Vec<u8>) {
        let clock = self.doc.clock();
        if self.state.is_connected() {
            self.push_frame(Frame::update(self.client_id, clock, bytes));
        } else if !self.offline.enqueue(clock, bytes) {
            self.reconnect.mark_pending();
        }
    }

    fn send_awareness(&mut self, update: AwarenessUpdate) {
        if !self.state.is_connected() {
            return;
        }
        match update.encode() {
            Ok(payload) => self.push_frame(Frame::awareness(self.client_id, payload)),
            Err(e) => log::warn!("Failed to encode presence: {e}"),
        }
    }

    fn send_snapshot(&mut self, now: Instant) {
        match self.doc.snapshot() {
            Ok(state) => {
                log::debug!("Forced resync of {} ({} bytes)", self.room, state.len());
                self.push_frame(Frame::snapshot(self.client_id, self.doc.clock(), state));
                self.reconnect.record_sync(now);
            }
            Err(e) => log::warn!("Failed to encode snapshot: {e}"),
        }
    }

    fn push_frame(&mut self, frame: Frame) {
        match frame.encode() {
            Ok(bytes) => self.outbox.push(bytes),
            Err(e) => log::warn!("Failed to encode {:?} frame: {e}", frame.msg_type),
        }
    }

    fn push_leave(&mut self) {
        match self.awareness.encode_removal() {
            Ok(payload) => self.push_frame(Frame::awareness(self.client_id, payload)),
            Err(e) => log::warn!("Failed to encode presence removal: {e}"),
        }
        self.push_frame(Frame::leave(self.client_id));
    }

    // ── Inbound ──────────────────────────────────────────────────

    /// Apply one frame from the link. Malformed input is logged and dropped.
    pub fn handle_frame(&mut self, bytes: &[u8], now: Instant) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping undecodable frame: {e}");
                return;
            }
        };
        if frame.client_id == self.client_id {
            return;
        }

        match frame.msg_type {
            MessageType::Update | MessageType::Snapshot => match self.doc.apply_remote(&frame.payload) {
                Ok(changes) => self.emit_changes(changes),
                Err(e) => log::warn!(
                    "Dropping {:?} from {}: {e}",
                    frame.msg_type,
                    frame.client_id
                ),
            },
            MessageType::Awareness => match AwarenessUpdate::decode(&frame.payload) {
                Ok(update) => {
                    let change = self.awareness.apply_update(update, now);
                    self.emit_presence(change);
                }
                Err(e) => log::warn!("Dropping presence from {}: {e}", frame.client_id),
            },
            MessageType::Join => {
                log::debug!("Client {} joined {}", frame.client_id, self.room);
                let update = self.awareness.renew();
                self.send_awareness(update);
            }
            MessageType::Leave => {
                let change = self.awareness.remove_states(&[frame.client_id]);
                self.emit_presence(change);
            }
        }
    }

    // ── Link lifecycle ───────────────────────────────────────────

    pub fn on_connecting(&mut self) {
        self.set_state(ConnectionState::Connecting);
    }

    /// Link up: resync if anything is pending, replay queued updates, and
    /// announce presence.
    pub fn on_connected(&mut self, now: Instant) {
        self.set_state(ConnectionState::Connected);
        if self.reconnect.on_connected() {
            self.send_snapshot(now);
        }
        let queued = self.offline.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued updates", queued.len());
        }
        for (clock, payload) in queued {
            self.push_frame(Frame::update(self.client_id, clock, payload));
        }
        let update = self.awareness.renew();
        self.send_awareness(update);
    }

    /// Link lost or connect failed. Returns the retry delay, `None` once
    /// the attempt budget is spent.
    pub fn on_link_lost(&mut self) -> Option<Duration> {
        let change = self.awareness.clear_remote();
        self.emit_presence(change);

        let attempt = self.reconnect.attempts();
        match self.reconnect.on_disconnected() {
            Some(delay) => {
                self.set_state(ConnectionState::Reconnecting { attempt, delay });
                Some(delay)
            }
            None => {
                self.set_state(ConnectionState::Exhausted);
                None
            }
        }
    }

    /// Manual disconnect: say goodbye while the link is still there.
    pub fn on_manual_disconnect(&mut self) {
        if self.state.is_connected() {
            self.push_leave();
        }
        self.reconnect.suspend();
        let change = self.awareness.clear_remote();
        self.emit_presence(change);
        self.set_state(ConnectionState::Disconnected);
    }

    pub fn reset_attempts(&mut self) {
        self.reconnect.reset();
    }

    pub fn mark_pending(&mut self) {
        self.reconnect.mark_pending();
    }

    /// Final flush: close the open undo item and leave the room.
    pub fn on_destroy(&mut self) {
        self.undo.stop_capturing();
        self.on_manual_disconnect();
    }

    // ── Timers ───────────────────────────────────────────────────

    pub fn heartbeat(&mut self, now: Instant) {
        let update = self.awareness.renew();
        self.send_awareness(update);
        let change = self.awareness.remove_outdated(now, self.awareness_timeout);
        self.emit_presence(change);
    }

    pub fn resync_check(&mut self, now: Instant) {
        if self.reconnect.should_resync(now) {
            self.send_snapshot(now);
        }
    }

    // ── Output ───────────────────────────────────────────────────

    pub fn take_outbox(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            log::info!("{}: {:?} -> {:?}", self.room, self.state, state);
            self.state = state;
            self.events.push(SessionEvent::ConnectionStatusChanged(state));
        }
    }

    fn emit_changes(&mut self, changes: ChangeSet) {
        if !changes.tracks.is_empty() {
            self.events
                .push(SessionEvent::TracksChanged(changes.tracks.into_iter().collect()));
        }
        if !changes.mixer.is_empty() {
            self.events
                .push(SessionEvent::MixerChanged(changes.mixer.into_iter().collect()));
        }
        if !changes.timeline.is_empty() {
            self.events
                .push(SessionEvent::TimelineChanged(changes.timeline.into_iter().collect()));
        }
        if changes.master {
            self.events.push(SessionEvent::MasterChanged);
        }
        for message in changes.messages {
            self.events.push(SessionEvent::MessageAppended(message));
        }
    }

    fn emit_presence(&mut self, change: AwarenessChange) {
        for client_id in change.added {
            if let Some(state) = self.awareness.remote_state(&client_id) {
                let user = state.user.clone();
                log::info!("{} joined {}", user.name, self.room);
                self.events.push(SessionEvent::UserJoined { client_id, user });
            }
        }
        for client_id in change.updated {
            if let Some(state) = self.awareness.remote_state(&client_id) {
                let user = state.user.clone();
                self.events.push(SessionEvent::UserUpdated { client_id, user });
            }
        }
        for client_id in change.removed {
            self.events.push(SessionEvent::UserLeft { client_id });
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Actor
// ───────────────────────────────────────────────────────────────────

type QueryFn = Box<dyn FnOnce(&SessionCore) + Send>;

enum Command {
    Edit {
        op: Op,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Undo(oneshot::Sender<Result<bool, SessionError>>),
    Redo(oneshot::Sender<Result<bool, SessionError>>),
    Presence {
        patch: PresencePatch,
        reply: oneshot::Sender<()>,
    },
    Query(QueryFn),
    Subscribe(oneshot::Sender<broadcast::Receiver<SessionEvent>>),
    Import {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Disconnect(oneshot::Sender<()>),
    Reconnect(oneshot::Sender<()>),
    Destroy(oneshot::Sender<()>),
}

/// The session actor. Construct with [`CollabSession::spawn`].
pub struct CollabSession<T: Transport> {
    core: SessionCore,
    transport: Arc<T>,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<SessionEvent>,
    link: Option<Link>,
    connecting: Option<JoinHandle<Result<Link, TransportError>>>,
    reconnect_timer: Timer,
    heartbeat: Ticker,
    resync: Ticker,
}

impl<T: Transport> CollabSession<T> {
    /// Start a session for `project_id` and begin connecting. Must be called
    /// from within a tokio runtime.
    pub fn spawn(project_id: &str, user: LocalUser, config: SessionConfig, transport: T) -> SessionHandle {
        let core = SessionCore::new(project_id, &user, &config);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let handle = SessionHandle {
            commands: command_tx,
            client_id: core.client_id(),
            room: core.room().clone(),
        };
        let session = Self {
            core,
            transport: Arc::new(transport),
            commands: command_rx,
            events,
            link: None,
            connecting: None,
            reconnect_timer: Timer::new(),
            heartbeat: Ticker::new(config.heartbeat_interval),
            resync: Ticker::new(config.resync_check_interval),
        };
        tokio::spawn(session.run());
        handle
    }

    async fn run(mut self) {
        log::info!(
            "Session {} started for {} in {}",
            self.core.client_id(),
            self.core.actor.user_id,
            self.core.room()
        );
        self.start_connect();
        self.flush();

        loop {
            let keep_running = tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        self.shutdown();
                        false
                    }
                },
                frame = recv_link(&mut self.link) => {
                    match frame {
                        Some(bytes) => self.core.handle_frame(&bytes, Instant::now()),
                        None => self.on_link_lost(),
                    }
                    true
                }
                result = join_connect(&mut self.connecting) => {
                    self.on_connect_result(result);
                    true
                }
                _ = self.reconnect_timer.fired() => {
                    self.start_connect();
                    true
                }
                _ = self.heartbeat.tick() => {
                    self.core.heartbeat(Instant::now());
                    true
                }
                _ = self.resync.tick() => {
                    self.core.resync_check(Instant::now());
                    true
                }
            };
            if !keep_running {
                break;
            }
            self.flush();
        }

        log::info!("Session {} destroyed", self.core.client_id());
    }

    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Edit { op, reply } => {
                let _ = reply.send(self.core.edit(op, Instant::now()).map_err(SessionError::from));
            }
            Command::Undo(reply) => {
                let _ = reply.send(self.core.undo().map_err(SessionError::from));
            }
            Command::Redo(reply) => {
                let _ = reply.send(self.core.redo().map_err(SessionError::from));
            }
            Command::Presence { patch, reply } => {
                self.core.set_presence(patch);
                let _ = reply.send(());
            }
            Command::Query(query) => query(&self.core),
            Command::Subscribe(reply) => {
                let _ = reply.send(self.events.subscribe());
            }
            Command::Import { bytes, reply } => {
                let _ = reply.send(self.core.import_snapshot(&bytes).map_err(SessionError::from));
            }
            Command::Disconnect(reply) => {
                self.disconnect();
                let _ = reply.send(());
            }
            Command::Reconnect(reply) => {
                self.reconnect();
                let _ = reply.send(());
            }
            Command::Destroy(reply) => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn start_connect(&mut self) {
        let hello = match self.core.hello() {
            Ok(hello) => hello,
            Err(e) => {
                log::error!("Cannot build join frame: {e}");
                return;
            }
        };
        self.core.on_connecting();
        let transport = self.transport.clone();
        let room = self.core.room().clone();
        self.connecting = Some(tokio::spawn(async move { transport.connect(&room, hello).await }));
    }

    fn on_connect_result(&mut self, result: Result<Link, TransportError>) {
        match result {
            Ok(link) => {
                self.link = Some(link);
                self.core.on_connected(Instant::now());
                self.heartbeat.start();
                self.resync.start();
            }
            Err(e) => {
                log::warn!("Connecting to {} failed: {e}", self.core.room());
                self.schedule_retry();
            }
        }
    }

    fn on_link_lost(&mut self) {
        log::info!("Link to {} lost", self.core.room());
        self.link = None;
        self.heartbeat.stop();
        self.resync.stop();
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        if let Some(delay) = self.core.on_link_lost() {
            self.reconnect_timer.schedule(delay);
        }
    }

    fn disconnect(&mut self) {
        self.reconnect_timer.cancel();
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        self.core.on_manual_disconnect();
        self.flush();
        self.link = None;
        self.heartbeat.stop();
        self.resync.stop();
    }

    fn reconnect(&mut self) {
        if self.link.is_some() || self.connecting.is_some() {
            return;
        }
        self.reconnect_timer.cancel();
        self.core.reset_attempts();
        self.start_connect();
    }

    fn shutdown(&mut self) {
        self.reconnect_timer.cancel();
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        self.core.on_destroy();
        self.flush();
        self.link = None;
        self.heartbeat.stop();
        self.resync.stop();
    }

    /// Hand queued frames to the link and events to subscribers.
    fn flush(&mut self) {
        for bytes in self.core.take_outbox() {
            let Some(link) = &self.link else {
                break;
            };
            match link.outgoing.try_send(bytes) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("Outgoing link full, frame dropped until next resync");
                    self.core.mark_pending();
                }
                // Closed: the incoming side reports the loss next.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        for event in self.core.take_events() {
            let _ = self.events.send(event);
        }
    }
}

impl CollabSession<WsTransport> {
    /// Start a session against the WebSocket relay at `config.endpoint`.
    pub fn connect_ws(project_id: &str, user: LocalUser, config: SessionConfig) -> SessionHandle {
        let transport = WsTransport::new(config.endpoint.clone());
        Self::spawn(project_id, user, config, transport)
    }
}

async fn recv_link(link: &mut Option<Link>) -> Option<Vec<u8>> {
    match link {
        Some(link) => link.incoming.recv().await,
        None => std::future::pending().await,
    }
}

async fn join_connect(
    task: &mut Option<JoinHandle<Result<Link, TransportError>>>,
) -> Result<Link, TransportError> {
    let Some(handle) = task.as_mut() else {
        return std::future::pending().await;
    };
    let joined = handle.await;
    *task = None;
    joined.unwrap_or_else(|e| Err(TransportError::Unreachable(e.to_string())))
}

// ───────────────────────────────────────────────────────────────────
// Handle
// ───────────────────────────────────────────────────────────────────

/// Cloneable front door to a running session. Every call returns
/// [`SessionError::Destroyed`] once the session is gone.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    client_id: Uuid,
    room: RoomKey,
}

impl SessionHandle {
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn room(&self) -> &RoomKey {
        &self.room
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SessionError::Destroyed)?;
        rx.await.map_err(|_| SessionError::Destroyed)
    }

    async fn edit(&self, op: Op) -> Result<(), SessionError> {
        self.request(|reply| Command::Edit { op, reply }).await?
    }

    /// Run a read-only closure against the session state.
    pub async fn query<R: Send + 'static>(
        &self,
        f: impl FnOnce(&SessionCore) -> R + Send + 'static,
    ) -> Result<R, SessionError> {
        self.request(|reply| {
            Command::Query(Box::new(move |core: &SessionCore| {
                let _ = reply.send(f(core));
            }))
        })
        .await
    }

    // ── Edits ────────────────────────────────────────────────────

    /// Add a track (and its default mixer entry). Returns the track id.
    pub async fn add_track(&self, mut track: NewTrack) -> Result<String, SessionError> {
        let id = track
            .id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        self.edit(Op::AddTrack(track)).await?;
        Ok(id)
    }

    pub async fn update_track(&self, id: &str, patch: TrackPatch) -> Result<(), SessionError> {
        self.edit(Op::UpdateTrack { id: id.to_string(), patch }).await
    }

    pub async fn remove_track(&self, id: &str) -> Result<(), SessionError> {
        self.edit(Op::RemoveTrack { id: id.to_string() }).await
    }

    pub async fn update_mixer(&self, track_id: &str, patch: MixerPatch) -> Result<(), SessionError> {
        self.edit(Op::UpdateMixer { track_id: track_id.to_string(), patch }).await
    }

    pub async fn update_master(&self, patch: MasterPatch) -> Result<(), SessionError> {
        self.edit(Op::UpdateMaster(patch)).await
    }

    pub async fn add_region(&self, track_id: &str, mut region: NewRegion) -> Result<RegionKey, SessionError> {
        let region_id = region
            .id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        self.edit(Op::AddRegion { track_id: track_id.to_string(), region }).await?;
        Ok(RegionKey::new(track_id, region_id))
    }

    pub async fn update_region(&self, key: RegionKey, patch: RegionPatch) -> Result<(), SessionError> {
        self.edit(Op::UpdateRegion { key, patch }).await
    }

    pub async fn remove_region(&self, key: RegionKey) -> Result<(), SessionError> {
        self.edit(Op::RemoveRegion { key }).await
    }

    pub async fn send_message(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.edit(Op::SendMessage { text: text.into() }).await
    }

    /// Revert the latest local undo item. `Ok(false)` when there was none.
    pub async fn undo(&self) -> Result<bool, SessionError> {
        self.request(Command::Undo).await?
    }

    pub async fn redo(&self) -> Result<bool, SessionError> {
        self.request(Command::Redo).await?
    }

    pub async fn import_snapshot(&self, bytes: Vec<u8>) -> Result<(), SessionError> {
        self.request(|reply| Command::Import { bytes, reply }).await?
    }

    // ── Reads ────────────────────────────────────────────────────

    pub async fn tracks(&self) -> Result<BTreeMap<String, Track>, SessionError> {
        self.query(|core| core.document().tracks()).await
    }

    pub async fn mixer(&self) -> Result<BTreeMap<String, MixerSettings>, SessionError> {
        self.query(|core| core.document().mixer()).await
    }

    pub async fn timeline(&self) -> Result<BTreeMap<String, TrackTimeline>, SessionError> {
        self.query(|core| core.document().timeline()).await
    }

    pub async fn master(&self) -> Result<MasterSettings, SessionError> {
        self.query(|core| core.document().master()).await
    }

    pub async fn messages(&self) -> Result<Vec<ChatMessage>, SessionError> {
        self.query(|core| core.document().messages()).await
    }

    pub async fn document_json(&self) -> Result<serde_json::Value, SessionError> {
        self.query(|core| core.document().to_json()).await?.map_err(SessionError::from)
    }

    pub async fn export_snapshot(&self) -> Result<Vec<u8>, SessionError> {
        self.query(|core| core.export_snapshot()).await?.map_err(SessionError::from)
    }

    pub async fn active_users(&self) -> Result<BTreeMap<Uuid, UserPresence>, SessionError> {
        self.query(|core| core.active_users()).await
    }

    pub async fn connection_state(&self) -> Result<ConnectionState, SessionError> {
        self.query(|core| core.connection_state()).await
    }

    pub async fn pending_changes(&self) -> Result<bool, SessionError> {
        self.query(|core| core.pending_changes()).await
    }

    /// Receive every subsequent [`SessionEvent`].
    pub async fn subscribe(&self) -> Result<broadcast::Receiver<SessionEvent>, SessionError> {
        self.request(Command::Subscribe).await
    }

    // ── Presence ─────────────────────────────────────────────────

    pub async fn set_cursor(&self, cursor: Option<Cursor>) -> Result<(), SessionError> {
        let patch = PresencePatch::cursor(cursor);
        self.request(|reply| Command::Presence { patch, reply }).await
    }

    pub async fn set_active_track(&self, track_id: Option<String>) -> Result<(), SessionError> {
        let patch = PresencePatch::active_track(track_id);
        self.request(|reply| Command::Presence { patch, reply }).await
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Leave the room and stop retrying until [`reconnect`](Self::reconnect).
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(Command::Disconnect).await
    }

    /// Connect now with a fresh attempt budget. No-op while connected or
    /// already connecting.
    pub async fn reconnect(&self) -> Result<(), SessionError> {
        self.request(Command::Reconnect).await
    }

    /// Flush the open undo item, leave the room, stop every timer and close
    /// all subscriptions.
    pub async fn destroy(&self) -> Result<(), SessionError> {
        self.request(Command::Destroy).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::PresenceState;

    fn core(user: &str) -> SessionCore {
        SessionCore::new("p1", &LocalUser::new(user, user), &SessionConfig::default())
    }

    fn frame_types(outbox: &[Vec<u8>]) -> Vec<MessageType> {
        outbox.iter().map(|b| Frame::decode(b).unwrap().msg_type).collect()
    }

    /// Deliver every queued frame from `from` to `to`.
    fn deliver(from: &mut SessionCore, to: &mut SessionCore) {
        for bytes in from.take_outbox() {
            to.handle_frame(&bytes, Instant::now());
        }
    }

    fn connected(user: &str) -> SessionCore {
        let mut c = core(user);
        c.on_connecting();
        c.on_connected(Instant::now());
        c.take_outbox();
        c.take_events();
        c
    }

    #[test]
    fn test_offline_edits_replay_after_resync() {
        let mut c = core("alice");
        c.edit(Op::AddTrack(NewTrack::named("Vocal").with_id("t1")), Instant::now())
            .unwrap();
        assert!(c.take_outbox().is_empty());
        assert_eq!(c.offline_len(), 1);
        assert!(c.pending_changes());

        c.on_connected(Instant::now());
        assert_eq!(
            frame_types(&c.take_outbox()),
            vec![MessageType::Snapshot, MessageType::Update, MessageType::Awareness]
        );
        assert_eq!(c.offline_len(), 0);
        assert!(!c.pending_changes());
    }

    #[test]
    fn test_remote_join_republishes_presence() {
        let mut c = connected("alice");
        let other = core("bob");
        c.handle_frame(&other.hello().unwrap().encode().unwrap(), Instant::now());
        assert_eq!(frame_types(&c.take_outbox()), vec![MessageType::Awareness]);
    }

    #[test]
    fn test_link_loss_drops_remote_presence() {
        let mut a = connected("alice");
        let mut b = connected("bob");
        b.set_presence(PresencePatch::active_track(Some("t1".into())));
        deliver(&mut b, &mut a);

        let events = a.take_events();
        assert!(matches!(
            &events[..],
            [SessionEvent::UserJoined { user, .. }] if user.active_track.as_deref() == Some("t1")
        ));
        assert_eq!(a.active_users().len(), 1);

        assert_eq!(a.on_link_lost(), Some(Duration::from_millis(1000)));
        assert_eq!(
            a.take_events(),
            vec![
                SessionEvent::UserLeft { client_id: b.client_id() },
                SessionEvent::ConnectionStatusChanged(ConnectionState::Reconnecting {
                    attempt: 0,
                    delay: Duration::from_millis(1000),
                }),
            ]
        );
        assert!(a.active_users().is_empty());
    }

    #[test]
    fn test_malformed_frames_dropped() {
        let mut c = connected("alice");
        c.handle_frame(&[1, 2, 3], Instant::now());
        let bogus = Frame::update(Uuid::new_v4(), 1, vec![0xFF; 8]).encode().unwrap();
        c.handle_frame(&bogus, Instant::now());
        assert!(c.take_events().is_empty());
        assert!(c.document().tracks().is_empty());
    }

    #[test]
    fn test_undo_never_reverts_remote_edit() {
        let mut a = connected("alice");
        let mut b = connected("bob");
        let t0 = Instant::now();

        a.edit(Op::AddTrack(NewTrack::named("Vocal").with_id("t1")), t0).unwrap();
        deliver(&mut a, &mut b);
        b.edit(Op::UpdateTrack { id: "t1".into(), patch: TrackPatch::rename("Lead Vox") }, t0)
            .unwrap();
        deliver(&mut b, &mut a);

        assert!(a.undo().unwrap());
        assert_eq!(a.document().track("t1").unwrap().name, "Lead Vox");
        assert!(a.take_outbox().is_empty());
    }

    #[test]
    fn test_manual_disconnect_says_goodbye() {
        let mut c = connected("alice");
        c.on_manual_disconnect();
        assert_eq!(
            frame_types(&c.take_outbox()),
            vec![MessageType::Awareness, MessageType::Leave]
        );
        assert_eq!(c.connection_state(), ConnectionState::Disconnected);
        assert!(c.pending_changes());
    }

    #[test]
    fn test_destroy_closes_open_undo_item() {
        let mut c = connected("alice");
        let t0 = Instant::now();
        c.edit(Op::AddTrack(NewTrack::named("Vocal").with_id("t1")), t0).unwrap();
        c.on_destroy();

        // Inside the coalescing window, but the destroy already sealed the item.
        c.edit(
            Op::UpdateTrack { id: "t1".into(), patch: TrackPatch::rename("Lead Vox") },
            t0 + Duration::from_millis(10),
        )
        .unwrap();
        assert!(c.undo().unwrap());
        assert_eq!(c.document().track("t1").unwrap().name, "Vocal");
        assert!(c.undo().unwrap());
        assert!(c.document().track("t1").is_none());
    }

    #[test]
    fn test_heartbeat_expires_silent_peers() {
        let mut a = connected("alice");
        let b = core("bob");
        let t0 = Instant::now();
        let presence = AwarenessUpdate {
            entries: vec![crate::awareness::AwarenessEntry {
                client_id: b.client_id(),
                clock: 1,
                state: Some(PresenceState { user: b.awareness().local_state().user.clone() }),
            }],
        };
        let frame = Frame::awareness(b.client_id(), presence.encode().unwrap());
        a.handle_frame(&frame.encode().unwrap(), t0);
        a.take_events();

        a.heartbeat(t0 + OUTDATED_TIMEOUT);
        assert_eq!(frame_types(&a.take_outbox()), vec![MessageType::Awareness]);
        assert_eq!(a.take_events(), vec![SessionEvent::UserLeft { client_id: b.client_id() }]);
    }

    #[test]
    fn test_resync_check_sends_snapshot_when_pending() {
        let mut c = connected("alice");
        let t0 = Instant::now();
        c.resync_check(t0);
        assert!(c.take_outbox().is_empty());

        c.edit(Op::UpdateMaster(MasterPatch::volume(0.5)), t0).unwrap();
        c.take_outbox();
        c.resync_check(t0);
        assert_eq!(frame_types(&c.take_outbox()), vec![MessageType::Snapshot]);
        assert!(!c.pending_changes());
    }
}

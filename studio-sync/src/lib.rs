//! # studio-sync — Real-time state sync for collaborative audio projects
//!
//! Every participant holds a full replica of the project document (tracks,
//! mixer, timeline, master bus, chat). Edits apply locally at once and are
//! shipped as compact deltas; replicas converge by last-writer-wins on
//! Lamport stamps, so delivery order and duplication do not matter.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   Frame (bincode)   ┌──────────────────┐
//! │ CollabSession    │ ◄─────────────────► │ RelayServer      │
//! │ (actor per user) │   WebSocket or      │ RoomManager      │
//! └────────┬─────────┘   in-memory Link    │  └─ RelayRoom    │
//!          │                               │      replica +   │
//!          ▼                               │  BroadcastGroup  │
//! ┌──────────────────┐                     └──────────────────┘
//! │ SessionCore      │
//! │  Document        │ LwwMap / LwwRegister / AppendLog
//! │  UndoManager     │ local-origin only
//! │  Awareness       │ ephemeral presence
//! │  Reconnect       │ backoff + forced resync
//! │  OfflineQueue    │
//! └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`clock`] — Lamport stamps
//! - [`crdt`] — last-writer-wins containers
//! - [`model`] — track, mixer, region, master and chat records
//! - [`document`] — the shared project document and its delta encoding
//! - [`undo`] — per-user undo/redo with capture coalescing
//! - [`awareness`] — presence states and heartbeat expiry
//! - [`protocol`] — wire frames and room keys
//! - [`reconnect`] — backoff policy and connection state machine
//! - [`scheduler`] — cancelable timers
//! - [`broadcast`] — room fan-out
//! - [`transport`] — WebSocket and in-memory links, offline queue
//! - [`relay`] — room relay server
//! - [`session`] — the collaboration session actor and its handle

pub mod clock;
pub mod crdt;
pub mod model;
pub mod document;
pub mod undo;
pub mod awareness;
pub mod protocol;
pub mod reconnect;
pub mod scheduler;
pub mod broadcast;
pub mod transport;
pub mod relay;
pub mod session;

// Re-exports for convenience
pub use awareness::{
    color_for_user, Awareness, AwarenessChange, AwarenessUpdate, Cursor, DeviceClass,
    PresencePatch, PresenceState, UserPresence,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, Outbound};
pub use clock::{LamportClock, Stamp};
pub use document::{Actor, ChangeSet, Document, DocumentError, DocumentView, Op, Update};
pub use model::{
    ChatMessage, ExtValue, Extensions, MasterPatch, MasterSettings, MixerPatch, MixerSettings,
    NewRegion, NewTrack, Region, RegionKey, RegionPatch, Track, TrackKind, TrackPatch,
    TrackTimeline,
};
pub use protocol::{Frame, JoinInfo, MessageType, ProtocolError, RoomKey};
pub use reconnect::{BackoffPolicy, ConnectionState, ReconnectController};
pub use relay::{RelayConfig, RelayError, RelayRoom, RelayServer, RelayStats, RoomManager};
pub use session::{
    CollabSession, LocalUser, SessionConfig, SessionCore, SessionError, SessionEvent,
    SessionHandle,
};
pub use transport::{Link, MemoryTransport, OfflineQueue, Transport, TransportError, WsTransport};
pub use undo::UndoManager;

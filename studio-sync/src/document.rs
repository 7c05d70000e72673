//! Replicated project document.
//!
//! Five containers, each replicated independently:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Document (one per project room)                          │
//! │                                                          │
//! │  tracks    LwwMap<track_id, Track>                       │
//! │  mixer     LwwMap<track_id, MixerSettings>               │
//! │  timeline  LwwMap<(track_id, region_id), Region>         │
//! │  master    LwwRegister<MasterSettings>                   │
//! │  messages  AppendLog<ChatMessage>                        │
//! └──────────────────────────────────────────────────────────┘
//!        │ apply_local(op)              ▲ apply_remote(bytes)
//!        ▼                              │
//!   Update { deltas } ── bincode + LZ4 ─┘
//! ```
//!
//! An update frame is just a list of stamped entries, so a full snapshot
//! has the same shape as an incremental one and merging either is the same
//! operation. Track removal touches `tracks`, `mixer` and `timeline` as
//! independent entries; a peer may briefly observe a mixer entry without its
//! track until all of them arrive.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::clock::{LamportClock, Stamp};
use crate::crdt::{AppendLog, LwwMap, LwwRegister, Versioned};
use crate::model::{
    now_millis, ChatMessage, MasterPatch, MasterSettings, MixerPatch, MixerSettings, NewRegion,
    NewTrack, Region, RegionKey, RegionPatch, Sender, Track, TrackPatch, TrackTimeline,
};

/// Upper bound on a decompressed update, checked before allocating.
const MAX_UPDATE_BYTES: usize = 64 * 1024 * 1024;

/// Who is performing a local edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub name: String,
}

impl Actor {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
        }
    }
}

/// A local mutation request.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    AddTrack(NewTrack),
    UpdateTrack { id: String, patch: TrackPatch },
    RemoveTrack { id: String },
    UpdateMixer { track_id: String, patch: MixerPatch },
    UpdateMaster(MasterPatch),
    AddRegion { track_id: String, region: NewRegion },
    UpdateRegion { key: RegionKey, patch: RegionPatch },
    RemoveRegion { key: RegionKey },
    SendMessage { text: String },
}

/// One replicated entry inside an update frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Delta {
    Track { id: String, entry: Versioned<Track> },
    Mixer { id: String, entry: Versioned<MixerSettings> },
    Region { key: RegionKey, entry: Versioned<Region> },
    Master { entry: Versioned<MasterSettings> },
    Message { stamp: Stamp, message: ChatMessage },
}

/// Decoded update frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub deltas: Vec<Delta>,
}

impl Update {
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Serialize to the opaque wire form (bincode, then LZ4 with size prefix).
    pub fn encode(&self) -> Result<Vec<u8>, DocumentError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| DocumentError::Encode(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DocumentError> {
        let declared = bytes
            .get(..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
            .ok_or_else(|| DocumentError::Decode("truncated update header".into()))?;
        if declared > MAX_UPDATE_BYTES {
            return Err(DocumentError::Decode(format!(
                "declared update size {declared} exceeds limit"
            )));
        }
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| DocumentError::Decode(e.to_string()))?;
        let (update, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| DocumentError::Decode(e.to_string()))?;
        Ok(update)
    }
}

/// Keys touched by an apply, for incremental re-rendering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub tracks: BTreeSet<String>,
    pub mixer: BTreeSet<String>,
    /// Track ids whose region lists changed.
    pub timeline: BTreeSet<String>,
    pub master: bool,
    /// Newly appended chat entries, in log order.
    pub messages: Vec<ChatMessage>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
            && self.mixer.is_empty()
            && self.timeline.is_empty()
            && !self.master
            && self.messages.is_empty()
    }

    pub fn extend(&mut self, other: ChangeSet) {
        self.tracks.extend(other.tracks);
        self.mixer.extend(other.mixer);
        self.timeline.extend(other.timeline);
        self.master |= other.master;
        self.messages.extend(other.messages);
    }
}

/// Prior value of one undoable key, plus the stamp the edit wrote.
#[derive(Debug, Clone, PartialEq)]
pub enum UndoRecord {
    Track { id: String, before: Option<Track>, stamp: Stamp },
    Region { key: RegionKey, before: Option<Region>, stamp: Stamp },
}

/// Identity of the key an [`UndoRecord`] refers to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum UndoKey {
    Track(String),
    Region(RegionKey),
}

impl UndoRecord {
    pub fn key(&self) -> UndoKey {
        match self {
            UndoRecord::Track { id, .. } => UndoKey::Track(id.clone()),
            UndoRecord::Region { key, .. } => UndoKey::Region(key.clone()),
        }
    }

    pub fn stamp(&self) -> Stamp {
        match self {
            UndoRecord::Track { stamp, .. } | UndoRecord::Region { stamp, .. } => *stamp,
        }
    }

    /// Fold a later edit of the same key in: keep our `before`, take its stamp.
    pub(crate) fn absorb(&mut self, later: &UndoRecord) {
        let latest = later.stamp();
        match self {
            UndoRecord::Track { stamp, .. } | UndoRecord::Region { stamp, .. } => *stamp = latest,
        }
    }
}

/// Result of a local edit.
#[derive(Debug, Clone, Default)]
pub struct Applied {
    pub update: Update,
    pub changes: ChangeSet,
    /// Undo information for `tracks`/`timeline` writes only.
    pub undo: Vec<UndoRecord>,
}

impl Applied {
    pub fn encode(&self) -> Result<Vec<u8>, DocumentError> {
        self.update.encode()
    }
}

/// Document errors.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentError {
    Encode(String),
    Decode(String),
    UnknownTrack(String),
    DuplicateTrack(String),
    UnknownRegion(RegionKey),
    InvalidRegion { start: f64, end: f64 },
    /// Volume or pan that is NaN or infinite.
    InvalidLevel { field: &'static str, value: f32 },
    EmptyMessage,
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "Update encode error: {e}"),
            Self::Decode(e) => write!(f, "Update decode error: {e}"),
            Self::UnknownTrack(id) => write!(f, "Unknown track: {id}"),
            Self::DuplicateTrack(id) => write!(f, "Track already exists: {id}"),
            Self::UnknownRegion(key) => {
                write!(f, "Unknown region {} on track {}", key.region_id, key.track_id)
            }
            Self::InvalidRegion { start, end } => {
                write!(f, "Invalid region span: start {start} > end {end}")
            }
            Self::InvalidLevel { field, value } => write!(f, "Invalid {field}: {value}"),
            Self::EmptyMessage => write!(f, "Chat message is empty"),
        }
    }
}

impl std::error::Error for DocumentError {}

/// JSON-shaped read view of the whole document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentView {
    pub tracks: BTreeMap<String, Track>,
    pub mixer: BTreeMap<String, MixerSettings>,
    pub timeline: BTreeMap<String, TrackTimeline>,
    pub master: MasterSettings,
    pub messages: Vec<ChatMessage>,
}

/// One replica of the shared project state.
pub struct Document {
    clock: LamportClock,
    tracks: LwwMap<String, Track>,
    mixer: LwwMap<String, MixerSettings>,
    timeline: LwwMap<RegionKey, Region>,
    master: LwwRegister<MasterSettings>,
    messages: AppendLog<ChatMessage>,
}

impl Document {
    /// Create an empty replica identified by `replica`.
    pub fn new(replica: Uuid) -> Self {
        Self {
            clock: LamportClock::new(replica),
            tracks: LwwMap::new(),
            mixer: LwwMap::new(),
            timeline: LwwMap::new(),
            master: LwwRegister::new(),
            messages: AppendLog::new(),
        }
    }

    pub fn replica(&self) -> Uuid {
        self.clock.replica()
    }

    /// Current Lamport counter.
    pub fn clock(&self) -> u64 {
        self.clock.counter()
    }

    // ── Local edits ──────────────────────────────────────────────

    /// Apply a local mutation and return the update to broadcast.
    pub fn apply_local(&mut self, op: Op, actor: &Actor) -> Result<Applied, DocumentError> {
        let mut applied = Applied::default();
        let now = now_millis();

        match op {
            Op::AddTrack(new) => {
                let id = new.id.unwrap_or_else(|| Uuid::new_v4().to_string());
                if self.tracks.contains(&id) {
                    return Err(DocumentError::DuplicateTrack(id));
                }
                let track = Track {
                    id: id.clone(),
                    name: new.name,
                    kind: new.kind,
                    source: new.source,
                    created_by: actor.user_id.clone(),
                    created_at: now,
                    updated_by: actor.user_id.clone(),
                    updated_at: now,
                    extensions: new.extensions,
                };
                self.write_track(&mut applied, id.clone(), Some(track));
                if !self.mixer.contains(&id) {
                    self.write_mixer(&mut applied, id, Some(MixerSettings::default()));
                }
            }

            Op::UpdateTrack { id, patch } => {
                let mut track = self
                    .tracks
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| DocumentError::UnknownTrack(id.clone()))?;
                patch.apply(&mut track);
                track.updated_by = actor.user_id.clone();
                track.updated_at = now;
                self.write_track(&mut applied, id, Some(track));
            }

            Op::RemoveTrack { id } => {
                if !self.tracks.contains(&id) {
                    return Err(DocumentError::UnknownTrack(id));
                }
                self.write_track(&mut applied, id.clone(), None);
                if self.mixer.contains(&id) {
                    self.write_mixer(&mut applied, id.clone(), None);
                }
                let regions: Vec<RegionKey> = self
                    .timeline
                    .iter()
                    .filter(|(k, _)| k.track_id == id)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in regions {
                    self.write_region(&mut applied, key, None);
                }
            }

            Op::UpdateMixer { track_id, patch } => {
                if !self.tracks.contains(&track_id) && !self.mixer.contains(&track_id) {
                    return Err(DocumentError::UnknownTrack(track_id));
                }
                check_level("volume", patch.volume)?;
                check_level("pan", patch.pan)?;
                let mut mixer = self.mixer.get(&track_id).cloned().unwrap_or_default();
                patch.apply(&mut mixer);
                self.write_mixer(&mut applied, track_id, Some(mixer));
            }

            Op::UpdateMaster(patch) => {
                check_level("volume", patch.volume)?;
                let mut master = self.master.get().cloned().unwrap_or_default();
                patch.apply(&mut master);
                master.updated_by = Some(actor.user_id.clone());
                master.updated_at = Some(now);
                let stamp = self.clock.tick();
                self.master.set(master.clone(), stamp);
                applied.update.deltas.push(Delta::Master {
                    entry: Versioned::live(stamp, master),
                });
                applied.changes.master = true;
            }

            Op::AddRegion { track_id, region } => {
                if !self.tracks.contains(&track_id) {
                    return Err(DocumentError::UnknownTrack(track_id));
                }
                check_span(region.start, region.end)?;
                let region_id = region.id.unwrap_or_else(|| Uuid::new_v4().to_string());
                let record = Region {
                    id: region_id.clone(),
                    start: region.start,
                    end: region.end,
                    color: region.color,
                    label: region.label,
                    created_by: actor.user_id.clone(),
                    created_at: now,
                    updated_by: actor.user_id.clone(),
                    updated_at: now,
                };
                self.write_region(&mut applied, RegionKey::new(track_id, region_id), Some(record));
            }

            Op::UpdateRegion { key, patch } => {
                let mut region = self
                    .timeline
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| DocumentError::UnknownRegion(key.clone()))?;
                patch.apply(&mut region);
                check_span(region.start, region.end)?;
                region.updated_by = actor.user_id.clone();
                region.updated_at = now;
                self.write_region(&mut applied, key, Some(region));
            }

            Op::RemoveRegion { key } => {
                if !self.timeline.contains(&key) {
                    return Err(DocumentError::UnknownRegion(key));
                }
                self.write_region(&mut applied, key, None);
            }

            Op::SendMessage { text } => {
                if text.trim().is_empty() {
                    return Err(DocumentError::EmptyMessage);
                }
                let stamp = self.clock.tick();
                let message = ChatMessage {
                    id: Uuid::new_v4().to_string(),
                    sender: Sender {
                        id: actor.user_id.clone(),
                        name: actor.name.clone(),
                    },
                    text,
                    timestamp: now,
                };
                self.messages.insert(stamp, message.clone());
                applied.update.deltas.push(Delta::Message {
                    stamp,
                    message: message.clone(),
                });
                applied.changes.messages.push(message);
            }
        }

        Ok(applied)
    }

    /// Restore the `before` values of captured records as a new local edit.
    ///
    /// Keys whose current stamp differs from the record's stamp were written
    /// by someone else since (or already reverted) and are left untouched.
    pub fn revert(&mut self, records: &[UndoRecord], actor: &Actor) -> Applied {
        let mut applied = Applied::default();
        let now = now_millis();

        for record in records {
            match record {
                UndoRecord::Track { id, before, stamp } => {
                    if self.tracks.entry(id).map(|e| e.stamp) != Some(*stamp) {
                        continue;
                    }
                    let restored = before.clone().map(|mut t| {
                        t.updated_by = actor.user_id.clone();
                        t.updated_at = now;
                        t
                    });
                    let live = restored.is_some();
                    self.write_track(&mut applied, id.clone(), restored);
                    // Keep every live track paired with a mixer entry.
                    if live && !self.mixer.contains(id) {
                        self.write_mixer(&mut applied, id.clone(), Some(MixerSettings::default()));
                    } else if !live && self.mixer.contains(id) {
                        self.write_mixer(&mut applied, id.clone(), None);
                    }
                }
                UndoRecord::Region { key, before, stamp } => {
                    if self.timeline.entry(key).map(|e| e.stamp) != Some(*stamp) {
                        continue;
                    }
                    let restored = before.clone().map(|mut r| {
                        r.updated_by = actor.user_id.clone();
                        r.updated_at = now;
                        r
                    });
                    self.write_region(&mut applied, key.clone(), restored);
                }
            }
        }

        applied
    }

    fn write_track(&mut self, applied: &mut Applied, id: String, value: Option<Track>) {
        let stamp = self.clock.tick();
        let prev = match &value {
            Some(track) => self.tracks.set(id.clone(), track.clone(), stamp),
            None => self.tracks.remove(id.clone(), stamp),
        };
        applied.undo.push(UndoRecord::Track {
            id: id.clone(),
            before: prev.and_then(|e| e.value),
            stamp,
        });
        applied.update.deltas.push(Delta::Track {
            id: id.clone(),
            entry: Versioned { stamp, value },
        });
        applied.changes.tracks.insert(id);
    }

    fn write_mixer(&mut self, applied: &mut Applied, id: String, value: Option<MixerSettings>) {
        let stamp = self.clock.tick();
        match &value {
            Some(mixer) => self.mixer.set(id.clone(), mixer.clone(), stamp),
            None => self.mixer.remove(id.clone(), stamp),
        };
        applied.update.deltas.push(Delta::Mixer {
            id: id.clone(),
            entry: Versioned { stamp, value },
        });
        applied.changes.mixer.insert(id);
    }

    fn write_region(&mut self, applied: &mut Applied, key: RegionKey, value: Option<Region>) {
        let stamp = self.clock.tick();
        let prev = match &value {
            Some(region) => self.timeline.set(key.clone(), region.clone(), stamp),
            None => self.timeline.remove(key.clone(), stamp),
        };
        applied.undo.push(UndoRecord::Region {
            key: key.clone(),
            before: prev.and_then(|e| e.value),
            stamp,
        });
        applied.changes.timeline.insert(key.track_id.clone());
        applied.update.deltas.push(Delta::Region {
            key,
            entry: Versioned { stamp, value },
        });
    }

    // ── Remote merge ─────────────────────────────────────────────

    /// Merge an encoded update (incremental or snapshot) from a peer.
    ///
    /// Decoding happens before any state is touched, so a malformed frame
    /// leaves the replica unchanged.
    pub fn apply_remote(&mut self, bytes: &[u8]) -> Result<ChangeSet, DocumentError> {
        let update = Update::decode(bytes)?;
        Ok(self.apply_update(update))
    }

    /// Merge a decoded update. Never fails.
    pub fn apply_update(&mut self, update: Update) -> ChangeSet {
        let mut changes = ChangeSet::default();

        for delta in update.deltas {
            match delta {
                Delta::Track { id, entry } => {
                    self.clock.observe(entry.stamp);
                    if self.tracks.merge(id.clone(), entry) {
                        changes.tracks.insert(id);
                    }
                }
                Delta::Mixer { id, entry } => {
                    self.clock.observe(entry.stamp);
                    if self.mixer.merge(id.clone(), entry) {
                        changes.mixer.insert(id);
                    }
                }
                Delta::Region { key, entry } => {
                    self.clock.observe(entry.stamp);
                    let track_id = key.track_id.clone();
                    if self.timeline.merge(key, entry) {
                        changes.timeline.insert(track_id);
                    }
                }
                Delta::Master { entry } => {
                    self.clock.observe(entry.stamp);
                    if self.master.merge(entry) {
                        changes.master = true;
                    }
                }
                Delta::Message { stamp, message } => {
                    self.clock.observe(stamp);
                    if self.messages.insert(stamp, message.clone()) {
                        changes.messages.push(message);
                    }
                }
            }
        }

        changes
    }

    // ── Snapshots ────────────────────────────────────────────────

    /// Every entry (tombstones included) as one update.
    pub fn snapshot_update(&self) -> Update {
        let mut deltas = Vec::new();
        for (id, entry) in self.tracks.entries() {
            deltas.push(Delta::Track { id: id.clone(), entry: entry.clone() });
        }
        for (id, entry) in self.mixer.entries() {
            deltas.push(Delta::Mixer { id: id.clone(), entry: entry.clone() });
        }
        for (key, entry) in self.timeline.entries() {
            deltas.push(Delta::Region { key: key.clone(), entry: entry.clone() });
        }
        if let Some(entry) = self.master.entry() {
            deltas.push(Delta::Master { entry: entry.clone() });
        }
        for (stamp, message) in self.messages.iter() {
            deltas.push(Delta::Message { stamp: *stamp, message: message.clone() });
        }
        Update { deltas }
    }

    /// Encoded full state, sufficient to rebuild the replica without history.
    pub fn snapshot(&self) -> Result<Vec<u8>, DocumentError> {
        self.snapshot_update().encode()
    }

    /// Replace local state with an encoded snapshot.
    pub fn load_snapshot(&mut self, bytes: &[u8]) -> Result<ChangeSet, DocumentError> {
        let update = Update::decode(bytes)?;
        let mut changes = self.everything();
        self.tracks.clear();
        self.mixer.clear();
        self.timeline.clear();
        self.master.clear();
        self.messages.clear();
        changes.extend(self.apply_update(update));
        changes.messages = self.messages();
        Ok(changes)
    }

    fn everything(&self) -> ChangeSet {
        ChangeSet {
            tracks: self.tracks.iter().map(|(k, _)| k.clone()).collect(),
            mixer: self.mixer.iter().map(|(k, _)| k.clone()).collect(),
            timeline: self.timeline.iter().map(|(k, _)| k.track_id.clone()).collect(),
            master: self.master.get().is_some(),
            messages: Vec::new(),
        }
    }

    // ── Read views ───────────────────────────────────────────────

    pub fn track(&self, id: &str) -> Option<&Track> {
        self.tracks.get(&id.to_string())
    }

    pub fn tracks(&self) -> BTreeMap<String, Track> {
        self.tracks.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn mixer(&self) -> BTreeMap<String, MixerSettings> {
        self.mixer.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Region lists per track, each sorted by `(start, id)`.
    pub fn timeline(&self) -> BTreeMap<String, TrackTimeline> {
        let mut lanes: BTreeMap<String, TrackTimeline> = self
            .tracks
            .iter()
            .map(|(id, _)| (id.clone(), TrackTimeline::default()))
            .collect();
        for (key, region) in self.timeline.iter() {
            lanes
                .entry(key.track_id.clone())
                .or_default()
                .regions
                .push(region.clone());
        }
        for lane in lanes.values_mut() {
            lane.regions.sort_by(|a, b| {
                a.start
                    .total_cmp(&b.start)
                    .then_with(|| a.id.cmp(&b.id))
            });
        }
        lanes
    }

    pub fn region(&self, key: &RegionKey) -> Option<&Region> {
        self.timeline.get(key)
    }

    pub fn master(&self) -> MasterSettings {
        self.master.get().cloned().unwrap_or_default()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.iter().map(|(_, m)| m.clone()).collect()
    }

    pub fn view(&self) -> DocumentView {
        DocumentView {
            tracks: self.tracks(),
            mixer: self.mixer(),
            timeline: self.timeline(),
            master: self.master(),
            messages: self.messages(),
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value, DocumentError> {
        serde_json::to_value(self.view()).map_err(|e| DocumentError::Encode(e.to_string()))
    }
}

fn check_span(start: f64, end: f64) -> Result<(), DocumentError> {
    if !start.is_finite() || !end.is_finite() || start > end {
        return Err(DocumentError::InvalidRegion { start, end });
    }
    Ok(())
}

/// Clamping keeps NaN, so non-finite levels are refused before a patch applies.
fn check_level(field: &'static str, value: Option<f32>) -> Result<(), DocumentError> {
    match value {
        Some(value) if !value.is_finite() => Err(DocumentError::InvalidLevel { field, value }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(n: u128) -> Document {
        Document::new(Uuid::from_u128(n))
    }

    fn alice() -> Actor {
        Actor::new("alice", "Alice")
    }

    fn bob() -> Actor {
        Actor::new("bob", "Bob")
    }

    #[test]
    fn test_add_track_creates_default_mixer() {
        let mut a = replica(1);
        let mut b = replica(2);

        let applied = a
            .apply_local(Op::AddTrack(NewTrack::named("Vocal").with_id("t1")), &alice())
            .unwrap();
        let changes = b.apply_remote(&applied.encode().unwrap()).unwrap();

        assert!(changes.tracks.contains("t1"));
        assert_eq!(b.track("t1").unwrap().name, "Vocal");
        assert_eq!(b.mixer().get("t1"), Some(&MixerSettings::default()));
    }

    #[test]
    fn test_generated_track_ids_are_unique() {
        let mut doc = replica(1);
        for _ in 0..3 {
            doc.apply_local(Op::AddTrack(NewTrack::named("Take")), &alice()).unwrap();
        }
        assert_eq!(doc.tracks().len(), 3);
    }

    #[test]
    fn test_duplicate_track_rejected() {
        let mut doc = replica(1);
        doc.apply_local(Op::AddTrack(NewTrack::named("A").with_id("t1")), &alice()).unwrap();
        let err = doc
            .apply_local(Op::AddTrack(NewTrack::named("B").with_id("t1")), &alice())
            .unwrap_err();
        assert_eq!(err, DocumentError::DuplicateTrack("t1".into()));
    }

    #[test]
    fn test_remove_track_tombstones_mixer_and_regions() {
        let mut doc = replica(1);
        doc.apply_local(Op::AddTrack(NewTrack::named("Drums").with_id("t1")), &alice()).unwrap();
        doc.apply_local(
            Op::AddRegion { track_id: "t1".into(), region: NewRegion::span(0.0, 4.0).with_id("r1") },
            &alice(),
        )
        .unwrap();

        let applied = doc.apply_local(Op::RemoveTrack { id: "t1".into() }, &alice()).unwrap();

        assert!(doc.tracks().is_empty());
        assert!(doc.mixer().is_empty());
        assert!(doc.timeline().is_empty());
        assert_eq!(applied.update.deltas.len(), 3);
    }

    #[test]
    fn test_invalid_region_rejected() {
        let mut doc = replica(1);
        doc.apply_local(Op::AddTrack(NewTrack::named("Bass").with_id("t1")), &alice()).unwrap();
        let err = doc
            .apply_local(
                Op::AddRegion { track_id: "t1".into(), region: NewRegion::span(5.0, 1.0) },
                &alice(),
            )
            .unwrap_err();
        assert!(matches!(err, DocumentError::InvalidRegion { .. }));
        assert!(doc.timeline()["t1"].regions.is_empty());
    }

    #[test]
    fn test_non_finite_levels_rejected() {
        let mut doc = replica(1);
        doc.apply_local(Op::AddTrack(NewTrack::named("Keys").with_id("t1")), &alice()).unwrap();
        let clock = doc.clock();

        let err = doc
            .apply_local(Op::UpdateMixer { track_id: "t1".into(), patch: MixerPatch::volume(f32::NAN) }, &alice())
            .unwrap_err();
        assert!(matches!(err, DocumentError::InvalidLevel { field: "volume", .. }));
        let err = doc
            .apply_local(Op::UpdateMixer { track_id: "t1".into(), patch: MixerPatch::pan(f32::INFINITY) }, &alice())
            .unwrap_err();
        assert!(matches!(err, DocumentError::InvalidLevel { field: "pan", .. }));
        let err = doc.apply_local(Op::UpdateMaster(MasterPatch::volume(f32::NAN)), &alice()).unwrap_err();
        assert!(matches!(err, DocumentError::InvalidLevel { field: "volume", .. }));

        assert_eq!(doc.clock(), clock);
        assert_eq!(doc.mixer()["t1"], MixerSettings::default());
        assert_eq!(doc.master(), MasterSettings::default());

        // Finite values outside the range still clamp.
        doc.apply_local(Op::UpdateMixer { track_id: "t1".into(), patch: MixerPatch::volume(3.0) }, &alice())
            .unwrap();
        assert_eq!(doc.mixer()["t1"].volume, 1.0);
    }

    #[test]
    fn test_update_unknown_track_fails() {
        let mut doc = replica(1);
        let err = doc
            .apply_local(Op::UpdateMixer { track_id: "nope".into(), patch: MixerPatch::volume(0.1) }, &alice())
            .unwrap_err();
        assert_eq!(err, DocumentError::UnknownTrack("nope".into()));
    }

    #[test]
    fn test_concurrent_region_inserts_both_survive() {
        let mut a = replica(1);
        let mut b = replica(2);
        let add = a.apply_local(Op::AddTrack(NewTrack::named("Keys").with_id("t1")), &alice()).unwrap();
        b.apply_remote(&add.encode().unwrap()).unwrap();

        let ua = a
            .apply_local(Op::AddRegion { track_id: "t1".into(), region: NewRegion::span(0.0, 2.0) }, &alice())
            .unwrap()
            .encode()
            .unwrap();
        let ub = b
            .apply_local(Op::AddRegion { track_id: "t1".into(), region: NewRegion::span(1.0, 3.0) }, &bob())
            .unwrap()
            .encode()
            .unwrap();

        a.apply_remote(&ub).unwrap();
        b.apply_remote(&ua).unwrap();

        assert_eq!(a.timeline()["t1"].regions.len(), 2);
        assert_eq!(a.view(), b.view());
    }

    #[test]
    fn test_apply_remote_is_idempotent() {
        let mut a = replica(1);
        let mut b = replica(2);
        let update = a
            .apply_local(Op::AddTrack(NewTrack::named("Vocal").with_id("t1")), &alice())
            .unwrap()
            .encode()
            .unwrap();

        b.apply_remote(&update).unwrap();
        let once = b.view();
        let changes = b.apply_remote(&update).unwrap();

        assert!(changes.is_empty());
        assert_eq!(b.view(), once);
    }

    #[test]
    fn test_concurrent_writes_commute() {
        let mut base = replica(1);
        let add = base
            .apply_local(Op::AddTrack(NewTrack::named("Gtr").with_id("t1")), &alice())
            .unwrap()
            .encode()
            .unwrap();

        let mut a = replica(2);
        let mut b = replica(3);
        a.apply_remote(&add).unwrap();
        b.apply_remote(&add).unwrap();

        let ua = a
            .apply_local(Op::UpdateTrack { id: "t1".into(), patch: TrackPatch::rename("Lead") }, &alice())
            .unwrap()
            .encode()
            .unwrap();
        let ub = b
            .apply_local(Op::UpdateTrack { id: "t1".into(), patch: TrackPatch::rename("Rhythm") }, &bob())
            .unwrap()
            .encode()
            .unwrap();

        let mut ab = replica(4);
        ab.apply_remote(&add).unwrap();
        ab.apply_remote(&ua).unwrap();
        ab.apply_remote(&ub).unwrap();

        let mut ba = replica(5);
        ba.apply_remote(&add).unwrap();
        ba.apply_remote(&ub).unwrap();
        ba.apply_remote(&ua).unwrap();

        assert_eq!(ab.view(), ba.view());
        // Same counter on both sides: higher replica id wins.
        assert_eq!(ab.track("t1").unwrap().name, "Rhythm");
    }

    #[test]
    fn test_messages_append_in_stamp_order() {
        let mut a = replica(1);
        let mut b = replica(2);

        let m1 = a.apply_local(Op::SendMessage { text: "hi".into() }, &alice()).unwrap().encode().unwrap();
        b.apply_remote(&m1).unwrap();
        let m2 = b.apply_local(Op::SendMessage { text: "hey".into() }, &bob()).unwrap().encode().unwrap();
        a.apply_remote(&m2).unwrap();

        let texts: Vec<_> = a.messages().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["hi", "hey"]);
        assert_eq!(a.messages(), b.messages());
    }

    #[test]
    fn test_empty_message_rejected() {
        let mut doc = replica(1);
        assert_eq!(
            doc.apply_local(Op::SendMessage { text: "   ".into() }, &alice()).unwrap_err(),
            DocumentError::EmptyMessage
        );
    }

    #[test]
    fn test_snapshot_rebuilds_state() {
        let mut a = replica(1);
        a.apply_local(Op::AddTrack(NewTrack::named("Pad").with_id("t1")), &alice()).unwrap();
        a.apply_local(Op::UpdateMaster(MasterPatch::volume(0.7)), &alice()).unwrap();
        a.apply_local(Op::SendMessage { text: "mix is up".into() }, &alice()).unwrap();
        a.apply_local(Op::RemoveTrack { id: "t1".into() }, &alice()).unwrap();

        let mut b = replica(2);
        b.apply_local(Op::AddTrack(NewTrack::named("Scratch").with_id("tmp")), &bob()).unwrap();
        b.load_snapshot(&a.snapshot().unwrap()).unwrap();

        assert_eq!(a.view(), b.view());
        assert_eq!(b.master().volume, 0.7);

        // Tombstones travel with the snapshot: a stale re-add does not resurrect.
        let mut c = replica(3);
        c.apply_remote(&a.snapshot().unwrap()).unwrap();
        assert!(c.tracks().is_empty());
    }

    #[test]
    fn test_local_clock_moves_past_remote() {
        let mut a = replica(1);
        let mut b = replica(2);
        for _ in 0..10 {
            a.apply_local(Op::UpdateMaster(MasterPatch::volume(0.5)), &alice()).unwrap();
        }
        b.apply_remote(&a.snapshot().unwrap()).unwrap();
        let ub = b
            .apply_local(Op::UpdateMaster(MasterPatch::volume(0.2)), &bob())
            .unwrap()
            .encode()
            .unwrap();
        a.apply_remote(&ub).unwrap();
        assert_eq!(a.master().volume, 0.2);
    }

    #[test]
    fn test_malformed_update_leaves_state_untouched() {
        let mut doc = replica(1);
        doc.apply_local(Op::AddTrack(NewTrack::named("Vocal").with_id("t1")), &alice()).unwrap();
        let before = doc.view();

        assert!(doc.apply_remote(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(doc.apply_remote(&[0xFF, 0xFF, 0xFF, 0x7F, 0x00]).is_err());
        assert!(doc.apply_remote(&lz4_flex::compress_prepend_size(b"not bincode")).is_err());
        assert_eq!(doc.view(), before);
    }

    #[test]
    fn test_revert_skips_foreign_overwrite() {
        let mut a = replica(1);
        let mut b = replica(2);
        let add = a.apply_local(Op::AddTrack(NewTrack::named("Vocal").with_id("t1")), &alice()).unwrap();
        b.apply_remote(&add.encode().unwrap()).unwrap();

        let rename = b
            .apply_local(Op::UpdateTrack { id: "t1".into(), patch: TrackPatch::rename("Bob's") }, &bob())
            .unwrap();
        a.apply_remote(&rename.encode().unwrap()).unwrap();

        let reverted = a.revert(&add.undo, &alice());
        assert!(reverted.update.is_empty());
        assert_eq!(a.track("t1").unwrap().name, "Bob's");
    }

    #[test]
    fn test_to_json_shape() {
        let mut doc = replica(1);
        doc.apply_local(Op::AddTrack(NewTrack::named("Vocal").with_id("t1")), &alice()).unwrap();
        let json = doc.to_json().unwrap();
        assert_eq!(json["tracks"]["t1"]["name"], "Vocal");
        assert_eq!(json["mixer"]["t1"]["muted"], false);
        assert!(json["timeline"]["t1"]["regions"].as_array().unwrap().is_empty());
        assert_eq!(json["master"]["volume"], 1.0);
    }
}

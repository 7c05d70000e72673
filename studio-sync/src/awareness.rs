//! Ephemeral presence: who is in the room, where their cursor is, which
//! track they are working on.
//!
//! ```text
//! set_local_state(patch) ──► AwarenessUpdate { client_id, clock+1, state }
//!                                   │  (Awareness frame, broadcast)
//!                                   ▼
//!                  remote Awareness::apply_update()
//!                                   │  newer clock wins, self filtered
//!                                   ▼
//!                  AwarenessChange { added, updated, removed }
//! ```
//!
//! Presence is never part of the document. A client that disconnects (or
//! stops heartbeating for longer than the outdated timeout) is removed with
//! no tombstone left behind.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::model::now_millis;
use crate::protocol::ProtocolError;

/// Presence heartbeat interval.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Remote states not refreshed within this window are dropped.
pub const OUTDATED_TIMEOUT: Duration = Duration::from_secs(60);

/// Fixed cursor palette.
pub const PALETTE: [&str; 12] = [
    "#e6194b", "#3cb44b", "#ffe119", "#4363d8", "#f58231", "#911eb4",
    "#46f0f0", "#f032e6", "#bcf60c", "#fabebe", "#008080", "#e6beff",
];

/// Stable colour for a user id (FNV-1a into [`PALETTE`]).
pub fn color_for_user(user_id: &str) -> &'static str {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in user_id.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    PALETTE[(hash % PALETTE.len() as u32) as usize]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    #[default]
    Desktop,
    Tablet,
    Mobile,
}

/// Cursor on the arrangement: timeline position in seconds, optionally on a lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub position: f64,
    pub track_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    pub id: String,
    pub name: String,
    pub color: String,
    pub cursor: Option<Cursor>,
    pub active_track: Option<String>,
    pub is_active: bool,
    /// Milliseconds since the Unix epoch of the last semantic change.
    pub last_active: u64,
    pub device: DeviceClass,
}

/// Presence frame body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub user: UserPresence,
}

/// Partial local presence change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresencePatch {
    pub cursor: Option<Option<Cursor>>,
    pub active_track: Option<Option<String>>,
    pub is_active: Option<bool>,
    pub device: Option<DeviceClass>,
}

impl PresencePatch {
    pub fn cursor(cursor: Option<Cursor>) -> Self {
        Self {
            cursor: Some(cursor),
            ..Self::default()
        }
    }

    pub fn active_track(track_id: Option<String>) -> Self {
        Self {
            active_track: Some(track_id),
            ..Self::default()
        }
    }
}

/// One client's presence at a given clock; `state: None` means it left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client_id: Uuid,
    pub clock: u32,
    pub state: Option<PresenceState>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(update)
    }
}

/// Client ids whose presence changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AwarenessChange {
    pub added: Vec<Uuid>,
    pub updated: Vec<Uuid>,
    pub removed: Vec<Uuid>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct Meta {
    clock: u32,
    last_updated: Instant,
}

/// Presence tracker for one session.
pub struct Awareness {
    client_id: Uuid,
    local: PresenceState,
    local_clock: u32,
    /// Remote states only.
    states: HashMap<Uuid, PresenceState>,
    /// Last clock seen per remote client, kept after a removal entry for
    /// ordering until the outdated timeout passes.
    meta: HashMap<Uuid, Meta>,
}

impl Awareness {
    pub fn new(client_id: Uuid, user_id: &str, name: &str, device: DeviceClass) -> Self {
        Self {
            client_id,
            local: PresenceState {
                user: UserPresence {
                    id: user_id.to_string(),
                    name: name.to_string(),
                    color: color_for_user(user_id).to_string(),
                    cursor: None,
                    active_track: None,
                    is_active: true,
                    last_active: now_millis(),
                    device,
                },
            },
            local_clock: 0,
            states: HashMap::new(),
            meta: HashMap::new(),
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn local_state(&self) -> &PresenceState {
        &self.local
    }

    /// Apply a local change and return the entry to broadcast.
    pub fn set_local_state(&mut self, patch: PresencePatch) -> AwarenessUpdate {
        let user = &mut self.local.user;
        if let Some(cursor) = patch.cursor {
            user.cursor = cursor;
        }
        if let Some(track) = patch.active_track {
            user.active_track = track;
        }
        if let Some(active) = patch.is_active {
            user.is_active = active;
        }
        if let Some(device) = patch.device {
            user.device = device;
        }
        user.last_active = now_millis();
        self.local_clock += 1;
        self.local_update()
    }

    /// Re-assert the local state for liveness only (heartbeat).
    pub fn renew(&mut self) -> AwarenessUpdate {
        self.local_clock += 1;
        self.local_update()
    }

    /// Current local entry, without advancing the clock.
    pub fn local_update(&self) -> AwarenessUpdate {
        AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client_id: self.client_id,
                clock: self.local_clock,
                state: Some(self.local.clone()),
            }],
        }
    }

    pub fn encode_local(&self) -> Result<Vec<u8>, ProtocolError> {
        self.local_update().encode()
    }

    /// Removal entry for the local client (clean leave).
    pub fn encode_removal(&mut self) -> Result<Vec<u8>, ProtocolError> {
        self.local_clock += 1;
        AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client_id: self.client_id,
                clock: self.local_clock,
                state: None,
            }],
        }
        .encode()
    }

    /// Every known state keyed by client id, the local one included.
    pub fn get_states(&self) -> HashMap<Uuid, PresenceState> {
        let mut all = self.states.clone();
        all.insert(self.client_id, self.local.clone());
        all
    }

    /// Remote states only.
    pub fn remote_states(&self) -> impl Iterator<Item = (&Uuid, &PresenceState)> {
        self.states.iter()
    }

    pub fn remote_state(&self, client_id: &Uuid) -> Option<&PresenceState> {
        self.states.get(client_id)
    }

    /// Merge remote entries. Self entries are ignored.
    pub fn apply_update(&mut self, update: AwarenessUpdate, now: Instant) -> AwarenessChange {
        let mut change = AwarenessChange::default();

        for entry in update.entries {
            if entry.client_id == self.client_id {
                continue;
            }
            let known = self.meta.get(&entry.client_id).map(|m| m.clock);
            let present = self.states.contains_key(&entry.client_id);
            let newer = match known {
                None => true,
                Some(clock) => {
                    entry.clock > clock || (entry.clock == clock && entry.state.is_none() && present)
                }
            };
            // A removal for a client already gone carries nothing to order
            // against; recording its clock would shadow the client's rejoin.
            if !newer || (entry.state.is_none() && !present) {
                continue;
            }

            self.meta.insert(
                entry.client_id,
                Meta {
                    clock: entry.clock,
                    last_updated: now,
                },
            );

            match entry.state {
                Some(state) => match self.states.insert(entry.client_id, state.clone()) {
                    None => change.added.push(entry.client_id),
                    Some(previous) if previous != state => change.updated.push(entry.client_id),
                    Some(_) => {}
                },
                None => {
                    if self.states.remove(&entry.client_id).is_some() {
                        change.removed.push(entry.client_id);
                    }
                }
            }
        }

        if !change.is_empty() {
            log::trace!(
                "awareness: +{} ~{} -{}",
                change.added.len(),
                change.updated.len(),
                change.removed.len()
            );
        }
        change
    }

    /// Drop remote states (link loss, peer Leave). Their clocks are forgotten
    /// too, so a rejoining client is accepted at any clock.
    pub fn remove_states(&mut self, client_ids: &[Uuid]) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        for id in client_ids {
            self.meta.remove(id);
            if self.states.remove(id).is_some() {
                change.removed.push(*id);
            }
        }
        change
    }

    /// Drop every remote state.
    pub fn clear_remote(&mut self) -> AwarenessChange {
        let ids: Vec<Uuid> = self.states.keys().copied().collect();
        self.remove_states(&ids)
    }

    /// Drop remote states not refreshed within `timeout`.
    pub fn remove_outdated(&mut self, now: Instant, timeout: Duration) -> AwarenessChange {
        let stale: Vec<Uuid> = self
            .states
            .keys()
            .filter(|id| {
                self.meta
                    .get(*id)
                    .is_some_and(|m| now.saturating_duration_since(m.last_updated) >= timeout)
            })
            .copied()
            .collect();
        let change = self.remove_states(&stale);
        let states = &self.states;
        self.meta.retain(|id, m| {
            states.contains_key(id) || now.saturating_duration_since(m.last_updated) < timeout
        });
        change
    }

    /// Clients with a remembered clock, present or not.
    pub fn tracked_clients(&self) -> usize {
        self.meta.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u128, user: &str) -> Awareness {
        Awareness::new(Uuid::from_u128(n), user, user, DeviceClass::Desktop)
    }

    #[test]
    fn test_color_is_stable_and_in_palette() {
        let a = color_for_user("alice");
        assert_eq!(a, color_for_user("alice"));
        assert!(PALETTE.contains(&a));
        let distinct: std::collections::HashSet<_> =
            (0..50).map(|i| color_for_user(&format!("user-{i}"))).collect();
        assert!(distinct.len() > 1);
    }

    #[test]
    fn test_join_update_leave() {
        let mut a = peer(1, "alice");
        let mut b = peer(2, "bob");
        let now = Instant::now();

        let change = b.apply_update(a.local_update(), now);
        assert_eq!(change.added, vec![a.client_id()]);

        let cursor = a.set_local_state(PresencePatch::cursor(Some(Cursor {
            position: 12.5,
            track_id: Some("t1".into()),
        })));
        let change = b.apply_update(cursor, now);
        assert_eq!(change.updated, vec![a.client_id()]);
        assert_eq!(
            b.remote_state(&a.client_id()).unwrap().user.cursor.as_ref().unwrap().position,
            12.5
        );

        let removal = AwarenessUpdate::decode(&a.encode_removal().unwrap()).unwrap();
        let change = b.apply_update(removal, now);
        assert_eq!(change.removed, vec![a.client_id()]);
        assert!(!b.get_states().contains_key(&a.client_id()));
    }

    #[test]
    fn test_stale_clock_ignored() {
        let mut a = peer(1, "alice");
        let mut b = peer(2, "bob");
        let now = Instant::now();

        let old = a.set_local_state(PresencePatch::active_track(Some("t1".into())));
        let new = a.set_local_state(PresencePatch::active_track(Some("t2".into())));
        b.apply_update(new, now);
        let change = b.apply_update(old, now);

        assert!(change.is_empty());
        assert_eq!(
            b.remote_state(&a.client_id()).unwrap().user.active_track.as_deref(),
            Some("t2")
        );
    }

    #[test]
    fn test_self_entries_filtered() {
        let mut a = peer(1, "alice");
        let own = a.renew();
        assert!(a.apply_update(own, Instant::now()).is_empty());
        assert_eq!(a.get_states().len(), 1);
    }

    #[test]
    fn test_heartbeat_is_not_an_update() {
        let mut a = peer(1, "alice");
        let mut b = peer(2, "bob");
        let now = Instant::now();
        b.apply_update(a.local_update(), now);
        assert!(b.apply_update(a.renew(), now).is_empty());
    }

    #[test]
    fn test_remove_outdated() {
        let a = peer(1, "alice");
        let mut b = peer(2, "bob");
        let t0 = Instant::now();
        b.apply_update(a.local_update(), t0);

        assert!(b.remove_outdated(t0 + Duration::from_secs(59), OUTDATED_TIMEOUT).is_empty());
        let change = b.remove_outdated(t0 + OUTDATED_TIMEOUT, OUTDATED_TIMEOUT);
        assert_eq!(change.removed, vec![a.client_id()]);
    }

    #[test]
    fn test_rejoin_after_relay_removal() {
        let mut a = peer(1, "alice");
        let mut b = peer(2, "bob");
        let t0 = Instant::now();
        b.apply_update(a.renew(), t0);

        // Link loss on b's side, then the relay's removal for a arrives late.
        b.remove_states(&[a.client_id()]);
        let late = AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client_id: a.client_id(),
                clock: 2,
                state: None,
            }],
        };
        assert!(b.apply_update(late, t0).is_empty());
        assert_eq!(b.tracked_clients(), 0);

        // a comes back and announces itself at the same clock.
        let rejoin = a.renew();
        assert_eq!(rejoin.entries[0].clock, 2);
        let change = b.apply_update(rejoin, t0 + Duration::from_secs(1));
        assert_eq!(change.added, vec![a.client_id()]);
    }

    #[test]
    fn test_remove_outdated_prunes_departed_clocks() {
        let mut a = peer(1, "alice");
        let mut b = peer(2, "bob");
        let t0 = Instant::now();
        b.apply_update(a.renew(), t0);
        let removal = AwarenessUpdate::decode(&a.encode_removal().unwrap()).unwrap();
        assert_eq!(b.apply_update(removal, t0).removed, vec![a.client_id()]);
        assert_eq!(b.tracked_clients(), 1);

        b.remove_outdated(t0 + Duration::from_secs(1), OUTDATED_TIMEOUT);
        assert_eq!(b.tracked_clients(), 1);
        b.remove_outdated(t0 + OUTDATED_TIMEOUT, OUTDATED_TIMEOUT);
        assert_eq!(b.tracked_clients(), 0);
    }

    #[test]
    fn test_clear_remote_leaves_no_trace() {
        let a = peer(1, "alice");
        let mut b = peer(2, "bob");
        b.apply_update(a.local_update(), Instant::now());
        let change = b.clear_remote();
        assert_eq!(change.removed.len(), 1);
        assert_eq!(b.remote_states().count(), 0);
    }

    #[test]
    fn test_presence_json_shape() {
        let a = peer(1, "alice");
        let json = serde_json::to_value(a.local_state()).unwrap();
        assert_eq!(json["user"]["id"], "alice");
        assert_eq!(json["user"]["isActive"], true);
        assert!(json["user"]["activeTrack"].is_null());
        assert_eq!(json["user"]["device"], "desktop");
    }
}

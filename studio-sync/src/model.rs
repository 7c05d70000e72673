//! Typed records stored in the shared project document.
//!
//! Every record has a closed set of typed fields plus an open
//! [`Extensions`] map for forward-compatible data the engine does not
//! interpret. Audit fields (`created_*`, `updated_*`) are informational
//! only; conflict resolution uses causal stamps, never these timestamps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Untyped extension value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<ExtValue>),
    Map(BTreeMap<String, ExtValue>),
}

impl From<bool> for ExtValue {
    fn from(v: bool) -> Self {
        ExtValue::Bool(v)
    }
}

impl From<f64> for ExtValue {
    fn from(v: f64) -> Self {
        ExtValue::Number(v)
    }
}

impl From<&str> for ExtValue {
    fn from(v: &str) -> Self {
        ExtValue::Text(v.to_string())
    }
}

impl From<String> for ExtValue {
    fn from(v: String) -> Self {
        ExtValue::Text(v)
    }
}

/// Open extension fields on a record.
pub type Extensions = BTreeMap<String, ExtValue>;

// ───────────────────────────────────────────────────────────────────
// Tracks
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    #[default]
    Audio,
    Midi,
    Instrument,
    Bus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TrackKind,
    /// Reference to the audio source; the engine never dereferences it.
    pub source: Option<String>,
    pub created_by: String,
    pub created_at: u64,
    pub updated_by: String,
    pub updated_at: u64,
    pub extensions: Extensions,
}

/// Caller-supplied fields for a new track.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewTrack {
    /// Explicit id; a UUID is generated when absent.
    pub id: Option<String>,
    pub name: String,
    pub kind: TrackKind,
    pub source: Option<String>,
    pub extensions: Extensions,
}

impl NewTrack {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn kind(mut self, kind: TrackKind) -> Self {
        self.kind = kind;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackPatch {
    pub name: Option<String>,
    pub kind: Option<TrackKind>,
    pub source: Option<Option<String>>,
    pub extensions: Option<Extensions>,
}

impl TrackPatch {
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub(crate) fn apply(&self, track: &mut Track) {
        if let Some(name) = &self.name {
            track.name = name.clone();
        }
        if let Some(kind) = self.kind {
            track.kind = kind;
        }
        if let Some(source) = &self.source {
            track.source = source.clone();
        }
        if let Some(ext) = &self.extensions {
            for (k, v) in ext {
                track.extensions.insert(k.clone(), v.clone());
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Mixer
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MixerSettings {
    /// Linear gain in [0, 1].
    pub volume: f32,
    /// Stereo position in [-1, 1].
    pub pan: f32,
    pub muted: bool,
    pub soloed: bool,
    pub eq: Option<Extensions>,
    pub effects: Option<Vec<ExtValue>>,
}

impl Default for MixerSettings {
    fn default() -> Self {
        Self {
            volume: 0.8,
            pan: 0.0,
            muted: false,
            soloed: false,
            eq: None,
            effects: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MixerPatch {
    pub volume: Option<f32>,
    pub pan: Option<f32>,
    pub muted: Option<bool>,
    pub soloed: Option<bool>,
    pub eq: Option<Option<Extensions>>,
    pub effects: Option<Option<Vec<ExtValue>>>,
}

impl MixerPatch {
    pub fn volume(volume: f32) -> Self {
        Self {
            volume: Some(volume),
            ..Self::default()
        }
    }

    pub fn pan(pan: f32) -> Self {
        Self {
            pan: Some(pan),
            ..Self::default()
        }
    }

    pub(crate) fn apply(&self, mixer: &mut MixerSettings) {
        if let Some(v) = self.volume {
            mixer.volume = v.clamp(0.0, 1.0);
        }
        if let Some(p) = self.pan {
            mixer.pan = p.clamp(-1.0, 1.0);
        }
        if let Some(m) = self.muted {
            mixer.muted = m;
        }
        if let Some(s) = self.soloed {
            mixer.soloed = s;
        }
        if let Some(eq) = &self.eq {
            mixer.eq = eq.clone();
        }
        if let Some(fx) = &self.effects {
            mixer.effects = fx.clone();
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Timeline
// ───────────────────────────────────────────────────────────────────

/// Composite key of one region: regions of a track are independent
/// registers, so concurrent inserts on the same track both survive.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionKey {
    pub track_id: String,
    pub region_id: String,
}

impl RegionKey {
    pub fn new(track_id: impl Into<String>, region_id: impl Into<String>) -> Self {
        Self {
            track_id: track_id.into(),
            region_id: region_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Region {
    pub id: String,
    /// Start position in seconds.
    pub start: f64,
    /// End position in seconds; `start <= end` on local writes.
    pub end: f64,
    pub color: Option<String>,
    pub label: Option<String>,
    pub created_by: String,
    pub created_at: u64,
    pub updated_by: String,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewRegion {
    pub id: Option<String>,
    pub start: f64,
    pub end: f64,
    pub color: Option<String>,
    pub label: Option<String>,
}

impl NewRegion {
    pub fn span(start: f64, end: f64) -> Self {
        Self {
            start,
            end,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegionPatch {
    pub start: Option<f64>,
    pub end: Option<f64>,
    pub color: Option<Option<String>>,
    pub label: Option<Option<String>>,
}

impl RegionPatch {
    pub fn span(start: f64, end: f64) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            ..Self::default()
        }
    }

    pub(crate) fn apply(&self, region: &mut Region) {
        if let Some(s) = self.start {
            region.start = s;
        }
        if let Some(e) = self.end {
            region.end = e;
        }
        if let Some(c) = &self.color {
            region.color = c.clone();
        }
        if let Some(l) = &self.label {
            region.label = l.clone();
        }
    }
}

/// Read view of one track's lane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackTimeline {
    pub regions: Vec<Region>,
}

// ───────────────────────────────────────────────────────────────────
// Master + chat
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterSettings {
    pub volume: f32,
    pub updated_by: Option<String>,
    pub updated_at: Option<u64>,
    pub extensions: Extensions,
}

impl Default for MasterSettings {
    fn default() -> Self {
        Self {
            volume: 1.0,
            updated_by: None,
            updated_at: None,
            extensions: Extensions::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MasterPatch {
    pub volume: Option<f32>,
    pub extensions: Option<Extensions>,
}

impl MasterPatch {
    pub fn volume(volume: f32) -> Self {
        Self {
            volume: Some(volume),
            ..Self::default()
        }
    }

    pub(crate) fn apply(&self, master: &mut MasterSettings) {
        if let Some(v) = self.volume {
            master.volume = v.clamp(0.0, 1.0);
        }
        if let Some(ext) = &self.extensions {
            for (k, v) in ext {
                master.extensions.insert(k.clone(), v.clone());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub sender: Sender,
    pub text: String,
    pub timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixer_defaults() {
        let m = MixerSettings::default();
        assert_eq!(m.volume, 0.8);
        assert_eq!(m.pan, 0.0);
        assert!(!m.muted);
        assert!(!m.soloed);
    }

    #[test]
    fn test_mixer_patch_clamps() {
        let mut m = MixerSettings::default();
        MixerPatch { volume: Some(1.7), pan: Some(-3.0), ..MixerPatch::default() }.apply(&mut m);
        assert_eq!(m.volume, 1.0);
        assert_eq!(m.pan, -1.0);
    }

    #[test]
    fn test_track_patch_merges_extensions() {
        let mut track = Track {
            id: "t1".into(),
            name: "Vocal".into(),
            kind: TrackKind::Audio,
            source: None,
            created_by: "u1".into(),
            created_at: 0,
            updated_by: "u1".into(),
            updated_at: 0,
            extensions: Extensions::from([("armed".to_string(), ExtValue::Bool(true))]),
        };
        let mut ext = Extensions::new();
        ext.insert("lane".into(), ExtValue::Number(2.0));
        TrackPatch { extensions: Some(ext), ..TrackPatch::rename("Lead") }.apply(&mut track);

        assert_eq!(track.name, "Lead");
        assert_eq!(track.extensions.len(), 2);
    }

    #[test]
    fn test_track_json_shape() {
        let track = Track {
            id: "t1".into(),
            name: "Vocal".into(),
            kind: TrackKind::Bus,
            source: Some("file-42".into()),
            created_by: "u1".into(),
            created_at: 1,
            updated_by: "u1".into(),
            updated_at: 1,
            extensions: Extensions::new(),
        };
        let json = serde_json::to_value(&track).unwrap();
        assert_eq!(json["type"], "bus");
        assert_eq!(json["createdBy"], "u1");
    }
}

//! Local undo/redo over the `tracks` and `timeline` containers.
//!
//! ```text
//!   IDLE ──capture()──► CAPTURING ──(no capture for capture_timeout)──► IDLE
//!                          │  ▲
//!                          └──┘ capture() within the window joins the open item
//! ```
//!
//! Only records returned by [`Document::apply_local`](crate::Document::apply_local)
//! for this session are captured, so remote edits are never undone here.
//! Reverting is a new local write; keys that someone else has written since
//! the capture are skipped by [`Document::revert`](crate::Document::revert).

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::document::{Actor, Applied, Document, UndoRecord};

pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DEPTH: usize = 100;

#[derive(Debug, Clone, Default)]
struct UndoItem {
    records: Vec<UndoRecord>,
}

impl UndoItem {
    /// Merge records per key: the first `before` is kept, the stamp follows
    /// the latest write.
    fn absorb(&mut self, records: Vec<UndoRecord>) {
        for record in records {
            let key = record.key();
            match self.records.iter_mut().find(|r| r.key() == key) {
                Some(existing) => existing.absorb(&record),
                None => self.records.push(record),
            }
        }
    }
}

pub struct UndoManager {
    capture_timeout: Duration,
    max_depth: usize,
    undo_stack: VecDeque<UndoItem>,
    redo_stack: Vec<UndoItem>,
    /// Time of the last capture while an item is open.
    open_since: Option<Instant>,
}

impl UndoManager {
    pub fn new(capture_timeout: Duration, max_depth: usize) -> Self {
        Self {
            capture_timeout,
            max_depth: max_depth.max(1),
            undo_stack: VecDeque::new(),
            redo_stack: Vec::new(),
            open_since: None,
        }
    }

    /// Record a local forward edit. Clears the redo stack.
    pub fn capture(&mut self, records: Vec<UndoRecord>, now: Instant) {
        if records.is_empty() {
            return;
        }
        self.redo_stack.clear();

        let coalesce = matches!(
            self.open_since,
            Some(last) if now.saturating_duration_since(last) < self.capture_timeout
        );
        match self.undo_stack.back_mut() {
            Some(item) if coalesce => item.absorb(records),
            _ => {
                let mut item = UndoItem::default();
                item.absorb(records);
                self.push_undo(item);
            }
        }
        self.open_since = Some(now);
    }

    /// Close the open item so the next capture starts a new one.
    pub fn stop_capturing(&mut self) {
        self.open_since = None;
    }

    /// Revert the most recent item. `None` when there is nothing to undo.
    pub fn undo(&mut self, doc: &mut Document, actor: &Actor) -> Option<Applied> {
        let item = self.undo_stack.pop_back()?;
        self.open_since = None;
        let applied = revert_item(doc, &item, actor);
        if !applied.undo.is_empty() {
            self.redo_stack.push(UndoItem {
                records: applied.undo.clone(),
            });
        }
        log::debug!(
            "undo reverted {} of {} keys",
            applied.undo.len(),
            item.records.len()
        );
        Some(applied)
    }

    /// Re-apply the most recently undone item.
    pub fn redo(&mut self, doc: &mut Document, actor: &Actor) -> Option<Applied> {
        let item = self.redo_stack.pop()?;
        self.open_since = None;
        let applied = revert_item(doc, &item, actor);
        if !applied.undo.is_empty() {
            self.push_undo(UndoItem {
                records: applied.undo.clone(),
            });
        }
        Some(applied)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.open_since = None;
    }

    fn push_undo(&mut self, item: UndoItem) {
        self.undo_stack.push_back(item);
        while self.undo_stack.len() > self.max_depth {
            self.undo_stack.pop_front();
        }
    }
}

impl Default for UndoManager {
    fn default() -> Self {
        Self::new(DEFAULT_CAPTURE_TIMEOUT, DEFAULT_MAX_DEPTH)
    }
}

fn revert_item(doc: &mut Document, item: &UndoItem, actor: &Actor) -> Applied {
    let reversed: Vec<UndoRecord> = item.records.iter().rev().cloned().collect();
    doc.revert(&reversed, actor)
}

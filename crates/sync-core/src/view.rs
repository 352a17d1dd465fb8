//! Local cache of the peer's last-known note states.
//!
//! The view answers "what does the peer think this note looks like" without a
//! round trip, and makes duplicate or out-of-order events harmless. It is not
//! authoritative storage.

use crate::note::{Note, NoteId};
use crate::protocol::SyncEvent;
use std::collections::HashMap;
use tracing::debug;

/// Outcome of applying one event to the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewChange {
    /// A note the view did not know about was added.
    Inserted,
    /// An existing entry was overwritten.
    Replaced,
    /// An existing entry was removed.
    Removed,
    /// Update or delete for an id the view does not hold.
    Ignored,
}

impl ViewChange {
    /// Whether the view changed.
    pub fn is_applied(self) -> bool {
        matches!(self, ViewChange::Inserted | ViewChange::Replaced | ViewChange::Removed)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteNoteView {
    notes: HashMap<NoteId, Note>,
}

impl RemoteNoteView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a create, update or delete.
    ///
    /// - create inserts or overwrites (a duplicate create acts as an update)
    /// - update only replaces an existing entry
    /// - delete only removes an existing entry
    ///
    /// Timestamps are not compared; the last event received wins.
    pub fn apply(&mut self, event: &SyncEvent) -> ViewChange {
        match event {
            SyncEvent::Create(note) => match self.notes.insert(note.id.clone(), note.clone()) {
                None => ViewChange::Inserted,
                Some(_) => ViewChange::Replaced,
            },
            SyncEvent::Update(note) => match self.notes.get_mut(&note.id) {
                Some(held) => {
                    *held = note.clone();
                    ViewChange::Replaced
                }
                None => {
                    debug!("Ignoring update for unknown note {}", note.id);
                    ViewChange::Ignored
                }
            },
            SyncEvent::Delete(id) => match self.notes.remove(id) {
                Some(_) => ViewChange::Removed,
                None => {
                    debug!("Ignoring delete for unknown note {}", id);
                    ViewChange::Ignored
                }
            },
        }
    }

    pub fn get(&self, id: &NoteId) -> Option<&Note> {
        self.notes.get(id)
    }

    pub fn contains(&self, id: &NoteId) -> bool {
        self.notes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    /// All held notes, sorted by id.
    pub fn notes(&self) -> Vec<Note> {
        let mut notes: Vec<Note> = self.notes.values().cloned().collect();
        notes.sort_by(|a, b| a.id.cmp(&b.id));
        notes
    }

    pub fn clear(&mut self) {
        self.notes.clear();
    }
}

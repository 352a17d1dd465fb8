//! NoteStore trait abstraction over the host's authoritative note storage.
//!
//! Implementations:
//! - `InMemoryStore` - For testing, and as the reference materializing store
//! - `StickyNotesStore` (in sync-daemon) - Reads Windows Sticky Notes' plum.sqlite

use crate::note::{Note, NoteId};
use crate::protocol::SyncEvent;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Note store not found: {0}")]
    NotFound(PathBuf),

    #[error("Operation not supported by this store: {0}")]
    Unsupported(&'static str),

    #[error("Store backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Source of the local note set, and optional sink for remote changes.
#[async_trait]
pub trait NoteStore: Send + Sync {
    /// Read the complete current set of notes, in the store's natural order.
    async fn list_notes(&self) -> Result<Vec<Note>>;

    /// Apply a remote create/update/delete to authoritative storage.
    ///
    /// View-only stores keep the default, which refuses.
    async fn materialize(&self, _event: &SyncEvent) -> Result<()> {
        Err(StoreError::Unsupported("materialize"))
    }
}

/// In-memory note store.
///
/// Keeps insertion order, which is the order `list_notes` reports.
#[derive(Default)]
pub struct InMemoryStore {
    notes: RwLock<Vec<Note>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_notes(notes: Vec<Note>) -> Self {
        Self {
            notes: RwLock::new(notes),
        }
    }

    /// Insert a note, replacing any note with the same id in place.
    pub fn upsert(&self, note: Note) {
        let mut notes = self.notes.write().unwrap_or_else(|e| e.into_inner());
        match notes.iter_mut().find(|n| n.id == note.id) {
            Some(existing) => *existing = note,
            None => notes.push(note),
        }
    }

    pub fn remove(&self, id: &NoteId) -> Option<Note> {
        let mut notes = self.notes.write().unwrap_or_else(|e| e.into_inner());
        let index = notes.iter().position(|n| &n.id == id)?;
        Some(notes.remove(index))
    }

    pub fn get(&self, id: &NoteId) -> Option<Note> {
        self.notes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|n| &n.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.notes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl NoteStore for InMemoryStore {
    async fn list_notes(&self) -> Result<Vec<Note>> {
        Ok(self.notes.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn materialize(&self, event: &SyncEvent) -> Result<()> {
        match event {
            SyncEvent::Create(note) => self.upsert(note.clone()),
            SyncEvent::Update(note) => {
                if self.get(&note.id).is_some() {
                    self.upsert(note.clone());
                }
            }
            SyncEvent::Delete(id) => {
                self.remove(id);
            }
        }
        Ok(())
    }
}

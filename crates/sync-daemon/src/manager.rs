//! Sync manager: reconciles local and remote note state over a framed channel.
//!
//! The manager owns:
//! - The local [`NoteStore`] that full pushes are read from
//! - The [`FramedChannel`] to the peer
//! - The [`RemoteNoteView`] of the peer's notes and the last sync time
//!
//! Channel events arrive through [`SyncManager::run`]. Every (re)connection
//! triggers a full push of the local notes as `create` events, since the
//! protocol has no cursor to resume from.

use crate::channel::{ChannelEvent, ChannelState, CloseReason, FramedChannel};
use chrono::{DateTime, Utc};
use note_sync_core::{Note, NoteId, NoteStore, RemoteNoteView, SyncEvent, ViewChange};
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Characters of a note body shown in log lines and status output.
pub const PREVIEW_CHARS: usize = 50;

/// One-line summary of a note for status output.
pub fn note_summary(note: &Note) -> String {
    format!("{} [{}] {}", note.id, note.color, note.body.preview(PREVIEW_CHARS))
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Not connected to peer")]
    NotConnected,
}

/// What happens to remote changes beyond the reconciliation view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MaterializePolicy {
    /// Only the remote view is updated
    #[default]
    ViewOnly,
    /// Applied changes are also forwarded to [`NoteStore::materialize`]
    Apply,
}

/// Result of one full push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Notes read from the local store
    pub total: usize,
    /// Notes written to the socket
    pub pushed: usize,
    /// When the push finished
    pub at: DateTime<Utc>,
}

/// Snapshot of the manager for status display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub state: ChannelState,
    pub host: String,
    pub port: Option<u16>,
    pub remote_notes: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Status: {}", self.state)?;
        if let Some(port) = self.port {
            write!(f, " ({}:{})", self.host, port)?;
        }
        write!(f, ", {} remote note(s)", self.remote_notes)?;
        match self.last_sync_at {
            Some(at) => write!(f, ", last sync {}", at.to_rfc3339()),
            None => write!(f, ", never synced"),
        }
    }
}

#[derive(Default)]
struct SyncState {
    remote: RemoteNoteView,
    last_sync_at: Option<DateTime<Utc>>,
}

pub struct SyncManager<S> {
    store: S,
    channel: FramedChannel,
    policy: MaterializePolicy,
    /// Shared with the event loop; never held across an await
    state: Mutex<SyncState>,
}

impl<S: NoteStore> SyncManager<S> {
    pub fn new(store: S, channel: FramedChannel) -> Self {
        Self {
            store,
            channel,
            policy: MaterializePolicy::default(),
            state: Mutex::new(SyncState::default()),
        }
    }

    pub fn with_policy(mut self, policy: MaterializePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn channel(&self) -> &FramedChannel {
        &self.channel
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> MaterializePolicy {
        self.policy
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Connect the channel. The full push happens when `run` sees the
    /// resulting `Connected` event.
    pub async fn connect(&self) -> Option<u16> {
        self.channel.connect().await
    }

    pub async fn disconnect(&self) {
        self.channel.disconnect().await;
    }

    /// Consume channel events until every sender is gone.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        debug!("Channel event stream ended");
    }

    /// Dispatch one channel event.
    pub async fn handle_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected { port } => {
                self.on_connected(port).await;
            }
            ChannelEvent::Message(event) => {
                self.on_message(event).await;
            }
            ChannelEvent::Closed { port, reason } => match reason {
                CloseReason::PeerClosed => info!("Peer on port {} disconnected", port),
                CloseReason::Local => debug!("Connection on port {} closed locally", port),
                CloseReason::Io(e) => warn!("Connection on port {} lost: {}", port, e),
            },
        }
    }

    /// Full push after a connection is established.
    pub async fn on_connected(&self, port: u16) -> SyncReport {
        info!("Connected on port {}, pushing local notes", port);
        self.push_all().await
    }

    /// Apply a remote event to the reconciliation view.
    pub async fn on_message(&self, event: SyncEvent) -> ViewChange {
        let change = self.state().remote.apply(&event);

        match (&event, change) {
            (SyncEvent::Create(note) | SyncEvent::Update(note), c) if c.is_applied() => {
                info!(
                    "Received {} of note {}: {}",
                    event.action(),
                    note.id,
                    note.body.preview(PREVIEW_CHARS)
                );
            }
            (SyncEvent::Delete(id), ViewChange::Removed) => {
                info!("Peer deleted note {}", id);
            }
            _ => {
                debug!("{} of note {} left the view unchanged ({:?})", event.action(), event.note_id(), change);
            }
        }

        if self.policy == MaterializePolicy::Apply && change.is_applied() {
            if let Err(e) = self.store.materialize(&event).await {
                error!(
                    "Failed to apply remote {} of note {} to the local store: {}",
                    event.action(),
                    event.note_id(),
                    e
                );
            }
        }

        change
    }

    /// Push every local note to the peer now.
    pub async fn sync_now(&self) -> Result<SyncReport, SyncError> {
        if !self.channel.is_connected() {
            info!("Not connected to peer, skipping sync");
            return Err(SyncError::NotConnected);
        }
        Ok(self.push_all().await)
    }

    async fn push_all(&self) -> SyncReport {
        let notes = match self.store.list_notes().await {
            Ok(notes) => notes,
            Err(e) => {
                warn!("Failed to read local notes, pushing none: {}", e);
                Vec::new()
            }
        };

        let total = notes.len();
        let mut pushed = 0;
        for note in notes {
            if self.channel.send(&SyncEvent::Create(note)).await {
                pushed += 1;
            }
        }

        let at = Utc::now();
        self.state().last_sync_at = Some(at);

        if pushed == total {
            info!("Synced {} note(s) to peer", pushed);
        } else {
            warn!("Synced {} of {} note(s) to peer", pushed, total);
        }

        SyncReport { total, pushed, at }
    }

    pub fn status(&self) -> SyncStatus {
        let state = self.state();
        SyncStatus {
            state: self.channel.state(),
            host: self.channel.config().host.clone(),
            port: self.channel.port(),
            remote_notes: state.remote.len(),
            last_sync_at: state.last_sync_at,
        }
    }

    pub fn remote_note(&self, id: &NoteId) -> Option<Note> {
        self.state().remote.get(id).cloned()
    }

    /// Every note in the remote view, sorted by id.
    pub fn remote_notes(&self) -> Vec<Note> {
        self.state().remote.notes()
    }

    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        self.state().last_sync_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use async_trait::async_trait;
    use note_sync_core::store::{Result as StoreResult, StoreError};
    use note_sync_core::InMemoryStore;

    struct BrokenStore;

    #[async_trait]
    impl NoteStore for BrokenStore {
        async fn list_notes(&self) -> StoreResult<Vec<Note>> {
            Err(StoreError::Backend("database is locked".into()))
        }
    }

    fn manager<S: NoteStore>(store: S) -> SyncManager<S> {
        let (channel, _rx) = FramedChannel::new(ChannelConfig::new("127.0.0.1"));
        SyncManager::new(store, channel)
    }

    #[tokio::test]
    async fn test_sync_now_requires_connection() {
        let manager = manager(InMemoryStore::new());
        assert!(matches!(manager.sync_now().await, Err(SyncError::NotConnected)));
        assert!(manager.last_sync_at().is_none());
    }

    #[tokio::test]
    async fn test_messages_update_remote_view() {
        let manager = manager(InMemoryStore::new());
        let note = Note::from_plain_text("from peer").with_id("P");

        assert_eq!(manager.on_message(SyncEvent::Create(note.clone())).await, ViewChange::Inserted);
        assert_eq!(manager.remote_note(&note.id), Some(note.clone()));

        assert_eq!(
            manager.on_message(SyncEvent::Delete(note.id.clone())).await,
            ViewChange::Removed
        );
        assert!(manager.remote_notes().is_empty());
    }

    #[tokio::test]
    async fn test_view_only_policy_leaves_store_untouched() {
        let manager = manager(InMemoryStore::new());
        manager
            .on_message(SyncEvent::Create(Note::from_plain_text("x").with_id("X")))
            .await;

        assert!(manager.store().is_empty());
        assert_eq!(manager.status().remote_notes, 1);
    }

    #[tokio::test]
    async fn test_apply_policy_materializes_changes() {
        let manager = manager(InMemoryStore::new()).with_policy(MaterializePolicy::Apply);
        let note = Note::from_plain_text("x").with_id("X");

        manager.on_message(SyncEvent::Create(note.clone())).await;
        assert_eq!(manager.store().get(&note.id), Some(note.clone()));

        manager.on_message(SyncEvent::Delete(note.id.clone())).await;
        assert!(manager.store().is_empty());
    }

    #[tokio::test]
    async fn test_apply_policy_skips_ignored_events() {
        let manager = manager(InMemoryStore::new()).with_policy(MaterializePolicy::Apply);
        let local = Note::from_plain_text("local").with_id("L");
        manager.store().upsert(local.clone());

        // Not in the remote view, so the local note must survive
        let change = manager.on_message(SyncEvent::Delete(local.id.clone())).await;

        assert_eq!(change, ViewChange::Ignored);
        assert_eq!(manager.store().len(), 1);
    }

    #[tokio::test]
    async fn test_broken_store_degrades_to_empty_push() {
        let manager = manager(BrokenStore);
        let report = manager.on_connected(8080).await;

        assert_eq!(report.total, 0);
        assert_eq!(report.pushed, 0);
        assert_eq!(manager.last_sync_at(), Some(report.at));
    }

    #[test]
    fn test_note_summary_truncates_body() {
        let note = Note::from_plain_text(&"a".repeat(PREVIEW_CHARS * 3)).with_id("N");
        let expected = format!("N [Yellow] {}…", "a".repeat(PREVIEW_CHARS));
        assert_eq!(note_summary(&note), expected);
    }

    #[test]
    fn test_status_display() {
        let status = SyncStatus {
            state: ChannelState::Disconnected,
            host: "localhost".into(),
            port: None,
            remote_notes: 2,
            last_sync_at: None,
        };
        assert_eq!(status.to_string(), "Status: Disconnected, 2 remote note(s), never synced");
    }
}

//! note-sync-daemon library: the networked half of note sync.
//!
//! Exposes the channel, the sync manager and the Sticky Notes store so the
//! binary and the integration tests share one implementation.

pub mod channel;
pub mod manager;
pub mod sticky_notes;

pub use channel::{ChannelConfig, ChannelEvent, ChannelState, CloseReason, FramedChannel};
pub use manager::{
    MaterializePolicy, PREVIEW_CHARS, SyncError, SyncManager, SyncReport, SyncStatus, note_summary,
};
pub use sticky_notes::{StickyNotesStore, locate_database};

//! note-sync-core: Shared data model and wire protocol for two-peer note sync.
//!
//! This crate provides the transport-independent pieces:
//! - The canonical `Note` entity and its opaque rich-text body
//! - The JSON note-update envelope and length-prefix framing
//! - `RemoteNoteView`, the reconciliation cache of the peer's notes
//! - The `NoteStore` trait abstraction over host note storage

pub mod note;
pub mod protocol;
pub mod rich_text;
pub mod store;
pub mod view;

pub use note::{Note, NoteColor, NoteId};
pub use protocol::{FrameDecoder, ProtocolError, SyncAction, SyncEvent};
pub use rich_text::{AttributedText, BodyFormat};
pub use store::{InMemoryStore, NoteStore, StoreError};
pub use view::{RemoteNoteView, ViewChange};

//! Wire protocol for note sync.
//!
//! This module defines what travels over the stream socket:
//! - JSON note-update envelopes (create/update/delete)
//! - Length-prefix framing of those envelopes

pub mod envelope;
pub mod frame;

pub use envelope::{SyncAction, SyncEvent, NOTE_UPDATE_TYPE};
pub use frame::{encode_event_frame, encode_frame, FrameDecoder, FRAME_HEADER_LEN, MAX_FRAME_SIZE};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Unknown sync action: {0}")]
    UnknownAction(String),

    #[error("Invalid note in {action} message: {reason}")]
    InvalidNote { action: SyncAction, reason: String },

    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

//! Note-update envelope.
//!
//! Wire format (UTF-8 JSON):
//! `{"type":"note_update","action":"create"|"update"|"delete","note":{...}}`
//!
//! Create and update carry the full note. Delete carries only `{"id":"…"}`,
//! and only the id is required when receiving one.

use super::{ProtocolError, Result};
use crate::note::{Note, NoteId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The `type` discriminator of note-update envelopes.
pub const NOTE_UPDATE_TYPE: &str = "note_update";

/// Kind of change a [`SyncEvent`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

impl SyncAction {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncAction::Create => "create",
            SyncAction::Update => "update",
            SyncAction::Delete => "delete",
        }
    }

    pub fn from_wire(action: &str) -> Option<Self> {
        match action {
            "create" => Some(SyncAction::Create),
            "update" => Some(SyncAction::Update),
            "delete" => Some(SyncAction::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A create/update/delete intent for one note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Create(Note),
    Update(Note),
    Delete(NoteId),
}

#[derive(Serialize)]
struct OutgoingMessage<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    action: SyncAction,
    note: OutgoingNote<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum OutgoingNote<'a> {
    Full(&'a Note),
    Ref { id: &'a NoteId },
}

#[derive(Deserialize)]
struct IncomingMessage {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    note: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct NoteRef {
    id: NoteId,
}

impl SyncEvent {
    pub fn action(&self) -> SyncAction {
        match self {
            SyncEvent::Create(_) => SyncAction::Create,
            SyncEvent::Update(_) => SyncAction::Update,
            SyncEvent::Delete(_) => SyncAction::Delete,
        }
    }

    /// The reconciliation key of the note this event refers to.
    pub fn note_id(&self) -> &NoteId {
        match self {
            SyncEvent::Create(note) | SyncEvent::Update(note) => &note.id,
            SyncEvent::Delete(id) => id,
        }
    }

    /// The full note, if the event carries one.
    pub fn note(&self) -> Option<&Note> {
        match self {
            SyncEvent::Create(note) | SyncEvent::Update(note) => Some(note),
            SyncEvent::Delete(_) => None,
        }
    }

    /// Serialize to UTF-8 JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let note = match self {
            SyncEvent::Create(note) | SyncEvent::Update(note) => OutgoingNote::Full(note),
            SyncEvent::Delete(id) => OutgoingNote::Ref { id },
        };
        let msg = OutgoingMessage {
            msg_type: NOTE_UPDATE_TYPE,
            action: self.action(),
            note,
        };
        Ok(serde_json::to_vec(&msg)?)
    }

    /// Parse a payload received from the peer.
    ///
    /// Returns `Ok(None)` for well-formed messages of another `type`, which
    /// receivers ignore.
    pub fn from_json(data: &[u8]) -> Result<Option<Self>> {
        let msg: IncomingMessage = serde_json::from_slice(data)?;
        if msg.msg_type != NOTE_UPDATE_TYPE {
            return Ok(None);
        }

        let action = msg.action.ok_or(ProtocolError::MissingField("action"))?;
        let action = SyncAction::from_wire(&action).ok_or(ProtocolError::UnknownAction(action))?;
        let note = msg.note.ok_or(ProtocolError::MissingField("note"))?;

        let invalid = |e: serde_json::Error| ProtocolError::InvalidNote {
            action,
            reason: e.to_string(),
        };

        let event = match action {
            SyncAction::Create => SyncEvent::Create(serde_json::from_value(note).map_err(invalid)?),
            SyncAction::Update => SyncEvent::Update(serde_json::from_value(note).map_err(invalid)?),
            SyncAction::Delete => {
                let note_ref: NoteRef = serde_json::from_value(note).map_err(invalid)?;
                SyncEvent::Delete(note_ref.id)
            }
        };
        Ok(Some(event))
    }
}

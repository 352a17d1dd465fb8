//! Canonical note entity shared by both sync peers.
//!
//! A [`Note`] is the unit of synchronization. Its `id` is the only
//! reconciliation key: two notes with the same id are the same logical note
//! no matter which side produced them.

use crate::rich_text::AttributedText;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Globally unique note identifier.
///
/// Assigned once when the note is created and never reassigned. Serialized
/// as a plain JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteId(String);

impl NoteId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NoteId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NoteId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Palette name of a note.
///
/// Stores without a concept of color use [`NoteColor::Yellow`]. Unknown
/// palette names coming off the wire also fall back to yellow rather than
/// failing the whole message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NoteColor {
    #[default]
    Yellow,
    Green,
    Pink,
    Purple,
    Blue,
    Gray,
    Charcoal,
}

impl NoteColor {
    pub const ALL: [NoteColor; 7] = [
        NoteColor::Yellow,
        NoteColor::Green,
        NoteColor::Pink,
        NoteColor::Purple,
        NoteColor::Blue,
        NoteColor::Gray,
        NoteColor::Charcoal,
    ];

    /// Palette name as sent on the wire.
    pub fn name(self) -> &'static str {
        match self {
            NoteColor::Yellow => "Yellow",
            NoteColor::Green => "Green",
            NoteColor::Pink => "Pink",
            NoteColor::Purple => "Purple",
            NoteColor::Blue => "Blue",
            NoteColor::Gray => "Gray",
            NoteColor::Charcoal => "Charcoal",
        }
    }

    /// Parse a palette name, ignoring ASCII case.
    ///
    /// Returns `None` for names outside the palette.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|color| color.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for NoteColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<String> for NoteColor {
    fn from(name: String) -> Self {
        Self::from_name(&name).unwrap_or_default()
    }
}

impl From<NoteColor> for String {
    fn from(color: NoteColor) -> Self {
        color.name().to_string()
    }
}

/// A synchronized note.
///
/// Wire format (camelCase JSON):
/// `{"id":"…","attributedText":"<base64>","createdAt":"…Z","modifiedAt":"…Z","color":"Yellow"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: NoteId,
    #[serde(rename = "attributedText")]
    pub body: AttributedText,
    #[serde(with = "iso8601")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "iso8601")]
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub color: NoteColor,
}

impl Note {
    /// Create a new note with a generated id, stamped with the current time.
    pub fn new(body: AttributedText) -> Self {
        let now = Utc::now();
        Self {
            id: NoteId::generate(),
            body,
            created_at: now,
            modified_at: now,
            color: NoteColor::default(),
        }
    }

    /// Create a note from plain text, wrapped in the RTF envelope.
    pub fn from_plain_text(text: &str) -> Self {
        Self::new(AttributedText::from_plain_text(text))
    }

    pub fn with_id(mut self, id: impl Into<NoteId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_color(mut self, color: NoteColor) -> Self {
        self.color = color;
        self
    }

    pub fn with_timestamps(mut self, created_at: DateTime<Utc>, modified_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.modified_at = modified_at;
        self
    }

    /// Replace the body and bump `modified_at`.
    ///
    /// `modified_at` never moves backwards, even if the clock does.
    pub fn edit(&mut self, body: AttributedText) {
        self.body = body;
        self.modified_at = Utc::now().max(self.modified_at);
    }
}

/// ISO-8601 UTC timestamps with millisecond precision and a literal `Z`.
///
/// Parsing accepts any RFC 3339 offset (normalized to UTC) as well as naive
/// timestamps without an offset, which are taken to be UTC.
pub mod iso8601 {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn parse(s: &str) -> Option<DateTime<Utc>> {
        let s = s.trim();
        if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
            return Some(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid ISO-8601 timestamp: {s}")))
    }
}

//! Opaque rich-text note bodies.
//!
//! Bodies are carried as bytes and never interpreted beyond sniffing their
//! format. On the wire they travel as a base64 string (`attributedText`).
//! Plain text is wrapped in a minimal RTF envelope so the peer can render it
//! as an attributed string.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

const RTF_MAGIC: &[u8] = b"{\\rtf";

const RTF_PREFIX: &str =
    "{\\rtf1\\ansi\\ansicpg1252\\deff0\\nouicompat\\deflang1033\\viewkind4\\uc1\\pard\\f0\\fs20 ";
const RTF_SUFFIX: &str = "\\par}";

/// Encoding tag of a body, sniffed from its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    Rtf,
    PlainText,
    Binary,
}

/// A self-describing rich-text blob.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AttributedText {
    bytes: Vec<u8>,
}

impl AttributedText {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Wrap plain text in the RTF envelope.
    pub fn from_plain_text(text: &str) -> Self {
        let mut rtf = String::with_capacity(RTF_PREFIX.len() + text.len() + RTF_SUFFIX.len());
        rtf.push_str(RTF_PREFIX);
        escape_rtf(text, &mut rtf);
        rtf.push_str(RTF_SUFFIX);
        Self::from_bytes(rtf.into_bytes())
    }

    pub fn from_base64(encoded: &str) -> Result<Self, base64::DecodeError> {
        STANDARD.decode(encoded.trim()).map(Self::from_bytes)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn format(&self) -> BodyFormat {
        if self.bytes.starts_with(RTF_MAGIC) {
            BodyFormat::Rtf
        } else if std::str::from_utf8(&self.bytes).is_ok() {
            BodyFormat::PlainText
        } else {
            BodyFormat::Binary
        }
    }

    /// Recover the plain text of a body.
    ///
    /// Works for bodies produced by [`AttributedText::from_plain_text`] and
    /// for bare UTF-8 text. Returns `None` for foreign RTF and binary blobs.
    pub fn plain_text(&self) -> Option<String> {
        let text = std::str::from_utf8(&self.bytes).ok()?;
        match self.format() {
            BodyFormat::Rtf => {
                let inner = text.strip_prefix(RTF_PREFIX)?.strip_suffix(RTF_SUFFIX)?;
                unescape_rtf(inner)
            }
            BodyFormat::PlainText => Some(text.to_string()),
            BodyFormat::Binary => None,
        }
    }

    /// Short single-line preview for log output.
    pub fn preview(&self, max_chars: usize) -> String {
        match self.plain_text() {
            Some(text) => {
                let line = text.replace('\n', " ");
                let mut preview: String = line.chars().take(max_chars).collect();
                if line.chars().count() > max_chars {
                    preview.push('…');
                }
                preview
            }
            None => format!("<{:?} body, {} bytes>", self.format(), self.bytes.len()),
        }
    }
}

impl fmt::Debug for AttributedText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributedText")
            .field("format", &self.format())
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Serialize for AttributedText {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for AttributedText {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(|e| serde::de::Error::custom(e.to_string()))
    }
}

fn escape_rtf(text: &str, out: &mut String) {
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '{' => out.push_str("\\{"),
            '}' => out.push_str("\\}"),
            '\r' => {}
            '\n' => out.push_str("\\par "),
            c if c.is_ascii() => out.push(c),
            c => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    // RTF \u takes a signed 16-bit value
                    out.push_str(&format!("\\u{}?", *unit as i16));
                }
            }
        }
    }
}

fn unescape_rtf(inner: &str) -> Option<String> {
    let mut out = String::with_capacity(inner.len());
    let mut units: Vec<u16> = Vec::new();
    let mut rest = inner;

    while let Some(ch) = rest.chars().next() {
        if ch != '\\' {
            flush_utf16(&mut units, &mut out)?;
            out.push(ch);
            rest = &rest[ch.len_utf8()..];
            continue;
        }

        let escaped = &rest[1..];
        if let Some(tail) = escaped.strip_prefix("par ") {
            flush_utf16(&mut units, &mut out)?;
            out.push('\n');
            rest = tail;
        } else if let Some(tail) = escaped.strip_prefix('u') {
            let digits = tail
                .char_indices()
                .take_while(|&(i, c)| c.is_ascii_digit() || (i == 0 && c == '-'))
                .count();
            let value: i16 = tail[..digits].parse().ok()?;
            units.push(value as u16);
            rest = tail[digits..].strip_prefix('?').unwrap_or(&tail[digits..]);
        } else {
            let next = escaped.chars().next()?;
            if !matches!(next, '\\' | '{' | '}') {
                return None;
            }
            flush_utf16(&mut units, &mut out)?;
            out.push(next);
            rest = &escaped[next.len_utf8()..];
        }
    }

    flush_utf16(&mut units, &mut out)?;
    Some(out)
}

fn flush_utf16(units: &mut Vec<u16>, out: &mut String) -> Option<()> {
    if units.is_empty() {
        return Some(());
    }
    let decoded = String::from_utf16(units).ok()?;
    out.push_str(&decoded);
    units.clear();
    Some(())
}

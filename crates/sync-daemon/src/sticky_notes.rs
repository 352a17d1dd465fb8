//! Read-only note store over Windows Sticky Notes' `plum.sqlite`.
//!
//! The database layout has changed across Sticky Notes releases, so the store
//! checks a ranked list of known schema shapes and reads from the first one
//! that matches. An unknown layout yields no notes rather than a guess.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use note_sync_core::note::iso8601;
use note_sync_core::store::{Result, StoreError};
use note_sync_core::{AttributedText, Note, NoteColor, NoteId, NoteStore};
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

const STICKY_NOTES_PACKAGE: &str = "Microsoft.MicrosoftStickyNotes_8wekyb3d8bbwe";

/// .NET ticks (100ns since 0001-01-01) at the Unix epoch.
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;
const TICKS_PER_SECOND: i64 = 10_000_000;

/// A known table layout. Optional columns may be absent from the shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaShape {
    pub table: &'static str,
    pub text: &'static str,
    pub id: Option<&'static str>,
    pub color: Option<&'static str>,
    pub created: Option<&'static str>,
    pub updated: Option<&'static str>,
    /// Non-null means the note is in the trash
    pub deleted: Option<&'static str>,
}

impl SchemaShape {
    const fn text_only(table: &'static str, text: &'static str) -> Self {
        Self {
            table,
            text,
            id: None,
            color: None,
            created: None,
            updated: None,
            deleted: None,
        }
    }

    fn columns(&self) -> impl Iterator<Item = &'static str> {
        [Some(self.text), self.id, self.color, self.created, self.updated, self.deleted]
            .into_iter()
            .flatten()
    }
}

/// Known layouts, most specific first.
pub const SCHEMA_CANDIDATES: &[SchemaShape] = &[
    SchemaShape {
        table: "Note",
        text: "Text",
        id: Some("Id"),
        color: Some("Theme"),
        created: Some("CreatedAt"),
        updated: Some("UpdatedAt"),
        deleted: Some("DeletedAt"),
    },
    SchemaShape::text_only("Note", "Text"),
    SchemaShape::text_only("Notes", "Content"),
    SchemaShape::text_only("StickyNotes", "Body"),
    SchemaShape::text_only("Notes", "NoteText"),
];

/// Find the Sticky Notes database of the current user.
pub fn locate_database() -> Option<PathBuf> {
    candidate_paths(std::env::var_os("LOCALAPPDATA"), std::env::var_os("APPDATA"))
        .into_iter()
        .find(|path| path.exists())
}

/// Database locations to check, newest layout first.
fn candidate_paths(local_app_data: Option<OsString>, app_data: Option<OsString>) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(local) = local_app_data {
        paths.push(
            PathBuf::from(local)
                .join("Packages")
                .join(STICKY_NOTES_PACKAGE)
                .join("LocalState")
                .join("plum.sqlite"),
        );
    }
    if let Some(roaming) = app_data {
        paths.push(
            PathBuf::from(roaming)
                .join("Microsoft")
                .join("Sticky Notes")
                .join("StickyNotes.snt"),
        );
    }
    paths
}

/// Sticky Notes database reader.
#[derive(Debug, Clone)]
pub struct StickyNotesStore {
    path: PathBuf,
}

impl StickyNotesStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store over the database found by [`locate_database`].
    pub fn locate() -> Option<Self> {
        locate_database().map(Self::new)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl NoteStore for StickyNotesStore {
    async fn list_notes(&self) -> Result<Vec<Note>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_database(&path))
            .await
            .map_err(|e| StoreError::Backend(format!("reader task failed: {e}")))?
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Read every live note from the database at `path`.
pub fn read_database(path: &Path) -> Result<Vec<Note>> {
    if !path.exists() {
        return Err(StoreError::NotFound(path.to_path_buf()));
    }

    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(backend)?;

    let Some(shape) = detect_schema(&conn).map_err(backend)? else {
        warn!("No known Sticky Notes schema in {}", path.display());
        return Ok(Vec::new());
    };
    debug!("Using schema {:?} for {}", shape, path.display());

    let notes = read_notes(&conn, shape, &path.to_string_lossy()).map_err(backend)?;
    info!("Read {} note(s) from {}", notes.len(), path.display());
    Ok(notes)
}

/// Pick the first candidate whose table and columns all exist.
pub fn detect_schema(conn: &Connection) -> rusqlite::Result<Option<&'static SchemaShape>> {
    for shape in SCHEMA_CANDIDATES {
        let columns = table_columns(conn, shape.table)?;
        if columns.is_empty() {
            continue;
        }
        let matches = shape
            .columns()
            .all(|wanted| columns.iter().any(|c| c.eq_ignore_ascii_case(wanted)));
        if matches {
            return Ok(Some(shape));
        }
    }
    Ok(None)
}

/// Column names of `table`; empty if the table does not exist.
fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let names = stmt
        .query_map([table], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

fn column_or_null(column: Option<&str>) -> String {
    column.map_or_else(|| "NULL".to_string(), |c| format!("\"{c}\""))
}

fn read_notes(conn: &Connection, shape: &SchemaShape, namespace: &str) -> rusqlite::Result<Vec<Note>> {
    let mut sql = format!(
        "SELECT rowid, \"{}\", {}, {}, {}, {} FROM \"{}\"",
        shape.text,
        column_or_null(shape.id),
        column_or_null(shape.color),
        column_or_null(shape.created),
        column_or_null(shape.updated),
        shape.table,
    );
    if let Some(deleted) = shape.deleted {
        sql.push_str(&format!(" WHERE \"{deleted}\" IS NULL"));
    }
    sql.push_str(" ORDER BY rowid");

    let read_at = Utc::now();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| {
        Ok(StoredRow {
            rowid: row.get(0)?,
            text: row.get(1)?,
            id: row.get(2)?,
            color: row.get(3)?,
            created: row.get(4)?,
            updated: row.get(5)?,
        })
    })?;

    let mut notes = Vec::new();
    for row in rows {
        if let Some(note) = row?.into_note(shape.table, namespace, read_at) {
            notes.push(note);
        }
    }
    Ok(notes)
}

struct StoredRow {
    rowid: i64,
    text: Value,
    id: Value,
    color: Value,
    created: Value,
    updated: Value,
}

impl StoredRow {
    fn into_note(self, table: &str, namespace: &str, read_at: DateTime<Utc>) -> Option<Note> {
        let text = match self.text {
            Value::Text(text) => strip_paragraph_ids(&text),
            _ => return None,
        };
        if text.trim().is_empty() {
            return None;
        }

        let id = note_id(&self.id).unwrap_or_else(|| {
            let name = format!("{namespace}#{table}:{}", self.rowid);
            NoteId::new(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string())
        });

        let color = match &self.color {
            Value::Text(theme) => NoteColor::from_name(theme).unwrap_or_default(),
            _ => NoteColor::default(),
        };

        let created_at = timestamp(&self.created).unwrap_or(read_at);
        let modified_at = timestamp(&self.updated).unwrap_or(read_at).max(created_at);

        Some(
            Note::new(AttributedText::from_plain_text(&text))
                .with_id(id)
                .with_color(color)
                .with_timestamps(created_at, modified_at),
        )
    }
}

fn note_id(value: &Value) -> Option<NoteId> {
    match value {
        Value::Text(id) if !id.trim().is_empty() => Some(NoteId::new(id.trim())),
        Value::Blob(bytes) => Uuid::from_slice(bytes).ok().map(|u| NoteId::new(u.to_string())),
        _ => None,
    }
}

fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Integer(ticks) => from_dotnet_ticks(*ticks),
        Value::Text(text) => iso8601::parse(text),
        _ => None,
    }
}

/// Convert .NET ticks to UTC.
pub fn from_dotnet_ticks(ticks: i64) -> Option<DateTime<Utc>> {
    let since_epoch = ticks.checked_sub(UNIX_EPOCH_TICKS)?;
    let secs = since_epoch.div_euclid(TICKS_PER_SECOND);
    let nanos = (since_epoch.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}

/// Remove the `\id=<guid> ` marker Sticky Notes puts before each paragraph.
fn strip_paragraph_ids(text: &str) -> String {
    text.lines()
        .map(|line| match line.strip_prefix("\\id=") {
            Some(rest) => rest.split_once(' ').map_or("", |(_, content)| content),
            None => line,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

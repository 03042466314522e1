use std::path::Path;

use chrono::{DateTime, Utc};
use log::warn;
use rusqlite::types::ToSql;
use rusqlite::{named_params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::error::VideoIndexError;
use crate::utils::Utils;

/// Entries returned per `list` call. The UI loads further pages incrementally.
pub const PAGE_SIZE: usize = 6;

/// Attempts at inserting a new entry before an opaque id collision is reported.
const MAX_ID_ATTEMPTS: usize = 3;

const UPSERT_OBSERVED_SQL: &str = "
    INSERT INTO files (file_path, id, suffix, scanned, last_scanned_at)
    VALUES (:file_path, :id, :suffix, 1, :now)
    ON CONFLICT (file_path) DO UPDATE SET
        scanned = 1,
        suffix = excluded.suffix,
        last_scanned_at = excluded.last_scanned_at";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FileEntry {
    path: String,
    id: String,
    suffix: String,
    scanned: bool,
    last_scanned_at: DateTime<Utc>,
    notes: String,
}

/// Listing parameters. `after` is the keyset cursor: the path of the last entry of
/// the previous page, or "" for the first page.
#[derive(Clone, Debug, Default)]
pub struct FileFilter {
    pub after: String,
    pub missing_notes_only: bool,
    pub query: Option<String>,
    /// Include files whose suffix is not enabled
    pub all_suffixes: bool,
}

impl FileEntry {
    const SELECT_COLUMNS: &'static str =
        "SELECT f.file_path, f.id, f.suffix, f.scanned, f.last_scanned_at, f.notes FROM files f";

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(FileEntry {
            path: row.get(0)?,
            id: row.get(1)?,
            suffix: row.get(2)?,
            scanned: row.get(3)?,
            last_scanned_at: Utils::timestamp_column(row, 4)?,
            notes: row.get(5)?,
        })
    }

    /// Record that `path` exists right now. New paths get a fresh opaque id; known
    /// paths are re-marked and re-stamped with their id and notes untouched.
    pub fn upsert_observed(conn: &Connection, path: &str) -> Result<(), VideoIndexError> {
        let suffix = Utils::suffix_of(Path::new(path));
        let now = Utils::now_timestamp();

        let mut attempt = 1;
        loop {
            let result = conn.execute(
                UPSERT_OBSERVED_SQL,
                named_params! {
                    ":file_path": path,
                    ":id": Utils::generate_id(),
                    ":suffix": suffix,
                    ":now": now,
                },
            );

            match result.map_err(VideoIndexError::from) {
                Ok(_) => return Ok(()),
                // Only the unique id index can conflict here; the path conflict is the upsert
                Err(VideoIndexError::Conflict(msg)) if attempt < MAX_ID_ATTEMPTS => {
                    warn!("Opaque id collision inserting '{}' ({}), retrying", path, msg);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn get_by_id(conn: &Connection, id: &str) -> Result<Option<Self>, VideoIndexError> {
        let sql = format!("{} WHERE f.id = ?1", Self::SELECT_COLUMNS);
        conn.query_row(&sql, [id], Self::from_row)
            .optional()
            .map_err(VideoIndexError::from)
    }

    /// Overwrite the notes of one entry. Scan state is not touched.
    pub fn update_notes(conn: &Connection, id: &str, notes: &str) -> Result<(), VideoIndexError> {
        let updated = conn.execute(
            "UPDATE files SET notes = :notes WHERE id = :id",
            named_params! { ":notes": notes, ":id": id },
        )?;

        if updated == 0 {
            return Err(VideoIndexError::NotFound(format!("file id '{}'", id)));
        }
        Ok(())
    }

    /// One page of live entries after `filter.after`, in ascending path order.
    pub fn list(conn: &Connection, filter: &FileFilter) -> Result<Vec<Self>, VideoIndexError> {
        let limit = PAGE_SIZE as i64;
        let query = filter.query.as_deref().filter(|q| !q.is_empty());

        let mut sql = String::from(Self::SELECT_COLUMNS);
        if !filter.all_suffixes {
            sql.push_str(" JOIN suffixes s ON s.suffix = f.suffix AND s.enabled = 1");
        }
        sql.push_str(" WHERE f.scanned = 1 AND f.file_path > :after");
        if filter.missing_notes_only {
            sql.push_str(" AND length(f.notes) = 0");
        }
        if query.is_some() {
            sql.push_str(" AND instr(lower(f.file_path || ' ' || f.notes), lower(:query)) > 0");
        }
        sql.push_str(" ORDER BY f.file_path LIMIT :limit");

        let mut params: Vec<(&str, &dyn ToSql)> = vec![(":after", &filter.after), (":limit", &limit)];
        if let Some(ref q) = query {
            params.push((":query", q));
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params.as_slice(), Self::from_row)?;

        let mut entries = Vec::with_capacity(PAGE_SIZE);
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Cursor for the page after `page`, or None when `page` was the last one.
    pub fn next_cursor(page: &[FileEntry]) -> Option<&str> {
        if page.len() < PAGE_SIZE {
            return None;
        }
        page.last().map(|entry| entry.path())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn is_scanned(&self) -> bool {
        self.scanned
    }

    pub fn last_scanned_at(&self) -> DateTime<Utc> {
        self.last_scanned_at
    }

    pub fn notes(&self) -> &str {
        &self.notes
    }
}

use std::path::{Path, PathBuf};
use std::{env, fs};

use chrono::{DateTime, Utc};
use log::{debug, info};
use rusqlite::{named_params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::database::Database;
use crate::error::VideoIndexError;
use crate::utils::Utils;

/// A registered root folder and the state of its most recent scan.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Location {
    root_folder: String,
    last_scan_started_at: Option<DateTime<Utc>>,
    last_scan_completed_at: Option<DateTime<Utc>>,
}

impl Location {
    const SELECT_COLUMNS: &'static str =
        "SELECT root_folder, last_scan_started_at, last_scan_completed_at FROM locations";

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Location {
            root_folder: row.get(0)?,
            last_scan_started_at: Utils::opt_timestamp_column(row, 1)?,
            last_scan_completed_at: Utils::opt_timestamp_column(row, 2)?,
        })
    }

    /// Register `root_folder`. Adding an existing root is a no-op.
    pub fn add(conn: &Connection, root_folder: &str) -> Result<(), VideoIndexError> {
        let inserted = conn.execute(
            "INSERT INTO locations (root_folder) VALUES (?1) ON CONFLICT (root_folder) DO NOTHING",
            [root_folder],
        )?;

        if inserted > 0 {
            info!("Added location '{}'", root_folder);
        } else {
            debug!("Location '{}' already registered", root_folder);
        }

        Ok(())
    }

    pub fn get(conn: &Connection, root_folder: &str) -> Result<Option<Self>, VideoIndexError> {
        let sql = format!("{} WHERE root_folder = ?1", Self::SELECT_COLUMNS);
        conn.query_row(&sql, [root_folder], Self::from_row)
            .optional()
            .map_err(VideoIndexError::from)
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, VideoIndexError> {
        let sql = format!("{} ORDER BY root_folder", Self::SELECT_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::from_row)?;

        let mut locations = Vec::new();
        for row in rows {
            locations.push(row?);
        }
        Ok(locations)
    }

    /// Open a new scan epoch: stamp the start time, clear the completion time and
    /// un-mark every file under the root so the walk can re-mark what it finds.
    pub fn mark_scan_start(conn: &Connection, root_folder: &str) -> Result<(), VideoIndexError> {
        Database::immediate_transaction(conn, |c| {
            let updated = c.execute(
                "UPDATE locations
                SET last_scan_started_at = :now, last_scan_completed_at = NULL
                WHERE root_folder = :root_folder",
                named_params! {
                    ":now": Utils::now_timestamp(),
                    ":root_folder": root_folder,
                },
            )?;
            if updated == 0 {
                return Err(VideoIndexError::NotFound(format!("location '{}'", root_folder)));
            }

            let unmarked = c.execute(
                "UPDATE files
                SET scanned = 0
                WHERE substr(file_path, 1, length(:prefix)) = :prefix",
                named_params! { ":prefix": Utils::subtree_prefix(root_folder) },
            )?;
            debug!("Un-marked {} file entries under '{}'", unmarked, root_folder);
            Ok(())
        })
    }

    /// Close the scan epoch: stamp the completion time and sweep every entry under
    /// the root that the walk did not re-mark. Returns the number of entries removed.
    pub fn mark_scan_complete(conn: &Connection, root_folder: &str) -> Result<usize, VideoIndexError> {
        Database::immediate_transaction(conn, |c| {
            let updated = c.execute(
                "UPDATE locations
                SET last_scan_completed_at = :now
                WHERE root_folder = :root_folder",
                named_params! {
                    ":now": Utils::now_timestamp(),
                    ":root_folder": root_folder,
                },
            )?;
            if updated == 0 {
                return Err(VideoIndexError::NotFound(format!("location '{}'", root_folder)));
            }

            let removed = c.execute(
                "DELETE FROM files
                WHERE substr(file_path, 1, length(:prefix)) = :prefix
                AND scanned = 0",
                named_params! { ":prefix": Utils::subtree_prefix(root_folder) },
            )?;
            Ok(removed)
        })
    }

    pub fn root_folder(&self) -> &str {
        &self.root_folder
    }

    pub fn last_scan_started_at(&self) -> Option<DateTime<Utc>> {
        self.last_scan_started_at
    }

    pub fn last_scan_completed_at(&self) -> Option<DateTime<Utc>> {
        self.last_scan_completed_at
    }

    /// Started but not completed: a scan is running or the last one was interrupted.
    pub fn is_scan_incomplete(&self) -> bool {
        self.last_scan_started_at.is_some() && self.last_scan_completed_at.is_none()
    }

    /// Resolve user input to the canonical absolute directory the store expects.
    pub fn validate_and_canonicalize_path(path_arg: &str) -> Result<PathBuf, VideoIndexError> {
        let path_arg = path_arg.trim();
        if path_arg.is_empty() {
            return Err(VideoIndexError::Error("Provided path is empty".into()));
        }

        let path = Path::new(path_arg);

        let absolute_path = if path.is_absolute() {
            path.to_owned()
        } else {
            env::current_dir()?.join(path)
        };

        if !absolute_path.exists() {
            return Err(VideoIndexError::Error(format!(
                "Path '{}' does not exist",
                absolute_path.display()
            )));
        }

        // Follows symlinks: a link to a directory is accepted and stored by its target
        let metadata = fs::metadata(&absolute_path)?;
        if !metadata.is_dir() {
            return Err(VideoIndexError::Error(format!(
                "Path '{}' is not a directory",
                absolute_path.display()
            )));
        }

        // Canonicalize using Dunce (de-UNC) to strip the "UNC" (e.g., \\?\C) on Windows
        let canonical_path = dunce::canonicalize(absolute_path)?;

        if canonical_path.to_str().is_none() {
            return Err(VideoIndexError::Error(format!(
                "Path '{}' is not valid UTF-8",
                canonical_path.display()
            )));
        }

        Ok(canonical_path)
    }
}

use log::info;
use rusqlite::{named_params, Connection};
use serde::Serialize;

use crate::error::VideoIndexError;

/// Aggregate statistics for one file suffix.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SuffixCount {
    pub suffix: String,
    pub file_count: i64,
    pub enabled: bool,
}

pub struct Suffixes {}

impl Suffixes {
    /// Every non-empty suffix that has at least one file entry, with its entry count
    /// and enablement. Suffixes that were never toggled report `enabled = false`.
    pub fn counts(conn: &Connection) -> Result<Vec<SuffixCount>, VideoIndexError> {
        let mut stmt = conn.prepare(
            "WITH c AS (
                SELECT suffix, count(*) AS file_count
                FROM files
                WHERE length(suffix) > 0
                GROUP BY suffix
            )
            SELECT c.suffix, c.file_count, COALESCE(s.enabled, 0) AS enabled
            FROM c
            LEFT JOIN suffixes s ON s.suffix = c.suffix
            ORDER BY c.suffix",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(SuffixCount {
                suffix: row.get(0)?,
                file_count: row.get(1)?,
                enabled: row.get(2)?,
            })
        })?;

        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }

    pub fn set_enabled(conn: &Connection, suffix: &str, enabled: bool) -> Result<(), VideoIndexError> {
        conn.execute(
            "INSERT INTO suffixes (suffix, enabled) VALUES (:suffix, :enabled)
            ON CONFLICT (suffix) DO UPDATE SET enabled = excluded.enabled",
            named_params! { ":suffix": suffix, ":enabled": enabled },
        )?;

        info!(
            "Suffix '{}' {}",
            suffix,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }
}

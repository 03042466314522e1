mod v0_to_v1;
mod v1_to_v2;

use log::{debug, info};
use rusqlite::{params, Connection};

use crate::database::Database;
use crate::error::VideoIndexError;
use crate::utils::Utils;

use v0_to_v1::UPGRADE_0_TO_1_SQL;
use v1_to_v2::UPGRADE_1_TO_2_SQL;

/// A single schema step. `sql` must be idempotent; it runs in the same immediate
/// transaction as the version record that marks it applied.
pub struct Migration {
    pub version: i64,
    pub sql: &'static str,
}

impl Migration {
    pub const fn new(version: i64, sql: &'static str) -> Self {
        Self { version, sql }
    }
}

pub const MIGRATION_0_TO_1: Migration = Migration::new(1, UPGRADE_0_TO_1_SQL);
pub const MIGRATION_1_TO_2: Migration = Migration::new(2, UPGRADE_1_TO_2_SQL);

/// All migrations, in strictly increasing version order.
pub const MIGRATIONS: &[Migration] = &[MIGRATION_0_TO_1, MIGRATION_1_TO_2];

/// Version of the last migration; the schema this build expects.
pub const CURRENT_SCHEMA_VERSION: i64 = MIGRATIONS[MIGRATIONS.len() - 1].version;

/// Highest applied schema version, or 0 if the version log does not exist yet.
pub fn current_version(conn: &Connection) -> Result<i64, VideoIndexError> {
    let table_exists: bool = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_versions'",
        [],
        |row| row.get::<_, i64>(0),
    )? > 0;

    if !table_exists {
        return Ok(0);
    }

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(schema_version), 0) FROM schema_versions",
        [],
        |row| row.get(0),
    )?;

    Ok(version)
}

/// Bring the store up to `CURRENT_SCHEMA_VERSION`. Returns the resulting version.
///
/// Any failure is fatal to the caller: the store is left at the last fully
/// applied version and the process must not continue with it.
pub fn migrate(db: &Database) -> Result<i64, VideoIndexError> {
    let version = migrate_with(db, MIGRATIONS)?;
    debug!(
        "Database schema at version {} (expected {})",
        version, CURRENT_SCHEMA_VERSION
    );
    Ok(version)
}

fn migrate_with(db: &Database, migrations: &[Migration]) -> Result<i64, VideoIndexError> {
    let conn = db.get_connection()?;

    let start = current_version(&conn)?;
    let mut version = start;
    info!("Database schema version is {}", start);

    let latest = migrations.last().map(|m| m.version).unwrap_or(0);
    if start > latest {
        return Err(VideoIndexError::Error(format!(
            "Database schema version {} is newer than the latest supported version {}",
            start, latest
        )));
    }

    for migration in migrations.iter().filter(|m| m.version > start) {
        info!("Migrating to database schema version {}", migration.version);

        Database::immediate_transaction(&conn, |c| {
            // Another process may have applied this step while we waited for the write lock
            if current_version(c)? >= migration.version {
                return Ok(());
            }

            c.execute_batch(migration.sql)?;
            c.execute(
                "INSERT INTO schema_versions (schema_version, migration_applied_at) VALUES (?1, ?2)",
                params![migration.version, Utils::now_timestamp()],
            )?;
            Ok(())
        })
        .map_err(|e| VideoIndexError::MigrationFailed {
            version: migration.version,
            reason: e.to_string(),
        })?;

        version = migration.version;
    }

    Ok(version)
}

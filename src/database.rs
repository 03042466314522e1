use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, error, info};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::error::VideoIndexError;

pub const DB_FILENAME: &str = "video-index.db";

pub type DbPool = Pool<SqliteConnectionManager>;
pub type PooledConn = PooledConnection<SqliteConnectionManager>;

/// Handle to the index store. Cloning is cheap and shares the same pool, so the
/// entry point creates one and hands clones to every component.
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    path: PathBuf,
}

impl Database {
    /// Open (creating if needed) the database file at `path`.
    ///
    /// Every pooled connection runs in WAL mode so readers are never blocked by the
    /// scan writer, and waits up to `busy_timeout` for the write lock instead of
    /// failing immediately with SQLITE_BUSY.
    pub fn open(path: &Path, pool_size: u32, busy_timeout: Duration) -> Result<Self, VideoIndexError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            Ok(())
        });

        let pool = Pool::builder().max_size(pool_size).build(manager)?;
        info!("Database opened at: {}", path.display());

        Ok(Database {
            pool,
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check out a connection for the duration of one logical operation.
    pub fn get_connection(&self) -> Result<PooledConn, VideoIndexError> {
        Ok(self.pool.get()?)
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction, committing on success and
    /// rolling back on any error.
    pub fn immediate_transaction<F, T>(conn: &Connection, f: F) -> Result<T, VideoIndexError>
    where
        F: FnOnce(&Connection) -> Result<T, VideoIndexError>,
    {
        conn.execute_batch("BEGIN IMMEDIATE")?;

        match f(conn) {
            Ok(value) => match conn.execute_batch("COMMIT") {
                Ok(()) => Ok(value),
                Err(commit_err) => {
                    error!("Commit failed, rolling back: {}", commit_err);
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(commit_err.into())
                }
            },
            Err(e) => {
                debug!("Rolling back transaction: {}", e);
                if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                    error!("Rollback failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }
}

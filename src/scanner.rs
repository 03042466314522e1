// Scan of one location, as three steps on one connection:
// 1. Start
//      - Stamp last_scan_started_at, clear last_scan_completed_at
//      - Un-mark (scanned = 0) every file entry under the root
// 2. Walk
//      - Depth-first over an explicit stack, checking for interrupt at each pop
//      - Upsert every non-directory entry, which re-marks it (batched transactions)
// 3. Complete
//      - Stamp last_scan_completed_at
//      - Delete every file entry under the root that is still un-marked
//
// An interrupted or failed scan stops after step 2 without completing. That leaves
// the location looking like a crashed scan, which the next successful scan repairs.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn, Level};
use logging_timer::timer;
use rusqlite::Connection;
use serde::Serialize;

use crate::database::Database;
use crate::error::VideoIndexError;
use crate::files::FileEntry;
use crate::locations::Location;

pub struct Scanner {}

/// Batch size for database write operations during the walk
const SCAN_BATCH_SIZE: usize = 100;

/// Counts reported when a scan completes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub files_observed: u64,
    pub directories_walked: u64,
    pub items_skipped: u64,
    pub entries_removed: u64,
}

/// Walk state, so the helpers don't need long parameter lists
struct ScanContext<'a> {
    conn: &'a Connection,
    interrupt_token: &'a Arc<AtomicBool>,
    in_transaction: bool,
    batch_count: usize,
    summary: ScanSummary,
}

impl<'a> ScanContext<'a> {
    fn new(conn: &'a Connection, interrupt_token: &'a Arc<AtomicBool>) -> Self {
        Self {
            conn,
            interrupt_token,
            in_transaction: false,
            batch_count: 0,
            summary: ScanSummary::default(),
        }
    }

    fn execute_batch_write<F, T>(&mut self, f: F) -> Result<T, VideoIndexError>
    where
        F: FnOnce(&Connection) -> Result<T, VideoIndexError>,
    {
        // Start transaction on first write
        if !self.in_transaction {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
            self.in_transaction = true;
        }

        let result = f(self.conn)?;
        self.batch_count += 1;

        // Auto-flush at batch size
        if self.batch_count >= SCAN_BATCH_SIZE {
            self.flush()?;
        }

        Ok(result)
    }

    fn flush(&mut self) -> Result<(), VideoIndexError> {
        let _tmr = timer!(Level::Trace; "ScanContext.flush", "{}", self.batch_count);
        if self.in_transaction {
            self.conn.execute_batch("COMMIT")?;
            self.in_transaction = false;
            self.batch_count = 0;
        }
        Ok(())
    }

    fn skip(&mut self) {
        self.summary.items_skipped += 1;
    }
}

impl<'a> Drop for ScanContext<'a> {
    fn drop(&mut self) {
        // An open transaction at drop time means the walk did not finish (error or
        // interrupt), possibly on the batch's first write. Roll it back so the
        // connection returns to the pool in autocommit mode.
        if self.in_transaction {
            debug!(
                "ScanContext dropped with {} unflushed writes - rolling back transaction",
                self.batch_count
            );
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                error!("Failed to roll back scan batch: {}", e);
            }
        }
    }
}

impl Scanner {
    /// Reconcile the index against the current contents of `root_folder`.
    ///
    /// `root_folder` must be a registered location holding a canonical directory path.
    /// Returns `ScanInterrupted` if `interrupt_token` was raised before the walk finished
    /// and `RootUnreadable` if the root itself could not be listed; in both cases the
    /// location's completion time stays null.
    pub fn scan_location(
        db: &Database,
        root_folder: &str,
        interrupt_token: &Arc<AtomicBool>,
    ) -> Result<ScanSummary, VideoIndexError> {
        let _tmr = timer!(Level::Debug; "Scanner.scan_location", "{}", root_folder);
        let conn = db.get_connection()?;

        Location::mark_scan_start(&conn, root_folder)?;

        let mut ctx = ScanContext::new(&conn, interrupt_token);
        Scanner::walk(&mut ctx, Path::new(root_folder))?;
        ctx.flush()?;
        let mut summary = std::mem::take(&mut ctx.summary);
        drop(ctx);

        let removed = Location::mark_scan_complete(&conn, root_folder)?;
        summary.entries_removed = removed as u64;

        info!(
            "Scan of '{}' complete: {} files in {} directories, {} skipped, {} removed",
            root_folder,
            summary.files_observed,
            summary.directories_walked,
            summary.items_skipped,
            summary.entries_removed
        );

        Ok(summary)
    }

    fn walk(ctx: &mut ScanContext, root: &Path) -> Result<(), VideoIndexError> {
        // Directories are compared by canonical path so a symlink back to an
        // ancestor (or a second link to the same folder) is entered only once
        let mut visited: HashSet<PathBuf> = HashSet::new();
        let root_canonical = match fs::canonicalize(root) {
            Ok(p) => p,
            Err(e) => {
                error!("Cannot resolve root directory '{}': {}", root.display(), e);
                return Err(VideoIndexError::RootUnreadable(root.to_path_buf()));
            }
        };
        visited.insert(root_canonical);

        let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];

        while let Some(dir) = stack.pop() {
            Scanner::check_interrupted(ctx.interrupt_token)?;

            let _tmr = timer!(Level::Trace; "Scanner.walk", "{}", dir.display());
            debug!("Scanning {}", dir.display());

            let items = match fs::read_dir(&dir) {
                Ok(items) => items,
                Err(e) if dir == root => {
                    error!("Cannot read root directory '{}': {}. Scan cannot proceed.", dir.display(), e);
                    return Err(VideoIndexError::RootUnreadable(dir));
                }
                Err(e) => {
                    match e.kind() {
                        ErrorKind::NotFound => {
                            debug!("Directory disappeared during scan: '{}'", dir.display());
                        }
                        _ => {
                            warn!("Skipping unreadable directory '{}': {}", dir.display(), e);
                        }
                    }
                    ctx.skip();
                    continue;
                }
            };

            ctx.summary.directories_walked += 1;

            for item in items {
                let item = match item {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("Error reading directory entry in '{}': {}", dir.display(), e);
                        ctx.skip();
                        continue;
                    }
                };
                let item_path = item.path();

                // file_type() does not follow symlinks
                let file_type = match item.file_type() {
                    Ok(ft) => ft,
                    Err(e) => {
                        warn!("Cannot stat '{}': {}", item_path.display(), e);
                        ctx.skip();
                        continue;
                    }
                };

                let is_dir = if file_type.is_symlink() {
                    match fs::metadata(&item_path) {
                        Ok(target) => target.is_dir(),
                        Err(e) => {
                            warn!("Skipping broken symlink '{}': {}", item_path.display(), e);
                            ctx.skip();
                            continue;
                        }
                    }
                } else {
                    file_type.is_dir()
                };

                if is_dir {
                    Scanner::push_directory(ctx, &mut stack, &mut visited, item_path);
                } else {
                    Scanner::observe_file(ctx, &item_path)?;
                }
            }
        }

        Ok(())
    }

    fn push_directory(
        ctx: &mut ScanContext,
        stack: &mut Vec<PathBuf>,
        visited: &mut HashSet<PathBuf>,
        dir: PathBuf,
    ) {
        match fs::canonicalize(&dir) {
            Ok(canonical) => {
                if visited.insert(canonical) {
                    stack.push(dir);
                } else {
                    debug!("Not re-entering already visited directory '{}'", dir.display());
                }
            }
            Err(e) => {
                warn!("Cannot resolve directory '{}': {}", dir.display(), e);
                ctx.skip();
            }
        }
    }

    fn observe_file(ctx: &mut ScanContext, path: &Path) -> Result<(), VideoIndexError> {
        let Some(path_str) = path.to_str() else {
            warn!("Skipping path that is not valid UTF-8: '{}'", path.display());
            ctx.skip();
            return Ok(());
        };

        ctx.execute_batch_write(|conn| FileEntry::upsert_observed(conn, path_str))?;
        ctx.summary.files_observed += 1;
        Ok(())
    }

    /// Check if scan has been interrupted, returning error if so
    fn check_interrupted(interrupt_token: &Arc<AtomicBool>) -> Result<(), VideoIndexError> {
        if interrupt_token.load(Ordering::Acquire) {
            Err(VideoIndexError::ScanInterrupted)
        } else {
            Ok(())
        }
    }
}

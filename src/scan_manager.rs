use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use log::{error, info, warn};
use threadpool::ThreadPool;

use crate::database::Database;
use crate::error::VideoIndexError;
use crate::scanner::Scanner;
use crate::utils::Utils;

/// Dispatches scans onto a worker pool, at most one in flight per root.
///
/// A request for a root that is already scanning is coalesced into a single
/// follow-up scan. A request whose root contains, or is contained by, an in-flight
/// root waits in the pending queue until that scan finishes, because the two sweeps
/// would otherwise delete entries the other walk has not re-marked yet.
#[derive(Clone)]
pub struct ScanManager {
    shared: Arc<Shared>,
}

struct Shared {
    db: Database,
    queue: Mutex<ScanQueue>,
    idle: Condvar,
}

struct ActiveScan {
    interrupt_token: Arc<AtomicBool>,
    rerun_requested: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Admission {
    Start,
    Coalesced,
    Queued,
    Rejected,
}

/// Bookkeeping for in-flight and waiting scans. Kept free of threads so the
/// scheduling rules can be tested directly.
struct ScanQueue {
    pool: ThreadPool,
    active: HashMap<String, ActiveScan>,
    pending: VecDeque<String>,
    shutting_down: bool,
}

impl ScanQueue {
    fn new(pool: ThreadPool) -> Self {
        Self {
            pool,
            active: HashMap::new(),
            pending: VecDeque::new(),
            shutting_down: false,
        }
    }

    fn admit(&mut self, root: &str) -> Admission {
        if self.shutting_down {
            return Admission::Rejected;
        }

        if let Some(active) = self.active.get_mut(root) {
            active.rerun_requested = true;
            return Admission::Coalesced;
        }

        if self.pending.iter().any(|p| p == root) {
            return Admission::Coalesced;
        }

        if self.active.keys().any(|a| Utils::roots_overlap(a, root)) {
            self.pending.push_back(root.to_owned());
            return Admission::Queued;
        }

        Admission::Start
    }

    fn activate(&mut self, root: &str) -> Arc<AtomicBool> {
        let interrupt_token = Arc::new(AtomicBool::new(false));
        self.active.insert(
            root.to_owned(),
            ActiveScan {
                interrupt_token: Arc::clone(&interrupt_token),
                rerun_requested: false,
            },
        );
        interrupt_token
    }

    /// Retire `root` and return the waiting roots that may start now, in request order.
    fn finish(&mut self, root: &str) -> Vec<String> {
        let rerun = self
            .active
            .remove(root)
            .map(|a| a.rerun_requested)
            .unwrap_or(false);

        if self.shutting_down {
            self.pending.clear();
            return Vec::new();
        }

        // The coalesced follow-up runs before anything queued behind it
        if rerun && !self.pending.iter().any(|p| p == root) {
            self.pending.push_front(root.to_owned());
        }

        let mut ready: Vec<String> = Vec::new();
        let mut still_waiting = VecDeque::new();
        while let Some(candidate) = self.pending.pop_front() {
            let blocked = self
                .active
                .keys()
                .chain(ready.iter())
                .any(|other| Utils::roots_overlap(other, &candidate));
            if blocked {
                still_waiting.push_back(candidate);
            } else {
                ready.push(candidate);
            }
        }
        self.pending = still_waiting;

        ready
    }

    fn is_idle(&self) -> bool {
        self.active.is_empty() && self.pending.is_empty()
    }
}

impl ScanManager {
    pub fn new(db: Database, threads: usize) -> Self {
        let pool = ThreadPool::with_name("scan-worker".into(), threads.max(1));
        Self {
            shared: Arc::new(Shared {
                db,
                queue: Mutex::new(ScanQueue::new(pool)),
                idle: Condvar::new(),
            }),
        }
    }

    /// Ask for `root_folder` to be scanned. Returns immediately; completion is
    /// visible through the location's `last_scan_completed_at`.
    pub fn request_scan(&self, root_folder: &str) {
        let mut queue = self.shared.queue.lock().unwrap();

        match queue.admit(root_folder) {
            Admission::Start => Self::start_locked(&self.shared, &mut queue, root_folder),
            Admission::Coalesced => {
                info!("Scan of '{}' already requested, coalescing", root_folder)
            }
            Admission::Queued => {
                info!("Scan of '{}' queued behind an overlapping scan", root_folder)
            }
            Admission::Rejected => {
                warn!("Ignoring scan request for '{}': shutting down", root_folder)
            }
        }
    }

    /// Interrupt the in-flight scan of `root_folder`, or drop it from the queue if it
    /// has not started. The location is left incomplete, like a crashed scan.
    pub fn request_cancellation(&self, root_folder: &str) -> Result<(), VideoIndexError> {
        let mut queue = self.shared.queue.lock().unwrap();

        if let Some(active) = queue.active.get_mut(root_folder) {
            active.rerun_requested = false;
            active.interrupt_token.store(true, Ordering::Release);
            info!("Cancellation requested for scan of '{}'", root_folder);
            return Ok(());
        }

        let before = queue.pending.len();
        queue.pending.retain(|p| p != root_folder);
        if queue.pending.len() < before {
            info!("Removed queued scan of '{}'", root_folder);
            if queue.is_idle() {
                self.shared.idle.notify_all();
            }
            return Ok(());
        }

        Err(VideoIndexError::NotFound(format!(
            "no scan in progress for '{}'",
            root_folder
        )))
    }

    pub fn is_scanning(&self, root_folder: &str) -> bool {
        let queue = self.shared.queue.lock().unwrap();
        queue.active.contains_key(root_folder)
    }

    /// Roots with a scan in flight, sorted.
    pub fn active_roots(&self) -> Vec<String> {
        let queue = self.shared.queue.lock().unwrap();
        let mut roots: Vec<String> = queue.active.keys().cloned().collect();
        roots.sort();
        roots
    }

    /// Block until no scan is running or waiting.
    pub fn wait_idle(&self) {
        let mut queue = self.shared.queue.lock().unwrap();
        while !queue.is_idle() {
            queue = self.shared.idle.wait(queue).unwrap();
        }
    }

    /// Interrupt every in-flight scan, drop waiting ones, and wait for workers to stop.
    pub fn shutdown(&self) {
        self.interrupt_all();
        self.wait_idle();
        info!("Scan manager shut down");
    }

    fn interrupt_all(&self) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.shutting_down = true;
        queue.pending.clear();
        for active in queue.active.values() {
            active.interrupt_token.store(true, Ordering::Release);
        }
    }

    /// Called with the queue mutex held
    fn start_locked(shared: &Arc<Shared>, queue: &mut ScanQueue, root_folder: &str) {
        let interrupt_token = queue.activate(root_folder);
        let shared_for_worker = Arc::clone(shared);
        let root = root_folder.to_owned();

        queue.pool.execute(move || {
            let guard = CompletionGuard {
                shared: shared_for_worker,
                root,
            };
            Self::run_scan(&guard.shared.db, &guard.root, &interrupt_token);
        });
    }

    fn run_scan(db: &Database, root_folder: &str, interrupt_token: &Arc<AtomicBool>) {
        info!("Scan of '{}' started", root_folder);

        match Scanner::scan_location(db, root_folder, interrupt_token) {
            Ok(_) => {}
            Err(VideoIndexError::ScanInterrupted) => {
                info!("Scan of '{}' was interrupted; location left incomplete", root_folder);
            }
            Err(e) => {
                error!("Scan of '{}' failed: {}", root_folder, e);
            }
        }
    }

    fn on_scan_complete(shared: &Arc<Shared>, root_folder: &str) {
        // Runs from a drop guard, possibly while a panicking scan unwinds
        let mut queue = shared.queue.lock().unwrap_or_else(|e| e.into_inner());

        for next in queue.finish(root_folder) {
            Self::start_locked(shared, &mut queue, &next);
        }

        if queue.is_idle() {
            shared.idle.notify_all();
        }
    }
}

/// Retires the root when the worker job ends, whether the scan returned or panicked.
struct CompletionGuard {
    shared: Arc<Shared>,
    root: String,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        ScanManager::on_scan_complete(&self.shared, &self.root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::open_temp_database;
    use crate::database::PooledConn;
    use crate::files::{FileEntry, FileFilter};
    use crate::locations::Location;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    fn queue() -> ScanQueue {
        ScanQueue::new(ThreadPool::new(1))
    }

    #[cfg(unix)]
    #[test]
    fn test_admit_rules() {
        let mut q = queue();
        assert_eq!(q.admit("/videos"), Admission::Start);
        q.activate("/videos");

        assert_eq!(q.admit("/videos"), Admission::Coalesced);
        assert!(q.active["/videos"].rerun_requested);

        assert_eq!(q.admit("/videos/sub"), Admission::Queued);
        assert_eq!(q.admit("/videos/sub"), Admission::Coalesced);
        assert_eq!(q.pending.len(), 1);

        assert_eq!(q.admit("/videos2"), Admission::Start);
    }

    #[cfg(unix)]
    #[test]
    fn test_finish_runs_rerun_before_overlapping_waiters() {
        let mut q = queue();
        q.activate("/videos");
        assert_eq!(q.admit("/videos/sub"), Admission::Queued);
        assert_eq!(q.admit("/archive/old"), Admission::Start);
        q.activate("/archive/old");
        assert_eq!(q.admit("/videos"), Admission::Coalesced);

        // The follow-up of /videos goes first; the child overlaps it and keeps waiting
        let ready = q.finish("/videos");
        assert_eq!(ready, vec!["/videos".to_string()]);
        assert_eq!(q.pending, VecDeque::from(vec!["/videos/sub".to_string()]));

        q.activate("/videos");
        assert_eq!(q.finish("/videos"), vec!["/videos/sub".to_string()]);
        q.activate("/videos/sub");
        assert!(q.finish("/videos/sub").is_empty());
        assert!(q.finish("/archive/old").is_empty());
        assert!(q.is_idle());
    }

    #[test]
    fn test_shutdown_rejects_and_drops_pending() {
        let mut q = queue();
        q.activate("/a");
        q.pending.push_back("/a/b".into());
        q.shutting_down = true;

        assert_eq!(q.admit("/c"), Admission::Rejected);
        assert!(q.finish("/a").is_empty());
        assert!(q.is_idle());
    }

    #[test]
    fn test_request_scan_runs_in_background() {
        let (_db_dir, db) = open_temp_database();
        let tree = TempDir::new().unwrap();
        let root = dunce::canonicalize(tree.path()).unwrap().to_str().unwrap().to_owned();
        fs::write(tree.path().join("a.mp4"), b"").unwrap();
        fs::create_dir(tree.path().join("sub")).unwrap();
        fs::write(tree.path().join("sub").join("b.mp4"), b"").unwrap();
        {
            let conn = db.get_connection().unwrap();
            Location::add(&conn, &root).unwrap();
        }

        let manager = ScanManager::new(db.clone(), 2);
        manager.request_scan(&root);
        manager.request_scan(&root);
        manager.request_scan(&root);
        manager.wait_idle();

        assert!(!manager.is_scanning(&root));
        assert!(manager.active_roots().is_empty());

        let conn = db.get_connection().unwrap();
        let location = Location::get(&conn, &root).unwrap().unwrap();
        assert!(location.last_scan_completed_at().is_some());
        let entries = FileEntry::list(
            &conn,
            &FileFilter {
                all_suffixes: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(entries.len(), 2);
    }

    /// A registered location over a deep tree.
    fn deep_location(db: &Database, tree: &TempDir) -> String {
        let root = dunce::canonicalize(tree.path()).unwrap().to_str().unwrap().to_owned();
        let mut dir = tree.path().to_path_buf();
        for depth in 0..20 {
            dir = dir.join(format!("d{}", depth));
            fs::create_dir(&dir).unwrap();
            fs::write(dir.join("clip.mp4"), b"").unwrap();
        }

        let conn = db.get_connection().unwrap();
        Location::add(&conn, &root).unwrap();
        root
    }

    /// Hold the write lock so a scan blocks in `mark_scan_start` until released.
    fn hold_write_lock(db: &Database) -> PooledConn {
        let conn = db.get_connection().unwrap();
        conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        conn
    }

    #[test]
    fn test_cancel_running_scan_leaves_location_incomplete() {
        let (_db_dir, db) = open_temp_database();
        let tree = TempDir::new().unwrap();
        let root = deep_location(&db, &tree);
        let lock_conn = hold_write_lock(&db);

        let manager = ScanManager::new(db.clone(), 1);
        manager.request_scan(&root);
        assert!(manager.is_scanning(&root));
        assert_eq!(manager.active_roots(), vec![root.clone()]);

        manager.request_cancellation(&root).unwrap();
        lock_conn.execute_batch("COMMIT").unwrap();
        drop(lock_conn);
        manager.wait_idle();

        assert!(!manager.is_scanning(&root));
        let conn = db.get_connection().unwrap();
        let location = Location::get(&conn, &root).unwrap().unwrap();
        assert!(location.last_scan_started_at().is_some());
        assert!(location.last_scan_completed_at().is_none());

        // A later scan completes normally
        manager.request_scan(&root);
        manager.wait_idle();
        let location = Location::get(&conn, &root).unwrap().unwrap();
        assert!(location.last_scan_completed_at().is_some());
    }

    #[test]
    fn test_shutdown_interrupts_running_and_drops_queued_scans() {
        let (_db_dir, db) = open_temp_database();
        let tree = TempDir::new().unwrap();
        let root = deep_location(&db, &tree);
        let child = dunce::canonicalize(tree.path().join("d0"))
            .unwrap()
            .to_str()
            .unwrap()
            .to_owned();
        {
            let conn = db.get_connection().unwrap();
            Location::add(&conn, &child).unwrap();
        }
        let lock_conn = hold_write_lock(&db);

        let manager = ScanManager::new(db.clone(), 2);
        manager.request_scan(&root);
        manager.request_scan(&child);
        assert_eq!(manager.active_roots(), vec![root.clone()]);

        manager.interrupt_all();
        lock_conn.execute_batch("COMMIT").unwrap();
        drop(lock_conn);
        manager.shutdown();

        let conn = db.get_connection().unwrap();
        let parent = Location::get(&conn, &root).unwrap().unwrap();
        assert!(parent.last_scan_completed_at().is_none());
        let queued = Location::get(&conn, &child).unwrap().unwrap();
        assert!(queued.last_scan_started_at().is_none());
    }

    #[test]
    fn test_panicking_scan_still_retires_root() {
        let (_db_dir, db) = open_temp_database();
        let manager = ScanManager::new(db, 1);
        {
            let mut queue = manager.shared.queue.lock().unwrap();
            queue.activate("/videos");
        }

        let shared = Arc::clone(&manager.shared);
        let worker = std::thread::spawn(move || {
            let _guard = CompletionGuard {
                shared,
                root: "/videos".into(),
            };
            panic!("scan blew up");
        });
        assert!(worker.join().is_err());

        manager.wait_idle();
        assert!(manager.active_roots().is_empty());
    }

    #[test]
    fn test_cancellation_without_scan_is_not_found() {
        let (_db_dir, db) = open_temp_database();
        let manager = ScanManager::new(db, 1);
        assert!(matches!(
            manager.request_cancellation("/videos"),
            Err(VideoIndexError::NotFound(_))
        ));
    }

    #[test]
    fn test_shutdown_when_idle_returns() {
        let (_db_dir, db) = open_temp_database();
        let manager = ScanManager::new(db, 1);
        manager.shutdown();
        manager.request_scan("/videos");
        assert!(manager.active_roots().is_empty());
    }
}

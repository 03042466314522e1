/// Schema Upgrade: Version 0 → 1
///
/// Creates the version log and the three entity tables. Every statement is
/// `IF NOT EXISTS` so re-running against a store created by an older build
/// that never recorded its version is harmless.
pub const UPGRADE_0_TO_1_SQL: &str = r#"
-- Append-only log of applied migrations
CREATE TABLE IF NOT EXISTS schema_versions (
    schema_version INTEGER NOT NULL,
    migration_applied_at TEXT NOT NULL
);

-- One row per registered root folder
CREATE TABLE IF NOT EXISTS locations (
    root_folder TEXT PRIMARY KEY,
    last_scan_started_at TEXT,     -- NULL until the first scan starts
    last_scan_completed_at TEXT    -- NULL while a scan is running or after an interrupted scan
);

-- One row per observed file, keyed by absolute path
CREATE TABLE IF NOT EXISTS files (
    file_path TEXT PRIMARY KEY,
    id TEXT NOT NULL,              -- Opaque external identifier, assigned once
    suffix TEXT NOT NULL,          -- Final extension including the dot, or ''
    scanned INTEGER NOT NULL DEFAULT 1,
    last_scanned_at TEXT NOT NULL,
    notes TEXT NOT NULL DEFAULT ''
);

-- Per-suffix visibility toggle. Missing rows mean disabled.
CREATE TABLE IF NOT EXISTS suffixes (
    suffix TEXT PRIMARY KEY,
    enabled INTEGER NOT NULL DEFAULT 0
);
"#;

/// Schema Upgrade: Version 1 → 2
///
/// Adds the indexes behind point lookup by opaque id and behind the suffix
/// aggregation / listing join. The id index is unique, so an id collision on
/// insert surfaces as a constraint conflict rather than two files sharing an id.
pub const UPGRADE_1_TO_2_SQL: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_files_id ON files (id);
CREATE INDEX IF NOT EXISTS idx_files_suffix ON files (suffix);
"#;

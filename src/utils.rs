use std::path::{Path, MAIN_SEPARATOR};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use rusqlite::types::Type;
use rusqlite::Row;

/// Number of random bytes behind each opaque file id. 8 bytes encode to 11 characters.
const ID_BYTES: usize = 8;

pub struct Utils {}

impl Utils {
    /// Current time in the text form stored in the database.
    pub fn now_timestamp() -> String {
        Self::format_timestamp(Utc::now())
    }

    pub fn format_timestamp(ts: DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Read a non-null timestamp column written by `format_timestamp`.
    pub fn timestamp_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
        let text: String = row.get(idx)?;
        Self::parse_timestamp(&text, idx)
    }

    pub fn opt_timestamp_column(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
        let text: Option<String> = row.get(idx)?;
        text.map(|t| Self::parse_timestamp(&t, idx)).transpose()
    }

    fn parse_timestamp(text: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    }

    /// Cryptographically random, URL-safe token of fixed length.
    pub fn generate_id() -> String {
        let mut bytes = [0u8; ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Final extension of the file name including the leading dot, or "" when the
    /// name has no extension. `.hidden` and `clip.` both have no suffix.
    pub fn suffix_of(path: &Path) -> String {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if !ext.is_empty() => format!(".{}", ext),
            _ => String::new(),
        }
    }

    /// The string every path strictly inside `root` starts with.
    pub fn subtree_prefix(root: &str) -> String {
        if root.ends_with(MAIN_SEPARATOR) {
            root.to_owned()
        } else {
            format!("{}{}", root, MAIN_SEPARATOR)
        }
    }

    /// True if `path` is `root` itself or lies below it. Sibling folders that merely
    /// share a string prefix ("/videos2" vs "/videos") are not under it.
    pub fn is_path_under(path: &str, root: &str) -> bool {
        path == root || path.starts_with(&Self::subtree_prefix(root))
    }

    /// True if one root contains the other, so their scans would touch the same entries.
    pub fn roots_overlap(a: &str, b: &str) -> bool {
        Self::is_path_under(a, b) || Self::is_path_under(b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_suffix_of() {
        assert_eq!(Utils::suffix_of(Path::new("/videos/a.mp4")), ".mp4");
        assert_eq!(Utils::suffix_of(Path::new("/videos/movie.final.MKV")), ".MKV");
        assert_eq!(Utils::suffix_of(Path::new("/videos/README")), "");
        assert_eq!(Utils::suffix_of(Path::new("/videos/.hidden")), "");
        assert_eq!(Utils::suffix_of(Path::new("/videos/clip.")), "");
    }

    #[test]
    fn test_generate_id_is_url_safe_and_fixed_length() {
        let mut seen = HashSet::new();
        for _ in 0..200 {
            let id = Utils::generate_id();
            assert_eq!(id.len(), 11);
            assert!(id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
            assert!(seen.insert(id));
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_is_path_under() {
        assert!(Utils::is_path_under("/videos/a.mp4", "/videos"));
        assert!(Utils::is_path_under("/videos/sub/c.mp4", "/videos"));
        assert!(Utils::is_path_under("/videos", "/videos"));
        assert!(!Utils::is_path_under("/videos2/a.mp4", "/videos"));
        assert!(Utils::is_path_under("/videos/a.mp4", "/"));
    }

    #[cfg(unix)]
    #[test]
    fn test_roots_overlap() {
        assert!(Utils::roots_overlap("/videos", "/videos/sub"));
        assert!(Utils::roots_overlap("/videos/sub", "/videos"));
        assert!(Utils::roots_overlap("/videos", "/videos"));
        assert!(!Utils::roots_overlap("/videos", "/videos2"));
    }

    #[test]
    fn test_timestamp_round_trip_through_sqlite() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let now = Utc::now();
        let text = Utils::format_timestamp(now);
        let parsed = conn
            .query_row("SELECT ?1, NULL", [&text], |row| {
                Ok((
                    Utils::timestamp_column(row, 0)?,
                    Utils::opt_timestamp_column(row, 1)?,
                ))
            })
            .unwrap();
        assert_eq!(Utils::format_timestamp(parsed.0), text);
        assert!(parsed.1.is_none());
    }
}

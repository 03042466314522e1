use std::io::{self, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::json;

use crate::config::CONFIG;
use crate::database::Database;
use crate::error::VideoIndexError;
use crate::files::{FileEntry, FileFilter};
use crate::locations::Location;
use crate::scan_manager::ScanManager;
use crate::schema;
use crate::suffixes::Suffixes;
use crate::utils::Utils;

#[derive(Parser)]
#[command(
    name = "video-index",
    version,
    about = "Video Index: catalog video files under registered folders"
)]
pub struct Cli {
    /// Print records as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Database file (overrides the configured path)
    #[arg(long, global = true, value_name = "PATH")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Apply pending schema migrations and report the schema version
    Migrate,

    /// Register a folder as a location
    Add { path: String },

    /// List registered locations
    Locations,

    /// Scan one location, or every location when no path is given, and wait for completion
    Scan { path: Option<String> },

    /// List one page of indexed files
    Files {
        /// Start after this path (the last path of the previous page)
        #[arg(long)]
        after: Option<String>,

        /// Only files without notes
        #[arg(long)]
        missing_notes: bool,

        /// Case-insensitive substring match on path and notes
        #[arg(long, short = 'q')]
        query: Option<String>,

        /// Include files whose suffix is not enabled
        #[arg(long)]
        all: bool,
    },

    /// Show one file by id
    Show { id: String },

    /// Replace the notes of a file
    Notes { id: String, text: String },

    /// List suffixes with file counts and enablement
    Suffixes,

    /// Enable a suffix for listing (e.g. `.mp4`)
    Enable { suffix: String },

    /// Disable a suffix for listing
    Disable { suffix: String },
}

impl Cli {
    pub fn handle_command_line(project_dirs: &ProjectDirs) -> Result<(), VideoIndexError> {
        let args = Cli::parse();
        debug!("Command: {:?}", args.command);

        let config = CONFIG
            .get()
            .ok_or_else(|| VideoIndexError::Error("Configuration was not loaded".into()))?;

        let db_path = args
            .db
            .clone()
            .unwrap_or_else(|| config.database.resolved_path(project_dirs.data_local_dir()));
        let db = Database::open(
            &db_path,
            config.database.pool_size(),
            config.database.busy_timeout(),
        )?;
        debug!("Using database {}", db.path().display());

        let stdout = io::stdout();
        let mut out = stdout.lock();
        Self::run(&args, &db, config.scan.threads(), &mut out)
    }

    /// Execute a parsed command against `db`, writing results to `out`.
    pub fn run(
        args: &Cli,
        db: &Database,
        scan_threads: usize,
        out: &mut dyn Write,
    ) -> Result<(), VideoIndexError> {
        let version = schema::migrate(db)?;
        let conn = db.get_connection()?;

        match &args.command {
            Command::Migrate => {
                if args.json {
                    Self::print_json(out, &json!({ "schema_version": version }))
                } else {
                    writeln!(out, "Schema version {}", version)?;
                    Ok(())
                }
            }
            Command::Add { path } => {
                let canonical = Location::validate_and_canonicalize_path(path)?;
                let root_folder = Self::path_str(&canonical)?;
                Location::add(&conn, root_folder)?;
                let location = Location::get(&conn, root_folder)?
                    .ok_or_else(|| VideoIndexError::NotFound(format!("location '{}'", root_folder)))?;
                Self::print_locations(out, args.json, &[location])
            }
            Command::Locations => {
                let locations = Location::list(&conn)?;
                Self::print_locations(out, args.json, &locations)
            }
            Command::Scan { path } => {
                let roots = Self::scan_roots(&conn, path.as_deref())?;
                drop(conn);

                let manager = ScanManager::new(db.clone(), scan_threads);
                Self::interrupt_on_ctrl_c(&manager);
                for root in &roots {
                    manager.request_scan(root);
                }
                manager.wait_idle();
                debug_assert!(roots.iter().all(|root| !manager.is_scanning(root)));
                info!("Finished scanning {} location(s)", roots.len());

                let conn = db.get_connection()?;
                let mut locations = Vec::with_capacity(roots.len());
                for root in &roots {
                    if let Some(location) = Location::get(&conn, root)? {
                        locations.push(location);
                    }
                }
                Self::print_locations(out, args.json, &locations)
            }
            Command::Files {
                after,
                missing_notes,
                query,
                all,
            } => {
                let filter = FileFilter {
                    after: after.clone().unwrap_or_default(),
                    missing_notes_only: *missing_notes,
                    query: query.clone(),
                    all_suffixes: *all,
                };
                let page = FileEntry::list(&conn, &filter)?;
                Self::print_files(out, args.json, &page)
            }
            Command::Show { id } => {
                let entry = FileEntry::get_by_id(&conn, id)?
                    .ok_or_else(|| VideoIndexError::NotFound(format!("file with id '{}'", id)))?;
                if args.json {
                    Self::print_json(out, &entry)
                } else {
                    writeln!(out, "id:           {}", entry.id())?;
                    writeln!(out, "path:         {}", entry.path())?;
                    writeln!(out, "suffix:       {}", entry.suffix())?;
                    if !entry.is_scanned() {
                        writeln!(out, "state:        not seen by the current scan")?;
                    }
                    writeln!(
                        out,
                        "last scanned: {}",
                        Utils::format_timestamp(entry.last_scanned_at())
                    )?;
                    writeln!(out, "notes:        {}", entry.notes())?;
                    Ok(())
                }
            }
            Command::Notes { id, text } => {
                FileEntry::update_notes(&conn, id, text)?;
                if args.json {
                    Self::print_json(out, &json!({ "id": id, "notes": text }))
                } else {
                    writeln!(out, "Updated notes for {}", id)?;
                    Ok(())
                }
            }
            Command::Suffixes => {
                let counts = Suffixes::counts(&conn)?;
                if args.json {
                    Self::print_json(out, &counts)
                } else {
                    for count in &counts {
                        writeln!(
                            out,
                            "{:<10} {:>8}  {}",
                            count.suffix,
                            count.file_count,
                            if count.enabled { "enabled" } else { "disabled" }
                        )?;
                    }
                    Ok(())
                }
            }
            Command::Enable { suffix } => Self::set_suffix(&conn, out, args.json, suffix, true),
            Command::Disable { suffix } => Self::set_suffix(&conn, out, args.json, suffix, false),
        }
    }

    /// Ctrl-C stops in-flight scans at their next directory and drops queued ones.
    /// Interrupted locations stay incomplete until their next scan.
    fn interrupt_on_ctrl_c(manager: &ScanManager) {
        let handler_manager = manager.clone();
        let result = ctrlc::set_handler(move || {
            for root in handler_manager.active_roots() {
                warn!("Interrupting scan of '{}'", root);
                if let Err(e) = handler_manager.request_cancellation(&root) {
                    debug!("Scan of '{}' ended before it could be cancelled: {}", root, e);
                }
            }
            handler_manager.shutdown();
        });

        // Only one handler per process; a second scan in the same process keeps the first
        if let Err(e) = result {
            debug!("Ctrl-C handler not installed: {}", e);
        }
    }

    fn scan_roots(
        conn: &rusqlite::Connection,
        path: Option<&str>,
    ) -> Result<Vec<String>, VideoIndexError> {
        match path {
            None => Ok(Location::list(conn)?
                .into_iter()
                .map(|l| l.root_folder().to_owned())
                .collect()),
            Some(path) => {
                let canonical = Location::validate_and_canonicalize_path(path)?;
                let root_folder = Self::path_str(&canonical)?;
                match Location::get(conn, root_folder)? {
                    Some(location) => Ok(vec![location.root_folder().to_owned()]),
                    None => Err(VideoIndexError::NotFound(format!(
                        "'{}' is not a registered location",
                        root_folder
                    ))),
                }
            }
        }
    }

    fn set_suffix(
        conn: &rusqlite::Connection,
        out: &mut dyn Write,
        as_json: bool,
        suffix: &str,
        enabled: bool,
    ) -> Result<(), VideoIndexError> {
        let suffix = Self::normalize_suffix(suffix)?;
        Suffixes::set_enabled(conn, &suffix, enabled)?;
        if as_json {
            Self::print_json(out, &json!({ "suffix": suffix, "enabled": enabled }))
        } else {
            writeln!(
                out,
                "{} {}",
                suffix,
                if enabled { "enabled" } else { "disabled" }
            )?;
            Ok(())
        }
    }

    /// Accept `mp4` as shorthand for `.mp4`.
    fn normalize_suffix(suffix: &str) -> Result<String, VideoIndexError> {
        let suffix = suffix.trim();
        if suffix.is_empty() || suffix == "." {
            return Err(VideoIndexError::Error("Suffix is empty".into()));
        }
        if suffix.starts_with('.') {
            Ok(suffix.to_owned())
        } else {
            Ok(format!(".{}", suffix))
        }
    }

    fn path_str(path: &std::path::Path) -> Result<&str, VideoIndexError> {
        path.to_str().ok_or_else(|| {
            VideoIndexError::Error(format!("Path '{}' is not valid UTF-8", path.display()))
        })
    }

    fn print_locations(
        out: &mut dyn Write,
        as_json: bool,
        locations: &[Location],
    ) -> Result<(), VideoIndexError> {
        if as_json {
            return Self::print_json(out, &locations);
        }

        for location in locations {
            let state = if location.is_scan_incomplete() {
                "  (incomplete)"
            } else {
                ""
            };
            writeln!(
                out,
                "{}  started: {}  completed: {}{}",
                location.root_folder(),
                Self::opt_timestamp(location.last_scan_started_at()),
                Self::opt_timestamp(location.last_scan_completed_at()),
                state
            )?;
        }
        Ok(())
    }

    fn print_files(
        out: &mut dyn Write,
        as_json: bool,
        page: &[FileEntry],
    ) -> Result<(), VideoIndexError> {
        let next_after = FileEntry::next_cursor(page);

        if as_json {
            return Self::print_json(out, &json!({ "files": page, "next_after": next_after }));
        }

        for entry in page {
            if entry.notes().is_empty() {
                writeln!(out, "{}  {}", entry.id(), entry.path())?;
            } else {
                writeln!(out, "{}  {}  # {}", entry.id(), entry.path(), entry.notes())?;
            }
        }
        if let Some(cursor) = next_after {
            writeln!(out, "-- more: --after '{}'", cursor)?;
        }
        Ok(())
    }

    fn print_json<T: Serialize + ?Sized>(out: &mut dyn Write, value: &T) -> Result<(), VideoIndexError> {
        serde_json::to_writer_pretty(&mut *out, value)?;
        writeln!(out)?;
        Ok(())
    }

    fn opt_timestamp(ts: Option<DateTime<Utc>>) -> String {
        ts.map(Utils::format_timestamp)
            .unwrap_or_else(|| "-".to_owned())
    }
}

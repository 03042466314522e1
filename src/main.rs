mod cli;
mod config;
mod database;
mod error;
mod files;
mod locations;
mod scan_manager;
mod scanner;
mod schema;
mod suffixes;
mod utils;

use cli::Cli;
use config::{Config, CONFIG};
use directories::ProjectDirs;
use flexi_logger::{
    detailed_format, Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming,
};
use log::{debug, error};

const LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;
const LOG_FILES_KEPT: usize = 5;

fn main() {
    let Some(project_dirs) = ProjectDirs::from("", "", "video-index") else {
        eprintln!("Could not determine the application data directory");
        std::process::exit(1);
    };

    let config = Config::load_config(&project_dirs);
    let log_spec = config.logging.log_spec();
    let _ = CONFIG.set(config);

    // Keep the handle alive so the file writer is flushed on exit
    let _logger = setup_logging(&project_dirs, &log_spec);

    debug!(
        "Command-line args: {:?}",
        std::env::args_os().collect::<Vec<_>>()
    );

    if let Err(err) = Cli::handle_command_line(&project_dirs) {
        error!("{:?}", err);
        eprintln!("{}", err);
        std::process::exit(1);
    }
}

fn setup_logging(project_dirs: &ProjectDirs, log_spec: &str) -> Option<LoggerHandle> {
    let log_dir = project_dirs.data_local_dir().join("logs");

    let result = Logger::try_with_str(log_spec).and_then(|logger| {
        logger
            .log_to_file(
                FileSpec::default()
                    .directory(&log_dir)
                    .basename("video-index"),
            )
            .format_for_files(detailed_format)
            .rotate(
                Criterion::Size(LOG_FILE_SIZE),
                Naming::Timestamps,
                Cleanup::KeepLogFiles(LOG_FILES_KEPT),
            )
            .duplicate_to_stderr(Duplicate::Error)
            .start()
    });

    match result {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("Failed to start logging in {}: {}", log_dir.display(), e);
            None
        }
    }
}

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::database::DB_FILENAME;

pub static CONFIG: OnceCell<Config> = OnceCell::new();

const CONFIG_FILENAME: &str = "config.toml";
const ENV_PREFIX: &str = "VIDEO_INDEX_";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub video_index: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const VIDEO_INDEX_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            video_index: Self::VIDEO_INDEX_LEVEL.to_string(),
        }
    }

    /// Level spec for `flexi_logger`, e.g. `video_index=info`.
    pub fn log_spec(&self) -> String {
        format!("video_index={}", self.video_index)
    }

    fn ensure_valid(&mut self) {
        let str_original = self.video_index.clone();
        self.video_index = self.video_index.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.video_index.as_str()) {
            eprintln!(
                "Config error: video_index log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::VIDEO_INDEX_LEVEL
            );
            self.video_index = Self::VIDEO_INDEX_LEVEL.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    path: String,
    pool_size: u32,
    busy_timeout_ms: u64,
}

impl DatabaseConfig {
    const POOL_SIZE: u32 = 8;
    const BUSY_TIMEOUT_MS: u64 = 5000;

    fn default() -> Self {
        DatabaseConfig {
            path: String::new(),
            pool_size: Self::POOL_SIZE,
            busy_timeout_ms: Self::BUSY_TIMEOUT_MS,
        }
    }

    /// The configured database file, or `video-index.db` in `data_dir` when unset.
    pub fn resolved_path(&self, data_dir: &Path) -> PathBuf {
        if self.path.is_empty() {
            data_dir.join(DB_FILENAME)
        } else {
            PathBuf::from(&self.path)
        }
    }

    pub fn pool_size(&self) -> u32 {
        self.pool_size
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    fn ensure_valid(&mut self) {
        self.path = self.path.trim().to_owned();
        if self.pool_size == 0 {
            eprintln!(
                "Config error: database pool_size of 0 is invalid - using default of {}",
                Self::POOL_SIZE
            );
            self.pool_size = Self::POOL_SIZE;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanConfig {
    threads: usize,
}

impl ScanConfig {
    const THREADS: usize = 2;

    fn default() -> Self {
        ScanConfig {
            threads: Self::THREADS,
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    fn ensure_valid(&mut self) {
        if self.threads == 0 {
            eprintln!(
                "Config error: scan threads of 0 is invalid - using default of {}",
                Self::THREADS
            );
            self.threads = Self::THREADS;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub scan: ScanConfig,
}

impl Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            database: DatabaseConfig::default(),
            scan: ScanConfig::default(),
        }
    }

    /// Loads the configuration from `config.toml` in the app's data directory,
    /// overridden by `VIDEO_INDEX_` environment variables (`__` separates sections,
    /// e.g. `VIDEO_INDEX_SCAN__THREADS=4`). Writes the defaults to disk if no file
    /// exists and falls back to them if extraction fails.
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        let config_path = project_dirs.data_local_dir().join(CONFIG_FILENAME);

        if !config_path.exists() {
            Self::write_default(&config_path);
        }

        Self::load_from(&config_path)
    }

    fn load_from(config_path: &Path) -> Self {
        let default_config = Config::default();

        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            default_config
        });

        config.ensure_valid();

        config
    }

    fn write_default(config_path: &Path) {
        if let Some(parent) = config_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!(
                    "Failed to create configuration directory {}: {}",
                    parent.display(),
                    e
                );
            }
        }
        match toml::to_string_pretty(&Config::default()) {
            Ok(toml_string) => {
                if let Err(e) = fs::write(config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            }
            Err(_) => eprintln!("Failed to serialize default config."),
        }
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.database.ensure_valid();
        self.scan.ensure_valid();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_when_file_missing() {
        Jail::expect_with(|jail| {
            let config = Config::load_from(&jail.directory().join(CONFIG_FILENAME));
            assert_eq!(config, Config::default());
            assert_eq!(config.logging.log_spec(), "video_index=info");
            assert_eq!(config.scan.threads(), 2);
            Ok(())
        });
    }

    #[test]
    fn test_file_then_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILENAME,
                r#"
                [database]
                path = "/srv/videos.db"
                pool_size = 4

                [scan]
                threads = 3
                "#,
            )?;
            jail.set_env("VIDEO_INDEX_SCAN__THREADS", "5");

            let config = Config::load_from(&jail.directory().join(CONFIG_FILENAME));
            assert_eq!(config.database.pool_size(), 4);
            assert_eq!(config.database.busy_timeout(), Duration::from_millis(5000));
            assert_eq!(
                config.database.resolved_path(Path::new("/data")),
                PathBuf::from("/srv/videos.db")
            );
            assert_eq!(config.scan.threads(), 5);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_values_are_corrected() {
        Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILENAME,
                r#"
                [logging]
                video_index = " DEBUG "

                [database]
                pool_size = 0

                [scan]
                threads = 0
                "#,
            )?;

            let config = Config::load_from(&jail.directory().join(CONFIG_FILENAME));
            assert_eq!(config.logging.video_index, "debug");
            assert_eq!(config.database.pool_size(), 8);
            assert_eq!(config.scan.threads(), 2);

            jail.create_file(CONFIG_FILENAME, "[logging]\nvideo_index = \"loud\"\n")?;
            let config = Config::load_from(&jail.directory().join(CONFIG_FILENAME));
            assert_eq!(config.logging.video_index, "info");
            Ok(())
        });
    }

    #[test]
    fn test_write_default_round_trips() {
        Jail::expect_with(|jail| {
            let path = jail.directory().join("nested").join(CONFIG_FILENAME);
            Config::write_default(&path);
            assert!(path.exists());
            assert_eq!(Config::load_from(&path), Config::default());
            Ok(())
        });
    }

    #[test]
    fn test_empty_database_path_uses_data_dir() {
        let db = DatabaseConfig::default();
        assert_eq!(
            db.resolved_path(Path::new("/data")),
            Path::new("/data").join(DB_FILENAME)
        );
    }
}

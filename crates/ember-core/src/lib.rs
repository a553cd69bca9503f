// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use serde::Deserialize;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// File name of the per-session log inside the data directory.
pub const LOG_FILE_NAME: &str = "vk.log";

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// `[log]` section of the app config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Mirror every event into `<data_dir>/vk.log`.
    pub file: bool,
    pub data_dir: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file: false,
            data_dir: PathBuf::from("."),
        }
    }
}

impl LogConfig {
    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(LOG_FILE_NAME)
    }
}

/// Truncates (or creates) the session log and writes its header line.
pub fn open_log_file(path: &Path) -> Result<File, CoreError> {
    let wrap = |source| CoreError::LogFile {
        path: path.to_path_buf(),
        source,
    };
    let mut f = File::create(path).map_err(wrap)?;
    let started = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    writeln!(f, "ember log session started at {started} (unix)").map_err(wrap)?;
    Ok(f)
}

/// Installs the global subscriber: stderr always, the session file when enabled.
/// Filtering follows `RUST_LOG`, defaulting to `info`.
pub fn init_tracing(cfg: &LogConfig) -> Option<PathBuf> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_target(false).compact();

    let (file, file_err) = if cfg.file {
        match open_log_file(&cfg.log_path()) {
            Ok(f) => (Some(f), None),
            Err(e) => (None, Some(e)),
        }
    } else {
        (None, None)
    };
    let opened = file.is_some();
    let file_layer = file.map(|f| {
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(Mutex::new(f))
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init();

    if let Some(e) = file_err {
        tracing::warn!("{e}; logging to console only");
    }
    opened.then(|| cfg.log_path())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_config_defaults_when_section_is_empty() {
        let cfg: LogConfig = toml::from_str("").unwrap();
        assert!(!cfg.file);
        assert_eq!(cfg.log_path(), PathBuf::from(".").join("vk.log"));
    }

    #[test]
    fn log_config_reads_data_dir() {
        let cfg: LogConfig = toml::from_str("file = true\ndata_dir = \"/var/tmp/ember\"").unwrap();
        assert!(cfg.file);
        assert_eq!(cfg.log_path(), PathBuf::from("/var/tmp/ember/vk.log"));
    }

    #[test]
    fn log_file_starts_with_session_header() {
        let dir = std::env::temp_dir().join(format!("ember-core-log-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(LOG_FILE_NAME);
        std::fs::write(&path, "stale contents\n").unwrap();

        drop(open_log_file(&path).unwrap());

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("ember log session started at "));
        assert!(!text.contains("stale"));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_directory_reports_path() {
        let path = Path::new("/nonexistent-ember-dir/sub/vk.log");
        let err = open_log_file(path).unwrap_err();
        assert!(err.to_string().contains("nonexistent-ember-dir"));
    }
}

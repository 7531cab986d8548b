//! Process plumbing: log sink and PID file.

use crate::config::LoggingConfig;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("could not open log file '{path}': {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not write PID file '{path}': {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Install the global tracing subscriber per the logging config: append to
/// the configured file (created mode 0644) or fall back to stderr.
/// A missing log file is fatal; silent daemons are worse than dead ones.
pub fn init_logging(logging: &LoggingConfig) -> Result<(), DaemonError> {
    // Both the library and the daemon binary emit under their own targets.
    let level = logging.log_level.as_str();
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("ghostknock={level}").parse().expect("static log directive"))
        .add_directive(format!("ghostknockd={level}").parse().expect("static log directive"));

    match &logging.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .mode(0o644)
                .open(path)
                .map_err(|source| DaemonError::LogFile { path: path.clone(), source })?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

/// PID file with RAII removal on clean shutdown.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn write(path: &Path) -> Result<Self, DaemonError> {
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true).mode(0o644);
        let result = options
            .open(path)
            .and_then(|mut file| {
                use std::io::Write;
                writeln!(file, "{}", std::process::id())
            });
        match result {
            Ok(()) => Ok(Self { path: path.to_path_buf() }),
            Err(source) => Err(DaemonError::PidFile { path: path.to_path_buf(), source }),
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

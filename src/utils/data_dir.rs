//! Global data directory: database, logs and default download location.
//!
//! Defaults to `~/.capture-relay/` and can be overridden with `--conf`.
//! Initialized once at startup via [`init`].

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Resolve and remember the data directory. Only the first call takes effect.
pub fn init(custom: Option<&Path>) -> Result<&'static Path> {
    let dir = match custom {
        Some(p) => p.to_path_buf(),
        None => dirs::home_dir()
            .ok_or_else(|| anyhow!("no home directory found, pass --conf"))?
            .join(".capture-relay"),
    };
    Ok(DATA_DIR.get_or_init(|| dir).as_path())
}

/// The data directory, or the working directory if [`init`] never ran.
pub fn get() -> &'static Path {
    DATA_DIR.get().map(PathBuf::as_path).unwrap_or(Path::new("."))
}

/// Default SQLite path under the data directory.
pub fn database_path() -> PathBuf {
    get().join("relay.db")
}

/// Default log file path under the data directory.
pub fn log_path() -> PathBuf {
    get().join("logs").join("capture-relay.log")
}

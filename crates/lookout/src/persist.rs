//! On-disk spool for notifications that were not delivered before shutdown.

use std::fs;
use std::path::{Path, PathBuf};

use lookout_alerts::Notification;
use tracing::{info, warn};

use crate::error::{DaemonError, Result};

/// File name of the spool inside the configured directory.
pub const SPOOL_FILE: &str = "notifications.json";

/// A JSON file holding undelivered notifications between restarts.
#[derive(Debug, Clone)]
pub struct Spool {
    path: PathBuf,
}

impl Spool {
    /// Creates a spool in `dir`.
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(SPOOL_FILE),
        }
    }

    /// Path of the spool file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `notifications`, replacing any previous spool.
    ///
    /// The file is written next to the spool and renamed into place, so a
    /// crash mid-write never leaves a truncated spool behind.
    ///
    /// # Errors
    ///
    /// Returns `DaemonError::Spool` if the directory or file cannot be written.
    pub fn save(&self, notifications: &[Notification]) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| DaemonError::spool(dir, e))?;
        }

        let json = serde_json::to_vec_pretty(notifications)
            .map_err(|e| DaemonError::spool(&self.path, e))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| DaemonError::spool(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| DaemonError::spool(&self.path, e))?;

        info!(
            path = %self.path.display(),
            count = notifications.len(),
            "spooled undelivered notifications"
        );
        Ok(())
    }

    /// Reads and removes the spool. A missing spool yields no notifications.
    ///
    /// # Errors
    ///
    /// Returns `DaemonError::Spool` if the file exists but cannot be read or
    /// parsed. The file is left in place in that case.
    pub fn take(&self) -> Result<Vec<Notification>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DaemonError::spool(&self.path, e)),
        };

        let notifications: Vec<Notification> =
            serde_json::from_slice(&bytes).map_err(|e| DaemonError::spool(&self.path, e))?;

        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove spool after loading");
        }
        Ok(notifications)
    }
}

//! The live configuration snapshot.
//!
//! Components never hold a `&EngineConfig` across ticks. They ask the
//! [`ConfigHandle`] for the current `Arc<EngineConfig>` and compare
//! generations to notice reloads.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::{ConfigError, Result};
use crate::model::EngineConfig;

#[derive(Debug)]
struct Versioned {
    config: Arc<EngineConfig>,
    generation: u64,
}

/// Atomically swappable configuration.
#[derive(Debug)]
pub struct ConfigHandle {
    current: RwLock<Versioned>,
    source: Option<PathBuf>,
}

impl ConfigHandle {
    /// Wraps an already validated configuration (generation 1).
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            current: RwLock::new(Versioned {
                config: Arc::new(config),
                generation: 1,
            }),
            source: None,
        }
    }

    /// Loads the configuration from a file and remembers the path for reloads.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded or is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = EngineConfig::from_file(path)?;
        info!(path = %path.display(), "loaded configuration");

        Ok(Self {
            source: Some(path.to_path_buf()),
            ..Self::new(config)
        })
    }

    /// Returns the current configuration.
    #[must_use]
    pub fn current(&self) -> Arc<EngineConfig> {
        Arc::clone(&self.current.read().config)
    }

    /// Returns the current generation; it increases on every successful swap.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.current.read().generation
    }

    /// Returns the file the configuration was loaded from, if any.
    #[must_use]
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Validates and installs a new configuration, returning its generation.
    ///
    /// # Errors
    ///
    /// Returns the validation error; the previous configuration stays active.
    pub fn replace(&self, config: EngineConfig) -> Result<u64> {
        config.validate()?;

        let mut current = self.current.write();
        current.generation += 1;
        current.config = Arc::new(config);
        Ok(current.generation)
    }

    /// Re-reads the source file and installs it.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no source file or the new content is
    /// invalid; the previous configuration stays active in both cases.
    pub fn reload(&self) -> Result<u64> {
        let path = self.source.as_ref().ok_or(ConfigError::NoSource)?;

        match EngineConfig::from_file(path).and_then(|config| self.replace(config)) {
            Ok(generation) => {
                info!(path = %path.display(), generation, "configuration reloaded");
                Ok(generation)
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    generation = self.generation(),
                    "configuration reload rejected, keeping previous configuration"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(file: &mut NamedTempFile, content: &str) {
        let f = file.as_file_mut();
        f.set_len(0).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.sync_all().unwrap();
    }

    fn file_with(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn new_handle_starts_at_generation_one() {
        let handle = ConfigHandle::new(EngineConfig::default());
        assert_eq!(handle.generation(), 1);
        assert!(handle.source().is_none());
    }

    #[test]
    fn replace_swaps_snapshot() {
        let handle = ConfigHandle::new(EngineConfig::default());
        let before = handle.current();

        let mut next = EngineConfig::default();
        next.global.scrape_interval_secs = 30;
        assert_eq!(handle.replace(next).unwrap(), 2);

        // Old snapshot stays valid for whoever still holds it.
        assert_eq!(before.global.scrape_interval_secs, 15);
        assert_eq!(handle.current().global.scrape_interval_secs, 30);
    }

    #[test]
    fn invalid_replace_keeps_previous() {
        let handle = ConfigHandle::new(EngineConfig::default());

        let mut bad = EngineConfig::default();
        bad.global.evaluation_interval_secs = 0;

        assert!(handle.replace(bad).is_err());
        assert_eq!(handle.generation(), 1);
        assert_eq!(handle.current().global.evaluation_interval_secs, 15);
    }

    #[test]
    fn reload_from_file() {
        let mut file = file_with("[global]\nscrape_interval_secs = 20\n");
        let handle = ConfigHandle::load(file.path()).unwrap();
        assert_eq!(handle.current().global.scrape_interval_secs, 20);

        write_config(&mut file, "[global]\nscrape_interval_secs = 40\n");
        assert_eq!(handle.reload().unwrap(), 2);
        assert_eq!(handle.current().global.scrape_interval_secs, 40);
    }

    #[test]
    fn rejected_reload_keeps_previous() {
        let mut file = file_with("[global]\nscrape_interval_secs = 20\n");
        let handle = ConfigHandle::load(file.path()).unwrap();

        // Timeout above the interval for the only target.
        write_config(
            &mut file,
            "[global]\nscrape_timeout_secs = 25\n[[targets]]\njob = \"a\"\naddress = \"h:1\"\n",
        );

        assert!(matches!(handle.reload(), Err(ConfigError::Invalid { .. })));
        assert_eq!(handle.generation(), 1);
        assert_eq!(handle.current().global.scrape_interval_secs, 20);
    }

    #[test]
    fn reload_without_source_fails() {
        let handle = ConfigHandle::new(EngineConfig::default());
        assert!(matches!(handle.reload(), Err(ConfigError::NoSource)));
    }
}

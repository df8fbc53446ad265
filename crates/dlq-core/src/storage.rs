//! Storage layer for the data directory (settings file; records are in SQLite)

use crate::error::DlqError;
use dlq_types::Settings;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

const SETTINGS_FILE: &str = "settings.json";

/// Storage manager for the dlq data directory
#[derive(Clone, Debug)]
pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    /// Create a new storage instance, creating the directory if needed
    pub async fn new(data_dir: PathBuf) -> Result<Self, DlqError> {
        fs::create_dir_all(&data_dir).await?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("downloads.db")
    }

    /// Directory holding `.part` files of unfinished transfers
    pub fn temp_dir(&self) -> PathBuf {
        self.data_dir.join("temp")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    // ========================================================================
    // Settings (JSON file)
    // ========================================================================

    /// Load settings, falling back to defaults when the file is missing.
    ///
    /// Fields absent from the file take their default values.
    pub async fn load_settings(&self) -> Result<Settings, DlqError> {
        let path = self.settings_path();

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings file at {}, using defaults", path.display());
                return Ok(Settings::default());
            }
            Err(e) => return Err(e.into()),
        };

        let settings: Settings = serde_json::from_str(&content).map_err(|e| {
            warn!("Invalid settings file {}: {}", path.display(), e);
            DlqError::Serialization(format!("{}: {}", path.display(), e))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Save settings
    pub async fn save_settings(&self, settings: &Settings) -> Result<(), DlqError> {
        settings.validate()?;
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(self.settings_path(), content).await?;
        Ok(())
    }

    /// Delete the settings file and return the defaults
    pub async fn reset_settings(&self) -> Result<Settings, DlqError> {
        match fs::remove_file(self.settings_path()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Settings::default())
    }
}

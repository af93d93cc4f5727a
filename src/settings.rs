//! Programmer settings with persistence.
//!
//! This module provides:
//! - `ProgrammerSettings` for the user-adjustable engine inputs
//! - Persistence to a JSON file in a settings directory
//! - Conversion into the engine's `EngineConfig`

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dfu::config::{
    DEFAULT_BLOCK_SIZE, INTERNAL_FLASH_BASE, MAX_ERASE_POLL_ATTEMPTS, MAX_SYNC_ATTEMPTS,
    SYNC_RETRY_DELAY,
};
use crate::dfu::{DfuResult, EngineConfig, RetryPolicy};

/// Settings a user may change between sessions.
///
/// Missing fields fall back to the defaults, so older files keep loading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProgrammerSettings {
    /// Flash address images are written to.
    pub load_address: u32,

    /// Bytes per DNLOAD/UPLOAD block.
    pub block_size: u32,

    /// Attempts to bring the device back to dfuIDLE between steps.
    pub max_sync_attempts: u32,

    /// Pause between those attempts.
    pub sync_retry_delay_ms: u64,

    /// Polls allowed while a mass erase runs.
    pub max_erase_poll_attempts: u32,

    /// Read the image back after programming.
    pub verify_after_program: bool,
}

impl Default for ProgrammerSettings {
    fn default() -> Self {
        Self {
            load_address: INTERNAL_FLASH_BASE,
            block_size: DEFAULT_BLOCK_SIZE,
            max_sync_attempts: MAX_SYNC_ATTEMPTS,
            sync_retry_delay_ms: SYNC_RETRY_DELAY.as_millis() as u64,
            max_erase_poll_attempts: MAX_ERASE_POLL_ATTEMPTS,
            verify_after_program: true,
        }
    }
}

impl ProgrammerSettings {
    /// Build the engine configuration these settings describe.
    ///
    /// Fails when the result would not pass `EngineConfig::validate`.
    pub fn to_engine_config(&self) -> DfuResult<EngineConfig> {
        let sync_policy = RetryPolicy {
            max_attempts: self.max_sync_attempts,
            delay: Duration::from_millis(self.sync_retry_delay_ms),
            ..RetryPolicy::sync()
        };
        let erase_policy = RetryPolicy {
            max_attempts: self.max_erase_poll_attempts,
            ..RetryPolicy::erase()
        };

        let config = EngineConfig {
            load_address: self.load_address,
            block_size: self.block_size,
            sync_policy,
            erase_policy,
            ..EngineConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Check if these settings differ from defaults.
    pub fn has_non_default_settings(&self) -> bool {
        *self != Self::default()
    }
}

/// Settings file name stored in the settings directory.
const SETTINGS_FILENAME: &str = "programmer_settings.json";

/// Manages persistence of programmer settings to a JSON file.
pub struct SettingsManager {
    settings_file_path: PathBuf,
}

impl SettingsManager {
    /// Create a new settings manager for the given directory.
    pub fn new(settings_dir: &Path) -> Self {
        let settings_file_path = settings_dir.join(SETTINGS_FILENAME);
        Self { settings_file_path }
    }

    /// Load settings from disk, returning defaults if the file doesn't exist.
    pub fn load(&self) -> DfuResult<ProgrammerSettings> {
        if !self.settings_file_path.exists() {
            return Ok(ProgrammerSettings::default());
        }

        let contents = fs::read_to_string(&self.settings_file_path)?;

        // Handle empty file gracefully
        if contents.trim().is_empty() {
            return Ok(ProgrammerSettings::default());
        }

        Ok(serde_json::from_str(&contents)?)
    }

    /// Save settings to disk.
    pub fn save(&self, settings: &ProgrammerSettings) -> DfuResult<()> {
        if let Some(parent) = self.settings_file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(settings)?;
        fs::write(&self.settings_file_path, contents)?;
        Ok(())
    }

    /// Get the path where settings are stored.
    pub fn settings_path(&self) -> &Path {
        &self.settings_file_path
    }
}

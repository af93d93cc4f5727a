//! Commands for programmer settings management.
//!
//! Provides get/save operations for programmer settings, persisting to a
//! JSON file in the given settings directory.

use std::path::PathBuf;

use log::info;

use crate::settings::{ProgrammerSettings, SettingsManager};

/// Get current programmer settings from disk.
///
/// Returns default settings if no settings file exists yet.
pub async fn get_programmer_settings(settings_dir: PathBuf) -> Result<ProgrammerSettings, String> {
    tokio::task::spawn_blocking(move || {
        SettingsManager::new(&settings_dir)
            .load()
            .map_err(|e| format!("Failed to load settings: {}", e))
    })
    .await
    .map_err(|e| format!("Settings task failed: {}", e))?
}

/// Save programmer settings to disk.
pub async fn save_programmer_settings(
    settings: ProgrammerSettings,
    settings_dir: PathBuf,
) -> Result<(), String> {
    tokio::task::spawn_blocking(move || {
        let manager = SettingsManager::new(&settings_dir);
        manager
            .save(&settings)
            .map_err(|e| format!("Failed to save settings: {}", e))?;

        if settings.has_non_default_settings() {
            info!(
                "Saved non-default settings to {}",
                manager.settings_path().display()
            );
        }
        Ok(())
    })
    .await
    .map_err(|e| format!("Settings task failed: {}", e))?
}

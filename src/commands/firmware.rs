//! Firmware file commands.

use std::path::PathBuf;

use crate::dfu::firmware_reader::load_image;
use crate::dfu::{FirmwareImage, FirmwareInfo};

/// Load an image from a `.bin` file or the first `.bin` in a directory.
pub async fn load_firmware(
    source: PathBuf,
    load_address: u32,
    block_size: u32,
) -> Result<FirmwareImage, String> {
    tokio::task::spawn_blocking(move || {
        load_image(&source, load_address, block_size).map_err(|e| format!("{}", e))
    })
    .await
    .map_err(|e| format!("Failed to read firmware: {}", e))?
}

/// Summarize a firmware image without touching a device.
pub async fn inspect_firmware(
    source: PathBuf,
    load_address: u32,
    block_size: u32,
) -> Result<FirmwareInfo, String> {
    let image = load_firmware(source, load_address, block_size).await?;
    Ok(image.info())
}

//! Firmware source lookup.
//!
//! Images are raw `.bin` files: no header, no container, written verbatim
//! starting at the load address.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use super::error::{DfuError, DfuResult};
use super::image::FirmwareImage;

/// Extension a firmware binary must carry.
pub const FIRMWARE_EXTENSION: &str = "bin";

/// Find the first `.bin` file in a directory, by file name order.
pub fn find_firmware_file<P: AsRef<Path>>(dir: P) -> DfuResult<PathBuf> {
    let mut candidates: Vec<PathBuf> = fs::read_dir(dir.as_ref())?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_firmware_file(path))
        .collect();

    candidates.sort();
    candidates.into_iter().next().ok_or(DfuError::NoImage)
}

/// Read a firmware binary. Empty files are rejected.
pub fn read_firmware_file<P: AsRef<Path>>(path: P) -> DfuResult<Vec<u8>> {
    let path = path.as_ref();
    let data = fs::read(path)?;
    if data.is_empty() {
        return Err(DfuError::NoImage);
    }

    debug!("Read {} bytes from {}", data.len(), path.display());
    Ok(data)
}

/// Load an image from a file, or from the first `.bin` in a directory.
pub fn load_image<P: AsRef<Path>>(
    source: P,
    load_address: u32,
    block_size: u32,
) -> DfuResult<FirmwareImage> {
    let source = source.as_ref();
    let path = if source.is_dir() {
        find_firmware_file(source)?
    } else {
        source.to_path_buf()
    };

    let bytes = read_firmware_file(&path)?;
    FirmwareImage::new(bytes, load_address, block_size)
}

fn is_firmware_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(FIRMWARE_EXTENSION))
}

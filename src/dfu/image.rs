//! Firmware image and block chunking.

use sha2::{Digest, Sha256};

use super::config::{BLOCK_PADDING, DEFAULT_BLOCK_SIZE, INTERNAL_FLASH_BASE};
use super::error::{DfuError, DfuResult};

/// Raw firmware bytes plus where and how to write them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    bytes: Vec<u8>,
    load_address: u32,
    block_size: u32,
}

impl FirmwareImage {
    /// Create an image.
    ///
    /// Fails with `NoImage` on empty input and `InvalidBlockSize` when the
    /// block size is zero or larger than a control transfer can carry.
    pub fn new(bytes: Vec<u8>, load_address: u32, block_size: u32) -> DfuResult<Self> {
        if bytes.is_empty() {
            return Err(DfuError::NoImage);
        }
        if block_size == 0 || block_size > u32::from(u16::MAX) {
            return Err(DfuError::InvalidBlockSize { size: block_size });
        }

        Ok(Self {
            bytes,
            load_address,
            block_size,
        })
    }

    /// Image for the internal flash base with the default block size.
    pub fn with_defaults(bytes: Vec<u8>) -> DfuResult<Self> {
        Self::new(bytes, INTERNAL_FLASH_BASE, DEFAULT_BLOCK_SIZE)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn load_address(&self) -> u32 {
        self.load_address
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Image length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false; empty images are rejected at construction.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of block transfers: ceil(len / block size).
    pub fn block_count(&self) -> usize {
        self.bytes.len().div_ceil(self.block_size as usize)
    }

    /// Iterate the image as full-size blocks, padding the last with 0xFF.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            chunks: self.bytes.chunks(self.block_size as usize),
            block_size: self.block_size as usize,
        }
    }

    /// Summary for display and logging.
    pub fn info(&self) -> FirmwareInfo {
        FirmwareInfo {
            size: self.bytes.len(),
            block_count: self.block_count(),
            block_size: self.block_size,
            load_address: self.load_address,
            sha256: format!("{:x}", Sha256::digest(&self.bytes)),
        }
    }
}

/// Iterator over padded image blocks.
pub struct Blocks<'a> {
    chunks: std::slice::Chunks<'a, u8>,
    block_size: usize,
}

impl Iterator for Blocks<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.chunks.next()?;
        let mut block = Vec::with_capacity(self.block_size);
        block.extend_from_slice(chunk);
        // Pad with 0xFF, the erased flash value.
        block.resize(self.block_size, BLOCK_PADDING);
        Some(block)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl ExactSizeIterator for Blocks<'_> {}

/// Information about a firmware image.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareInfo {
    /// Size of the firmware binary in bytes.
    pub size: usize,
    /// Number of blocks the image is written in.
    pub block_count: usize,
    /// Bytes per block.
    pub block_size: u32,
    /// Target flash address.
    pub load_address: u32,
    /// SHA-256 of the raw image, lowercase hex.
    pub sha256: String,
}

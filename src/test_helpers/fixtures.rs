use crate::dfu::config::{DEFAULT_BLOCK_SIZE, INTERNAL_FLASH_BASE};
use crate::dfu::FirmwareImage;

/// Builder for creating test FirmwareImage instances
pub struct ImageBuilder {
    len: usize,
    fill: Option<u8>,
    load_address: u32,
    block_size: u32,
}

impl ImageBuilder {
    /// Image of `len` bytes with a repeating non-0xFF pattern.
    pub fn new(len: usize) -> Self {
        Self {
            len,
            fill: None,
            load_address: INTERNAL_FLASH_BASE,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    pub fn fill(mut self, byte: u8) -> Self {
        self.fill = Some(byte);
        self
    }

    pub fn load_address(mut self, address: u32) -> Self {
        self.load_address = address;
        self
    }

    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn bytes(&self) -> Vec<u8> {
        match self.fill {
            Some(byte) => vec![byte; self.len],
            None => (0..self.len).map(|i| (i % 251) as u8).collect(),
        }
    }

    pub fn build(self) -> FirmwareImage {
        FirmwareImage::new(self.bytes(), self.load_address, self.block_size)
            .expect("Invalid test image")
    }
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE as usize)
    }
}

//! Device identity for ST system bootloaders.
//!
//! Detects STM32 devices in DFU mode by USB VID/PID.

use serde::{Deserialize, Serialize};

use super::config::is_st_dfu_device;

/// Identity of an attached bootloader, captured once at attach time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    /// USB Vendor ID.
    pub vendor_id: u16,
    /// USB Product ID.
    pub product_id: u16,
    /// bcdDevice reported by the bootloader.
    pub bootloader_version: u16,
}

impl DeviceIdentity {
    pub fn new(vendor_id: u16, product_id: u16, bootloader_version: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            bootloader_version,
        }
    }

    /// Check if this is the ST system bootloader in DFU mode.
    pub fn is_st_dfu(&self) -> bool {
        is_st_dfu_device(self.vendor_id, self.product_id)
    }

    /// Bootloader version as "major.minor", decoded from BCD.
    pub fn version_string(&self) -> String {
        let major = self.bootloader_version >> 8;
        let minor = (self.bootloader_version >> 4) & 0x0F;
        format!("{:X}.{:X}", major, minor)
    }

    /// Get a display label for this device.
    pub fn display_label(&self) -> String {
        if self.is_st_dfu() {
            format!("STM32 Bootloader v{}", self.version_string())
        } else {
            format!(
                "DFU device {:04X}:{:04X} v{}",
                self.vendor_id,
                self.product_id,
                self.version_string()
            )
        }
    }
}

/// Find all attached ST bootloaders in DFU mode.
///
/// Returns an empty list when enumeration fails.
#[cfg(feature = "usb")]
pub fn find_st_dfu_devices() -> Vec<DeviceIdentity> {
    use nusb::MaybeFuture;

    let devices = match nusb::list_devices().wait() {
        Ok(devices) => devices,
        Err(e) => {
            log::warn!("USB enumeration failed: {}", e);
            return Vec::new();
        }
    };

    devices
        .filter(|d| is_st_dfu_device(d.vendor_id(), d.product_id()))
        .map(|d| DeviceIdentity::new(d.vendor_id(), d.product_id(), d.device_version()))
        .collect()
}

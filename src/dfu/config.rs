//! Configuration constants for the STM32 DfuSe protocol.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{DfuError, DfuResult};

// ============================================================================
// USB Device Identifiers
// ============================================================================

/// STMicroelectronics USB Vendor ID.
pub const ST_VID: u16 = 0x0483;

/// Product ID reported by the ST system bootloader in DFU mode.
pub const ST_DFU_PID: u16 = 0xDF11;

/// Interface number of the DfuSe interface on the system bootloader.
pub const DFU_INTERFACE: u16 = 0;

// ============================================================================
// Control Transfer Framing
// ============================================================================

/// bmRequestType for class requests to an interface, host to device.
pub const REQUEST_TYPE_OUT: u8 = 0x21;

/// bmRequestType for class requests to an interface, device to host.
pub const REQUEST_TYPE_IN: u8 = 0xA1;

/// Length of a GETSTATUS response.
pub const STATUS_LENGTH: usize = 6;

/// DFU class request codes (bRequest).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuRequest {
    Detach = 0,
    Dnload = 1,
    Upload = 2,
    GetStatus = 3,
    ClrStatus = 4,
    GetState = 5,
    Abort = 6,
}

impl DfuRequest {
    /// Parse a request code from a byte value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(DfuRequest::Detach),
            1 => Some(DfuRequest::Dnload),
            2 => Some(DfuRequest::Upload),
            3 => Some(DfuRequest::GetStatus),
            4 => Some(DfuRequest::ClrStatus),
            5 => Some(DfuRequest::GetState),
            6 => Some(DfuRequest::Abort),
            _ => None,
        }
    }

    /// Request name as used in the USB DFU class documents.
    pub fn name(&self) -> &'static str {
        match self {
            DfuRequest::Detach => "DFU_DETACH",
            DfuRequest::Dnload => "DFU_DNLOAD",
            DfuRequest::Upload => "DFU_UPLOAD",
            DfuRequest::GetStatus => "DFU_GETSTATUS",
            DfuRequest::ClrStatus => "DFU_CLRSTATUS",
            DfuRequest::GetState => "DFU_GETSTATE",
            DfuRequest::Abort => "DFU_ABORT",
        }
    }
}

// ============================================================================
// ST Vendor Commands (sent as DNLOAD with wValue = 0)
// ============================================================================

/// Set Address Pointer command byte.
pub const CMD_SET_ADDRESS_POINTER: u8 = 0x21;

/// Erase command byte (a lone byte means mass erase).
pub const CMD_ERASE: u8 = 0x41;

/// Read Unprotect command byte.
pub const CMD_READ_UNPROTECT: u8 = 0x92;

/// wValue used for every command and address pointer transfer.
pub const COMMAND_BLOCK_VALUE: u16 = 0;

/// Offset between a firmware block index and the wValue it travels with.
/// wValue 0 carries commands and wValue 1 is reserved by DfuSe.
pub const BLOCK_VALUE_OFFSET: u16 = 2;

// ============================================================================
// Flash Layout
// ============================================================================

/// Start of the STM32 internal flash.
pub const INTERNAL_FLASH_BASE: u32 = 0x0800_0000;

/// Default transfer size for program and verify.
pub const DEFAULT_BLOCK_SIZE: u32 = 2048;

/// Byte used to pad the final partial block (erased flash value).
pub const BLOCK_PADDING: u8 = 0xFF;

// ============================================================================
// Transfer Timeouts (milliseconds, 0 means unbounded)
// ============================================================================

/// Timeout for GETSTATUS requests.
pub const STATUS_TIMEOUT_MS: u32 = 500;

/// Timeout for CLRSTATUS, GETSTATE and ABORT requests.
pub const CLEAR_TIMEOUT_MS: u32 = 0;

/// Timeout for vendor command DNLOAD requests.
pub const COMMAND_TIMEOUT_MS: u32 = 50;

/// Timeout for firmware block DNLOAD requests.
pub const BLOCK_TIMEOUT_MS: u32 = 0;

/// Timeout for UPLOAD requests.
pub const UPLOAD_TIMEOUT_MS: u32 = 100;

// ============================================================================
// Retry Configuration
// ============================================================================

/// Maximum CLRSTATUS/GETSTATUS rounds while waiting for dfuIDLE.
pub const MAX_SYNC_ATTEMPTS: u32 = 50;

/// Pause between two sync rounds.
pub const SYNC_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Maximum status rounds while a mass erase is in progress.
/// A full-chip erase on larger parts takes tens of seconds.
pub const MAX_ERASE_POLL_ATTEMPTS: u32 = 600;

/// Lower bound on the pause between erase status rounds.
pub const ERASE_POLL_DELAY: Duration = Duration::from_millis(100);

/// Map a firmware block index to the wValue it is transferred with.
///
/// Every DNLOAD and UPLOAD of image data goes through here, so the offset is
/// applied in exactly one place. Indexes 65534 and 65535 have no wValue.
pub fn block_value(block_index: u16) -> DfuResult<u16> {
    block_index
        .checked_add(BLOCK_VALUE_OFFSET)
        .ok_or(DfuError::InvalidBlockIndex { index: block_index })
}

/// Check if a VID/PID combination is an ST system bootloader in DFU mode.
pub fn is_st_dfu_device(vid: u16, pid: u16) -> bool {
    vid == ST_VID && pid == ST_DFU_PID
}

// ============================================================================
// Runtime Configuration
// ============================================================================

/// Bounded retry settings for a poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum number of status rounds before giving up.
    pub max_attempts: u32,
    /// Pause between rounds.
    #[serde(with = "duration_ms")]
    pub delay: Duration,
    /// Sleep for the device-reported bwPollTimeout when it exceeds `delay`.
    #[serde(default)]
    pub honor_poll_timeout: bool,
}

impl RetryPolicy {
    /// Policy used before and between protocol steps.
    pub const fn sync() -> Self {
        Self {
            max_attempts: MAX_SYNC_ATTEMPTS,
            delay: SYNC_RETRY_DELAY,
            honor_poll_timeout: false,
        }
    }

    /// Policy used while the device works through a mass erase.
    pub const fn erase() -> Self {
        Self {
            max_attempts: MAX_ERASE_POLL_ATTEMPTS,
            delay: ERASE_POLL_DELAY,
            honor_poll_timeout: true,
        }
    }

    /// Delay to wait before the next round, given the device's poll hint.
    pub fn next_delay(&self, poll_timeout_ms: u32) -> Duration {
        let hinted = Duration::from_millis(u64::from(poll_timeout_ms));
        if self.honor_poll_timeout && hinted > self.delay {
            hinted
        } else {
            self.delay
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::sync()
    }
}

/// Timeouts applied to each kind of control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTimeouts {
    pub status_ms: u32,
    pub clear_ms: u32,
    pub command_ms: u32,
    pub block_ms: u32,
    pub upload_ms: u32,
}

impl Default for TransferTimeouts {
    fn default() -> Self {
        Self {
            status_ms: STATUS_TIMEOUT_MS,
            clear_ms: CLEAR_TIMEOUT_MS,
            command_ms: COMMAND_TIMEOUT_MS,
            block_ms: BLOCK_TIMEOUT_MS,
            upload_ms: UPLOAD_TIMEOUT_MS,
        }
    }
}

/// Inputs that shape how the engine talks to the bootloader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Flash address the image is written to and read back from.
    pub load_address: u32,
    /// Bytes per DNLOAD/UPLOAD block.
    pub block_size: u32,
    /// Retry policy for the wait-for-dfuIDLE loop.
    pub sync_policy: RetryPolicy,
    /// Retry policy for the post mass erase wait.
    pub erase_policy: RetryPolicy,
    /// Per-request timeouts.
    pub timeouts: TransferTimeouts,
}

impl EngineConfig {
    /// Reject configurations the wire format cannot express.
    pub fn validate(&self) -> DfuResult<()> {
        if self.block_size == 0 || self.block_size > u32::from(u16::MAX) {
            return Err(DfuError::InvalidBlockSize {
                size: self.block_size,
            });
        }
        if self.sync_policy.max_attempts == 0 || self.erase_policy.max_attempts == 0 {
            return Err(DfuError::InvalidConfig {
                reason: "retry policies need at least one attempt".into(),
            });
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            load_address: INTERNAL_FLASH_BASE,
            block_size: DEFAULT_BLOCK_SIZE,
            sync_policy: RetryPolicy::sync(),
            erase_policy: RetryPolicy::erase(),
            timeouts: TransferTimeouts::default(),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

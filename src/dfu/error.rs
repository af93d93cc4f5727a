//! DFU error types for the STM32 DfuSe protocol implementation.

use thiserror::Error;

use super::status::DfuState;

/// Result type alias for DFU operations.
pub type DfuResult<T> = Result<T, DfuError>;

/// Faults reported by a transport for a single control transfer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// The host stack reported a failed transfer (negative length).
    #[error("control transfer failed with code {code}")]
    Failed { code: i32 },

    /// Fewer bytes arrived than the request requires.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// The transfer did not complete within its timeout.
    #[error("control transfer timed out")]
    Timeout,

    /// The endpoint stalled the request.
    #[error("control transfer stalled")]
    Stall,

    /// The device is gone or the handle was released.
    #[error("device disconnected")]
    Disconnected,

    /// Any other error from the USB stack.
    #[error("USB error: {0}")]
    Usb(String),
}

/// Errors that can occur during DFU operations.
#[derive(Debug, Error)]
pub enum DfuError {
    /// A control transfer failed; the current operation cannot continue.
    #[error("USB transfer failed during {operation}: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: TransferError,
    },

    /// The device reported a state the protocol step does not allow.
    #[error("Protocol error: {reason} (state {state:?})")]
    Protocol { reason: String, state: DfuState },

    /// GETSTATUS or GETSTATE returned a state byte outside the DFU state set.
    #[error("Unknown device state 0x{byte:02X}")]
    UnknownState { byte: u8 },

    /// The device refused a Set Address Pointer command.
    #[error("Start address 0x{address:08X} not supported")]
    UnsupportedAddress { address: u32 },

    /// Read-out protection is active.
    #[error("Device is read-protected; run a mass erase first")]
    DeviceProtected,

    /// No firmware bytes available.
    #[error("No firmware image available")]
    NoImage,

    /// Readback differs from the source image.
    #[error("Written image does not match the source image")]
    VerifyMismatch,

    /// The device never reached dfuIDLE within the retry budget.
    #[error("Device unresponsive after {attempts} attempts (last state {last_state:?})")]
    DeviceUnresponsive { attempts: u32, last_state: DfuState },

    /// The transport handle was released (for example after read unprotect).
    #[error("No device connected")]
    NotConnected,

    /// Block size is zero or does not fit a control transfer.
    #[error("Invalid block size {size}")]
    InvalidBlockSize { size: u32 },

    /// The image needs more blocks than wValue can number.
    #[error("Image needs {blocks} blocks, more than the protocol can address")]
    ImageTooLarge { blocks: usize },

    /// wValue = index + 2 would overflow and land on the command channel.
    #[error("Block index {index} cannot be numbered in wValue")]
    InvalidBlockIndex { index: u16 },

    /// Rejected engine configuration.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Operation was cancelled by the caller.
    #[error("Operation cancelled by user")]
    Cancelled,

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while reading or writing settings.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DfuError {
    /// Wrap a transport fault with the name of the request that hit it.
    pub fn transport(operation: &'static str, source: TransferError) -> Self {
        DfuError::Transport { operation, source }
    }

    /// Check if the caller can fix this error and try again.
    ///
    /// A protected device is unlocked by a mass erase; a cancelled operation
    /// can simply be restarted.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DfuError::DeviceProtected | DfuError::Cancelled)
    }

    /// Get a user-friendly error code for support purposes.
    pub fn error_code(&self) -> &'static str {
        match self {
            DfuError::Transport { .. } => "DFU-001",
            DfuError::Io(_) => "DFU-002",
            DfuError::Json(_) => "DFU-004",
            DfuError::Protocol { .. } => "DFU-010",
            DfuError::UnsupportedAddress { .. } => "DFU-011",
            DfuError::DeviceUnresponsive { .. } => "DFU-012",
            DfuError::UnknownState { .. } => "DFU-013",
            DfuError::DeviceProtected => "DFU-020",
            DfuError::VerifyMismatch => "DFU-030",
            DfuError::NoImage => "DFU-040",
            DfuError::InvalidBlockSize { .. } => "DFU-041",
            DfuError::ImageTooLarge { .. } => "DFU-042",
            DfuError::InvalidConfig { .. } => "DFU-043",
            DfuError::InvalidBlockIndex { .. } => "DFU-044",
            DfuError::NotConnected => "DFU-050",
            DfuError::Cancelled => "DFU-099",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_recoverable() {
        assert!(DfuError::DeviceProtected.is_recoverable());
        assert!(DfuError::Cancelled.is_recoverable());
        assert!(!DfuError::NotConnected.is_recoverable());
        assert!(!DfuError::transport("DFU_GETSTATUS", TransferError::Failed { code: -1 })
            .is_recoverable());
        assert!(!DfuError::Protocol {
            reason: "unprotect rejected".into(),
            state: DfuState::DfuIdle,
        }
        .is_recoverable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(DfuError::DeviceProtected.error_code(), "DFU-020");
        assert_eq!(DfuError::NoImage.error_code(), "DFU-040");
        assert_eq!(
            DfuError::UnsupportedAddress { address: 0 }.error_code(),
            "DFU-011"
        );
    }

    #[test]
    fn test_error_messages() {
        let err = DfuError::transport("DFU_UPLOAD", TransferError::Failed { code: -7 });
        assert_eq!(
            err.to_string(),
            "USB transfer failed during DFU_UPLOAD: control transfer failed with code -7"
        );

        let err = DfuError::UnsupportedAddress {
            address: 0x0800_0000,
        };
        assert_eq!(err.to_string(), "Start address 0x08000000 not supported");
    }
}

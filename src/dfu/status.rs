//! Device status polling.
//!
//! Every state-changing DNLOAD is only executed by the bootloader when the
//! host polls GETSTATUS afterwards; the poll that follows reports the result.
//! The probe decodes those replies and offers the bounded wait-for-dfuIDLE
//! loop the engine runs between protocol steps.

use std::thread;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::config::{DfuRequest, RetryPolicy, TransferTimeouts, STATUS_LENGTH};
use super::error::{DfuError, DfuResult, TransferError};
use super::transport::{execute, ControlData, ControlRequest, DfuTransport};

/// bState values reported by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DfuState {
    AppIdle = 0x00,
    AppDetach = 0x01,
    DfuIdle = 0x02,
    DfuDownloadSync = 0x03,
    DfuDownloadBusy = 0x04,
    DfuDownloadIdle = 0x05,
    DfuManifestSync = 0x06,
    DfuManifest = 0x07,
    DfuManifestWaitReset = 0x08,
    DfuUploadIdle = 0x09,
    DfuError = 0x0A,
    DfuUploadSync = 0x91,
    DfuUploadBusy = 0x92,
}

impl DfuState {
    /// Parse a state from a byte value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(DfuState::AppIdle),
            0x01 => Some(DfuState::AppDetach),
            0x02 => Some(DfuState::DfuIdle),
            0x03 => Some(DfuState::DfuDownloadSync),
            0x04 => Some(DfuState::DfuDownloadBusy),
            0x05 => Some(DfuState::DfuDownloadIdle),
            0x06 => Some(DfuState::DfuManifestSync),
            0x07 => Some(DfuState::DfuManifest),
            0x08 => Some(DfuState::DfuManifestWaitReset),
            0x09 => Some(DfuState::DfuUploadIdle),
            0x0A => Some(DfuState::DfuError),
            0x91 => Some(DfuState::DfuUploadSync),
            0x92 => Some(DfuState::DfuUploadBusy),
            _ => None,
        }
    }
}

/// Get a human-readable description of a bStatus code.
pub fn status_description(code: u8) -> &'static str {
    match code {
        0x00 => "No error",
        0x01 => "File is not targeted for this device",
        0x02 => "File failed a vendor-specific verification",
        0x03 => "Unable to write memory",
        0x04 => "Memory erase failed",
        0x05 => "Memory erase check failed",
        0x06 => "Program memory function failed",
        0x07 => "Programmed memory failed verification",
        0x08 => "Address out of range",
        0x09 => "Received DNLOAD with wLength = 0 before transfer was complete",
        0x0A => "Device firmware is corrupt",
        0x0B => "Vendor-specific error",
        0x0C => "Unexpected USB reset",
        0x0D => "Unexpected power on reset",
        0x0E => "Unknown error",
        0x0F => "Device stalled an unexpected request",
        _ => "Unrecognized status code",
    }
}

/// Decoded GETSTATUS reply. Fetched fresh on every probe, never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    /// bStatus: result of the most recent request.
    pub status_code: u8,
    /// bwPollTimeout: minimum wait before the next GETSTATUS is meaningful.
    pub poll_timeout_ms: u32,
    /// bState: state after the request.
    pub state: DfuState,
}

impl DeviceStatus {
    /// Decode the 6-byte GETSTATUS payload.
    ///
    /// Byte 0 is bStatus, bytes 1-3 the little-endian poll timeout, byte 4
    /// bState. Byte 5 (iString) is ignored.
    pub fn decode(bytes: &[u8; STATUS_LENGTH]) -> DfuResult<Self> {
        let state =
            DfuState::from_byte(bytes[4]).ok_or(DfuError::UnknownState { byte: bytes[4] })?;

        Ok(Self {
            status_code: bytes[0],
            poll_timeout_ms: u32::from_le_bytes([bytes[1], bytes[2], bytes[3], 0]),
            state,
        })
    }

    pub fn is_idle(&self) -> bool {
        self.state == DfuState::DfuIdle
    }

    pub fn is_error(&self) -> bool {
        self.state == DfuState::DfuError
    }
}

/// Issues GETSTATUS/CLRSTATUS/GETSTATE on a borrowed transport.
pub struct StatusProbe<'a, T: DfuTransport + ?Sized> {
    transport: &'a mut T,
    timeouts: TransferTimeouts,
}

impl<'a, T: DfuTransport + ?Sized> StatusProbe<'a, T> {
    pub fn new(transport: &'a mut T, timeouts: TransferTimeouts) -> Self {
        Self {
            transport,
            timeouts,
        }
    }

    /// Poll the device status. This is also what executes a staged DNLOAD.
    pub fn get_status(&mut self) -> DfuResult<DeviceStatus> {
        let mut buffer = [0u8; STATUS_LENGTH];
        let length = execute(
            &mut *self.transport,
            ControlRequest::inp(DfuRequest::GetStatus, 0),
            ControlData::In(&mut buffer),
            self.timeouts.status_ms,
        )?;

        if length < STATUS_LENGTH {
            return Err(DfuError::transport(
                DfuRequest::GetStatus.name(),
                TransferError::ShortRead {
                    expected: STATUS_LENGTH,
                    actual: length,
                },
            ));
        }

        let status = DeviceStatus::decode(&buffer)?;
        debug!(
            "status: state={:?} status=0x{:02X} poll={}ms",
            status.state, status.status_code, status.poll_timeout_ms
        );
        Ok(status)
    }

    /// Clear the device error latch. A no-op when no error is latched.
    pub fn clear_status(&mut self) -> DfuResult<()> {
        execute(
            &mut *self.transport,
            ControlRequest::out(DfuRequest::ClrStatus, 0),
            ControlData::None,
            self.timeouts.clear_ms,
        )?;
        Ok(())
    }

    /// Read the device state without status or poll timeout.
    pub fn get_state(&mut self) -> DfuResult<DfuState> {
        let mut buffer = [0u8; 1];
        let length = execute(
            &mut *self.transport,
            ControlRequest::inp(DfuRequest::GetState, 0),
            ControlData::In(&mut buffer),
            self.timeouts.clear_ms,
        )?;

        if length < 1 {
            return Err(DfuError::transport(
                DfuRequest::GetState.name(),
                TransferError::ShortRead {
                    expected: 1,
                    actual: length,
                },
            ));
        }

        DfuState::from_byte(buffer[0]).ok_or(DfuError::UnknownState { byte: buffer[0] })
    }

    /// Clear and poll until the device reports dfuIDLE.
    ///
    /// Always probes at least once. Fails with `DeviceUnresponsive` once the
    /// policy's attempt budget is spent.
    pub fn sync_to_idle(&mut self, policy: &RetryPolicy) -> DfuResult<DeviceStatus> {
        let mut last_state = DfuState::DfuError;

        for attempt in 1..=policy.max_attempts {
            self.clear_status()?;
            let status = self.get_status()?;
            if status.is_idle() {
                if attempt > 1 {
                    debug!("dfuIDLE reached after {} attempts", attempt);
                }
                return Ok(status);
            }

            last_state = status.state;
            if attempt < policy.max_attempts {
                thread::sleep(policy.next_delay(status.poll_timeout_ms));
            }
        }

        warn!(
            "Device did not reach dfuIDLE within {} attempts (last state {:?})",
            policy.max_attempts, last_state
        );
        Err(DfuError::DeviceUnresponsive {
            attempts: policy.max_attempts,
            last_state,
        })
    }

    /// Continue from an already observed status until dfuIDLE.
    ///
    /// Sends nothing when `last` is already idle.
    pub fn wait_until_idle(
        &mut self,
        last: DeviceStatus,
        policy: &RetryPolicy,
    ) -> DfuResult<DeviceStatus> {
        if last.is_idle() {
            return Ok(last);
        }
        self.sync_to_idle(policy)
    }
}

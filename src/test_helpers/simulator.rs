use crate::dfu::config::{
    DfuRequest, CMD_ERASE, CMD_READ_UNPROTECT, CMD_SET_ADDRESS_POINTER, INTERNAL_FLASH_BASE,
    ST_DFU_PID, ST_VID,
};
use crate::dfu::{
    ControlData, ControlRequest, DeviceIdentity, DfuState, DfuTransport, TransferError,
};

const FLASH_SIZE: usize = 128 * 1024;

const STATUS_OK: u8 = 0x00;
const STATUS_ERR_WRITE: u8 = 0x03;
const STATUS_ERR_ADDRESS: u8 = 0x08;
const STATUS_ERR_VENDOR: u8 = 0x0B;
const STATUS_ERR_UNKNOWN: u8 = 0x0E;
const STATUS_ERR_STALLED: u8 = 0x0F;

/// One transfer as seen by the simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedTransfer {
    pub request_type: u8,
    pub request: DfuRequest,
    pub value: u16,
    pub index: u16,
    /// Payload of an OUT transfer, empty otherwise.
    pub data: Vec<u8>,
    /// wLength.
    pub length: usize,
    pub timeout_ms: u32,
}

#[derive(Debug, Clone)]
enum Staged {
    SetAddress(u32),
    Erase,
    Unprotect,
    Write { block_index: u16, data: Vec<u8> },
    Unknown,
}

/// In-memory model of the ST system bootloader.
///
/// Staged DNLOADs run on the first GETSTATUS (dfuDNBUSY) and report their
/// result on the next one, like the real device.
#[derive(Debug)]
pub struct SimulatedBootloader {
    identity: DeviceIdentity,
    state: DfuState,
    status_code: u8,
    poll_timeout_ms: u32,
    address_pointer: u32,
    flash: Vec<u8>,
    protected: bool,
    connected: bool,
    resetting: bool,
    staged: Option<Staged>,
    completion: Option<Result<(), u8>>,
    busy_rounds: u32,
    log: Vec<RecordedTransfer>,

    failing: Vec<DfuRequest>,
    status_length: Option<usize>,
    reject_unprotect: bool,
    write_failure: Option<u16>,
    download_override: Option<(u16, DfuState)>,
}

impl SimulatedBootloader {
    pub fn new() -> Self {
        Self {
            identity: DeviceIdentity::new(ST_VID, ST_DFU_PID, 0x2200),
            state: DfuState::DfuIdle,
            status_code: STATUS_OK,
            poll_timeout_ms: 0,
            address_pointer: INTERNAL_FLASH_BASE,
            flash: vec![0xFF; FLASH_SIZE],
            protected: false,
            connected: true,
            resetting: false,
            staged: None,
            completion: None,
            busy_rounds: 0,
            log: Vec::new(),
            failing: Vec::new(),
            status_length: None,
            reject_unprotect: false,
            write_failure: None,
            download_override: None,
        }
    }

    /// Enable read-out protection.
    pub fn protected(mut self) -> Self {
        self.protected = true;
        self
    }

    // ========================================================================
    // Fault injection
    // ========================================================================

    /// Make every transfer of this request fail at the USB level.
    pub fn fail_request(&mut self, request: DfuRequest) {
        self.failing.push(request);
    }

    /// Return only `length` bytes for GETSTATUS.
    pub fn truncate_status(&mut self, length: usize) {
        self.status_length = Some(length);
    }

    /// Put the device in dfuERROR, as after a failed request.
    pub fn latch_error(&mut self) {
        self.state = DfuState::DfuError;
        self.status_code = STATUS_ERR_UNKNOWN;
    }

    /// Report dfuDNBUSY for the next `rounds` polls; `u32::MAX` never ends.
    pub fn stay_busy_for(&mut self, rounds: u32) {
        self.busy_rounds = rounds;
    }

    /// Report `state` instead of dfuDNBUSY when block `block_index` is polled.
    pub fn report_after_download(&mut self, block_index: u16, state: DfuState) {
        self.download_override = Some((block_index, state));
    }

    /// Fail programming of block `block_index` after it was accepted.
    pub fn fail_write_at(&mut self, block_index: u16) {
        self.write_failure = Some(block_index);
    }

    /// Refuse the read unprotect command.
    pub fn reject_unprotect(&mut self) {
        self.reject_unprotect = true;
    }

    pub fn set_poll_timeout(&mut self, poll_timeout_ms: u32) {
        self.poll_timeout_ms = poll_timeout_ms;
    }

    pub fn load_flash(&mut self, address: u32, bytes: &[u8]) {
        let offset = (address - INTERNAL_FLASH_BASE) as usize;
        self.flash[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Come back after a reset, as the host sees on re-enumeration.
    pub fn reattach(&mut self) {
        self.connected = true;
        self.resetting = false;
        self.state = DfuState::DfuIdle;
        self.status_code = STATUS_OK;
        self.staged = None;
        self.completion = None;
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn transfers(&self) -> &[RecordedTransfer] {
        &self.log
    }

    pub fn count(&self, request: DfuRequest) -> usize {
        self.log.iter().filter(|t| t.request == request).count()
    }

    pub fn state(&self) -> DfuState {
        self.state
    }

    pub fn flash(&self, address: u32, length: usize) -> Vec<u8> {
        let offset = (address - INTERNAL_FLASH_BASE) as usize;
        self.flash[offset..offset + length].to_vec()
    }

    // ========================================================================
    // Request handling
    // ========================================================================

    fn flash_range(&self, address: u32, length: usize) -> Option<std::ops::Range<usize>> {
        let offset = address.checked_sub(INTERNAL_FLASH_BASE)? as usize;
        let end = offset.checked_add(length)?;
        (end <= self.flash.len()).then_some(offset..end)
    }

    fn status_reply(&self, state: DfuState) -> [u8; 6] {
        let timeout = self.poll_timeout_ms.to_le_bytes();
        [
            self.status_code,
            timeout[0],
            timeout[1],
            timeout[2],
            state as u8,
            0,
        ]
    }

    fn get_status(&mut self) -> DfuState {
        if self.busy_rounds > 0 {
            if self.busy_rounds != u32::MAX {
                self.busy_rounds -= 1;
            }
            return DfuState::DfuDownloadBusy;
        }

        match self.state {
            DfuState::DfuDownloadSync => self.run_staged(),
            DfuState::DfuDownloadBusy => {
                match self.completion.take() {
                    Some(Err(code)) => {
                        self.state = DfuState::DfuError;
                        self.status_code = code;
                    }
                    _ => {
                        self.state = DfuState::DfuDownloadIdle;
                        self.status_code = STATUS_OK;
                    }
                }
                self.state
            }
            state => state,
        }
    }

    fn run_staged(&mut self) -> DfuState {
        let staged = self.staged.take().unwrap_or(Staged::Unknown);

        if let Staged::Write { block_index, .. } = &staged {
            if let Some((index, state)) = self.download_override {
                if index == *block_index {
                    self.state = state;
                    return state;
                }
            }
        }

        let outcome = match staged {
            Staged::SetAddress(address) => {
                if self.protected {
                    Err(STATUS_ERR_VENDOR)
                } else if self.flash_range(address, 1).is_none() {
                    Err(STATUS_ERR_ADDRESS)
                } else {
                    self.address_pointer = address;
                    Ok(())
                }
            }
            Staged::Erase => {
                if self.protected {
                    Err(STATUS_ERR_VENDOR)
                } else {
                    self.flash.fill(0xFF);
                    Ok(())
                }
            }
            Staged::Unprotect => {
                if self.reject_unprotect {
                    self.state = DfuState::DfuError;
                    self.status_code = STATUS_ERR_VENDOR;
                    return self.state;
                }
                self.protected = false;
                self.flash.fill(0xFF);
                self.resetting = true;
                Ok(())
            }
            Staged::Write { block_index, data } => {
                let address = self.address_pointer as u64 + block_index as u64 * data.len() as u64;
                let range = u32::try_from(address)
                    .ok()
                    .and_then(|a| self.flash_range(a, data.len()));
                match range {
                    _ if self.protected => Err(STATUS_ERR_VENDOR),
                    _ if self.write_failure == Some(block_index) => Err(STATUS_ERR_WRITE),
                    Some(range) => {
                        self.flash[range].copy_from_slice(&data);
                        Ok(())
                    }
                    None => Err(STATUS_ERR_ADDRESS),
                }
            }
            Staged::Unknown => Err(STATUS_ERR_VENDOR),
        };

        self.completion = Some(outcome);
        self.state = DfuState::DfuDownloadBusy;
        self.state
    }

    fn download(&mut self, value: u16, data: &[u8]) -> Result<usize, TransferError> {
        if !matches!(self.state, DfuState::DfuIdle | DfuState::DfuDownloadIdle) {
            self.state = DfuState::DfuError;
            self.status_code = STATUS_ERR_STALLED;
            return Err(TransferError::Stall);
        }

        self.staged = Some(if value == 0 {
            match data {
                [CMD_SET_ADDRESS_POINTER, a, b, c, d] => {
                    Staged::SetAddress(u32::from_le_bytes([*a, *b, *c, *d]))
                }
                [CMD_ERASE] => Staged::Erase,
                [CMD_READ_UNPROTECT] => Staged::Unprotect,
                _ => Staged::Unknown,
            }
        } else {
            Staged::Write {
                block_index: value.saturating_sub(2),
                data: data.to_vec(),
            }
        });
        self.state = DfuState::DfuDownloadSync;
        Ok(data.len())
    }

    fn upload(&mut self, value: u16, buffer: &mut [u8]) -> Result<usize, TransferError> {
        if !matches!(self.state, DfuState::DfuIdle | DfuState::DfuUploadIdle) {
            self.state = DfuState::DfuError;
            self.status_code = STATUS_ERR_STALLED;
            return Err(TransferError::Stall);
        }

        let block_index = value.saturating_sub(2) as u64;
        let address = self.address_pointer as u64 + block_index * buffer.len() as u64;
        let range = u32::try_from(address)
            .ok()
            .and_then(|a| self.flash_range(a, buffer.len()));

        match range {
            Some(range) if !self.protected => {
                buffer.copy_from_slice(&self.flash[range]);
                self.state = DfuState::DfuUploadIdle;
                Ok(buffer.len())
            }
            _ => {
                self.state = DfuState::DfuError;
                self.status_code = STATUS_ERR_ADDRESS;
                Err(TransferError::Stall)
            }
        }
    }
}

impl Default for SimulatedBootloader {
    fn default() -> Self {
        Self::new()
    }
}

impl DfuTransport for SimulatedBootloader {
    fn control_transfer(
        &mut self,
        request: ControlRequest,
        data: ControlData<'_>,
        timeout_ms: u32,
    ) -> Result<usize, TransferError> {
        self.log.push(RecordedTransfer {
            request_type: request.request_type,
            request: request.request,
            value: request.value,
            index: request.index,
            data: match &data {
                ControlData::Out(payload) => payload.to_vec(),
                _ => Vec::new(),
            },
            length: data.len(),
            timeout_ms,
        });

        if !self.connected || self.resetting {
            return Err(TransferError::Disconnected);
        }
        if self.failing.contains(&request.request) {
            return Err(TransferError::Failed { code: -1 });
        }

        match (request.request, data) {
            (DfuRequest::GetStatus, ControlData::In(buffer)) => {
                let state = self.get_status();
                let reply = self.status_reply(state);
                let count = self
                    .status_length
                    .unwrap_or(reply.len())
                    .min(reply.len())
                    .min(buffer.len());
                buffer[..count].copy_from_slice(&reply[..count]);
                Ok(count)
            }
            (DfuRequest::GetState, ControlData::In(buffer)) => {
                let state = if self.busy_rounds > 0 {
                    DfuState::DfuDownloadBusy
                } else {
                    self.state
                };
                match buffer.first_mut() {
                    Some(byte) => {
                        *byte = state as u8;
                        Ok(1)
                    }
                    None => Ok(0),
                }
            }
            (DfuRequest::ClrStatus, _) => {
                if self.busy_rounds == 0
                    && matches!(
                        self.state,
                        DfuState::DfuError | DfuState::DfuDownloadIdle | DfuState::DfuUploadIdle
                    )
                {
                    self.state = DfuState::DfuIdle;
                    self.status_code = STATUS_OK;
                }
                Ok(0)
            }
            (DfuRequest::Abort, _) => {
                self.state = DfuState::DfuIdle;
                self.status_code = STATUS_OK;
                self.staged = None;
                self.completion = None;
                Ok(0)
            }
            (DfuRequest::Dnload, ControlData::Out(payload)) => self.download(request.value, payload),
            (DfuRequest::Upload, ControlData::In(buffer)) => self.upload(request.value, buffer),
            _ => Err(TransferError::Stall),
        }
    }

    fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    fn release(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

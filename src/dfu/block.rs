//! Block-numbered DNLOAD and UPLOAD requests.
//!
//! Commands travel with wValue = 0; image blocks travel with
//! wValue = block index + 2 (see [`block_value`]).

use log::debug;

use super::command::VendorCommand;
use super::config::{block_value, DfuRequest, TransferTimeouts, COMMAND_BLOCK_VALUE};
use super::error::DfuResult;
use super::transport::{execute, ControlData, ControlRequest, DfuTransport};

/// Issues DNLOAD/UPLOAD/ABORT on a borrowed transport.
pub struct BlockTransfer<'a, T: DfuTransport + ?Sized> {
    transport: &'a mut T,
    timeouts: TransferTimeouts,
}

impl<'a, T: DfuTransport + ?Sized> BlockTransfer<'a, T> {
    pub fn new(transport: &'a mut T, timeouts: TransferTimeouts) -> Self {
        Self {
            transport,
            timeouts,
        }
    }

    /// Stage a vendor command payload (DNLOAD, wValue = 0, short timeout).
    pub fn download_command(&mut self, payload: &[u8]) -> DfuResult<()> {
        execute(
            &mut *self.transport,
            ControlRequest::out(DfuRequest::Dnload, COMMAND_BLOCK_VALUE),
            ControlData::Out(payload),
            self.timeouts.command_ms,
        )?;
        Ok(())
    }

    /// Encode and stage a vendor command.
    pub fn send_command(&mut self, command: VendorCommand) -> DfuResult<()> {
        debug!("Sending {} command", command.name());
        self.download_command(command.encode().as_bytes())
    }

    /// Stage one image block for writing at the current address pointer.
    pub fn download_block(&mut self, payload: &[u8], block_index: u16) -> DfuResult<()> {
        execute(
            &mut *self.transport,
            ControlRequest::out(DfuRequest::Dnload, block_value(block_index)?),
            ControlData::Out(payload),
            self.timeouts.block_ms,
        )?;
        Ok(())
    }

    /// Read one block (`buffer.len()` bytes) relative to the address pointer.
    pub fn upload_block(&mut self, buffer: &mut [u8], block_index: u16) -> DfuResult<usize> {
        execute(
            &mut *self.transport,
            ControlRequest::inp(DfuRequest::Upload, block_value(block_index)?),
            ControlData::In(buffer),
            self.timeouts.upload_ms,
        )
    }

    /// Abandon the current transfer and return the device to dfuIDLE.
    pub fn abort(&mut self) -> DfuResult<()> {
        execute(
            &mut *self.transport,
            ControlRequest::out(DfuRequest::Abort, 0),
            ControlData::None,
            self.timeouts.clear_ms,
        )?;
        Ok(())
    }
}

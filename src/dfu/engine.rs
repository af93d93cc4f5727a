//! DfuSe programming engine.
//!
//! Orchestrates the high-level operations as explicit sequences of control
//! transfers and status polls:
//! 1. **Protection check** - Set Address Pointer to flash base, poll twice
//! 2. **Mass erase** - Erase command, wait out bwPollTimeout, sync to dfuIDLE
//! 3. **Read unprotect** - Unprotect command, release the handle
//! 4. **Program** - Address pointer, then one DNLOAD per padded block
//! 5. **Verify** - Address pointer, one UPLOAD per block, byte compare
//!
//! Every staged DNLOAD executes on the next GETSTATUS; the poll after that
//! reports the result. The engine never issues a request before the state
//! produced by the previous one has been observed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use super::block::BlockTransfer;
use super::command::VendorCommand;
use super::config::{block_value, EngineConfig, BLOCK_VALUE_OFFSET, INTERNAL_FLASH_BASE};
use super::device::DeviceIdentity;
use super::error::{DfuError, DfuResult, TransferError};
use super::image::FirmwareImage;
use super::notifier::{DfuEvent, Notifier};
use super::status::{status_description, DeviceStatus, DfuState, StatusProbe};
use super::transport::DfuTransport;

/// Most blocks one transfer can number: wValue = index + 2 must fit in u16.
pub const MAX_BLOCKS: usize = (u16::MAX - BLOCK_VALUE_OFFSET) as usize + 1;

/// Shared flag a caller sets to stop a long operation between blocks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag so the engine can run again.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Result of a mass erase request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum EraseOutcome {
    /// Flash was erased.
    Erased { elapsed_ms: u64 },
    /// The device was protected; unprotect was sent instead and the device
    /// is resetting. Reattach before issuing anything else.
    ProtectionRemoved,
}

/// Drives one attached bootloader through the DfuSe operations.
pub struct ProgramEngine<T: DfuTransport> {
    transport: T,
    config: EngineConfig,
    identity: DeviceIdentity,
    notifier: Notifier,
    cancel: CancelToken,
}

impl<T: DfuTransport> ProgramEngine<T> {
    /// Take ownership of a transport.
    ///
    /// Validates the configuration and captures the device identity.
    pub fn new(transport: T, config: EngineConfig, notifier: Notifier) -> DfuResult<Self> {
        config.validate()?;
        Ok(Self::attach(transport, config, notifier))
    }

    /// Build an engine from a configuration the caller already validated.
    pub(crate) fn attach(transport: T, config: EngineConfig, notifier: Notifier) -> Self {
        let identity = transport.identity();
        notifier.notify(DfuEvent::Connected { device: identity });
        info!("Engine attached to {}", identity.display_label());

        Self {
            transport,
            config,
            identity,
            notifier,
            cancel: CancelToken::new(),
        }
    }

    /// Use a caller-owned cancellation flag.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Give the transport back, for example to reattach after a reset.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Wrap raw bytes with the configured load address and block size.
    pub fn prepare_image(&self, bytes: Vec<u8>) -> DfuResult<FirmwareImage> {
        FirmwareImage::new(bytes, self.config.load_address, self.config.block_size)
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    /// Poll the device once without changing its state.
    pub fn status(&mut self) -> DfuResult<DeviceStatus> {
        self.reported(|engine| {
            engine.ensure_connected()?;
            engine.probe().get_status()
        })
    }

    /// Read the device state via GETSTATE.
    pub fn state(&mut self) -> DfuResult<DfuState> {
        self.reported(|engine| {
            engine.ensure_connected()?;
            engine.probe().get_state()
        })
    }

    /// Clear and poll until dfuIDLE, within the configured attempt budget.
    pub fn sync_to_idle(&mut self) -> DfuResult<DeviceStatus> {
        self.reported(|engine| {
            engine.ensure_connected()?;
            engine.sync()
        })
    }

    /// Check whether read-out protection is active.
    ///
    /// Leaves the device in dfuIDLE whatever the answer.
    pub fn is_protected(&mut self) -> DfuResult<bool> {
        self.notifier.notify(DfuEvent::CheckingProtection);
        self.reported(|engine| {
            engine.ensure_connected()?;
            engine.check_protection()
        })
    }

    /// Erase all flash.
    ///
    /// On a protected device the erase command is not sent: read unprotect
    /// is issued instead, which wipes flash as the device resets.
    pub fn mass_erase(&mut self) -> DfuResult<EraseOutcome> {
        self.reported(|engine| {
            engine.ensure_connected()?;
            engine.erase_flash()
        })
    }

    /// Lift read-out protection and release the transport.
    ///
    /// The device self-resets and re-enumerates; the caller must reattach.
    pub fn remove_read_protection(&mut self) -> DfuResult<()> {
        self.reported(|engine| {
            engine.ensure_connected()?;
            engine.unprotect()
        })
    }

    /// Write an image, block by block.
    ///
    /// Fails with `DeviceProtected` when read-out protection is active.
    pub fn program(&mut self, image: &FirmwareImage) -> DfuResult<()> {
        self.reported(|engine| {
            engine.ensure_connected()?;
            engine.write_image(image)
        })
    }

    /// Write one block. Block 0 also sets the address pointer to `address`.
    ///
    /// `block` holds 1 to `block_size` bytes; a short final block is fine.
    /// Indexes past what wValue can number fail with `InvalidBlockIndex`.
    pub fn write_block(&mut self, address: u32, block: &[u8], block_index: u16) -> DfuResult<()> {
        self.reported(|engine| {
            engine.check_block(block, block_index)?;
            engine.ensure_connected()?;
            engine.download(address, block, block_index)
        })
    }

    /// Fill `buffer` from flash starting at `start_address`.
    pub fn read_image(
        &mut self,
        buffer: &mut [u8],
        start_address: u32,
        block_size: u32,
    ) -> DfuResult<()> {
        self.reported(|engine| {
            engine.ensure_connected()?;
            engine.upload(buffer, start_address, block_size)
        })
    }

    /// Read the image area back and compare it with the source bytes.
    pub fn verify(&mut self, image: &FirmwareImage) -> DfuResult<bool> {
        self.reported(|engine| {
            engine.ensure_connected()?;
            engine.compare_image(image)
        })
    }

    // ========================================================================
    // Protocol sequences
    // ========================================================================

    fn check_protection(&mut self) -> DfuResult<bool> {
        self.sync()?;
        self.blocks()
            .send_command(VendorCommand::SetAddressPointer(INTERNAL_FLASH_BASE))?;
        self.probe().get_status()?;
        let status = self.probe().get_status()?;

        let protected = status.is_error();
        self.wait_idle(status)?;

        debug!("Read protection active: {}", protected);
        Ok(protected)
    }

    fn erase_flash(&mut self) -> DfuResult<EraseOutcome> {
        self.sync()?;
        if self.check_protection()? {
            self.unprotect()?;
            return Ok(EraseOutcome::ProtectionRemoved);
        }

        self.notifier.notify(DfuEvent::Erasing);
        let start = Instant::now();

        self.blocks().send_command(VendorCommand::MassErase)?;
        // Reports dfuDNBUSY even on an invalid request; the wait below is
        // what observes the outcome.
        let status = self.probe().get_status()?;
        thread::sleep(Duration::from_millis(u64::from(status.poll_timeout_ms)));

        let policy = self.config.erase_policy;
        self.probe().sync_to_idle(&policy)?;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!("Mass erase completed in {} ms", elapsed_ms);
        self.notifier.notify(DfuEvent::EraseComplete { elapsed_ms });
        Ok(EraseOutcome::Erased { elapsed_ms })
    }

    fn unprotect(&mut self) -> DfuResult<()> {
        self.sync()?;
        self.blocks().send_command(VendorCommand::ReadUnprotect)?;

        let status = self.probe().get_status()?;
        if status.state != DfuState::DfuDownloadBusy {
            return Err(DfuError::Protocol {
                reason: "unprotect rejected".into(),
                state: status.state,
            });
        }

        self.transport.release();
        info!("Read unprotect accepted, transport released");
        self.notifier.notify(DfuEvent::ProtectionRemoved);
        Ok(())
    }

    fn write_image(&mut self, image: &FirmwareImage) -> DfuResult<()> {
        let total = checked_block_count(image.len(), image.block_size())?;

        if self.check_protection()? {
            return Err(DfuError::DeviceProtected);
        }

        self.notifier.log(format!(
            "Image size: {} bytes, address: 0x{:08X}, writing {} blocks of {} bytes",
            image.len(),
            image.load_address(),
            total,
            image.block_size()
        ));

        let start = Instant::now();
        for (index, block) in image.blocks().enumerate() {
            self.check_cancelled()?;
            self.download(image.load_address(), &block, index as u16)?;
            self.notifier.notify(DfuEvent::Writing {
                written: index + 1,
                total,
            });
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!("Programming completed in {} ms", elapsed_ms);
        self.notifier.notify(DfuEvent::ProgramComplete { elapsed_ms });
        Ok(())
    }

    fn check_block(&self, block: &[u8], block_index: u16) -> DfuResult<()> {
        if block.is_empty() || block.len() > self.config.block_size as usize {
            return Err(DfuError::InvalidBlockSize {
                size: u32::try_from(block.len()).unwrap_or(u32::MAX),
            });
        }
        block_value(block_index)?;
        Ok(())
    }

    fn download(&mut self, address: u32, block: &[u8], block_index: u16) -> DfuResult<()> {
        self.sync()?;

        if block_index == 0 {
            self.blocks()
                .send_command(VendorCommand::SetAddressPointer(address))?;
            self.probe().get_status()?;
            let status = self.probe().get_status()?;
            if status.is_error() {
                return Err(DfuError::UnsupportedAddress { address });
            }
        }

        self.sync()?;
        self.blocks().download_block(block, block_index)?;

        let status = self.probe().get_status()?;
        if status.state != DfuState::DfuDownloadBusy {
            return Err(DfuError::Protocol {
                reason: format!("block {} was not accepted", block_index),
                state: status.state,
            });
        }

        let status = self.probe().get_status()?;
        if status.is_error() {
            return Err(DfuError::Protocol {
                reason: format!(
                    "block {} was not written: {}",
                    block_index,
                    status_description(status.status_code)
                ),
                state: status.state,
            });
        }

        self.wait_idle(status)?;
        Ok(())
    }

    fn upload(&mut self, buffer: &mut [u8], start_address: u32, block_size: u32) -> DfuResult<()> {
        let total = checked_block_count(buffer.len(), block_size)?;
        let block_size = block_size as usize;

        self.sync()?;
        self.blocks()
            .send_command(VendorCommand::SetAddressPointer(start_address))?;
        self.probe().get_status()?;
        let mut last = self.probe().get_status()?;
        if last.is_error() {
            return Err(DfuError::UnsupportedAddress {
                address: start_address,
            });
        }

        let mut scratch = vec![0u8; block_size];
        for index in 0..total {
            self.check_cancelled()?;
            self.wait_idle(last)?;

            let received = self.blocks().upload_block(&mut scratch, index as u16)?;
            last = self.probe().get_status()?;
            if last.is_error() {
                return Err(DfuError::Protocol {
                    reason: format!("block {} could not be read", index),
                    state: last.state,
                });
            }

            let offset = index * block_size;
            let count = block_size.min(buffer.len() - offset);
            if received < count {
                return Err(DfuError::transport(
                    "DFU_UPLOAD",
                    TransferError::ShortRead {
                        expected: count,
                        actual: received,
                    },
                ));
            }
            buffer[offset..offset + count].copy_from_slice(&scratch[..count]);

            self.notifier.notify(DfuEvent::Reading {
                read: index + 1,
                total,
            });
        }

        self.wait_idle(last)?;
        Ok(())
    }

    fn compare_image(&mut self, image: &FirmwareImage) -> DfuResult<bool> {
        let start = Instant::now();
        let mut readback = vec![0u8; image.len()];
        self.upload(&mut readback, image.load_address(), image.block_size())?;

        let matches = readback.as_slice() == image.bytes();
        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!("Verify completed in {} ms (match: {})", elapsed_ms, matches);
        self.notifier.notify(DfuEvent::VerifyComplete {
            matches,
            elapsed_ms,
        });
        Ok(matches)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn probe(&mut self) -> StatusProbe<'_, T> {
        StatusProbe::new(&mut self.transport, self.config.timeouts)
    }

    fn blocks(&mut self) -> BlockTransfer<'_, T> {
        BlockTransfer::new(&mut self.transport, self.config.timeouts)
    }

    fn sync(&mut self) -> DfuResult<DeviceStatus> {
        let policy = self.config.sync_policy;
        self.probe().sync_to_idle(&policy)
    }

    fn wait_idle(&mut self, last: DeviceStatus) -> DfuResult<DeviceStatus> {
        let policy = self.config.sync_policy;
        self.probe().wait_until_idle(last, &policy)
    }

    fn ensure_connected(&self) -> DfuResult<()> {
        if self.transport.is_connected() {
            Ok(())
        } else {
            Err(DfuError::NotConnected)
        }
    }

    /// Abort and bail out when the caller asked to stop.
    fn check_cancelled(&mut self) -> DfuResult<()> {
        if !self.cancel.is_cancelled() {
            return Ok(());
        }

        warn!("Cancellation requested, aborting transfer");
        self.blocks().abort()?;
        self.sync()?;
        Err(DfuError::Cancelled)
    }

    /// Run an operation and emit exactly one `Failed` event if it fails.
    fn reported<R>(&mut self, op: impl FnOnce(&mut Self) -> DfuResult<R>) -> DfuResult<R> {
        let result = op(self);
        if let Err(ref e) = result {
            error!("{}", e);
            self.notifier.notify(DfuEvent::Failed {
                code: e.error_code().to_string(),
                message: e.to_string(),
            });
        }
        result
    }
}

/// ceil(len / block_size), checked against what wValue can number.
fn checked_block_count(len: usize, block_size: u32) -> DfuResult<usize> {
    if block_size == 0 || block_size > u32::from(u16::MAX) {
        return Err(DfuError::InvalidBlockSize { size: block_size });
    }

    let blocks = len.div_ceil(block_size as usize);
    if blocks > MAX_BLOCKS {
        return Err(DfuError::ImageTooLarge { blocks });
    }
    Ok(blocks)
}

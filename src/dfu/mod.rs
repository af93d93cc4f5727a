//! STM32 DfuSe (DFU with ST extensions) module.
//!
//! This module drives the ST system bootloader over USB control transfers:
//! protection check, mass erase, read unprotect, block programming and
//! readback verification.
//!
//! # Protocol Overview
//!
//! DfuSe reuses the standard DFU 1.1 requests. ST commands travel as DNLOAD
//! payloads with wValue = 0, image blocks with wValue = block index + 2.
//! Nothing a DNLOAD stages happens until the host polls GETSTATUS, and the
//! result is only visible on the poll after that.
//!
//! # Example
//!
//! ```ignore
//! use stm32_dfu::dfu::{EngineConfig, Notifier, ProgramEngine, UsbTransport};
//!
//! let transport = UsbTransport::open_first()?;
//! let notifier = Notifier::new(vec![Box::new(|event: &DfuEvent| {
//!     println!("{}", event.message())
//! })]);
//! let mut engine = ProgramEngine::new(transport, EngineConfig::default(), notifier)?;
//!
//! let image = engine.prepare_image(std::fs::read("app.bin")?)?;
//! engine.mass_erase()?;
//! engine.program(&image)?;
//! assert!(engine.verify(&image)?);
//! ```

pub mod config;
pub mod device;
mod error;
pub mod firmware_reader;
mod image;
mod notifier;

mod block;
mod command;
mod engine;
mod status;
mod transport;

// Engine
pub use engine::{CancelToken, EraseOutcome, ProgramEngine, MAX_BLOCKS};

// Building blocks
pub use block::BlockTransfer;
pub use command::{CommandPayload, VendorCommand};
pub use status::{status_description, DeviceStatus, DfuState, StatusProbe};

// Transport
pub use transport::{ControlData, ControlRequest, DfuTransport};
#[cfg(feature = "usb")]
pub use transport::UsbTransport;

// Configuration, identity and errors
pub use config::{EngineConfig, RetryPolicy, TransferTimeouts};
pub use device::DeviceIdentity;
pub use error::{DfuError, DfuResult, TransferError};

// Images and notifications
pub use image::{Blocks, FirmwareImage, FirmwareInfo};
pub use notifier::{ChannelObserver, DfuEvent, DfuObserver, Notifier};

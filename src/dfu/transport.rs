//! USB transport layer for DFU communication.
//!
//! Provides a trait-based abstraction over the single blocking control
//! transfer the protocol is built on, enabling both real hardware and a
//! simulated bootloader in tests.

use log::trace;

use super::config::{DfuRequest, DFU_INTERFACE, REQUEST_TYPE_IN, REQUEST_TYPE_OUT};
use super::device::DeviceIdentity;
use super::error::{DfuError, DfuResult, TransferError};

/// Setup stage of a DFU class control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    /// bmRequestType: class, interface recipient and direction folded together.
    pub request_type: u8,
    /// bRequest.
    pub request: DfuRequest,
    /// wValue: block number for DNLOAD/UPLOAD, 0 otherwise.
    pub value: u16,
    /// wIndex: the DFU interface.
    pub index: u16,
}

impl ControlRequest {
    /// Host-to-device request on the DFU interface.
    pub fn out(request: DfuRequest, value: u16) -> Self {
        Self {
            request_type: REQUEST_TYPE_OUT,
            request,
            value,
            index: DFU_INTERFACE,
        }
    }

    /// Device-to-host request on the DFU interface.
    pub fn inp(request: DfuRequest, value: u16) -> Self {
        Self {
            request_type: REQUEST_TYPE_IN,
            request,
            value,
            index: DFU_INTERFACE,
        }
    }

    /// True when data flows from the device to the host.
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// Data stage of a control transfer.
#[derive(Debug)]
pub enum ControlData<'a> {
    /// No data stage.
    None,
    /// Bytes sent to the device.
    Out(&'a [u8]),
    /// Buffer filled by the device; its length is wLength.
    In(&'a mut [u8]),
}

impl ControlData<'_> {
    /// wLength of the transfer.
    pub fn len(&self) -> usize {
        match self {
            ControlData::None => 0,
            ControlData::Out(data) => data.len(),
            ControlData::In(buffer) => buffer.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Trait for DFU transport operations.
///
/// A transport is an exclusive channel to one attached bootloader. Exactly
/// one engine drives it at a time.
pub trait DfuTransport: Send {
    /// Perform one blocking control transfer.
    ///
    /// # Arguments
    /// * `request` - Setup stage
    /// * `data` - Data stage
    /// * `timeout_ms` - Timeout in milliseconds, 0 for no timeout
    ///
    /// # Returns
    /// Number of bytes transferred in the data stage
    fn control_transfer(
        &mut self,
        request: ControlRequest,
        data: ControlData<'_>,
        timeout_ms: u32,
    ) -> Result<usize, TransferError>;

    /// Identity captured when the device was attached.
    fn identity(&self) -> DeviceIdentity;

    /// Give up the device handle. Later transfers fail with `Disconnected`.
    fn release(&mut self);

    /// Check if the handle is still held.
    fn is_connected(&self) -> bool;
}

impl<T: DfuTransport + ?Sized> DfuTransport for Box<T> {
    fn control_transfer(
        &mut self,
        request: ControlRequest,
        data: ControlData<'_>,
        timeout_ms: u32,
    ) -> Result<usize, TransferError> {
        (**self).control_transfer(request, data, timeout_ms)
    }

    fn identity(&self) -> DeviceIdentity {
        (**self).identity()
    }

    fn release(&mut self) {
        (**self).release()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

/// Run one transfer, logging it and naming the request in any failure.
pub(crate) fn execute<T: DfuTransport + ?Sized>(
    transport: &mut T,
    request: ControlRequest,
    data: ControlData<'_>,
    timeout_ms: u32,
) -> DfuResult<usize> {
    trace!(
        "{} wValue={} wLength={}",
        request.request.name(),
        request.value,
        data.len()
    );
    transport
        .control_transfer(request, data, timeout_ms)
        .map_err(|source| DfuError::transport(request.request.name(), source))
}

#[cfg(feature = "usb")]
pub use usb::UsbTransport;

#[cfg(feature = "usb")]
mod usb {
    use std::time::Duration;

    use log::{debug, info};
    use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient};
    use nusb::MaybeFuture;

    use super::{ControlData, ControlRequest, DfuTransport};
    use crate::dfu::config::{is_st_dfu_device, DFU_INTERFACE};
    use crate::dfu::device::DeviceIdentity;
    use crate::dfu::error::{DfuError, DfuResult, TransferError};

    /// Stand-in for "no timeout": long enough for any flash operation.
    const UNBOUNDED_TIMEOUT: Duration = Duration::from_secs(3600);

    /// `nusb` backed transport for the ST system bootloader.
    pub struct UsbTransport {
        interface: Option<nusb::Interface>,
        identity: DeviceIdentity,
    }

    impl UsbTransport {
        /// Open the first attached ST bootloader in DFU mode.
        pub fn open_first() -> DfuResult<Self> {
            let info = nusb::list_devices()
                .wait()
                .map_err(|e| DfuError::transport("enumerate", TransferError::Usb(e.to_string())))?
                .find(|d| is_st_dfu_device(d.vendor_id(), d.product_id()))
                .ok_or(DfuError::NotConnected)?;

            Self::open(info)
        }

        /// Open a specific device and claim its DFU interface.
        pub fn open(info: nusb::DeviceInfo) -> DfuResult<Self> {
            let identity =
                DeviceIdentity::new(info.vendor_id(), info.product_id(), info.device_version());
            debug!("Opening {}", identity.display_label());

            let device = info
                .open()
                .wait()
                .map_err(|e| DfuError::transport("open", TransferError::Usb(e.to_string())))?;
            let interface = device
                .detach_and_claim_interface(DFU_INTERFACE as u8)
                .wait()
                .map_err(|e| {
                    DfuError::transport("claim interface", TransferError::Usb(e.to_string()))
                })?;

            info!("Attached {}", identity.display_label());
            Ok(Self {
                interface: Some(interface),
                identity,
            })
        }
    }

    impl DfuTransport for UsbTransport {
        fn control_transfer(
            &mut self,
            request: ControlRequest,
            data: ControlData<'_>,
            timeout_ms: u32,
        ) -> Result<usize, TransferError> {
            let interface = self.interface.as_ref().ok_or(TransferError::Disconnected)?;
            let timeout = if timeout_ms == 0 {
                UNBOUNDED_TIMEOUT
            } else {
                Duration::from_millis(u64::from(timeout_ms))
            };

            match data {
                ControlData::In(buffer) => {
                    let bytes = interface
                        .control_in(
                            ControlIn {
                                control_type: ControlType::Class,
                                recipient: Recipient::Interface,
                                request: request.request as u8,
                                value: request.value,
                                index: request.index,
                                length: buffer.len() as u16,
                            },
                            timeout,
                        )
                        .wait()
                        .map_err(map_transfer_error)?;
                    let count = bytes.len().min(buffer.len());
                    buffer[..count].copy_from_slice(&bytes[..count]);
                    Ok(count)
                }
                ControlData::Out(payload) => {
                    send_out(interface, request, payload, timeout)?;
                    Ok(payload.len())
                }
                ControlData::None => {
                    send_out(interface, request, &[], timeout)?;
                    Ok(0)
                }
            }
        }

        fn identity(&self) -> DeviceIdentity {
            self.identity
        }

        fn release(&mut self) {
            if self.interface.take().is_some() {
                info!("USB was released");
            }
        }

        fn is_connected(&self) -> bool {
            self.interface.is_some()
        }
    }

    fn send_out(
        interface: &nusb::Interface,
        request: ControlRequest,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<(), TransferError> {
        interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: request.request as u8,
                    value: request.value,
                    index: request.index,
                    data: payload,
                },
                timeout,
            )
            .wait()
            .map_err(map_transfer_error)
    }

    fn map_transfer_error(error: nusb::transfer::TransferError) -> TransferError {
        use nusb::transfer::TransferError as UsbError;

        match error {
            UsbError::Stall => TransferError::Stall,
            UsbError::Disconnected => TransferError::Disconnected,
            // nusb cancels a control transfer when its timeout expires.
            UsbError::Cancelled => TransferError::Timeout,
            other => TransferError::Usb(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_request_direction() {
        let out = ControlRequest::out(DfuRequest::Dnload, 2);
        assert_eq!(out.request_type, 0x21);
        assert!(!out.is_in());

        let inp = ControlRequest::inp(DfuRequest::GetStatus, 0);
        assert_eq!(inp.request_type, 0xA1);
        assert!(inp.is_in());
        assert_eq!(inp.index, 0);
    }

    #[test]
    fn test_control_data_len() {
        let mut buffer = [0u8; 6];
        assert_eq!(ControlData::None.len(), 0);
        assert!(ControlData::None.is_empty());
        assert_eq!(ControlData::Out(&[0x41]).len(), 1);
        assert_eq!(ControlData::In(&mut buffer).len(), 6);
    }
}

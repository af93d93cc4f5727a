//! ST vendor command payloads.
//!
//! DfuSe layers its commands on the generic DNLOAD request: a transfer with
//! wValue = 0 carries a command byte and its arguments instead of image data.

use super::config::{CMD_ERASE, CMD_READ_UNPROTECT, CMD_SET_ADDRESS_POINTER};

/// Longest command payload (Set Address Pointer).
pub const MAX_COMMAND_LENGTH: usize = 5;

/// DfuSe vendor commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VendorCommand {
    /// Erase every flash sector.
    MassErase,
    /// Lift read-out protection. The device erases flash and resets.
    ReadUnprotect,
    /// Move the device's address pointer for the next block transfer.
    SetAddressPointer(u32),
}

impl VendorCommand {
    /// Build the DNLOAD payload for this command.
    pub fn encode(&self) -> CommandPayload {
        match *self {
            VendorCommand::MassErase => CommandPayload::new(&[CMD_ERASE]),
            VendorCommand::ReadUnprotect => CommandPayload::new(&[CMD_READ_UNPROTECT]),
            VendorCommand::SetAddressPointer(address) => {
                let [b0, b1, b2, b3] = address.to_le_bytes();
                CommandPayload::new(&[CMD_SET_ADDRESS_POINTER, b0, b1, b2, b3])
            }
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            VendorCommand::MassErase => "mass erase",
            VendorCommand::ReadUnprotect => "read unprotect",
            VendorCommand::SetAddressPointer(_) => "set address pointer",
        }
    }
}

/// Fixed-capacity command payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPayload {
    bytes: [u8; MAX_COMMAND_LENGTH],
    len: usize,
}

impl CommandPayload {
    fn new(data: &[u8]) -> Self {
        let mut bytes = [0u8; MAX_COMMAND_LENGTH];
        bytes[..data.len()].copy_from_slice(data);
        Self {
            bytes,
            len: data.len(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mass_erase_payload() {
        assert_eq!(VendorCommand::MassErase.encode().as_bytes(), &[0x41]);
    }

    #[test]
    fn test_read_unprotect_payload() {
        assert_eq!(VendorCommand::ReadUnprotect.encode().as_bytes(), &[0x92]);
    }

    #[test]
    fn test_set_address_pointer_payload() {
        let payload = VendorCommand::SetAddressPointer(0x0800_0000).encode();
        assert_eq!(payload.as_bytes(), &[0x21, 0x00, 0x00, 0x00, 0x08]);

        let payload = VendorCommand::SetAddressPointer(0x1234_5678).encode();
        assert_eq!(payload.as_bytes(), &[0x21, 0x78, 0x56, 0x34, 0x12]);
    }
}

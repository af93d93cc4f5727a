//! Host-side programmer for the STM32 system bootloader (USB DFU with ST
//! extensions).

pub mod commands;
pub mod dfu;
pub mod settings;

#[cfg(test)]
mod test_helpers;

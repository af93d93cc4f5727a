//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Parse a string as a hex or decimal u32
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u32>().map_err(|e| format!("Invalid number: {}", e))
    }
}

#[derive(Parser)]
#[command(name = "stm32-dfu")]
#[command(author, version, about = "STM32 system bootloader programmer", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Directory holding programmer_settings.json
    #[arg(long, global = true)]
    pub settings_dir: Option<PathBuf>,

    /// Flash address to write to and read from (hex with 0x prefix, or decimal)
    #[arg(long, global = true, value_parser = parse_hex_u32)]
    pub address: Option<u32>,

    /// Bytes per transfer block
    #[arg(long, global = true)]
    pub block_size: Option<u32>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List attached ST bootloaders
    Info,

    /// Show the device status
    Status,

    /// Check whether read-out protection is active
    Protected,

    /// Mass erase flash (lifts read protection on a protected device)
    Erase,

    /// Remove read-out protection; the device erases flash and resets
    Unprotect,

    /// Write a firmware binary
    Program {
        /// Firmware .bin file, or a directory holding one
        source: PathBuf,

        /// Skip the readback after writing
        #[arg(long)]
        no_verify: bool,
    },

    /// Compare flash against a firmware binary
    Verify {
        /// Firmware .bin file, or a directory holding one
        source: PathBuf,
    },
}

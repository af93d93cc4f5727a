//! stm32-dfu - program STM32 devices through the ST system bootloader.

mod cli;

use std::io::Write;
use std::process::ExitCode;

use clap::Parser;
use cli::{Cli, Commands};
use stm32_dfu::commands::dfu::{
    check_protection, erase_device, flash_firmware, verify_firmware, DfuProgressEvent,
};
use stm32_dfu::commands::firmware::load_firmware;
use stm32_dfu::commands::settings::get_programmer_settings;
use stm32_dfu::dfu::device::find_st_dfu_devices;
use stm32_dfu::dfu::{
    status_description, CancelToken, DfuEvent, EngineConfig, EraseOutcome, Notifier,
    ProgramEngine, UsbTransport,
};
use stm32_dfu::settings::ProgrammerSettings;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let settings = match &cli.settings_dir {
        Some(dir) => get_programmer_settings(dir.clone()).await?,
        None => ProgrammerSettings::default(),
    };
    let settings = ProgrammerSettings {
        load_address: cli.address.unwrap_or(settings.load_address),
        block_size: cli.block_size.unwrap_or(settings.block_size),
        ..settings
    };
    let config = settings.to_engine_config().map_err(|e| e.to_string())?;

    match cli.command {
        Commands::Info => {
            let devices = find_st_dfu_devices();
            if devices.is_empty() {
                return Err("No STM32 bootloader found".into());
            }
            for device in devices {
                println!(
                    "{} ({:04X}:{:04X})",
                    device.display_label(),
                    device.vendor_id,
                    device.product_id
                );
            }
            Ok(())
        }
        Commands::Status => {
            let mut engine = open_engine(config)?;
            let status = engine.status().map_err(|e| e.to_string())?;
            println!("State:        {:?}", status.state);
            println!(
                "Status:       0x{:02X} ({})",
                status.status_code,
                status_description(status.status_code)
            );
            println!("Poll timeout: {} ms", status.poll_timeout_ms);
            Ok(())
        }
        Commands::Protected => {
            let outcome = check_protection(open_transport()?, config, print_progress).await?;
            let protected = outcome.result.map_err(|e| e.to_string())?;
            println!(
                "Read protection is {}",
                if protected { "ACTIVE" } else { "not active" }
            );
            Ok(())
        }
        Commands::Erase => {
            let outcome = erase_device(open_transport()?, config, print_progress).await?;
            match outcome.result.map_err(|e| e.to_string())? {
                EraseOutcome::Erased { .. } => {}
                EraseOutcome::ProtectionRemoved => {
                    println!("Wait for the device to re-enumerate, then erase again if needed");
                }
            }
            Ok(())
        }
        Commands::Unprotect => {
            let mut engine = open_engine(config)?;
            engine
                .remove_read_protection()
                .map_err(|e| e.to_string())
        }
        Commands::Program { source, no_verify } => {
            let image = load_firmware(source, config.load_address, config.block_size).await?;
            let verify = settings.verify_after_program && !no_verify;
            let outcome = flash_firmware(
                open_transport()?,
                config,
                image,
                verify,
                CancelToken::new(),
                print_progress,
            )
            .await?;
            outcome.result.map_err(|e| e.to_string())
        }
        Commands::Verify { source } => {
            let image = load_firmware(source, config.load_address, config.block_size).await?;
            let outcome = verify_firmware(
                open_transport()?,
                config,
                image,
                CancelToken::new(),
                print_progress,
            )
            .await?;
            if outcome.result.map_err(|e| e.to_string())? {
                Ok(())
            } else {
                Err("Image written is NOT OK".into())
            }
        }
    }
}

fn open_transport() -> Result<UsbTransport, String> {
    UsbTransport::open_first().map_err(|e| e.to_string())
}

fn open_engine(config: EngineConfig) -> Result<ProgramEngine<UsbTransport>, String> {
    let notifier = Notifier::new(vec![Box::new(|event: &DfuEvent| {
        println!("{}", event.message());
    })]);
    ProgramEngine::new(open_transport()?, config, notifier).map_err(|e| e.to_string())
}

fn print_progress(event: DfuProgressEvent) {
    match (event.done, event.total) {
        (Some(done), Some(total)) if done < total => {
            print!("\r{} ({:.0}%)", event.message, event.percent);
            let _ = std::io::stdout().flush();
        }
        (Some(_), Some(_)) => println!("\r{} ({:.0}%)", event.message, event.percent),
        _ if event.stage == "failed" => {}
        _ => println!("{}", event.message),
    }
}

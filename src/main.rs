// SPDX-FileCopyrightText: 2024 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! # radflash
//!
//! This CLI programs firmware into Retevis/Radtel and iRadio handheld radios through their serial
//! bootloader, and backs up or restores the radios' external SPI flash.
//!
//! Commands supported: flash, backup, restore, convert, list

use radflash::image::{self, FILL_ERASED};
use radflash::session::{self, ProgrammingSession, SessionConfig};
use radflash::spi::{SpiConfig, SpiFlashClient};
use radflash::transport::{self, BAUD_RATE};
use radflash::{DeviceFamily, Error, FlashGeometry, Result, SpiProfile};

use clap::builder::{PossibleValuesParser, TypedValueParser};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use serialport::SerialPort;

use std::num;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::result;
use std::time::Duration;

fn progress_bar(total: u64) -> ProgressBar {
    let progress_bar = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template("{bar:^20.red/white.bold} {percent:>3}% {msg}")
    {
        progress_bar.set_style(style);
    }
    progress_bar.tick();
    progress_bar
}

fn phase_flash(
    port: &str,
    firmware: &Path,
    family: DeviceFamily,
    strict: bool,
    timeout: Duration,
) -> Result<()> {
    info!("Phase: Load");
    transport::ensure_present(port)?;

    let geometry = family.geometry();
    let (image, report) = image::decode_file(firmware, &geometry, FILL_ERASED, strict)?;
    if report.checksum_mismatches > 0 {
        warn!(
            "{} HEX records had a bad checksum and were loaded anyway",
            report.checksum_mismatches
        );
    }
    println!("Using {} protocol parameters", family);
    println!("Firmware CRC-32: {:#010X}", image.crc32());

    info!("Phase: Bootload");
    let serial = transport::open(port, BAUD_RATE)?;
    let config = SessionConfig {
        ack_timeout: timeout,
        ..SessionConfig::default()
    };
    let session = ProgrammingSession::new(*family.variant(), image, config);

    let progress_bar = progress_bar(geometry.blocks() as u64);
    let result = session::program(serial, session, |progress| {
        progress_bar.set_position(progress.block as u64);
        if progress.retransmission {
            progress_bar.set_message(format!("retry at {:#08X}", progress.offset));
        } else {
            progress_bar.set_message("");
        }
    });
    let summary = match result {
        Ok(summary) => {
            progress_bar.finish();
            summary
        }
        Err(err) => {
            progress_bar.abandon();
            return Err(err);
        }
    };

    let bits_per_second = summary.bytes as f64 * 8.0 / summary.elapsed.as_secs_f64();
    println!("Upload complete");
    println!("Nominal bootload bps: {bits_per_second:.0}");
    Ok(())
}

fn open_spi(
    port: &str,
    baud: u32,
    profile: SpiProfile,
    timeout: Duration,
) -> Result<SpiFlashClient<Box<dyn SerialPort>>> {
    transport::ensure_present(port)?;
    let serial = transport::open(port, baud)?;
    let config = SpiConfig {
        read_timeout: timeout,
        ..SpiConfig::default()
    };
    Ok(SpiFlashClient::new(serial, profile.command_checksum(), config))
}

fn phase_backup(
    port: &str,
    file: &Path,
    baud: u32,
    profile: SpiProfile,
    timeout: Duration,
) -> Result<()> {
    info!("Phase: Backup");
    let mut client = open_spi(port, baud, profile, timeout)?;

    let progress_bar = progress_bar(profile.block_count().into());
    let result = client.backup_to_file(file, profile.block_count(), |progress| {
        progress_bar.set_position(progress.block.into());
    });
    let report = match result {
        Ok(report) => {
            progress_bar.finish();
            report
        }
        Err(err) => {
            progress_bar.abandon();
            return Err(err);
        }
    };

    if report.checksum_mismatches > 0 {
        warn!(
            "{} blocks were accepted with a bad checksum",
            report.checksum_mismatches
        );
    }
    println!(
        "Backup completed: {} bytes written to {} (CRC-32 {:#010X})",
        profile.capacity(),
        file.display(),
        report.crc32
    );
    Ok(())
}

fn phase_restore(
    port: &str,
    file: &Path,
    baud: u32,
    profile: SpiProfile,
    timeout: Duration,
) -> Result<()> {
    info!("Phase: Restore");
    warn!("This will overwrite the SPI flash content");
    let mut client = open_spi(port, baud, profile, timeout)?;

    let progress_bar = progress_bar(profile.block_count().into());
    let result = client.restore_from_file(file, profile.block_count(), |progress| {
        progress_bar.set_position(progress.block.into());
    });
    let report = match result {
        Ok(report) => {
            progress_bar.finish();
            report
        }
        Err(err) => {
            progress_bar.abandon();
            return Err(err);
        }
    };

    println!(
        "Restore completed: {} blocks written from {} (CRC-32 {:#010X})",
        report.blocks,
        file.display(),
        report.crc32
    );
    Ok(())
}

fn phase_convert(input: &Path, output: &Path, strict: bool) -> Result<()> {
    info!("Phase: Convert");
    let report = image::convert(input, output, &FlashGeometry::PROGRAM, strict)?;
    println!(
        "Converted {} records, {} bytes placed, {} dropped",
        report.records, report.bytes_written, report.bytes_dropped
    );
    Ok(())
}

fn list_ports() -> Result<()> {
    let ports = transport::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("  {port}");
    }
    Ok(())
}

fn parse_baud(arg: String) -> u32 {
    // Only reachable with one of BAUD_OPTIONS.
    arg.parse::<u32>().unwrap_or(BAUD_RATE)
}

const BAUD_OPTIONS: [&str; 5] = ["921600", "460800", "230400", "115200", "57600"];

#[derive(Subcommand)]
enum Commands {
    /// Program firmware through the radio bootloader.
    Flash {
        /// Serial port connected to the radio (e.g. /dev/ttyUSB0, COM3).
        port: String,
        /// Firmware file, Intel HEX (.hex/.txt) or raw binary (.bin).
        firmware: PathBuf,
        #[arg(long)]
        /// Use the iRadio protocol parameters instead of Retevis/Radtel.
        iradio: bool,
        #[arg(long)]
        /// Reject HEX files with bad record checksums or short records.
        strict: bool,
    },
    /// Back up the external SPI flash to a file.
    Backup {
        /// Serial port connected to the radio.
        port: String,
        /// File to write the backup to.
        file: PathBuf,
        #[arg(
            value_parser = PossibleValuesParser::new(BAUD_OPTIONS).map(parse_baud),
            default_value_t = BAUD_RATE)]
        /// The baud rate to talk to the radio with.
        baud: u32,
        #[arg(short, long, default_value = "4m")]
        /// SPI flash size: 4m or 32m.
        size: SpiProfile,
    },
    /// Restore the external SPI flash from a backup file.
    Restore {
        /// Serial port connected to the radio.
        port: String,
        /// Backup file, exactly the flash size.
        file: PathBuf,
        #[arg(
            value_parser = PossibleValuesParser::new(BAUD_OPTIONS).map(parse_baud),
            default_value_t = BAUD_RATE)]
        /// The baud rate to talk to the radio with.
        baud: u32,
        #[arg(short, long, default_value = "4m")]
        /// SPI flash size: 4m or 32m.
        size: SpiProfile,
    },
    /// Convert an Intel HEX file into a binary image of the program flash.
    Convert {
        /// Intel HEX input.
        input: PathBuf,
        /// Binary output.
        output: PathBuf,
        #[arg(long)]
        /// Reject HEX files with bad record checksums or short records.
        strict: bool,
    },
    /// List the serial ports on this system.
    List,
}

#[derive(Parser)]
#[command(author, version, about, long_about=None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    /// The task to perform.
    command: Commands,
    #[command(flatten)]
    /// The level of output verbosity.
    verbose: clap_verbosity_flag::Verbosity,
    #[arg(short, long, value_parser=parse_duration, default_value="3000")]
    /// Time to wait for a block acknowledgement or read response, in milliseconds.
    timeout: Duration,
}

fn parse_duration(arg: &str) -> result::Result<Duration, num::ParseIntError> {
    let milliseconds = arg.parse()?;
    Ok(Duration::from_millis(milliseconds))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.verbose.log_level_filter())
        .init();

    info!(
        "radflash version: {}.{}",
        env!("CARGO_PKG_VERSION_MAJOR"),
        env!("CARGO_PKG_VERSION_MINOR")
    );

    let (result, what) = match &cli.command {
        Commands::Flash {
            port,
            firmware,
            iradio,
            strict,
        } => {
            let family = if *iradio {
                DeviceFamily::IRadio
            } else {
                DeviceFamily::Retevis
            };
            (
                phase_flash(port, firmware, family, *strict, cli.timeout),
                "Upload",
            )
        }
        Commands::Backup {
            port,
            file,
            baud,
            size,
        } => (
            phase_backup(port, file, *baud, *size, cli.timeout),
            "Backup",
        ),
        Commands::Restore {
            port,
            file,
            baud,
            size,
        } => (
            phase_restore(port, file, *baud, *size, cli.timeout),
            "Restore",
        ),
        Commands::Convert {
            input,
            output,
            strict,
        } => (phase_convert(input, output, *strict), "Conversion"),
        Commands::List => (list_ports(), "Listing ports"),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            if let Error::PortNotFound(_) = err {
                error!("Run `radflash list` to see the available ports.");
            }
            error!("{what} failed");
            ExitCode::FAILURE
        }
    }
}

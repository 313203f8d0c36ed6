// SPDX-FileCopyrightText: 2024 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! This crate talks to the serial bootloader of ARM-based handheld radios (Retevis/Radtel and
//! iRadio families) to program firmware into their MCU flash, and to the radio firmware itself to
//! back up and restore the external SPI flash.
//!
//! Firmware images are loaded from Intel HEX or raw binary files by [image], uploaded by the
//! [session] state machine and the external flash is handled by [spi]. A binary companion crate
//! wraps these into a command-line tool.

pub mod checksum;
pub mod error;
pub mod image;
pub mod packet;
pub mod session;
pub mod spi;
pub mod transport;
pub mod variant;

pub use checksum::Checksum;
pub use error::{Error, Result};
pub use image::{DecodeReport, HexDecoder, ImageFormat, MemoryImage};
pub use session::{program, ProgrammingSession, Progress, SessionConfig, TransferSummary};
pub use spi::{SpiConfig, SpiFlashClient, SpiProgress};
pub use transport::Transport;
pub use variant::{DeviceFamily, FlashGeometry, ProtocolVariant, SpiProfile};

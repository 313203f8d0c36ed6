// SPDX-FileCopyrightText: 2024 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! Device family constants: bootloader magic sequences, checksum offsets and flash geometry.

use std::fmt;
use std::str::FromStr;

use crate::checksum::Checksum;

/// Size of every block moved over the wire, both for firmware and SPI flash.
pub const BLOCK_SIZE: usize = 1024;

/// Positive acknowledgement byte.
pub const ACK: u8 = 0x06;
/// Negative acknowledgement byte.
pub const NAK: u8 = 0xFF;
/// Sent by the radio while it is still coming up. Not a protocol ACK.
pub const PRESENCE: u8 = 0x00;

/// Command byte of a block write (firmware data packet and SPI write).
pub const CMD_WRITE: u8 = 0x57;
/// Command byte of an SPI block read.
pub const CMD_READ: u8 = 0x52;

/// Where the firmware image lives in the radio's program flash.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlashGeometry {
    /// ARM address of the first image byte.
    pub base_address: u32,
    /// Image length in bytes. A multiple of `block_size`.
    pub image_size: usize,
    pub block_size: usize,
}

impl FlashGeometry {
    /// Application window behind the bootloader: 246 blocks starting at `0x0800_2800`.
    pub const PROGRAM: FlashGeometry = FlashGeometry {
        base_address: 0x0800_2800,
        image_size: 246 * BLOCK_SIZE,
        block_size: BLOCK_SIZE,
    };

    pub fn blocks(&self) -> usize {
        self.image_size.div_ceil(self.block_size)
    }
}

/// The magic sequences and checksum offset spoken by one family of radios.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProtocolVariant {
    pub name: &'static str,
    pub connect: [u8; 5],
    pub update: [u8; 5],
    pub end: [u8; 5],
    pub checksum: Checksum,
}

impl ProtocolVariant {
    pub const RETEVIS: ProtocolVariant = ProtocolVariant {
        name: "Retevis/Radtel",
        connect: [57, 51, 5, 16, 211],
        update: [57, 51, 5, 85, 24],
        end: [57, 51, 5, 238, 177],
        checksum: Checksum::with_offset(82),
    };

    pub const IRADIO: ProtocolVariant = ProtocolVariant {
        name: "iRadio",
        connect: [57, 51, 5, 16, 129],
        update: [57, 51, 5, 85, 198],
        end: [57, 51, 5, 238, 95],
        checksum: Checksum::PLAIN,
    };
}

/// Radio families with a known bootloader dialect.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DeviceFamily {
    #[default]
    Retevis,
    IRadio,
}

impl DeviceFamily {
    pub fn variant(&self) -> &'static ProtocolVariant {
        match self {
            Self::Retevis => &ProtocolVariant::RETEVIS,
            Self::IRadio => &ProtocolVariant::IRADIO,
        }
    }

    pub fn geometry(&self) -> FlashGeometry {
        FlashGeometry::PROGRAM
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.variant().name)
    }
}

/// Known external SPI flash layouts for backup and restore.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SpiProfile {
    /// 4 MiB chip; commands carry a checksum offset of 82.
    #[default]
    Flash4M,
    /// 32 MiB chip; commands carry a plain checksum.
    Flash32M,
}

impl SpiProfile {
    pub fn block_count(&self) -> u16 {
        match self {
            Self::Flash4M => 4096,
            Self::Flash32M => 32768,
        }
    }

    pub fn capacity(&self) -> u64 {
        u64::from(self.block_count()) * BLOCK_SIZE as u64
    }

    pub fn command_checksum(&self) -> Checksum {
        match self {
            Self::Flash4M => Checksum::with_offset(82),
            Self::Flash32M => Checksum::PLAIN,
        }
    }
}

impl FromStr for SpiProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "4m" | "4mb" | "4mib" => Ok(Self::Flash4M),
            "32m" | "32mb" | "32mib" => Ok(Self::Flash32M),
            other => Err(format!("unknown SPI flash size '{other}' (expected 4m or 32m)")),
        }
    }
}

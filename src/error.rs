// SPDX-FileCopyrightText: 2024 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! Error type shared by the decoder, the programming session and the SPI flash client.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::result;

pub type Result<T> = result::Result<T, Error>;

/// Errors that can be emitted while talking to the radio bootloader or preparing its data.
#[derive(Debug)]
pub enum Error {
    Serial(serialport::Error),
    Io(io::Error),
    /// The named serial port is not present on this system.
    PortNotFound(String),
    FileNotFound(PathBuf),
    /// A firmware file could not be decoded. `line` is 1-based.
    Format { line: usize, reason: String },
    /// A HEX record checksum did not match. Only raised in strict mode.
    ChecksumMismatch { line: usize, expected: u8, actual: u8 },
    /// A bounded read did not complete in time.
    Timeout(String),
    /// The radio never answered the connect sequence.
    NoResponse,
    /// The radio sent a NAK before block transfer started.
    NakDuringHandshake { stage: &'static str },
    /// The radio stopped answering before block transfer started.
    HandshakeTimeout { stage: &'static str },
    /// A block was rejected or timed out more often than allowed.
    MaxRetriesExceeded { offset: u32, attempts: u32 },
    /// An SPI read response did not echo the command header.
    InvalidHeader { block: u16, got: [u8; 3] },
    /// The radio refused an SPI block write.
    DeviceRejected { block: u16, code: u8 },
    /// A restore file is not exactly the flash capacity.
    FileSizeMismatch { expected: u64, actual: u64 },
    /// The background reader stopped before the session finished.
    Disconnected,
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Serial(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial(err) => write!(f, "serial port error: {err}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::PortNotFound(port) => write!(f, "port '{port}' not found"),
            Self::FileNotFound(path) => write!(f, "file {} not found", path.display()),
            Self::Format { line, reason } => write!(f, "line {line}: {reason}"),
            Self::ChecksumMismatch {
                line,
                expected,
                actual,
            } => write!(
                f,
                "line {line}: record checksum mismatch, expected {expected:#04X}, got {actual:#04X}"
            ),
            Self::Timeout(what) => write!(f, "timeout: {what}"),
            Self::NoResponse => write!(f, "connect: no response from device"),
            Self::NakDuringHandshake { stage } => write!(f, "{stage}: NAK received"),
            Self::HandshakeTimeout { stage } => write!(f, "{stage}: device stopped responding"),
            Self::MaxRetriesExceeded { offset, attempts } => write!(
                f,
                "transfer: block at offset {offset:#08X} failed after {attempts} attempts"
            ),
            Self::InvalidHeader { block, got } => write!(
                f,
                "read block {block}: invalid response header {:02X} {:02X} {:02X}",
                got[0], got[1], got[2]
            ),
            Self::DeviceRejected { block, code } => {
                write!(f, "write block {block}: device rejected with {code:#04X}")
            }
            Self::FileSizeMismatch { expected, actual } => write!(
                f,
                "restore file must be exactly {expected} bytes, got {actual}"
            ),
            Self::Disconnected => write!(f, "serial reader stopped unexpectedly"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Serial(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

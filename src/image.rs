// SPDX-FileCopyrightText: 2024 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! Firmware image loading.
//!
//! A firmware file is either raw binary or Intel HEX text. Either way it ends up in a
//! [MemoryImage], a fixed-size buffer addressed by offset from the program flash base address.
//!
//! Intel HEX lines have the following layout, all fields hex-encoded ASCII:
//!  - `:` start code
//!  - 1 byte data length
//!  - 2 bytes address (big endian)
//!  - 1 byte record type
//!  - N bytes data
//!  - 1 byte checksum (two's complement of the sum of all preceding bytes)

use std::fs;
use std::fs::File;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt};
use crc::{Crc, CRC_32_ISO_HDLC};
use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::variant::FlashGeometry;

/// Fill value for images sent to the programmer, matching erased flash.
pub const FILL_ERASED: u8 = 0xFF;
/// Fill value for the stand-alone HEX to binary converter.
pub const FILL_ZERO: u8 = 0x00;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A fixed-length byte buffer addressed by offset from the flash base address.
///
/// Writes outside the buffer are dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryImage {
    data: Vec<u8>,
}

impl MemoryImage {
    pub fn new(len: usize, fill: u8) -> Self {
        Self {
            data: vec![fill; len],
        }
    }

    /// An image of the program window, filled like erased flash.
    pub fn erased(geometry: &FlashGeometry) -> Self {
        Self::new(geometry.image_size, FILL_ERASED)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Stores `byte` at `offset`, returning whether it landed inside the image.
    pub fn write(&mut self, offset: i64, byte: u8) -> bool {
        match usize::try_from(offset)
            .ok()
            .and_then(|offset| self.data.get_mut(offset))
        {
            Some(slot) => {
                *slot = byte;
                true
            }
            None => false,
        }
    }

    /// Copies `bytes` to the start of the image, truncating to the image length.
    ///
    /// Returns the number of bytes copied.
    pub fn load_binary(&mut self, bytes: &[u8]) -> usize {
        let count = bytes.len().min(self.data.len());
        self.data[..count].copy_from_slice(&bytes[..count]);
        count
    }

    /// The `size` bytes starting at `offset`, clamped to the image end.
    pub fn block(&self, offset: usize, size: usize) -> &[u8] {
        let start = offset.min(self.data.len());
        let end = offset.saturating_add(size).min(self.data.len());
        &self.data[start..end]
    }

    pub fn crc32(&self) -> u32 {
        CRC32.checksum(&self.data)
    }
}

/// How a firmware file is encoded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    Hex,
    Binary,
}

impl ImageFormat {
    /// Guesses the format from the file extension, if it is a known one.
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "hex" | "txt" | "ihex" => Some(Self::Hex),
            "bin" => Some(Self::Binary),
            _ => None,
        }
    }
}

/// Summary of a decode run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodeReport {
    pub format: Option<ImageFormat>,
    /// Number of HEX records processed, including the end-of-file record.
    pub records: usize,
    /// Lines starting with `:` that were too short to hold a record.
    pub skipped_lines: usize,
    /// Records whose trailing checksum did not match their contents.
    pub checksum_mismatches: usize,
    /// Bytes that landed inside the image.
    pub bytes_written: usize,
    /// Data bytes that fell outside the image window.
    pub bytes_dropped: usize,
}

/// Intel HEX record types.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecordType {
    Data,
    EndOfFile,
    ExtendedSegmentAddress,
    StartSegmentAddress,
    ExtendedLinearAddress,
    StartLinearAddress,
    Unknown(u8),
}

impl From<u8> for RecordType {
    fn from(num: u8) -> Self {
        match num {
            0 => Self::Data,
            1 => Self::EndOfFile,
            2 => Self::ExtendedSegmentAddress,
            3 => Self::StartSegmentAddress,
            4 => Self::ExtendedLinearAddress,
            5 => Self::StartLinearAddress,
            other => Self::Unknown(other),
        }
    }
}

/// One parsed Intel HEX line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HexRecord {
    /// Data length as declared by the record.
    pub length: u8,
    pub address: u16,
    pub kind: RecordType,
    /// Data bytes actually present on the line. Shorter than `length` if the line was cut.
    pub data: Vec<u8>,
    /// Trailing checksum byte, absent on truncated lines.
    pub checksum: Option<u8>,
}

// Shortest complete record: ':' + length + address + type + checksum.
const MIN_RECORD_CHARS: usize = 11;

impl HexRecord {
    /// Parses a single line. Returns `Ok(None)` for lines too short to be a record.
    ///
    /// # Errors
    ///
    /// [Error::Format] if a field does not parse as hex.
    pub fn parse(line: &str, line_no: usize) -> Result<Option<Self>> {
        let Some(body) = line.strip_prefix(':') else {
            return Err(Error::Format {
                line: line_no,
                reason: "record does not start with ':'".to_string(),
            });
        };
        if line.len() < MIN_RECORD_CHARS {
            return Ok(None);
        }

        let bytes = decode_hex_pairs(body, line_no)?;
        let mut header = &bytes[..4];
        let length = header.read_u8()?;
        let address = header.read_u16::<BigEndian>()?;
        let kind = RecordType::from(header.read_u8()?);

        let rest = &bytes[4..];
        let length_usize = usize::from(length);
        let (data, checksum) = if rest.len() > length_usize {
            (rest[..length_usize].to_vec(), Some(rest[length_usize]))
        } else {
            (rest.to_vec(), None)
        };

        Ok(Some(Self {
            length,
            address,
            kind,
            data,
            checksum,
        }))
    }

    /// The checksum this record should carry.
    pub fn computed_checksum(&self) -> u8 {
        let [address_hi, address_lo] = self.address.to_be_bytes();
        let kind = match self.kind {
            RecordType::Data => 0,
            RecordType::EndOfFile => 1,
            RecordType::ExtendedSegmentAddress => 2,
            RecordType::StartSegmentAddress => 3,
            RecordType::ExtendedLinearAddress => 4,
            RecordType::StartLinearAddress => 5,
            RecordType::Unknown(kind) => kind,
        };
        let sum = [self.length, address_hi, address_lo, kind]
            .iter()
            .chain(self.data.iter())
            .fold(0u8, |acc, byte| acc.wrapping_add(*byte));
        sum.wrapping_neg()
    }

    /// Whether the trailing checksum is present and correct.
    pub fn checksum_ok(&self) -> bool {
        self.checksum == Some(self.computed_checksum())
    }

    pub fn is_truncated(&self) -> bool {
        self.data.len() < usize::from(self.length)
    }
}

fn decode_hex_pairs(text: &str, line_no: usize) -> Result<Vec<u8>> {
    let text = text.as_bytes();
    text.chunks(2)
        .filter(|pair| pair.len() == 2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| Error::Format {
                    line: line_no,
                    reason: format!("invalid hex digits '{}'", String::from_utf8_lossy(pair)),
                })
        })
        .collect()
}

/// Decodes Intel HEX text into a [MemoryImage].
///
/// Data lands at `(extended_address << 16) + record_address - base_address`. Offsets below zero
/// or past the image end are skipped. Record checksums are checked and counted, but a mismatch is
/// only fatal in strict mode.
#[derive(Copy, Clone, Debug)]
pub struct HexDecoder {
    base_address: u32,
    strict: bool,
}

impl HexDecoder {
    pub fn new(base_address: u32) -> Self {
        Self {
            base_address,
            strict: false,
        }
    }

    /// In strict mode short lines, truncated data and checksum mismatches are errors.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn decode<R: BufRead>(&self, reader: R, image: &mut MemoryImage) -> Result<DecodeReport> {
        let mut report = DecodeReport {
            format: Some(ImageFormat::Hex),
            ..DecodeReport::default()
        };
        let mut upper_address: i64 = 0;

        for (index, line) in reader.split(b'\n').enumerate() {
            let line_no = index + 1;
            let line = line?;
            let line = match std::str::from_utf8(&line) {
                Ok(line) => line.trim(),
                Err(_) if !line.starts_with(b":") => continue,
                Err(_) => {
                    return Err(Error::Format {
                        line: line_no,
                        reason: "record is not ASCII".to_string(),
                    })
                }
            };
            if line.len() <= 1 || !line.starts_with(':') {
                continue;
            }

            let Some(record) = HexRecord::parse(line, line_no)? else {
                if self.strict {
                    return Err(Error::Format {
                        line: line_no,
                        reason: "record too short".to_string(),
                    });
                }
                debug!("Skipping short record on line {}: {}", line_no, line);
                report.skipped_lines += 1;
                continue;
            };

            if record.is_truncated() {
                if self.strict {
                    return Err(Error::Format {
                        line: line_no,
                        reason: format!(
                            "record declares {} bytes but holds {}",
                            record.length,
                            record.data.len()
                        ),
                    });
                }
                warn!(
                    "Line {}: record truncated to {} of {} bytes",
                    line_no,
                    record.data.len(),
                    record.length
                );
            } else if record.checksum.is_none() {
                if self.strict {
                    return Err(Error::Format {
                        line: line_no,
                        reason: "missing checksum".to_string(),
                    });
                }
                warn!("Line {}: record has no checksum", line_no);
            } else if !record.checksum_ok() {
                let expected = record.computed_checksum();
                let actual = record.checksum.unwrap_or_default();
                if self.strict {
                    return Err(Error::ChecksumMismatch {
                        line: line_no,
                        expected,
                        actual,
                    });
                }
                warn!(
                    "Line {}: record checksum mismatch, expected {:#04X}, got {:#04X}",
                    line_no, expected, actual
                );
                report.checksum_mismatches += 1;
            }

            report.records += 1;
            match record.kind {
                RecordType::Data => {
                    let start = upper_address + i64::from(record.address)
                        - i64::from(self.base_address);
                    for (i, byte) in record.data.iter().enumerate() {
                        if image.write(start + i as i64, *byte) {
                            report.bytes_written += 1;
                        } else {
                            report.bytes_dropped += 1;
                        }
                    }
                }
                RecordType::EndOfFile => break,
                RecordType::ExtendedLinearAddress | RecordType::ExtendedSegmentAddress => {
                    if record.length != 2 || record.data.len() != 2 {
                        return Err(Error::Format {
                            line: line_no,
                            reason: "address record must hold exactly 2 bytes".to_string(),
                        });
                    }
                    let value = i64::from(u16::from_be_bytes([record.data[0], record.data[1]]));
                    upper_address = if record.kind == RecordType::ExtendedLinearAddress {
                        value << 16
                    } else {
                        value << 4
                    };
                    debug!("Line {}: upper address now {:#010X}", line_no, upper_address);
                }
                RecordType::StartSegmentAddress | RecordType::StartLinearAddress => {}
                RecordType::Unknown(kind) => {
                    debug!("Line {}: ignoring record type {:#04X}", line_no, kind);
                }
            }
        }

        Ok(report)
    }
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => Error::FileNotFound(path.to_path_buf()),
        _ => Error::Io(err),
    })
}

fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => Error::FileNotFound(path.to_path_buf()),
        _ => Error::Io(err),
    })
}

fn decode_binary(bytes: &[u8], image: &mut MemoryImage) -> DecodeReport {
    let copied = image.load_binary(bytes);
    if copied < bytes.len() {
        warn!(
            "Binary is {} bytes, truncated to the {} byte image",
            bytes.len(),
            image.len()
        );
    }
    DecodeReport {
        format: Some(ImageFormat::Binary),
        bytes_written: copied,
        bytes_dropped: bytes.len() - copied,
        ..DecodeReport::default()
    }
}

fn no_records() -> Error {
    Error::Format {
        line: 0,
        reason: "no Intel HEX records found".to_string(),
    }
}

/// Loads a firmware file into an image of `geometry`'s size.
///
/// The format is taken from the extension when it is `.hex`, `.txt` or `.bin`. Otherwise the
/// file is tried as Intel HEX first and falls back to raw binary.
pub fn decode_file(
    path: &Path,
    geometry: &FlashGeometry,
    fill: u8,
    strict: bool,
) -> Result<(MemoryImage, DecodeReport)> {
    let decoder = HexDecoder::new(geometry.base_address).strict(strict);
    let mut image = MemoryImage::new(geometry.image_size, fill);

    let report = match ImageFormat::from_path(path) {
        Some(ImageFormat::Hex) => {
            let report = decoder.decode(BufReader::new(open(path)?), &mut image)?;
            if report.records == 0 {
                return Err(no_records());
            }
            report
        }
        Some(ImageFormat::Binary) => decode_binary(&read(path)?, &mut image),
        None => {
            let bytes = read(path)?;
            match decoder.decode(bytes.as_slice(), &mut image) {
                Ok(report) if report.records > 0 => report,
                outcome => {
                    debug!(
                        "{} is not Intel HEX ({:?}), loading as binary",
                        path.display(),
                        outcome.err().map(|err| err.to_string())
                    );
                    image = MemoryImage::new(geometry.image_size, fill);
                    decode_binary(&bytes, &mut image)
                }
            }
        }
    };

    info!(
        "Loaded {:?} firmware {}: {} records, {} bytes placed, CRC-32 {:#010X}",
        report.format.unwrap_or(ImageFormat::Binary),
        path.display(),
        report.records,
        report.bytes_written,
        image.crc32()
    );
    debug!("First 16 bytes: {:02X?}", image.block(0, 16));
    Ok((image, report))
}

/// Converts an Intel HEX file into a zero-filled binary image of the program window.
pub fn convert(
    input: &Path,
    output: &Path,
    geometry: &FlashGeometry,
    strict: bool,
) -> Result<DecodeReport> {
    let decoder = HexDecoder::new(geometry.base_address).strict(strict);
    let mut image = MemoryImage::new(geometry.image_size, FILL_ZERO);
    let report = decoder.decode(BufReader::new(open(input)?), &mut image)?;
    if report.records == 0 {
        return Err(no_records());
    }
    fs::write(output, image.as_bytes())?;
    info!(
        "Wrote {} bytes to {} ({} records)",
        image.len(),
        output.display(),
        report.records
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_outside_are_dropped() {
        let mut image = MemoryImage::new(4, FILL_ERASED);
        assert!(image.write(0, 1));
        assert!(image.write(3, 2));
        assert!(!image.write(4, 3));
        assert!(!image.write(-1, 4));
        assert_eq!(image.as_bytes(), &[1, 0xFF, 0xFF, 2]);
    }

    #[test]
    fn binary_is_truncated_or_padded() {
        let mut image = MemoryImage::new(4, FILL_ERASED);
        assert_eq!(image.load_binary(&[1, 2]), 2);
        assert_eq!(image.as_bytes(), &[1, 2, 0xFF, 0xFF]);
        assert_eq!(image.load_binary(&[9, 8, 7, 6, 5]), 4);
        assert_eq!(image.as_bytes(), &[9, 8, 7, 6]);
    }

    #[test]
    fn block_clamps_to_end() {
        let image = MemoryImage::new(10, 0);
        assert_eq!(image.block(8, 4).len(), 2);
        assert!(image.block(12, 4).is_empty());
    }

    #[test]
    fn parses_record_fields() {
        let record = HexRecord::parse(":0400100001020304E2", 1).unwrap().unwrap();
        assert_eq!(record.length, 4);
        assert_eq!(record.address, 0x0010);
        assert_eq!(record.kind, RecordType::Data);
        assert_eq!(record.data, vec![1, 2, 3, 4]);
        assert_eq!(record.checksum, Some(0xE2));
        assert!(record.checksum_ok());
    }

    #[test]
    fn eof_record_checksum() {
        let record = HexRecord::parse(":00000001FF", 1).unwrap().unwrap();
        assert_eq!(record.kind, RecordType::EndOfFile);
        assert!(record.checksum_ok());
    }

    #[test]
    fn short_line_is_skipped() {
        assert_eq!(HexRecord::parse(":0000", 3).unwrap(), None);
    }

    #[test]
    fn bad_hex_is_a_format_error() {
        match HexRecord::parse(":0G00000000", 7) {
            Err(Error::Format { line, .. }) => assert_eq!(line, 7),
            _ => panic!("expected a format error"),
        }
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(
            ImageFormat::from_path(Path::new("fw.HEX")),
            Some(ImageFormat::Hex)
        );
        assert_eq!(
            ImageFormat::from_path(Path::new("allcode.txt")),
            Some(ImageFormat::Hex)
        );
        assert_eq!(
            ImageFormat::from_path(Path::new("fw.bin")),
            Some(ImageFormat::Binary)
        );
        assert_eq!(ImageFormat::from_path(Path::new("firmware")), None);
    }
}

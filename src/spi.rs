// SPDX-FileCopyrightText: 2024 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! External SPI flash backup and restore.
//!
//! The radio must be in normal mode (not the bootloader). Flash is addressed in 1024-byte blocks
//! numbered from zero; every read command is answered with a 1028-byte packet and every write
//! command with a single ACK byte.

use std::fs::File;
use std::io;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crc::{Crc, CRC_32_ISO_HDLC};
use log::{debug, info, trace, warn};

use crate::checksum::Checksum;
use crate::error::{Error, Result};
use crate::packet::{self, BLOCK_PACKET_LEN};
use crate::transport::Transport;
use crate::variant::{ACK, BLOCK_SIZE};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Timing and retry limits for SPI flash access.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpiConfig {
    /// Deadline for collecting a whole read response.
    pub read_timeout: Duration,
    /// Deadline for the ACK of a block write.
    pub write_timeout: Duration,
    /// Read attempts per block during a backup.
    pub read_attempts: u32,
    /// Pause between read attempts.
    pub retry_delay: Duration,
    /// Pause after sending a read command.
    pub read_turnaround: Duration,
    /// Pause after sending a write command.
    pub write_turnaround: Duration,
    /// Pause between blocks.
    pub block_delay: Duration,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(5),
            read_attempts: 3,
            retry_delay: Duration::from_millis(100),
            read_turnaround: Duration::from_millis(50),
            write_turnaround: Duration::from_millis(100),
            block_delay: Duration::from_millis(20),
        }
    }
}

/// A block read from the radio.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRead {
    pub data: Vec<u8>,
    /// False when the response was accepted on its header alone.
    pub checksum_ok: bool,
}

/// A block has been moved.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SpiProgress {
    /// Blocks done so far.
    pub block: u32,
    pub total: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupReport {
    pub blocks: u32,
    /// Blocks accepted despite a bad response checksum.
    pub checksum_mismatches: u32,
    /// Blocks that needed more than one read command.
    pub retried_blocks: u32,
    pub crc32: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub blocks: u32,
    pub crc32: u32,
}

/// Block level access to the radio's SPI flash.
pub struct SpiFlashClient<T: Transport> {
    transport: T,
    checksum: Checksum,
    config: SpiConfig,
}

impl<T: Transport> SpiFlashClient<T> {
    /// `checksum` is the one applied to outgoing commands. Responses always carry a plain sum.
    pub fn new(transport: T, checksum: Checksum, config: SpiConfig) -> Self {
        Self {
            transport,
            checksum,
            config,
        }
    }

    /// Fills `buffer` from the transport, failing if that takes longer than `timeout`.
    fn read_within(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<()> {
        let start = Instant::now();
        let mut filled = 0;
        while filled < buffer.len() {
            if start.elapsed() > timeout {
                return Err(Error::Timeout(format!(
                    "got {} of {} bytes after {:?}",
                    filled,
                    buffer.len(),
                    timeout
                )));
            }
            match self.transport.read(&mut buffer[filled..]) {
                Ok(0) => thread::sleep(Duration::from_millis(10)),
                Ok(count) => filled += count,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        trace!("TX {:02X?}", &bytes[..bytes.len().min(16)]);
        self.transport.write_all(bytes)?;
        self.transport.flush()?;
        Ok(())
    }

    /// Reads one 1024-byte block.
    ///
    /// A response whose checksum fails is read a second time. If that still fails but the header
    /// echoes the command, the data is accepted and [BlockRead::checksum_ok] is false: blank flash
    /// reads as all `0xFF` and does not always sum correctly.
    ///
    /// # Errors
    ///
    /// [Error::Timeout] if the response does not arrive in time, [Error::InvalidHeader] if it does
    /// not echo the command.
    pub fn read_block(&mut self, block: u16) -> Result<BlockRead> {
        let command = packet::block_read(block, self.checksum);
        debug!("Reading block {}", block);
        self.send(&command)?;
        thread::sleep(self.config.read_turnaround);

        let mut response = vec![0u8; BLOCK_PACKET_LEN];
        let timeout = self.config.read_timeout;
        self.read_within(&mut response, timeout).map_err(|err| match err {
            Error::Timeout(what) => Error::Timeout(format!("read block {block}: {what}")),
            other => other,
        })?;
        trace!("RX {:02X?}", &response[..16]);

        if response[..3] != command[..3] {
            return Err(Error::InvalidHeader {
                block,
                got: [response[0], response[1], response[2]],
            });
        }

        let mut checksum_ok = Checksum::PLAIN.verify(&response);
        if !checksum_ok {
            debug!("Block {}: checksum failed, trying second read", block);
            let mut second = vec![0u8; BLOCK_PACKET_LEN];
            match self.read_within(&mut second, timeout) {
                Ok(()) if second[..3] == command[..3] => {
                    response = second;
                    checksum_ok = Checksum::PLAIN.verify(&response);
                }
                Ok(()) => debug!("Block {}: second read has a bad header, keeping first", block),
                Err(err) => debug!("Block {}: second read failed ({}), keeping first", block, err),
            }
        }
        if !checksum_ok {
            if let Some((expected, actual)) = Checksum::PLAIN.compare(&response) {
                warn!(
                    "Block {}: checksum mismatch (expected {:#04X}, got {:#04X}), header is valid, accepting",
                    block, expected, actual
                );
            }
        }

        Ok(BlockRead {
            data: packet::payload(&response).to_vec(),
            checksum_ok,
        })
    }

    /// Writes one 1024-byte block.
    ///
    /// # Errors
    ///
    /// [Error::DeviceRejected] if the radio answers with anything but ACK.
    pub fn write_block(&mut self, block: u16, data: &[u8; BLOCK_SIZE]) -> Result<()> {
        let command = packet::block_write(block, data, self.checksum);
        debug!("Writing block {}", block);
        self.send(&command)?;
        thread::sleep(self.config.write_turnaround);

        let mut reply = [0u8; 1];
        let timeout = self.config.write_timeout;
        self.read_within(&mut reply, timeout).map_err(|err| match err {
            Error::Timeout(what) => Error::Timeout(format!("write block {block}: {what}")),
            other => other,
        })?;
        trace!("RX {:02X?}", reply);

        match reply[0] {
            ACK => Ok(()),
            code => Err(Error::DeviceRejected { block, code }),
        }
    }

    fn read_block_with_retries(&mut self, block: u16) -> Result<(BlockRead, bool)> {
        let mut attempt = 1;
        loop {
            match self.read_block(block) {
                Ok(read) => return Ok((read, attempt > 1)),
                Err(err) if attempt < self.config.read_attempts => {
                    warn!(
                        "Block {} at {:#08X}: {}, retrying ({}/{})",
                        block,
                        u32::from(block) * BLOCK_SIZE as u32,
                        err,
                        attempt,
                        self.config.read_attempts
                    );
                    if let Err(err) = self.transport.discard_input() {
                        debug!("Could not discard input: {}", err);
                    }
                    thread::sleep(self.config.retry_delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Reads blocks `0..block_count` in order and appends them to `output`.
    pub fn backup<W, F>(
        &mut self,
        mut output: W,
        block_count: u16,
        mut on_progress: F,
    ) -> Result<BackupReport>
    where
        W: Write,
        F: FnMut(&SpiProgress),
    {
        info!("Backing up {} blocks", block_count);
        let mut report = BackupReport::default();
        let mut digest = CRC32.digest();

        for block in 0..block_count {
            let (read, retried) = self.read_block_with_retries(block)?;
            if !read.checksum_ok {
                report.checksum_mismatches += 1;
            }
            if retried {
                report.retried_blocks += 1;
            }
            output.write_all(&read.data)?;
            digest.update(&read.data);
            report.blocks += 1;
            on_progress(&SpiProgress {
                block: report.blocks,
                total: u32::from(block_count),
            });
            thread::sleep(self.config.block_delay);
        }
        output.flush()?;

        report.crc32 = digest.finalize();
        info!(
            "Backup complete: {} blocks, {} accepted with bad checksum, CRC-32 {:#010X}",
            report.blocks, report.checksum_mismatches, report.crc32
        );
        Ok(report)
    }

    /// Writes `block_count` blocks from `input`, which must be exactly `len` bytes long.
    ///
    /// The size check happens before anything is sent. A short final read is padded with `0xFF`.
    /// The first rejected block aborts the restore.
    pub fn restore<R, F>(
        &mut self,
        mut input: R,
        len: u64,
        block_count: u16,
        mut on_progress: F,
    ) -> Result<RestoreReport>
    where
        R: Read,
        F: FnMut(&SpiProgress),
    {
        let expected = u64::from(block_count) * BLOCK_SIZE as u64;
        if len != expected {
            return Err(Error::FileSizeMismatch {
                expected,
                actual: len,
            });
        }

        info!("Restoring {} blocks", block_count);
        let mut report = RestoreReport::default();
        let mut digest = CRC32.digest();

        for block in 0..block_count {
            let mut buffer = [0xFFu8; BLOCK_SIZE];
            let count = read_up_to(&mut input, &mut buffer)?;
            if count < BLOCK_SIZE {
                debug!("Block {}: short read of {} bytes, padding", block, count);
            }
            digest.update(&buffer);
            self.write_block(block, &buffer)?;
            report.blocks += 1;
            on_progress(&SpiProgress {
                block: report.blocks,
                total: u32::from(block_count),
            });
            thread::sleep(self.config.block_delay);
        }

        report.crc32 = digest.finalize();
        info!(
            "Restore complete: {} blocks, CRC-32 {:#010X}",
            report.blocks, report.crc32
        );
        Ok(report)
    }

    /// Backs the flash up into a new file at `path`.
    pub fn backup_to_file<F>(
        &mut self,
        path: &Path,
        block_count: u16,
        on_progress: F,
    ) -> Result<BackupReport>
    where
        F: FnMut(&SpiProgress),
    {
        let file = File::create(path)?;
        self.backup(BufWriter::new(file), block_count, on_progress)
    }

    /// Restores the flash from the file at `path`.
    pub fn restore_from_file<F>(
        &mut self,
        path: &Path,
        block_count: u16,
        on_progress: F,
    ) -> Result<RestoreReport>
    where
        F: FnMut(&SpiProgress),
    {
        let file = File::open(path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => Error::FileNotFound(path.to_path_buf()),
            _ => Error::Io(err),
        })?;
        let len = file.metadata()?.len();
        self.restore(BufReader::new(file), len, block_count, on_progress)
    }
}

/// Reads until `buffer` is full or the input ends.
fn read_up_to<R: Read>(input: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match input.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(count) => filled += count,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_up_to_stops_at_end() {
        let mut input: &[u8] = &[1, 2, 3];
        let mut buffer = [0xFF; 8];
        assert_eq!(read_up_to(&mut input, &mut buffer).unwrap(), 3);
        assert_eq!(&buffer[..4], &[1, 2, 3, 0xFF]);
    }

    #[test]
    fn defaults() {
        let config = SpiConfig::default();
        assert_eq!(config.read_timeout, Duration::from_secs(3));
        assert_eq!(config.write_timeout, Duration::from_secs(5));
        assert_eq!(config.read_attempts, 3);
    }
}

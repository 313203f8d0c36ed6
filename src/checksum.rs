// SPDX-FileCopyrightText: 2024 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! Additive packet checksum used by the radio bootloader.

/// Single-byte additive checksum with a device-specific offset.
///
/// A sealed packet of `n` bytes carries `sum(packet[0..n-1]) + offset` (mod 256) in its last
/// byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Checksum {
    offset: u8,
}

impl Checksum {
    /// Plain sum, no offset.
    pub const PLAIN: Checksum = Checksum::with_offset(0);

    pub const fn with_offset(offset: u8) -> Self {
        Self { offset }
    }

    pub fn offset(&self) -> u8 {
        self.offset
    }

    /// Wrapping sum of `bytes` plus the offset.
    pub fn sum(&self, bytes: &[u8]) -> u8 {
        bytes
            .iter()
            .fold(self.offset, |acc, byte| acc.wrapping_add(*byte))
    }

    /// Writes the checksum of everything but the last byte into the last byte.
    ///
    /// Empty packets are left alone.
    pub fn seal(&self, packet: &mut [u8]) {
        if let Some((last, body)) = packet.split_last_mut() {
            *last = self.sum(body);
        }
    }

    /// Checks the trailing checksum byte of `packet`.
    pub fn verify(&self, packet: &[u8]) -> bool {
        match packet.split_last() {
            Some((last, body)) => self.sum(body) == *last,
            None => false,
        }
    }

    /// Returns `(expected, actual)` for the trailing checksum byte of a non-empty packet.
    pub fn compare(&self, packet: &[u8]) -> Option<(u8, u8)> {
        packet
            .split_last()
            .map(|(last, body)| (self.sum(body), *last))
    }
}

impl Default for Checksum {
    fn default() -> Self {
        Self::PLAIN
    }
}

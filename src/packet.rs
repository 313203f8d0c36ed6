// SPDX-FileCopyrightText: 2024 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! Wire packet layouts.
//!
//! A block write (firmware data packet or SPI write command) consists of:
//!  - 1 byte command, `0x57`
//!  - 2 bytes block number or offset (big endian)
//!  - 1024 bytes payload
//!  - 1 byte checksum
//!
//! An SPI read command is the same without the payload, and the radio answers it with a packet
//! shaped like a block write whose command byte is `0x52`.

use byteorder::{BigEndian, ByteOrder};

use crate::checksum::Checksum;
use crate::variant::{BLOCK_SIZE, CMD_READ, CMD_WRITE};

/// Length of a block write or an SPI read response.
pub const BLOCK_PACKET_LEN: usize = BLOCK_SIZE + 4;
/// Length of an SPI read command.
pub const READ_COMMAND_LEN: usize = 4;

/// Builds a block write packet. Payloads shorter than a block are padded with `0xFF`, longer
/// ones are cut.
pub fn block_write(number: u16, payload: &[u8], checksum: Checksum) -> Vec<u8> {
    let mut packet = vec![0xFF; BLOCK_PACKET_LEN];
    packet[0] = CMD_WRITE;
    BigEndian::write_u16(&mut packet[1..3], number);
    let count = payload.len().min(BLOCK_SIZE);
    packet[3..3 + count].copy_from_slice(&payload[..count]);
    checksum.seal(&mut packet);
    packet
}

/// Builds an SPI block read command.
pub fn block_read(number: u16, checksum: Checksum) -> [u8; READ_COMMAND_LEN] {
    let mut packet = [CMD_READ, 0, 0, 0];
    BigEndian::write_u16(&mut packet[1..3], number);
    checksum.seal(&mut packet);
    packet
}

/// The block number or offset carried by a block packet.
pub fn number(packet: &[u8]) -> Option<u16> {
    packet.get(1..3).map(BigEndian::read_u16)
}

/// The payload of a block packet.
pub fn payload(packet: &[u8]) -> &[u8] {
    packet.get(3..3 + BLOCK_SIZE).unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_layout() {
        let payload: Vec<u8> = (0..BLOCK_SIZE).map(|i| i as u8).collect();
        let checksum = Checksum::with_offset(82);
        let packet = block_write(0x1234, &payload, checksum);
        assert_eq!(packet.len(), 1028);
        assert_eq!(&packet[..3], &[0x57, 0x12, 0x34]);
        assert_eq!(number(&packet), Some(0x1234));
        assert_eq!(super::payload(&packet), payload.as_slice());
        assert!(checksum.verify(&packet));
    }

    #[test]
    fn flipping_a_payload_byte_breaks_the_checksum() {
        let checksum = Checksum::PLAIN;
        let mut packet = block_write(7, &[0xAA; BLOCK_SIZE], checksum);
        packet[500] ^= 0x01;
        assert!(!checksum.verify(&packet));
    }

    #[test]
    fn short_payload_is_padded() {
        let packet = block_write(0, &[1, 2, 3], Checksum::PLAIN);
        assert_eq!(&packet[3..6], &[1, 2, 3]);
        assert!(packet[6..1027].iter().all(|byte| *byte == 0xFF));
    }

    #[test]
    fn read_command_layout() {
        assert_eq!(block_read(0x0102, Checksum::PLAIN), [0x52, 0x01, 0x02, 0x55]);
        assert_eq!(
            block_read(0x0102, Checksum::with_offset(82)),
            [0x52, 0x01, 0x02, 0x55 + 82]
        );
    }
}

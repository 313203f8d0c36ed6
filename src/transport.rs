// SPDX-FileCopyrightText: 2024 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! Serial port access.

use std::io::{Read, Write};
use std::time::Duration;

use log::{debug, info};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::error::{Error, Result};

/// The bootloader always talks at 115200-8-N-1.
pub const BAUD_RATE: u32 = 115_200;

/// Read timeout of the underlying port. Longer deadlines are built by looping over short reads so
/// that timeouts and shutdown are noticed promptly.
pub const READ_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// A byte stream to the radio.
///
/// Dropping the transport closes it.
pub trait Transport: Read + Write + Send {
    /// Returns a second handle on the same stream for a background reader.
    fn try_clone_reader(&self) -> Result<Box<dyn Read + Send>>;

    /// Throws away any bytes received but not yet read.
    fn discard_input(&mut self) -> Result<()>;
}

impl Transport for Box<dyn SerialPort> {
    fn try_clone_reader(&self) -> Result<Box<dyn Read + Send>> {
        let clone = self.try_clone()?;
        Ok(Box::new(clone))
    }

    fn discard_input(&mut self) -> Result<()> {
        self.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

/// Opens `port` at `baud` with 8 data bits, no parity and one stop bit.
pub fn open(port: &str, baud: u32) -> Result<Box<dyn SerialPort>> {
    info!("Opening serial port {} at {} baud", port, baud);
    let serial = serialport::new(port, baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(READ_POLL_TIMEOUT)
        .open()?;
    Ok(serial)
}

/// Names of the serial ports present on this system, sorted.
pub fn available_ports() -> Result<Vec<String>> {
    let mut ports: Vec<String> = serialport::available_ports()?
        .into_iter()
        .map(|port| port.port_name)
        .collect();
    ports.sort();
    debug!("Available ports: {:?}", ports);
    Ok(ports)
}

/// Fails with [Error::PortNotFound] unless `port` is listed by the system.
pub fn ensure_present(port: &str) -> Result<()> {
    if available_ports()?.iter().any(|name| name == port) {
        Ok(())
    } else {
        Err(Error::PortNotFound(port.to_string()))
    }
}

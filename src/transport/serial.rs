//! Serial-attached bus bridge.
//!
//! The bit-banged two-wire master lives in a small adapter firmware; this
//! transport drives it over a serial port, one bus step per two-byte
//! request frame:
//!
//! ```text
//! 'S' (addr << 1) | rw   -> status    start condition
//! 'W' value              -> status    write one byte
//! 'R' expect_more        -> data      read one byte
//! 'P' 0x00               -> status    stop condition
//! ```
//!
//! where status is 0x00 for ack, 0x01 for nack. The bridge answers every
//! frame with exactly one byte, so the link stays in lockstep.
use std::{io::Read, io::Write, time::Duration};

use anyhow::{Error, Result};
use serialport::SerialPort;

use super::{BusResult, Direction, Transport};

const SERIAL_TIMEOUT_MS: u64 = 1000;

const OP_START: u8 = b'S';
const OP_WRITE: u8 = b'W';
const OP_READ: u8 = b'R';
const OP_STOP: u8 = b'P';

const STATUS_ACK: u8 = 0x00;

pub struct SerialTransport {
    serial_port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    pub fn open(port: &str) -> Result<Self> {
        log::info!("Opening bridge port: \"{}\" @ 115200 baud", port);
        let port = serialport::new(port, 115200)
            .timeout(Duration::from_millis(SERIAL_TIMEOUT_MS))
            .open()?;
        Ok(SerialTransport { serial_port: port })
    }

    pub fn open_nth(nth: usize) -> Result<Self> {
        let ports = serialport::available_ports()?;

        match ports.get(nth) {
            Some(port) => Self::open(&port.port_name),
            None => Err(Error::msg("No serial ports found!")),
        }
    }

    pub fn open_any() -> Result<Self> {
        Self::open_nth(0)
    }

    /// Send one request frame and collect the single response byte.
    fn request(&mut self, op: u8, arg: u8) -> std::io::Result<u8> {
        self.serial_port.write_all(&[op, arg])?;
        self.serial_port.flush()?;

        let mut resp = [0u8; 1];
        self.serial_port.read_exact(&mut resp)?;
        Ok(resp[0])
    }

    /// Hard link failures are not distinguishable from a dead target at
    /// the protocol layer, so they fold into `Timeout`.
    fn status_request(&mut self, op: u8, arg: u8) -> BusResult {
        match self.request(op, arg) {
            Ok(STATUS_ACK) => BusResult::Ack,
            Ok(_) => BusResult::Nack,
            Err(e) => {
                log::warn!("bridge link error: {}", e);
                BusResult::Timeout
            }
        }
    }
}

impl Transport for SerialTransport {
    fn start(&mut self, address: u8, direction: Direction) -> BusResult {
        self.status_request(OP_START, (address << 1) | direction.bit())
    }

    fn write_byte(&mut self, value: u8) -> BusResult {
        self.status_request(OP_WRITE, value)
    }

    fn read_byte(&mut self, expect_more: bool) -> u8 {
        match self.request(OP_READ, expect_more as u8) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("bridge link error during read: {}", e);
                0xff
            }
        }
    }

    fn stop(&mut self) {
        // Status of the stop frame carries no information, but the
        // response byte must still be drained to keep lockstep.
        let _ = self.status_request(OP_STOP, 0x00);
    }
}

//! Abstract two-wire bus transport interface.

pub use self::serial::SerialTransport;

mod serial;

/// Outcome of one addressed bus step.
///
/// Bridge-level I/O failures are folded into [`BusResult::Timeout`];
/// the protocol layer treats them the same as a no-acknowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BusResult {
    Ack,
    Nack,
    Timeout,
}

impl BusResult {
    pub fn is_ack(self) -> bool {
        self == BusResult::Ack
    }
}

/// Read/write bit accompanying a start condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    Write,
    Read,
}

impl Direction {
    /// Wire encoding: `(address << 1) | bit`, 0 for write, 1 for read.
    pub fn bit(self) -> u8 {
        match self {
            Direction::Write => 0,
            Direction::Read => 1,
        }
    }
}

/// Abstraction of the two-wire bus master.
/// Might be a serial-attached bridge, a hardware peripheral, or a fake.
///
/// One logical transaction is a start condition, zero or more byte
/// transfers, and exactly one stop condition. Callers issue the stop on
/// every exit path, including after a nack.
pub trait Transport {
    /// Issue a start condition addressed to `address` with `direction`.
    fn start(&mut self, address: u8, direction: Direction) -> BusResult;

    /// Transfer one byte to the addressed device.
    fn write_byte(&mut self, value: u8) -> BusResult;

    /// Read one byte from the addressed device. `expect_more` selects
    /// the continue-acknowledge; pass `false` before the final byte of
    /// a read transaction.
    fn read_byte(&mut self, expect_more: bool) -> u8;

    /// Issue a stop condition, releasing the bus.
    fn stop(&mut self);

    /// Give the host's background loop a chance to run. Invoked between
    /// consecutive byte transactions of long block reads.
    fn pump(&mut self) {
        std::thread::yield_now();
    }
}

//! The reverse-engineered OnBright programming protocol.
//!
//! Every transaction sequence below is transcribed from bus traces of the
//! vendor's official programmer. Several quirks are load bearing: config
//! writes go out twice, payload writes are addressed to the data channel
//! that otherwise serves reads, and the handshake checks only the reset
//! acknowledge. Do not clean these up without re-verifying against real
//! hardware traces.

use thiserror::Error;

use crate::constants::{
    CHIP_TYPE_OFFSET, COMMAND_ADDRESS, CONFIG_SPACE_SIZE, DATA_ADDRESS, FLASH_SIZE, HANDSHAKE01,
    HANDSHAKE02, MAX_HANDSHAKE_RETRIES, RESET_CHIP, commands,
};
use crate::transport::{BusResult, Direction, Transport};

/// Failure taxonomy of the protocol engine.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// A byte of the command phase was not acknowledged.
    #[error("no acknowledge during command phase")]
    CommandNack,
    /// The data-channel start or payload byte was not acknowledged.
    #[error("no acknowledge during data phase")]
    DataNack,
    /// The chip never acknowledged the reset pseudo-address.
    #[error("handshake retries exhausted")]
    HandshakeExhausted,
    /// A block operation would run past the end of the address space.
    #[error("range {start:#06x}+{len} exceeds the {bound}-byte address space")]
    AddressOutOfRange {
        start: usize,
        len: usize,
        bound: usize,
    },
}

/// Transaction phase a nack is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Command,
    Data,
}

/// Latches the first nack across the steps of one primitive.
///
/// A nack never aborts the sequence: the remaining steps, and above all
/// the stop condition, still go out so the bus is left in a clean state.
#[derive(Debug, Default)]
struct StepStatus {
    first_failure: Option<Phase>,
}

impl StepStatus {
    fn record(&mut self, phase: Phase, result: BusResult) {
        if !result.is_ack() && self.first_failure.is_none() {
            self.first_failure = Some(phase);
        }
    }

    fn finish(self) -> Result<(), ProtocolError> {
        match self.first_failure {
            None => Ok(()),
            Some(Phase::Command) => Err(ProtocolError::CommandNack),
            Some(Phase::Data) => Err(ProtocolError::DataNack),
        }
    }
}

/// The protocol engine. Owns its bus transport for the duration of a
/// programming session; primitives never interleave transactions.
pub struct Programmer<T: Transport> {
    transport: T,
}

impl<T: Transport> Programmer<T> {
    pub fn new(transport: T) -> Self {
        Programmer { transport }
    }

    /// Establish the vendor handshake.
    ///
    /// One ignored probe transaction to the data channel, then up to
    /// [`MAX_HANDSHAKE_RETRIES`] start attempts on the reset
    /// pseudo-address. The chip only starts acknowledging once its
    /// power-on/watchdog condition is satisfied, hence the retry loop.
    /// The first acknowledged reset is the sole success signal: the two
    /// greet steps and the trailing read request are sent unchecked.
    pub fn handshake(&mut self) -> Result<(), ProtocolError> {
        // The chip does not respond meaningfully to this probe, but the
        // official programmer always sends it first.
        let _ = self.transport.start(DATA_ADDRESS, Direction::Write);
        self.transport.stop();

        for attempt in 1..=MAX_HANDSHAKE_RETRIES {
            let result = self.transport.start(RESET_CHIP, Direction::Write);
            self.transport.stop();

            if result.is_ack() {
                log::debug!("reset acknowledged on attempt {}", attempt);

                let _ = self.transport.start(HANDSHAKE01, Direction::Write);
                self.transport.stop();

                let _ = self.transport.start(HANDSHAKE02, Direction::Write);
                self.transport.stop();

                // Read request with no actual read, as traced.
                let _ = self.transport.start(COMMAND_ADDRESS, Direction::Read);
                self.transport.stop();

                return Ok(());
            }
        }

        log::warn!(
            "no reset acknowledge after {} attempts",
            MAX_HANDSHAKE_RETRIES
        );
        Err(ProtocolError::HandshakeExhausted)
    }

    /// Erase the entire chip. Command phase only, no data phase.
    pub fn erase_chip(&mut self) -> Result<(), ProtocolError> {
        let mut status = StepStatus::default();
        self.command_phase(&mut status, commands::ERASE_CHIP, &[]);
        status.finish()
    }

    /// Read one configuration/fuse byte.
    pub fn read_config_byte(&mut self, address: u8) -> Result<u8, ProtocolError> {
        let mut status = StepStatus::default();
        self.command_phase(&mut status, commands::READ_CONFIG, &[address]);
        let value = self.data_read_phase(&mut status);
        status.finish()?;
        Ok(value)
    }

    /// Write one configuration/fuse byte.
    ///
    /// The full two-phase sequence is sent TWICE in immediate
    /// succession. The official programmer's traces show the duplicate,
    /// and omitting it causes silent write failures on hardware.
    pub fn write_config_byte(&mut self, address: u8, value: u8) -> Result<(), ProtocolError> {
        let mut status = StepStatus::default();
        for _ in 0..2 {
            self.command_phase(&mut status, commands::WRITE_CONFIG, &[address]);
            self.data_write_phase(&mut status, value);
        }
        status.finish()
    }

    /// Read one flash byte. The 16-bit address goes out big-endian.
    pub fn read_flash_byte(&mut self, address: u16) -> Result<u8, ProtocolError> {
        let [high, low] = address.to_be_bytes();
        let mut status = StepStatus::default();
        self.command_phase(&mut status, commands::READ_FLASH, &[high, low]);
        let value = self.data_read_phase(&mut status);
        status.finish()?;
        Ok(value)
    }

    /// Write one flash byte. Unlike config bytes, the sequence goes out
    /// once only; the asymmetry is part of the traced protocol.
    pub fn write_flash_byte(&mut self, address: u16, value: u8) -> Result<(), ProtocolError> {
        let [high, low] = address.to_be_bytes();
        let mut status = StepStatus::default();
        self.command_phase(&mut status, commands::WRITE_FLASH, &[high, low]);
        self.data_write_phase(&mut status, value);
        status.finish()
    }

    /// Read the chip type byte at config offset 0. The OBS38S003 family
    /// reports 0x0A; checking the value is left to the caller.
    pub fn read_chip_type(&mut self) -> Result<u8, ProtocolError> {
        self.read_config_byte(CHIP_TYPE_OFFSET)
    }

    /// Restart the target. Fire and forget: the protocol provides no
    /// acknowledge for this request, so there is no status to report.
    pub fn reset_mcu(&mut self) {
        let _ = self.transport.start(RESET_CHIP, Direction::Read);
        self.transport.stop();
    }

    /// Read `buf.len()` flash bytes starting at `start`, one byte per
    /// transaction pair, yielding to the host between bytes.
    ///
    /// The first failing byte's error is latched and returned after the
    /// sweep completes. (The traced implementation reported only the
    /// final byte's status; the latch is a deliberate hardening.)
    pub fn read_flash_block(&mut self, start: u16, buf: &mut [u8]) -> Result<(), ProtocolError> {
        check_range(start as usize, buf.len(), FLASH_SIZE)?;

        let mut first_failure = None;
        for (offset, slot) in buf.iter_mut().enumerate() {
            match self.read_flash_byte(start + offset as u16) {
                Ok(value) => *slot = value,
                Err(e) => {
                    first_failure.get_or_insert(e);
                }
            }
            // An 8 KiB sweep is thousands of transactions; let the
            // host's background loop breathe between bytes.
            self.transport.pump();
        }

        first_failure.map_or(Ok(()), Err)
    }

    /// Write `data` to flash starting at `start`. Same aggregation as
    /// [`Self::read_flash_block`].
    pub fn write_flash_block(&mut self, start: u16, data: &[u8]) -> Result<(), ProtocolError> {
        check_range(start as usize, data.len(), FLASH_SIZE)?;

        let mut first_failure = None;
        for (offset, &value) in data.iter().enumerate() {
            if let Err(e) = self.write_flash_byte(start + offset as u16, value) {
                first_failure.get_or_insert(e);
            }
        }

        first_failure.map_or(Ok(()), Err)
    }

    /// Read a range of configuration bytes.
    pub fn read_config_block(&mut self, start: u8, buf: &mut [u8]) -> Result<(), ProtocolError> {
        check_range(start as usize, buf.len(), CONFIG_SPACE_SIZE)?;

        let mut first_failure = None;
        for (offset, slot) in buf.iter_mut().enumerate() {
            match self.read_config_byte(start + offset as u8) {
                Ok(value) => *slot = value,
                Err(e) => {
                    first_failure.get_or_insert(e);
                }
            }
            self.transport.pump();
        }

        first_failure.map_or(Ok(()), Err)
    }

    /// Write a range of configuration bytes.
    pub fn write_config_block(&mut self, start: u8, data: &[u8]) -> Result<(), ProtocolError> {
        check_range(start as usize, data.len(), CONFIG_SPACE_SIZE)?;

        let mut first_failure = None;
        for (offset, &value) in data.iter().enumerate() {
            if let Err(e) = self.write_config_byte(start + offset as u8, value) {
                first_failure.get_or_insert(e);
            }
        }

        first_failure.map_or(Ok(()), Err)
    }

    /// Command phase: the command byte plus its address bytes, sent on
    /// the command channel as one write transaction.
    fn command_phase(&mut self, status: &mut StepStatus, command: u8, address: &[u8]) {
        status.record(
            Phase::Command,
            self.transport.start(COMMAND_ADDRESS, Direction::Write),
        );
        status.record(Phase::Command, self.transport.write_byte(command));
        for &byte in address {
            status.record(Phase::Command, self.transport.write_byte(byte));
        }
        self.transport.stop();
    }

    /// Data phase of a write: the payload byte is sent under the data
    /// channel address with the WRITE direction bit, exactly as the
    /// official programmer does despite that channel's read role.
    fn data_write_phase(&mut self, status: &mut StepStatus, value: u8) {
        status.record(
            Phase::Data,
            self.transport.start(DATA_ADDRESS, Direction::Write),
        );
        status.record(Phase::Data, self.transport.write_byte(value));
        self.transport.stop();
    }

    /// Data phase of a read: exactly one byte, flagged as the final one.
    fn data_read_phase(&mut self, status: &mut StepStatus) -> u8 {
        status.record(
            Phase::Data,
            self.transport.start(DATA_ADDRESS, Direction::Read),
        );
        let value = self.transport.read_byte(false);
        self.transport.stop();
        value
    }
}

/// Fail fast before any bus traffic when a range overruns the space.
fn check_range(start: usize, len: usize, bound: usize) -> Result<(), ProtocolError> {
    if start + len > bound {
        return Err(ProtocolError::AddressOutOfRange { start, len, bound });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::constants::CHIP_TYPE_OBS38S003;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum BusOp {
        Start(u8, Direction),
        Write(u8),
        Read(bool),
        Stop,
        Pump,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Mode {
        Idle,
        Command,
        DataWrite,
        DataRead,
    }

    impl Default for Mode {
        fn default() -> Self {
            Mode::Idle
        }
    }

    /// Scripted two-wire target. Records every bus op, interprets
    /// command frames enough to echo flash/config writes back on reads,
    /// and nacks whatever it is told to.
    #[derive(Default)]
    struct MockBus {
        ops: Vec<BusOp>,
        /// 1-based reset attempt on which the chip starts acknowledging.
        reset_ack_on: Option<u32>,
        reset_attempts: u32,
        /// Starts to answer with a nack, by address and direction.
        nack_starts: Vec<(u8, Direction)>,
        /// Flash addresses whose data-phase read start is nacked.
        nack_flash_reads: Vec<u16>,
        flash: HashMap<u16, u8>,
        config: HashMap<u8, u8>,
        /// Flash addresses served to read requests, in order.
        flash_reads: Vec<u16>,
        mode: Mode,
        frame: Vec<u8>,
        pending: Vec<u8>,
    }

    impl MockBus {
        fn pending_flash_address(&self) -> Option<u16> {
            match self.pending.as_slice() {
                [commands::READ_FLASH, high, low] => Some(u16::from_be_bytes([*high, *low])),
                _ => None,
            }
        }

        fn apply_data_write(&mut self, value: u8) {
            match self.pending.as_slice() {
                [commands::WRITE_CONFIG, address] => {
                    self.config.insert(*address, value);
                }
                [commands::WRITE_FLASH, high, low] => {
                    self.flash.insert(u16::from_be_bytes([*high, *low]), value);
                }
                _ => {}
            }
        }

        fn serve_read(&mut self) -> u8 {
            match self.pending.clone().as_slice() {
                [commands::READ_CONFIG, address] => {
                    self.config.get(address).copied().unwrap_or(0xff)
                }
                [commands::READ_FLASH, ..] => {
                    let address = self.pending_flash_address().unwrap();
                    self.flash_reads.push(address);
                    self.flash.get(&address).copied().unwrap_or(0xff)
                }
                _ => 0xff,
            }
        }

        fn count(&self, op: BusOp) -> usize {
            self.ops.iter().filter(|&&o| o == op).count()
        }

        fn starts(&self) -> usize {
            self.ops
                .iter()
                .filter(|o| matches!(o, BusOp::Start(..)))
                .count()
        }
    }

    impl Transport for MockBus {
        fn start(&mut self, address: u8, direction: Direction) -> BusResult {
            self.ops.push(BusOp::Start(address, direction));

            self.mode = match (address, direction) {
                (COMMAND_ADDRESS, Direction::Write) => {
                    self.frame.clear();
                    Mode::Command
                }
                (DATA_ADDRESS, Direction::Write) => Mode::DataWrite,
                (DATA_ADDRESS, Direction::Read) => Mode::DataRead,
                _ => Mode::Idle,
            };

            if address == RESET_CHIP && direction == Direction::Write {
                self.reset_attempts += 1;
                return if self.reset_ack_on == Some(self.reset_attempts) {
                    BusResult::Ack
                } else {
                    BusResult::Nack
                };
            }

            if self.mode == Mode::DataRead {
                if let Some(flash_address) = self.pending_flash_address() {
                    if self.nack_flash_reads.contains(&flash_address) {
                        return BusResult::Nack;
                    }
                }
            }

            if self.nack_starts.contains(&(address, direction)) {
                BusResult::Nack
            } else {
                BusResult::Ack
            }
        }

        fn write_byte(&mut self, value: u8) -> BusResult {
            self.ops.push(BusOp::Write(value));
            match self.mode {
                Mode::Command => self.frame.push(value),
                Mode::DataWrite => self.apply_data_write(value),
                _ => {}
            }
            BusResult::Ack
        }

        fn read_byte(&mut self, expect_more: bool) -> u8 {
            self.ops.push(BusOp::Read(expect_more));
            if self.mode == Mode::DataRead {
                self.serve_read()
            } else {
                0xff
            }
        }

        fn stop(&mut self) {
            self.ops.push(BusOp::Stop);
            if self.mode == Mode::Command {
                self.pending = std::mem::take(&mut self.frame);
            }
            self.mode = Mode::Idle;
        }

        fn pump(&mut self) {
            self.ops.push(BusOp::Pump);
        }
    }

    fn programmer(bus: MockBus) -> Programmer<MockBus> {
        Programmer::new(bus)
    }

    #[test]
    fn handshake_succeeds_on_first_attempt() {
        let mut p = programmer(MockBus {
            reset_ack_on: Some(1),
            ..Default::default()
        });
        assert_eq!(p.handshake(), Ok(()));

        use BusOp::*;
        assert_eq!(
            p.transport.ops,
            vec![
                Start(DATA_ADDRESS, Direction::Write),
                Stop,
                Start(RESET_CHIP, Direction::Write),
                Stop,
                Start(HANDSHAKE01, Direction::Write),
                Stop,
                Start(HANDSHAKE02, Direction::Write),
                Stop,
                Start(COMMAND_ADDRESS, Direction::Read),
                Stop,
            ]
        );
    }

    #[test]
    fn handshake_retries_until_reset_ack() {
        let mut p = programmer(MockBus {
            reset_ack_on: Some(7),
            ..Default::default()
        });
        assert_eq!(p.handshake(), Ok(()));
        assert_eq!(
            p.transport
                .count(BusOp::Start(RESET_CHIP, Direction::Write)),
            7
        );

        // Greet steps follow the acknowledged reset immediately.
        use BusOp::*;
        let tail = &p.transport.ops[p.transport.ops.len() - 6..];
        assert_eq!(
            tail,
            &[
                Start(HANDSHAKE01, Direction::Write),
                Stop,
                Start(HANDSHAKE02, Direction::Write),
                Stop,
                Start(COMMAND_ADDRESS, Direction::Read),
                Stop,
            ]
        );
    }

    #[test]
    fn handshake_exhausts_after_ten_attempts() {
        let mut p = programmer(MockBus::default());
        assert_eq!(p.handshake(), Err(ProtocolError::HandshakeExhausted));
        assert_eq!(
            p.transport
                .count(BusOp::Start(RESET_CHIP, Direction::Write)),
            10
        );
    }

    #[test]
    fn erase_chip_is_a_single_command_transaction() {
        let mut p = programmer(MockBus::default());
        assert_eq!(p.erase_chip(), Ok(()));

        use BusOp::*;
        assert_eq!(
            p.transport.ops,
            vec![
                Start(COMMAND_ADDRESS, Direction::Write),
                Write(commands::ERASE_CHIP),
                Stop,
            ]
        );
    }

    fn write_config_sequence(address: u8, value: u8) -> Vec<BusOp> {
        use BusOp::*;
        vec![
            Start(COMMAND_ADDRESS, Direction::Write),
            Write(commands::WRITE_CONFIG),
            Write(address),
            Stop,
            Start(DATA_ADDRESS, Direction::Write),
            Write(value),
            Stop,
        ]
    }

    #[test]
    fn write_config_byte_sends_the_sequence_twice() {
        let mut p = programmer(MockBus::default());
        assert_eq!(p.write_config_byte(0x12, 249), Ok(()));

        let expected: Vec<_> = write_config_sequence(0x12, 249)
            .into_iter()
            .chain(write_config_sequence(0x12, 249))
            .collect();
        assert_eq!(p.transport.ops, expected);
    }

    #[test]
    fn write_config_byte_sends_both_sequences_even_when_nacked() {
        let mut p = programmer(MockBus {
            nack_starts: vec![
                (COMMAND_ADDRESS, Direction::Write),
                (DATA_ADDRESS, Direction::Write),
            ],
            ..Default::default()
        });
        assert_eq!(
            p.write_config_byte(0x12, 249),
            Err(ProtocolError::CommandNack)
        );

        let expected: Vec<_> = write_config_sequence(0x12, 249)
            .into_iter()
            .chain(write_config_sequence(0x12, 249))
            .collect();
        assert_eq!(p.transport.ops, expected);
    }

    #[test]
    fn write_flash_byte_sends_the_sequence_once() {
        let mut p = programmer(MockBus::default());
        assert_eq!(p.write_flash_byte(0x0100, 0x42), Ok(()));

        use BusOp::*;
        assert_eq!(
            p.transport.ops,
            vec![
                Start(COMMAND_ADDRESS, Direction::Write),
                Write(commands::WRITE_FLASH),
                Write(0x01),
                Write(0x00),
                Stop,
                Start(DATA_ADDRESS, Direction::Write),
                Write(0x42),
                Stop,
            ]
        );
    }

    #[test]
    fn flash_byte_round_trip() {
        let mut p = programmer(MockBus::default());
        assert_eq!(p.write_flash_byte(0x0100, 0x42), Ok(()));
        assert_eq!(p.read_flash_byte(0x0100), Ok(0x42));
    }

    #[test]
    fn config_byte_round_trip() {
        let mut p = programmer(MockBus::default());
        assert_eq!(p.write_config_byte(0x18, 0xf9), Ok(()));
        assert_eq!(p.read_config_byte(0x18), Ok(0xf9));
    }

    #[test]
    fn read_chip_type_reads_config_offset_zero() {
        let mut bus = MockBus::default();
        bus.config.insert(CHIP_TYPE_OFFSET, CHIP_TYPE_OBS38S003);
        let mut p = programmer(bus);
        assert_eq!(p.read_chip_type(), Ok(CHIP_TYPE_OBS38S003));
    }

    #[test]
    fn read_config_byte_fails_on_data_phase_nack_but_still_stops() {
        let mut p = programmer(MockBus {
            nack_starts: vec![(DATA_ADDRESS, Direction::Read)],
            ..Default::default()
        });
        assert_eq!(p.read_config_byte(0x00), Err(ProtocolError::DataNack));

        // Both transactions ran to completion, stop included.
        assert_eq!(p.transport.starts(), 2);
        assert_eq!(p.transport.count(BusOp::Stop), 2);
    }

    #[test]
    fn read_config_byte_attributes_command_phase_nack() {
        let mut p = programmer(MockBus {
            nack_starts: vec![(COMMAND_ADDRESS, Direction::Write)],
            ..Default::default()
        });
        assert_eq!(p.read_config_byte(0x00), Err(ProtocolError::CommandNack));
    }

    #[test]
    fn reset_mcu_is_fire_and_forget() {
        let mut p = programmer(MockBus {
            nack_starts: vec![(RESET_CHIP, Direction::Read)],
            ..Default::default()
        });
        p.reset_mcu();

        use BusOp::*;
        assert_eq!(
            p.transport.ops,
            vec![Start(RESET_CHIP, Direction::Read), Stop]
        );
    }

    #[test]
    fn read_flash_block_sweeps_ascending_and_pumps_between_bytes() {
        let mut bus = MockBus::default();
        for address in 0u16..512 {
            bus.flash.insert(address, address as u8);
        }
        let mut p = programmer(bus);

        let mut buf = [0u8; 512];
        assert_eq!(p.read_flash_block(0, &mut buf), Ok(()));

        for (offset, &value) in buf.iter().enumerate() {
            assert_eq!(value, offset as u8);
        }
        let expected: Vec<u16> = (0..512).collect();
        assert_eq!(p.transport.flash_reads, expected);

        // Every byte is read with the final-read signal and followed by
        // a cooperative yield.
        assert_eq!(p.transport.count(BusOp::Read(false)), 512);
        assert_eq!(p.transport.count(BusOp::Pump), 512);
    }

    #[test]
    fn read_flash_block_latches_first_failure() {
        let mut bus = MockBus::default();
        for address in 0u16..8 {
            bus.flash.insert(address, 0x55);
        }
        bus.nack_flash_reads = vec![3];
        let mut p = programmer(bus);

        let mut buf = [0u8; 8];
        assert_eq!(p.read_flash_block(0, &mut buf), Err(ProtocolError::DataNack));

        // The sweep still covered the whole range.
        assert_eq!(p.transport.count(BusOp::Read(false)), 8);
        assert_eq!(buf[7], 0x55);
    }

    #[test]
    fn flash_block_round_trip() {
        let mut p = programmer(MockBus::default());
        let image: Vec<u8> = (0..64).map(|i| i as u8 ^ 0xa5).collect();
        assert_eq!(p.write_flash_block(0x0200, &image), Ok(()));

        let mut buf = [0u8; 64];
        assert_eq!(p.read_flash_block(0x0200, &mut buf), Ok(()));
        assert_eq!(&buf[..], &image[..]);
    }

    #[test]
    fn config_block_round_trip() {
        let mut p = programmer(MockBus::default());
        assert_eq!(p.write_config_block(0x11, &[1, 2, 3]), Ok(()));

        let mut buf = [0u8; 3];
        assert_eq!(p.read_config_block(0x11, &mut buf), Ok(()));
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn flash_block_rejects_out_of_range_before_bus_traffic() {
        let mut p = programmer(MockBus::default());
        let mut buf = [0u8; 512];
        assert_eq!(
            p.read_flash_block(0x1f00, &mut buf),
            Err(ProtocolError::AddressOutOfRange {
                start: 0x1f00,
                len: 512,
                bound: FLASH_SIZE,
            })
        );
        assert!(p.transport.ops.is_empty());
    }

    #[test]
    fn config_block_rejects_out_of_range_before_bus_traffic() {
        let mut p = programmer(MockBus::default());
        assert_eq!(
            p.write_config_block(250, &[0; 10]),
            Err(ProtocolError::AddressOutOfRange {
                start: 250,
                len: 10,
                bound: CONFIG_SPACE_SIZE,
            })
        );
        assert!(p.transport.ops.is_empty());
    }
}

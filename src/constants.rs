//! Fixed constants of the OnBright two-wire programming protocol.
//!
//! All values are recovered from bus traces of the vendor's official
//! programmer and must match bit-exactly.

/// Pseudo-address the chip acknowledges once its power-on/watchdog
/// condition is satisfied. Target of the handshake retry loop and of
/// the MCU reset request.
pub const RESET_CHIP: u8 = 0x7c;
/// First greet pseudo-address, sent right after the reset ack.
pub const HANDSHAKE01: u8 = 0x7d;
/// Second greet pseudo-address, sent after [`HANDSHAKE01`].
pub const HANDSHAKE02: u8 = 0x2d;

/// Command channel: carries command and address bytes.
pub const COMMAND_ADDRESS: u8 = 0x7e;
/// Data channel: carries or returns the payload byte. Byte writes go
/// out under this address too, despite its "read" role in the traces.
pub const DATA_ADDRESS: u8 = 0x7f;

/// Config offset holding the chip type byte.
pub const CHIP_TYPE_OFFSET: u8 = 0x00;
/// Expected chip type readback for the OBS38S003 family.
pub const CHIP_TYPE_OBS38S003: u8 = 0x0a;

/// Reset attempts before the handshake is reported failed. Matches the
/// retry budget of the vendor tool.
pub const MAX_HANDSHAKE_RETRIES: u32 = 10;

/// Flash geometry: 16 blocks of 512 bytes.
pub const FLASH_SIZE: usize = 8192;
pub const BLOCK_SIZE: usize = 512;
pub const BLOCK_COUNT: usize = FLASH_SIZE / BLOCK_SIZE;

/// Number of addressable configuration/fuse bytes.
pub const CONFIG_SPACE_SIZE: usize = 255;

pub mod commands {
    pub const ERASE_CHIP: u8 = 0x03;
    pub const WRITE_FLASH: u8 = 0x05;
    pub const READ_FLASH: u8 = 0x06;
    pub const WRITE_CONFIG: u8 = 0x08;
    pub const READ_CONFIG: u8 = 0x09;
}

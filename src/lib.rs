//! OnBright OBS38S003 in-circuit programming protocol implementation.

pub mod constants;
pub mod device;
pub mod flashing;
pub mod format;
pub mod protocol;
pub mod transport;

pub use self::device::{Chip, Family};
pub use self::flashing::Flashing;
pub use self::protocol::{Programmer, ProtocolError};
pub use self::transport::{BusResult, Direction, Transport};

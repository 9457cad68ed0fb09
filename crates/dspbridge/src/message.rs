//! Fixed three-word node message format.
//!
//! Every message is exactly [`MESSAGE_WIRE_BYTES`] bytes: `command`, `arg1`, `arg2`, each a
//! little-endian `u32`. There is no variable-length payload; bulk data moves through mapped
//! buffers whose accelerator-side addresses travel in `arg1`/`arg2`.

use core::fmt;

use crate::control::DeviceAddress;

pub const MESSAGE_WIRE_BYTES: usize = 12;

/// Command values understood by the node protocol.
pub mod command {
    /// Hands the node its input and output buffer addresses.
    pub const CONFIGURE: u32 = 0x0000_0000;
    /// Asks the node to process `arg1` bytes; the node replies exactly once.
    pub const WORK: u32 = 0x0000_0001;
    /// Terminal command: the node leaves its dispatch loop.
    pub const SHUTDOWN: u32 = 0x8000_0000;
    /// Intercepted by the driver itself; never delivered to a node.
    pub const DRIVER_RESERVED: u32 = 0x2000_0000;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Message {
    pub command: u32,
    pub arg1: u32,
    pub arg2: u32,
}

impl Message {
    pub const fn new(command: u32, arg1: u32, arg2: u32) -> Self {
        Self {
            command,
            arg1,
            arg2,
        }
    }

    /// Builds an ordinary payload message, refusing the command values the protocol reserves.
    pub fn payload(command: u32, arg1: u32, arg2: u32) -> Result<Self, DecodeError> {
        if is_reserved(command) {
            return Err(DecodeError::ReservedCommand(command));
        }
        Ok(Self::new(command, arg1, arg2))
    }

    pub fn encode(&self) -> [u8; MESSAGE_WIRE_BYTES] {
        let mut out = [0u8; MESSAGE_WIRE_BYTES];
        out[0..4].copy_from_slice(&self.command.to_le_bytes());
        out[4..8].copy_from_slice(&self.arg1.to_le_bytes());
        out[8..12].copy_from_slice(&self.arg2.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != MESSAGE_WIRE_BYTES {
            return Err(DecodeError::WrongLength { len: bytes.len() });
        }
        let word =
            |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Ok(Self {
            command: word(0),
            arg1: word(4),
            arg2: word(8),
        })
    }
}

fn is_reserved(command: u32) -> bool {
    command == command::SHUTDOWN || command == command::DRIVER_RESERVED
}

/// The closed set of commands a node dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Configure {
        input: DeviceAddress,
        output: DeviceAddress,
    },
    Work {
        length: u32,
    },
    Shutdown,
}

impl Command {
    pub fn to_message(self) -> Message {
        match self {
            Command::Configure { input, output } => {
                Message::new(command::CONFIGURE, input.0, output.0)
            }
            Command::Work { length } => Message::new(command::WORK, length, 0),
            Command::Shutdown => Message::new(command::SHUTDOWN, 0, 0),
        }
    }
}

impl TryFrom<Message> for Command {
    type Error = DecodeError;

    fn try_from(msg: Message) -> Result<Self, Self::Error> {
        Ok(match msg.command {
            command::CONFIGURE => Command::Configure {
                input: DeviceAddress(msg.arg1),
                output: DeviceAddress(msg.arg2),
            },
            command::WORK => Command::Work { length: msg.arg1 },
            command::SHUTDOWN => Command::Shutdown,
            other => return Err(DecodeError::UnknownCommand(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    WrongLength { len: usize },
    UnknownCommand(u32),
    ReservedCommand(u32),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::WrongLength { len } => {
                write!(f, "message is {len} bytes (expected {MESSAGE_WIRE_BYTES})")
            }
            DecodeError::UnknownCommand(cmd) => write!(f, "unknown command 0x{cmd:08x}"),
            DecodeError::ReservedCommand(cmd) => write!(f, "reserved command 0x{cmd:08x}"),
        }
    }
}

impl std::error::Error for DecodeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_layout_is_three_le_words() {
        let msg = Message::new(command::WORK, 0x1000, 0xdead_beef);
        assert_eq!(
            msg.encode(),
            [1, 0, 0, 0, 0x00, 0x10, 0, 0, 0xef, 0xbe, 0xad, 0xde]
        );
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        assert_eq!(
            Message::decode(&[0u8; 11]),
            Err(DecodeError::WrongLength { len: 11 })
        );
        assert_eq!(
            Message::decode(&[0u8; 16]),
            Err(DecodeError::WrongLength { len: 16 })
        );
    }

    #[test]
    fn payload_refuses_reserved_commands() {
        assert_eq!(
            Message::payload(command::SHUTDOWN, 0, 0),
            Err(DecodeError::ReservedCommand(command::SHUTDOWN))
        );
        assert_eq!(
            Message::payload(command::DRIVER_RESERVED, 1, 2),
            Err(DecodeError::ReservedCommand(command::DRIVER_RESERVED))
        );
        assert!(Message::payload(command::WORK, 4096, 0).is_ok());
    }

    #[test]
    fn commands_classify_from_messages() {
        let configure = Command::Configure {
            input: DeviceAddress(0x1100_0000),
            output: DeviceAddress(0x1100_2000),
        };
        assert_eq!(Command::try_from(configure.to_message()), Ok(configure));
        assert_eq!(
            Command::try_from(Message::new(command::WORK, 64, 0)),
            Ok(Command::Work { length: 64 })
        );
        assert_eq!(
            Command::try_from(Message::new(command::SHUTDOWN, 0, 0)),
            Ok(Command::Shutdown)
        );
        assert_eq!(
            Command::try_from(Message::new(7, 0, 0)),
            Err(DecodeError::UnknownCommand(7))
        );
    }
}

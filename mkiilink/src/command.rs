//! Bootloader commands carried in `BootloaderBinary` frames
//!
//! Each command payload starts with a 16 byte [CommandPacket] header made of
//! four little-endian words. `Program` commands follow the header with the
//! data to write.

use std::{mem::size_of, time::Duration};

use bitflags::bitflags;
use bytemuck::{bytes_of, pod_read_unaligned, Pod, Zeroable};
use strum::{Display, FromRepr};

use crate::error::Error;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const ERASE_TIMEOUT: Duration = Duration::from_secs(30);

/// Bytes of image data carried by one `Program` command
pub const PROGRAM_CHUNK_SIZE: usize = 256;

/// Fill value used to pad program data up to a flash word
pub const PAD_BYTE: u8 = 0xFF;

/// Types of commands understood by the bootloaders
///
/// The values are distinct powers of two so that a set of pending commands
/// can be held in a [CommandSet].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, FromRepr)]
#[non_exhaustive]
#[repr(u32)]
pub enum CommandType {
    Null = 0x00,
    Hello = 0x01,
    Erase = 0x02,
    Program = 0x04,
    Boot = 0x08,
    BmsHello = 0x10,
    BmsProgram = 0x20,
}

impl CommandType {
    /// Return a timeout based on the command type
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::Erase => ERASE_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }
}

/// Header embedded at the start of a `BootloaderBinary` payload
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct CommandPacket {
    pub arg0: u32,
    pub arg1: u32,
    pub arg2: u32,
    pub command: u32,
}

impl CommandPacket {
    pub const SIZE: usize = size_of::<CommandPacket>();

    pub fn new(command: CommandType, arg0: u32, arg1: u32) -> Self {
        CommandPacket {
            arg0,
            arg1,
            arg2: 0,
            command: command as u32,
        }
    }

    /// Wire representation, little-endian regardless of the host
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let le = CommandPacket {
            arg0: self.arg0.to_le(),
            arg1: self.arg1.to_le(),
            arg2: self.arg2.to_le(),
            command: self.command.to_le(),
        };

        let mut bytes = [0u8; Self::SIZE];
        bytes.copy_from_slice(bytes_of(&le));
        bytes
    }

    /// Split a payload into its command header and the data following it
    pub fn parse(payload: &[u8]) -> Result<(CommandPacket, &[u8]), Error> {
        if payload.len() < Self::SIZE {
            return Err(Error::ShortCommand(payload.len()));
        }

        let raw: CommandPacket = pod_read_unaligned(&payload[..Self::SIZE]);
        let packet = CommandPacket {
            arg0: u32::from_le(raw.arg0),
            arg1: u32::from_le(raw.arg1),
            arg2: u32::from_le(raw.arg2),
            command: u32::from_le(raw.command),
        };

        Ok((packet, &payload[Self::SIZE..]))
    }

    /// The command, if it is one this crate knows
    pub fn command_type(&self) -> Option<CommandType> {
        CommandType::from_repr(self.command)
    }

    pub fn is_final(&self) -> bool {
        self.arg1 != 0
    }
}

/// Available commands
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Command<'a> {
    Null,
    Hello,
    Erase {
        start: u32,
        end: u32,
    },
    Program {
        address: u32,
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        is_final: bool,
    },
    Boot,
}

impl Command<'_> {
    /// Return the command type
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Null => CommandType::Null,
            Command::Hello => CommandType::Hello,
            Command::Erase { .. } => CommandType::Erase,
            Command::Program { .. } => CommandType::Program,
            Command::Boot => CommandType::Boot,
        }
    }

    /// Return the command's header
    pub fn packet(&self) -> CommandPacket {
        let ty = self.command_type();
        match *self {
            Command::Erase { start, end } => CommandPacket::new(ty, start, end),
            Command::Program {
                address, is_final, ..
            } => CommandPacket::new(ty, address, is_final as u32),
            _ => CommandPacket::new(ty, 0, 0),
        }
    }

    /// Payload of the `BootloaderBinary` frame carrying this command
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(CommandPacket::SIZE + self.data_len());
        payload.extend_from_slice(&self.packet().to_bytes());

        if let Command::Program {
            data,
            pad_to,
            pad_byte,
            ..
        } = *self
        {
            payload.extend_from_slice(data);
            payload.resize(CommandPacket::SIZE + padded_len(data.len(), pad_to), pad_byte);
        }

        payload
    }

    fn data_len(&self) -> usize {
        match *self {
            Command::Program { data, pad_to, .. } => padded_len(data.len(), pad_to),
            _ => 0,
        }
    }
}

/// Length of `len` bytes once padded up to a multiple of `pad_to`
pub fn padded_len(len: usize, pad_to: usize) -> usize {
    if pad_to == 0 {
        len
    } else {
        len.div_ceil(pad_to) * pad_to
    }
}

bitflags! {
    /// Commands queued on the sending side, drained in a fixed order
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct CommandSet: u32 {
        const HELLO       = CommandType::Hello as u32;
        const ERASE       = CommandType::Erase as u32;
        const PROGRAM     = CommandType::Program as u32;
        const BOOT        = CommandType::Boot as u32;
        const BMS_HELLO   = CommandType::BmsHello as u32;
        const BMS_PROGRAM = CommandType::BmsProgram as u32;
    }
}

impl CommandSet {
    /// Order in which pending commands are executed
    const ORDER: [CommandSet; 6] = [
        CommandSet::HELLO,
        CommandSet::BMS_HELLO,
        CommandSet::ERASE,
        CommandSet::PROGRAM,
        CommandSet::BMS_PROGRAM,
        CommandSet::BOOT,
    ];

    /// Pending commands in execution order
    pub fn drain_order(self) -> impl Iterator<Item = CommandType> {
        Self::ORDER
            .into_iter()
            .filter(move |flag| self.contains(*flag))
            .filter_map(|flag| CommandType::from_repr(flag.bits()))
    }

    /// Reject combinations which cannot run together
    pub fn validate(self) -> Result<Self, Error> {
        if self.contains(CommandSet::PROGRAM | CommandSet::BMS_PROGRAM) {
            return Err(Error::ConflictingCommands);
        }

        Ok(self)
    }
}

impl From<CommandType> for CommandSet {
    fn from(ty: CommandType) -> Self {
        CommandSet::from_bits_truncate(ty as u32)
    }
}

//! Library and application errors

use std::{
    fmt::{Display, Formatter},
    io,
};

use miette::Diagnostic;
use thiserror::Error;

use crate::{
    codec::{DecodeOutcome, EncodeError},
    command::CommandType,
    frame::FrameType,
};

/// All possible errors returned by mkiilink
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Operation was cancelled by the user")]
    #[diagnostic(code(mkiilink::cancelled))]
    Cancelled,

    #[error("Timeout while waiting for a reply to {0}command")]
    #[diagnostic(
        code(mkiilink::timeout),
        help("The device stops answering when it hits an unrecoverable flash error. Power cycle it and try again")
    )]
    Timeout(TimedOutCommand),

    #[error("The device rejected the {0} command")]
    #[diagnostic(
        code(mkiilink::nack),
        help("The device sends its reason as a debug string just before the NACK")
    )]
    Nack(CommandType),

    #[error("Invalid erase range {start}..={end}")]
    #[diagnostic(
        code(mkiilink::bad_erase_range),
        help("Sectors are numbered 0 through 15 and the start must not exceed the end")
    )]
    BadEraseRange { start: i64, end: i64 },

    #[error("Cannot program the application processor and the BMS in one run")]
    #[diagnostic(
        code(mkiilink::conflicting_commands),
        help("Use either `--program` or `--program-bms`, not both")
    )]
    ConflictingCommands,

    #[error("Refusing to program an empty image")]
    #[diagnostic(code(mkiilink::empty_image))]
    EmptyImage,

    #[error("Command packet needs 16 bytes, received {0}")]
    #[diagnostic(code(mkiilink::short_command))]
    ShortCommand(usize),

    #[error("Program data of {len} bytes is not a multiple of the {word} byte flash word")]
    #[diagnostic(code(mkiilink::unaligned_program))]
    UnalignedProgram { len: usize, word: usize },

    #[error("Flash region bank {bank}, sectors {first_sector}+{sector_count} is out of range")]
    #[diagnostic(code(mkiilink::invalid_region))]
    InvalidRegion {
        bank: u8,
        first_sector: u8,
        sector_count: u8,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Flash(#[from] FlashFault),

    #[error("A handler for {0} frames is already registered")]
    #[diagnostic(code(mkiilink::duplicate_handler))]
    DuplicateHandler(FrameType),

    #[error("Failed to encode frame")]
    #[diagnostic(transparent)]
    Encode(#[from] EncodeError),

    #[error("Failed to decode frame")]
    #[diagnostic(transparent)]
    Decode(#[from] DecodeOutcome),

    #[error("Error on the flow-controlled link")]
    #[diagnostic(transparent)]
    Link(#[from] LinkError),

    #[error("Out of memory while buffering a frame")]
    #[diagnostic(code(mkiilink::out_of_memory))]
    OutOfMemory,

    #[error("No serial ports could be detected")]
    #[diagnostic(
        code(mkiilink::no_serial),
        help("Make sure you have connected a device to the host system")
    )]
    NoSerial,

    #[error("The serial port '{0}' could not be found")]
    #[diagnostic(
        code(mkiilink::serial_not_found),
        help("Make sure the correct device is connected to the host system")
    )]
    SerialNotFound(String),

    #[cfg(feature = "cli")]
    #[error(transparent)]
    #[diagnostic(code(mkiilink::dialoguer_error))]
    DialoguerError(#[from] dialoguer::Error),

    #[cfg(feature = "serialport")]
    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(mkiilink::serial_error))]
    Serial(#[source] serialport::Error),

    #[error("IO error: {0}")]
    #[diagnostic(code(mkiilink::io))]
    Io(#[source] io::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                Error::Timeout(TimedOutCommand::default())
            }
            io::ErrorKind::Interrupted => Error::Cancelled,
            _ => Error::Io(err),
        }
    }
}

#[cfg(feature = "serialport")]
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::Io(io::ErrorKind::TimedOut) => {
                Error::Timeout(TimedOutCommand::default())
            }
            _ => Error::Serial(err),
        }
    }
}

/// Errors of the RTS/CTS transport
///
/// All of these are recovered locally: the exchange is abandoned and the link
/// returns to idle with its receive interrupt masked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Diagnostic, Error)]
#[non_exhaustive]
pub enum LinkError {
    #[error("Peer did not grant the channel within {0} ms")]
    #[diagnostic(code(mkiilink::link::grant_timeout))]
    GrantTimeout(u32),

    #[error("Peer did not release the channel within {0} ms")]
    #[diagnostic(code(mkiilink::link::release_timeout))]
    ReleaseTimeout(u32),

    #[error("Peer did not finish sending within {0} ms")]
    #[diagnostic(code(mkiilink::link::receive_timeout))]
    ReceiveTimeout(u32),

    #[error("Peer request line dropped before the transfer started")]
    #[diagnostic(code(mkiilink::link::glitch))]
    Glitch,

    #[error("Receive buffer overrun, transfer discarded")]
    #[diagnostic(code(mkiilink::link::overrun))]
    Overrun,

    #[error("Transfer aborted")]
    #[diagnostic(code(mkiilink::link::aborted))]
    Aborted,

    #[error("UART transmit failed ({0:?})")]
    #[diagnostic(code(mkiilink::link::uart))]
    Uart(embedded_io::ErrorKind),
}

/// Hardware error reported by a flash controller
#[derive(Clone, Copy, Debug, PartialEq, Eq, Diagnostic, Error)]
#[error("Flash controller error {code:#010x} during {operation}")]
#[diagnostic(code(mkiilink::flash))]
pub struct FlashFault {
    pub operation: FlashOperation,
    pub code: u32,
}

impl FlashFault {
    pub fn new(operation: FlashOperation, code: u32) -> Self {
        FlashFault { operation, code }
    }
}

/// The flash operation that failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum FlashOperation {
    Unlock,
    Lock,
    Erase,
    Program,
}

/// A command which timed out while waiting for its reply
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{command} "),
            None => Ok(()),
        }
    }
}

impl From<CommandType> for TimedOutCommand {
    fn from(ct: CommandType) -> Self {
        TimedOutCommand { command: Some(ct) }
    }
}

pub(crate) trait ResultExt {
    /// Mark the command from which this error originates
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Timeout(_)) => Err(Error::Timeout(command.into())),
            res => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_tagged_with_the_pending_command() {
        let res: Result<(), Error> = Err(io::Error::from(io::ErrorKind::TimedOut).into());
        let res = res.for_command(CommandType::Erase);

        match res {
            Err(err @ Error::Timeout(_)) => {
                assert_eq!(
                    err.to_string(),
                    "Timeout while waiting for a reply to Erase command"
                );
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn other_errors_pass_through_untouched() {
        let res: Result<(), Error> = Err(Error::Nack(CommandType::Program));
        assert!(matches!(
            res.for_command(CommandType::Erase),
            Err(Error::Nack(CommandType::Program))
        ));
    }
}

//! Drive a node's bootloaders from the host
//!
//! The [Flasher] struct sends bootloader commands over a [Connection] and
//! waits for the Ack or Nack which ends each of them. Anything else the node
//! says in the meantime (debug strings, data, audio) is handed to a
//! [FrameObserver].

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::{
    codec::Codec,
    command::{Command, CommandSet, CommandType, PAD_BYTE, PROGRAM_CHUNK_SIZE},
    connection::{Connection, Port},
    error::{Error, ResultExt as _},
    flash::{AP_FLASH_WORD, APPLICATION_START_ADDR, BMS_FLASH_WORD},
    frame::{Destination, Frame, FrameType},
    link::AbortSignal,
    progress::ProgressCallbacks,
};

/// Read timeout used while waiting, so that an abort is noticed promptly
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where the sending side is in the command exchange
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CommandState {
    #[default]
    Idle,
    AwaitingAck(CommandType),
}

/// Receives every frame which is not the reply to a pending command
pub trait FrameObserver {
    fn observe(&mut self, frame: &Frame);
}

impl<F> FrameObserver for F
where
    F: FnMut(&Frame),
{
    fn observe(&mut self, frame: &Frame) {
        self(frame)
    }
}

/// Logs debug strings and traces everything else
#[derive(Copy, Clone, Debug, Default)]
pub struct LogObserver;

impl FrameObserver for LogObserver {
    fn observe(&mut self, frame: &Frame) {
        if frame.frame_type.is_debug() {
            info!("{}", frame.text());
        } else {
            debug!(
                "Ignoring {} frame ({} bytes)",
                frame.frame_type,
                frame.payload.len()
            );
        }
    }
}

/// Arguments for the commands in a [CommandSet]
#[derive(Clone, Debug)]
pub struct Plan {
    pub erase_start: i64,
    pub erase_end: i64,
    pub allow_unsafe: bool,
    pub program_address: u32,
    pub image: Vec<u8>,
    pub bms_image: Vec<u8>,
}

impl Default for Plan {
    fn default() -> Self {
        Plan {
            erase_start: 0,
            erase_end: -1,
            allow_unsafe: false,
            program_address: APPLICATION_START_ADDR,
            image: Vec::new(),
            bms_image: Vec::new(),
        }
    }
}

/// Word size the bootloader behind `dest` programs in
fn word_size(dest: Destination) -> usize {
    match dest {
        Destination::BatteryManagementSystem => BMS_FLASH_WORD,
        _ => AP_FLASH_WORD,
    }
}

/// Resolve the erase arguments the way the bootloader expects them
///
/// An `end` of -1 erases the single sector `start`. Sector 0 holds the
/// bootloader and is only erased when `allow_unsafe` is set.
pub fn erase_range(start: i64, end: i64, allow_unsafe: bool) -> Result<(u32, u32), Error> {
    let end = if end < 0 { start } else { end };

    let start = if start == 0 && !allow_unsafe {
        warn!("Ignored request to erase bootloader. Override with --allow-unsafe");
        1
    } else {
        start
    };

    if start < 0 || start > end {
        return Err(Error::BadEraseRange { start, end });
    }

    let start = u32::try_from(start).map_err(|_| Error::BadEraseRange { start, end })?;
    let end = u32::try_from(end).map_err(|_| Error::BadEraseRange {
        start: i64::from(start),
        end,
    })?;

    Ok((start, end))
}

/// Sends bootloader commands to a node and collects their replies
pub struct Flasher<P, O = LogObserver> {
    connection: Connection<P>,
    state: CommandState,
    abort: AbortSignal,
    observer: O,
    reply_timeout: Option<Duration>,
    chunk_size: usize,
}

impl<P: Port> Flasher<P, LogObserver> {
    pub fn new(port: P, codec: Codec) -> Self {
        Self::with_observer(port, codec, LogObserver)
    }
}

impl<P: Port, O: FrameObserver> Flasher<P, O> {
    pub fn with_observer(port: P, codec: Codec, observer: O) -> Self {
        Self::from_connection(Connection::new(port, codec), observer)
    }

    pub fn from_connection(connection: Connection<P>, observer: O) -> Self {
        Flasher {
            connection,
            state: CommandState::Idle,
            abort: AbortSignal::new(),
            observer,
            reply_timeout: None,
            chunk_size: PROGRAM_CHUNK_SIZE,
        }
    }

    /// Use `abort` to cancel waits, typically wired to ctrl-c.
    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    /// Wait at most `timeout` for every reply instead of the per-command default.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = Some(timeout);
        self
    }

    /// Split images into chunks of `chunk_size` bytes.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    pub fn connection(&mut self) -> &mut Connection<P> {
        &mut self.connection
    }

    pub fn into_parts(self) -> (Connection<P>, O) {
        (self.connection, self.observer)
    }

    /// Send one command and wait for the Ack or Nack answering it
    pub fn command(&mut self, dest: Destination, command: Command<'_>) -> Result<(), Error> {
        let ty = command.command_type();
        let frame = Frame::new(dest, FrameType::BootloaderBinary, command.to_payload());
        self.exchange(&frame, ty)
    }

    fn exchange(&mut self, frame: &Frame, ty: CommandType) -> Result<(), Error> {
        debug!("Sending {ty} command to {}", frame.destination);

        self.connection.write_frame(frame)?;
        self.state = CommandState::AwaitingAck(ty);

        let result = self.await_reply(ty).for_command(ty);
        self.state = CommandState::Idle;
        result
    }

    fn await_reply(&mut self, ty: CommandType) -> Result<(), Error> {
        let deadline = Instant::now() + self.reply_timeout.unwrap_or_else(|| ty.timeout());

        loop {
            if self.abort.is_aborted() {
                return Err(Error::Cancelled);
            }

            match self
                .connection
                .with_timeout(POLL_INTERVAL, |connection| connection.read_frame())
            {
                Ok(frame) if frame.is_ack() => return Ok(()),
                Ok(frame) if frame.is_nack() => return Err(Error::Nack(ty)),
                Ok(frame) => self.observer.observe(&frame),
                Err(Error::Timeout(_)) if Instant::now() < deadline => {}
                Err(err) => return Err(err),
            }
        }
    }

    /// Ask a bootloader to identify itself
    pub fn hello(&mut self, dest: Destination) -> Result<(), Error> {
        self.command(dest, Command::Hello)
    }

    /// Greet the BMS bootloader, which answers bare `Hello` frames
    pub fn bms_hello(&mut self) -> Result<(), Error> {
        let frame = Frame::empty(Destination::BatteryManagementSystem, FrameType::Hello);
        self.exchange(&frame, CommandType::BmsHello)
    }

    /// Erase application processor sectors `start..=end`
    pub fn erase(&mut self, start: i64, end: i64, allow_unsafe: bool) -> Result<(), Error> {
        let (start, end) = erase_range(start, end, allow_unsafe)?;
        info!("Erasing sectors {start} to {end}");

        self.command(Destination::ApplicationProcessor, Command::Erase { start, end })
    }

    /// Write `data` to the flash behind `dest`, starting at `address`
    pub fn program(
        &mut self,
        dest: Destination,
        address: u32,
        data: &[u8],
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        if data.is_empty() {
            return Err(Error::EmptyImage);
        }

        let pad_to = word_size(dest);
        let chunks = data.len().div_ceil(self.chunk_size);
        info!(
            "Programming {} bytes to {dest} at {address:#010x} in {chunks} chunks",
            data.len()
        );

        progress.init(address, chunks);

        let mut chunk_address = address;
        for (i, chunk) in data.chunks(self.chunk_size).enumerate() {
            let command = Command::Program {
                address: chunk_address,
                data: chunk,
                pad_to,
                pad_byte: PAD_BYTE,
                is_final: i + 1 == chunks,
            };

            if let Err(err) = self.command(dest, command) {
                if matches!(err, Error::Nack(_)) {
                    warn!("Programming FAILED at {chunk_address:#010x}");
                }
                return Err(err);
            }

            progress.update(i + 1);
            chunk_address = chunk_address.wrapping_add(self.chunk_size as u32);
        }

        progress.finish(false);

        Ok(())
    }

    /// Tell the application processor to boot its application
    pub fn boot(&mut self) -> Result<(), Error> {
        self.command(Destination::ApplicationProcessor, Command::Boot)
    }

    /// Send a line of data to the application processor
    ///
    /// A trailing newline is swapped for the NUL terminator the application
    /// expects. No reply is awaited.
    pub fn send_data(&mut self, data: &[u8]) -> Result<(), Error> {
        let mut payload = data.to_vec();
        match payload.last_mut() {
            Some(last) if *last == b'\n' => *last = 0,
            _ => payload.push(0),
        }

        let frame = Frame::new(Destination::ApplicationProcessor, FrameType::DataString, payload);
        self.connection.write_frame(&frame)
    }

    /// Hand every received frame to the observer until aborted
    pub fn listen(&mut self) -> Result<(), Error> {
        info!("Listening, press ctrl-c to stop");

        while !self.abort.is_aborted() {
            match self
                .connection
                .with_timeout(POLL_INTERVAL, |connection| connection.read_frame())
            {
                Ok(frame) => self.observer.observe(&frame),
                Err(Error::Timeout(_)) => {}
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    /// Run every command in `commands`, in their fixed order
    pub fn run(
        &mut self,
        commands: CommandSet,
        plan: &Plan,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        for ty in commands.validate()?.drain_order() {
            match ty {
                CommandType::Hello => self.hello(Destination::ApplicationProcessor)?,
                CommandType::BmsHello => self.bms_hello()?,
                CommandType::Erase => {
                    self.erase(plan.erase_start, plan.erase_end, plan.allow_unsafe)?
                }
                CommandType::Program => self.program(
                    Destination::ApplicationProcessor,
                    plan.program_address,
                    &plan.image,
                    progress,
                )?,
                CommandType::BmsProgram => self.program(
                    Destination::BatteryManagementSystem,
                    plan.program_address,
                    &plan.bms_image,
                    progress,
                )?,
                CommandType::Boot => self.boot()?,
                CommandType::Null => {}
            }
        }

        Ok(())
    }
}

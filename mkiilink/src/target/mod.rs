//! Receiving side of the bootloader protocol
//!
//! A [Bootloader] runs on each programmable node and answers the
//! `BootloaderBinary` frames the router hands it. Its behaviour differs
//! slightly between the application processor and the battery management
//! board, which is captured by a [TargetProfile].

use log::{debug, error, info, warn};

pub use self::{
    boot::{
        after_listen_window,
        resolve_listen_window,
        resolve_startup,
        startup_action,
        BootMarker,
        BootMarkerStore,
        MarkerWord,
        StartupAction,
        LISTEN_WINDOW_MS,
    },
    identity::DeviceIdentity,
    sim::{SimulatedDevice, TickPlatform},
};
use crate::{
    command::{CommandPacket, CommandSet, CommandType},
    error::Error,
    flash::{
        ErasePlan,
        FlashController,
        FlashRegion,
        APPLICATION_START_ADDR,
        AP_FLASH_WORD,
        BMS_FLASH_WORD,
    },
    frame::{Destination, Frame, FrameType},
    router::FrameSink,
};

mod boot;
mod identity;
mod sim;

/// Services of the chip the bootloader runs on
pub trait Platform {
    fn now_ms(&self) -> u32;

    fn system_reset(&mut self);

    /// Stop on an unrecoverable fault.
    fn halt(&mut self, reason: &str) -> !;
}

/// Per-node behaviour of the bootloader
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetProfile {
    pub destination: Destination,
    /// Shown in the greeting
    pub name: &'static str,
    /// Frame type of debug replies
    pub debug_type: FrameType,
    pub word_size: usize,
    /// Commands this node acts on
    pub commands: CommandSet,
    /// Erased before the first program chunk is written
    pub storage: Option<FlashRegion>,
    /// Reply to unsupported commands with a NACK instead of arming the bootloader
    pub nack_unknown: bool,
    /// Answer bare `Hello` frames
    pub answers_hello_frames: bool,
}

impl TargetProfile {
    pub fn application_processor() -> Self {
        TargetProfile {
            destination: Destination::ApplicationProcessor,
            name: "H7 Bootloader",
            debug_type: FrameType::DebugString,
            word_size: AP_FLASH_WORD,
            commands: CommandSet::HELLO | CommandSet::ERASE | CommandSet::PROGRAM | CommandSet::BOOT,
            storage: None,
            nack_unknown: false,
            answers_hello_frames: false,
        }
    }

    pub fn battery_management_system() -> Self {
        TargetProfile {
            destination: Destination::BatteryManagementSystem,
            name: "SONYC Mel BMS",
            debug_type: FrameType::DebugStringBms,
            word_size: BMS_FLASH_WORD,
            commands: CommandSet::PROGRAM,
            storage: Some(FlashRegion::PROGRAM_BANK2),
            nack_unknown: true,
            answers_hello_frames: true,
        }
    }
}

/// Replies collected while handling one frame
struct Replies {
    debug_type: FrameType,
    frames: Vec<Frame>,
}

impl Replies {
    fn new(debug_type: FrameType) -> Self {
        Replies {
            debug_type,
            frames: Vec::new(),
        }
    }

    fn debug(&mut self, text: impl AsRef<str>) -> &mut Self {
        let text = format!("{}\r\n", text.as_ref());
        self.frames
            .push(Frame::new(Destination::Base, self.debug_type, text.into_bytes()));
        self
    }

    fn ack(&mut self) -> &mut Self {
        self.frames.push(Frame::empty(Destination::Base, FrameType::Ack));
        self
    }

    fn nack(&mut self) -> &mut Self {
        self.frames.push(Frame::empty(Destination::Base, FrameType::Nack));
        self
    }
}

/// Command handler of one node
#[derive(Debug)]
pub struct Bootloader<F, M, P> {
    flash: F,
    markers: M,
    platform: P,
    profile: TargetProfile,
    identity: DeviceIdentity,
    program_started: Option<u32>,
    storage_erased: bool,
    reset_pending: bool,
}

impl<F, M, P> Bootloader<F, M, P>
where
    F: FlashController,
    M: BootMarkerStore,
    P: Platform,
{
    pub fn new(
        flash: F,
        markers: M,
        platform: P,
        profile: TargetProfile,
        identity: DeviceIdentity,
    ) -> Self {
        Bootloader {
            flash,
            markers,
            platform,
            profile,
            identity,
            program_started: None,
            storage_erased: false,
            reset_pending: false,
        }
    }

    pub fn profile(&self) -> &TargetProfile {
        &self.profile
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn markers(&self) -> &M {
        &self.markers
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Whether a `Boot` command is waiting for its replies to go out
    pub fn reset_pending(&self) -> bool {
        self.reset_pending
    }

    /// Handle one frame addressed to this node, returning the replies.
    ///
    /// A `Boot` command only schedules the reset; see [Bootloader::serve].
    pub fn handle(&mut self, frame: &Frame) -> Vec<Frame> {
        let mut replies = Replies::new(self.profile.debug_type);

        match frame.frame_type {
            FrameType::BootloaderBinary => self.command(&frame.payload, &mut replies),
            FrameType::Hello if self.profile.answers_hello_frames => {
                self.hello(&mut replies);
            }
            other => debug!("{} ignoring {other} frame", self.profile.name),
        }

        replies.frames
    }

    /// Handle a frame, send the replies and carry out any scheduled reset.
    pub fn serve(&mut self, frame: &Frame, sink: &mut dyn FrameSink) -> Result<(), Error> {
        for reply in self.handle(frame) {
            sink.send_frame(&reply)?;
        }

        if self.reset_pending {
            self.reset_pending = false;
            self.platform.system_reset();
        }

        Ok(())
    }

    fn command(&mut self, payload: &[u8], replies: &mut Replies) {
        let (packet, data) = match CommandPacket::parse(payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("{err}");
                self.unknown(None, replies);
                return;
            }
        };

        let supported = packet
            .command_type()
            .filter(|ty| self.profile.commands.contains(CommandSet::from(*ty)));

        match supported {
            Some(CommandType::Hello) => self.hello(replies),
            Some(CommandType::Erase) => self.erase(packet.arg0 as i32, packet.arg1 as i32, replies),
            Some(CommandType::Program) => self.program(packet.arg0, data, packet.is_final(), replies),
            Some(CommandType::Boot) => self.boot(replies),
            _ => self.unknown(Some(packet.command), replies),
        }
    }

    fn hello(&mut self, replies: &mut Replies) {
        replies.debug(format!("{} Compiled {}", self.profile.name, self.identity.build));

        if self.profile.destination == Destination::ApplicationProcessor {
            let id = self.identity.network_id();
            replies
                .debug(format!("CPU UID: {}", self.identity))
                .debug(format!("Device Network ID {id} (0x{id:04X})"));
        }

        replies.ack();
    }

    fn erase(&mut self, start: i32, end: i32, replies: &mut Replies) {
        let started = self.platform.now_ms();

        let plan = match ErasePlan::for_range(i64::from(start), i64::from(end)) {
            Ok(plan) => plan,
            Err(_) => {
                replies.debug(format!("BAD ERASE ARGS {start} {end}")).nack();
                return;
            }
        };

        info!("Erasing sectors {start}..={end}");
        let result = self.flash.unlock().and_then(|_| {
            match &plan {
                ErasePlan::MassErase => self.flash.mass_erase()?,
                ErasePlan::Regions(regions) => {
                    for region in regions {
                        self.flash.erase_region(*region)?;
                    }
                }
            }
            self.flash.lock()
        });

        if let Err(fault) = result {
            error!("Erase failed: {fault}");
            self.platform.halt(&fault.to_string());
        }

        let elapsed = self.platform.now_ms().wrapping_sub(started);
        replies
            .debug(format!("Erase operation completed in {elapsed} ms"))
            .ack();
    }

    fn program(&mut self, address: u32, data: &[u8], is_final: bool, replies: &mut Replies) {
        let word = self.profile.word_size;
        if data.len() % word != 0 {
            replies
                .debug(format!(
                    "Binary is sized {} but must be padded to mod {word}",
                    data.len()
                ))
                .nack();
            return;
        }

        let now = self.platform.now_ms();
        let started = *self.program_started.get_or_insert(now);

        if let Some(region) = self.profile.storage.filter(|_| !self.storage_erased) {
            let erased = self
                .flash
                .unlock()
                .and_then(|_| self.flash.erase_region(region))
                .and_then(|_| self.flash.lock());

            if let Err(fault) = erased {
                warn!("Storage erase failed: {fault}");
                replies.debug("Erase FAILED").nack();
                return;
            }

            self.storage_erased = true;
            let elapsed = self.platform.now_ms().wrapping_sub(now);
            replies.debug(format!(
                "Erase operation took {elapsed} ms... programming {} bytes...",
                data.len()
            ));
        }

        debug!("Programming {} bytes at {address:#010x}", data.len());
        if let Err(fault) = self.flash.unlock() {
            error!("Unlock failed: {fault}");
            self.platform.halt(&fault.to_string());
        }

        let mut addr = address;
        for chunk in data.chunks_exact(word) {
            if let Err(fault) = self.flash.program_word(addr, chunk) {
                // flash stays unlocked
                replies
                    .debug(format!("Program failed at {addr:#010x}: {fault}"))
                    .nack();
                return;
            }
            addr = addr.wrapping_add(word as u32);
        }

        if let Err(fault) = self.flash.lock() {
            error!("Lock failed: {fault}");
            self.platform.halt(&fault.to_string());
        }

        if is_final {
            let elapsed = self.platform.now_ms().wrapping_sub(started);
            replies.debug(format!("Programming completed in {elapsed} ms"));
            self.program_started = None;
        }

        replies.ack();
    }

    fn boot(&mut self, replies: &mut Replies) {
        replies
            .debug(format!(
                "Reset and booting to application at {APPLICATION_START_ADDR:#010x}..."
            ))
            .ack();

        self.markers.write_boot_marker(BootMarker::Application);
        self.reset_pending = true;
    }

    fn unknown(&mut self, command: Option<u32>, replies: &mut Replies) {
        if self.profile.nack_unknown {
            let shown = command.map_or_else(|| "?".to_string(), |c| c.to_string());
            replies.debug(format!("Ignoring cmd {shown}")).nack();
        } else {
            debug!("Unknown command {command:?}, staying in the bootloader");
            self.markers.write_boot_marker(BootMarker::Bootloader);
        }
    }
}

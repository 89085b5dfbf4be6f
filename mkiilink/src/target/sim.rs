//! An application processor and BMS pair living in memory
//!
//! Used to dry-run a bootload session and in tests: bytes written to a
//! [SimulatedDevice] are decoded and routed the way the application processor
//! routes them, and the replies come back out of its read side.

use std::{
    cell::Cell,
    collections::VecDeque,
    io::{Read, Write},
    time::Duration,
};

use log::warn;

use super::{Bootloader, DeviceIdentity, MarkerWord, Platform, TargetProfile};
use crate::{
    codec::{Codec, DecodeOutcome, DecoderState, FrameCodec},
    connection::Port,
    error::Error,
    flash::{SimulatedFlash, AP_FLASH_WORD, BMS_FLASH_WORD},
    frame::{Frame, FRAME_MAX_SIZE},
    router::{FrameSink, LinkId, Route, Router},
};

/// Longest a read of an empty outbox blocks
const IDLE_READ: Duration = Duration::from_millis(10);

/// A millisecond clock which moves one tick per reading
#[derive(Debug, Default)]
pub struct TickPlatform {
    now: Cell<u32>,
    resets: usize,
}

impl TickPlatform {
    pub fn resets(&self) -> usize {
        self.resets
    }
}

impl Platform for TickPlatform {
    fn now_ms(&self) -> u32 {
        let now = self.now.get().wrapping_add(1);
        self.now.set(now);
        now
    }

    fn system_reset(&mut self) {
        self.resets += 1;
    }

    fn halt(&mut self, reason: &str) -> ! {
        panic!("halted: {reason}");
    }
}

type SimBootloader = Bootloader<SimulatedFlash, MarkerWord, TickPlatform>;

/// Replies waiting to be read by the host
#[derive(Debug, Default)]
struct Outbox {
    codec: Codec,
    bytes: VecDeque<u8>,
}

impl FrameSink for Outbox {
    fn send_frame(&mut self, frame: &Frame) -> Result<Vec<Frame>, Error> {
        let bytes = self.codec.encode_to_vec(frame)?;
        self.bytes.extend(bytes);
        Ok(Vec::new())
    }
}

/// In-memory stand-in for a node attached over USB
pub struct SimulatedDevice {
    codec: Codec,
    state: DecoderState,
    router: Router,
    ap: SimBootloader,
    bms: SimBootloader,
    outbox: Outbox,
    timeout: Duration,
}

impl SimulatedDevice {
    pub fn new(codec: Codec) -> Self {
        let identity = DeviceIdentity::new(*b"SIMULATED-AP", env!("CARGO_PKG_VERSION"));

        SimulatedDevice {
            codec,
            state: DecoderState::new(FRAME_MAX_SIZE),
            router: Router::application_processor(),
            ap: Bootloader::new(
                SimulatedFlash::new(AP_FLASH_WORD),
                MarkerWord::default(),
                TickPlatform::default(),
                TargetProfile::application_processor(),
                identity.clone(),
            ),
            bms: Bootloader::new(
                SimulatedFlash::new(BMS_FLASH_WORD),
                MarkerWord::default(),
                TickPlatform::default(),
                TargetProfile::battery_management_system(),
                identity,
            ),
            outbox: Outbox {
                codec,
                bytes: VecDeque::new(),
            },
            timeout: Duration::from_secs(3),
        }
    }

    pub fn application_processor(&self) -> &SimBootloader {
        &self.ap
    }

    pub fn application_processor_mut(&mut self) -> &mut SimBootloader {
        &mut self.ap
    }

    pub fn battery_management_system(&self) -> &SimBootloader {
        &self.bms
    }

    pub fn battery_management_system_mut(&mut self) -> &mut SimBootloader {
        &mut self.bms
    }

    /// Queue an unsolicited frame for the host, as if a node had sent it.
    pub fn push_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        self.outbox.send_frame(frame)?;
        Ok(())
    }

    fn deliver(&mut self, frame: Frame) -> Result<(), Error> {
        match self.router.route(&frame, LinkId::USB) {
            Route::Local => self.ap.serve(&frame, &mut self.outbox),
            Route::Forward(LinkId::BMS) => self.bms.serve(&frame, &mut self.outbox),
            route => {
                warn!("Simulated device dropping {} frame: {route:?}", frame.frame_type);
                Ok(())
            }
        }
    }
}

impl Read for SimulatedDevice {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.outbox.bytes.is_empty() {
            // nothing will arrive unless the host writes, stand in for the read timeout
            std::thread::sleep(self.timeout.min(IDLE_READ));
            return Ok(0);
        }

        let len = buf.len().min(self.outbox.bytes.len());
        for (slot, byte) in buf.iter_mut().zip(self.outbox.bytes.drain(..len)) {
            *slot = byte;
        }
        Ok(len)
    }
}

impl Write for SimulatedDevice {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for result in self.codec.decode_all(buf, &mut self.state) {
            let frame = match result {
                Ok(frame) => frame,
                Err(DecodeOutcome::CrcMismatch(frame)) => {
                    warn!("Simulated device got {} frame with bad CRC", frame.frame_type);
                    continue;
                }
                Err(outcome) => {
                    warn!("Simulated device: {outcome}");
                    continue;
                }
            };

            self.deliver(frame).map_err(std::io::Error::other)?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Port for SimulatedDevice {
    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.timeout = timeout;
        Ok(())
    }
}

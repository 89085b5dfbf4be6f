use std::{
    io::{Read, Write},
    time::Duration,
};

use mkiilink::{
    codec::{Codec, DecoderState, FrameCodec},
    command::{CommandPacket, CommandSet, CommandType, PAD_BYTE},
    connection::Port,
    flash::{FlashRegion, APPLICATION_START_ADDR},
    flasher::{Flasher, Plan},
    frame::{Destination, Frame, FrameType},
    progress::ProgressCallbacks,
    target::{BootMarker, BootMarkerStore, SimulatedDevice},
    Error,
    WireFormat,
};
use pretty_assertions::assert_eq;

/// Passes everything through to a simulated node, keeping what the host wrote
struct Tap {
    device: SimulatedDevice,
    written: Vec<u8>,
}

impl Read for Tap {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.device.read(buf)
    }
}

impl Write for Tap {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.written.extend_from_slice(buf);
        self.device.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.device.flush()
    }
}

impl Port for Tap {
    fn timeout(&self) -> Duration {
        self.device.timeout()
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.device.set_timeout(timeout)
    }
}

/// Keeps the text of every debug string received
#[derive(Default)]
struct Transcript(Vec<String>);

impl mkiilink::flasher::FrameObserver for Transcript {
    fn observe(&mut self, frame: &Frame) {
        if frame.frame_type.is_debug() {
            self.0.push(frame.text());
        }
    }
}

#[derive(Default)]
struct Recorded {
    init: Vec<(u32, usize)>,
    updates: Vec<usize>,
    finished: usize,
}

impl ProgressCallbacks for Recorded {
    fn init(&mut self, addr: u32, total: usize) {
        self.init.push((addr, total));
    }

    fn update(&mut self, current: usize) {
        self.updates.push(current);
    }

    fn finish(&mut self, _skipped: bool) {
        self.finished += 1;
    }
}

fn flasher(format: WireFormat) -> Flasher<Tap, Transcript> {
    let codec = Codec::from(format);
    let tap = Tap {
        device: SimulatedDevice::new(codec),
        written: Vec::new(),
    };

    Flasher::with_observer(tap, codec, Transcript::default())
        .with_reply_timeout(Duration::from_millis(200))
}

fn finish(flasher: Flasher<Tap, Transcript>) -> (Tap, Transcript) {
    let (connection, transcript) = flasher.into_parts();
    (connection.into_port(), transcript)
}

/// Program commands the host wrote, as (header, data)
fn program_commands(tap: &Tap, codec: Codec) -> Vec<(CommandPacket, Vec<u8>)> {
    let mut state = DecoderState::default();

    codec
        .decode_all(&tap.written, &mut state)
        .into_iter()
        .map(|frame| frame.unwrap())
        .filter(|frame| frame.frame_type == FrameType::BootloaderBinary)
        .filter_map(|frame| {
            let (packet, data) = CommandPacket::parse(&frame.payload).unwrap();
            (packet.command_type() == Some(CommandType::Program)).then(|| (packet, data.to_vec()))
        })
        .collect()
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn image_is_sent_in_padded_chunks() {
    for format in [WireFormat::Stuffed, WireFormat::Esp3] {
        let codec = Codec::from(format);
        let mut flasher = flasher(format);
        let mut progress = Recorded::default();
        let data = image(2 * 256 + 100);

        flasher
            .program(
                Destination::ApplicationProcessor,
                APPLICATION_START_ADDR,
                &data,
                &mut progress,
            )
            .unwrap();

        let (tap, transcript) = finish(flasher);
        let commands = program_commands(&tap, codec);

        assert_eq!(commands.len(), 3);
        for (i, (packet, _)) in commands.iter().enumerate() {
            assert_eq!(packet.arg0, APPLICATION_START_ADDR + 256 * i as u32);
            assert_eq!(packet.is_final(), i == 2);
        }

        let (_, last) = &commands[2];
        assert_eq!(last.len(), 128);
        assert_eq!(&last[..100], &data[512..]);
        assert!(last[100..].iter().all(|b| *b == PAD_BYTE));

        let flash = tap.device.application_processor().flash();
        assert_eq!(flash.read(APPLICATION_START_ADDR, data.len()), &data[..]);

        assert_eq!(progress.init, vec![(APPLICATION_START_ADDR, 3)]);
        assert_eq!(progress.updates, vec![1, 2, 3]);
        assert_eq!(progress.finished, 1);
        assert!(transcript
            .0
            .iter()
            .any(|line| line.starts_with("Programming completed in")));
    }
}

#[test]
fn exact_multiple_marks_the_last_full_chunk_final() {
    let codec = Codec::default();
    let mut flasher = flasher(WireFormat::Stuffed);

    flasher
        .program(
            Destination::ApplicationProcessor,
            APPLICATION_START_ADDR,
            &image(512),
            &mut Recorded::default(),
        )
        .unwrap();

    let (tap, _) = finish(flasher);
    let finals: Vec<bool> = program_commands(&tap, codec)
        .iter()
        .map(|(packet, _)| packet.is_final())
        .collect();

    assert_eq!(finals, vec![false, true]);
}

#[test]
fn bms_image_is_padded_to_its_word_and_storage_erased_once() {
    let codec = Codec::default();
    let mut flasher = flasher(WireFormat::Stuffed);
    let data = image(256 + 100);

    flasher
        .program(
            Destination::BatteryManagementSystem,
            APPLICATION_START_ADDR,
            &data,
            &mut Recorded::default(),
        )
        .unwrap();

    let (tap, transcript) = finish(flasher);
    let commands = program_commands(&tap, codec);

    assert_eq!(commands.len(), 2);
    assert_eq!(commands[1].1.len(), 104);

    let bms = tap.device.battery_management_system();
    assert_eq!(bms.flash().erased_regions(), &[FlashRegion::PROGRAM_BANK2]);
    assert_eq!(bms.flash().read(APPLICATION_START_ADDR, data.len()), &data[..]);
    assert!(transcript.0[0].starts_with("Erase operation took"));
}

#[test]
fn nack_stops_the_transfer() {
    let codec = Codec::default();
    let mut flasher = flasher(WireFormat::Stuffed);
    flasher
        .connection()
        .port_mut()
        .device
        .application_processor_mut()
        .flash_mut()
        .fail_program_at(APPLICATION_START_ADDR + 256);

    let result = flasher.program(
        Destination::ApplicationProcessor,
        APPLICATION_START_ADDR,
        &image(4 * 256),
        &mut Recorded::default(),
    );

    assert!(matches!(result, Err(Error::Nack(CommandType::Program))));

    let (tap, transcript) = finish(flasher);
    assert_eq!(program_commands(&tap, codec).len(), 2);
    assert!(transcript
        .0
        .last()
        .is_some_and(|line| line.starts_with("Program failed at 0x08020500")));
}

#[test]
fn erase_across_banks_is_split() {
    let mut flasher = flasher(WireFormat::Esp3);
    flasher.erase(3, 12, false).unwrap();

    let (tap, transcript) = finish(flasher);
    let flash = tap.device.application_processor().flash();

    assert_eq!(
        flash.erased_regions(),
        &[
            FlashRegion::new(1, 3, 5).unwrap(),
            FlashRegion::new(2, 0, 5).unwrap()
        ]
    );
    assert_eq!(flash.mass_erases(), 0);
    assert!(transcript.0[0].starts_with("Erase operation completed in"));
}

#[test]
fn full_range_is_a_mass_erase() {
    let mut flasher = flasher(WireFormat::Stuffed);
    flasher.erase(0, 15, true).unwrap();

    let (tap, _) = finish(flasher);
    let flash = tap.device.application_processor().flash();

    assert_eq!(flash.mass_erases(), 1);
    assert!(flash.erased_regions().is_empty());
}

#[test]
fn bootloader_sector_is_spared_without_allow_unsafe() {
    let mut flasher = flasher(WireFormat::Stuffed);
    flasher.erase(0, 2, false).unwrap();

    let (tap, _) = finish(flasher);
    assert_eq!(
        tap.device.application_processor().flash().erased_regions(),
        &[FlashRegion::new(1, 1, 2).unwrap()]
    );
}

#[test]
fn boot_writes_the_marker_and_resets() {
    let mut flasher = flasher(WireFormat::Stuffed);
    flasher.boot().unwrap();

    let (tap, transcript) = finish(flasher);
    let ap = tap.device.application_processor();

    assert_eq!(ap.markers().read_boot_marker(), BootMarker::Application);
    assert_eq!(ap.platform().resets(), 1);
    assert_eq!(
        transcript.0,
        vec!["Reset and booting to application at 0x08020400...".to_string()]
    );
}

#[test]
fn plan_runs_in_order() {
    let mut flasher = flasher(WireFormat::Stuffed);
    let plan = Plan {
        erase_start: 1,
        erase_end: 7,
        image: image(300),
        ..Plan::default()
    };

    flasher
        .run(
            CommandSet::HELLO
                | CommandSet::BMS_HELLO
                | CommandSet::ERASE
                | CommandSet::PROGRAM
                | CommandSet::BOOT,
            &plan,
            &mut Recorded::default(),
        )
        .unwrap();

    let (tap, transcript) = finish(flasher);
    let firsts: Vec<&str> = transcript
        .0
        .iter()
        .map(|line| line.split_whitespace().next().unwrap_or_default())
        .collect();

    assert_eq!(
        firsts,
        vec![
            "H7", "CPU", "Device", "SONYC", "Erase", "Programming", "Reset"
        ]
    );
    assert_eq!(
        tap.device.application_processor().flash().erased_regions(),
        &[FlashRegion::PROGRAM_BANK1]
    );
}

#[test]
fn bad_erase_range_is_rejected_before_sending() {
    let mut flasher = flasher(WireFormat::Stuffed);

    assert!(matches!(
        flasher.erase(9, 4, false),
        Err(Error::BadEraseRange { start: 9, end: 4 })
    ));

    let (tap, _) = finish(flasher);
    assert!(tap.written.is_empty());
}

use std::{fs, process::Command};

use assert_cmd::prelude::*;
use mkiilink::{
    codec::{Codec, FrameCodec, WireFormat},
    frame::{Destination, Frame, FrameType},
};

fn stdout_of(cmd: &mut Command) -> String {
    let assert = cmd.assert().success();
    String::from_utf8_lossy(&assert.get_output().stdout).into_owned()
}

#[test]
fn help_lists_the_subcommands() -> Result<(), Box<dyn std::error::Error>> {
    let stdout = stdout_of(Command::cargo_bin("mkiilink")?.arg("--help"));

    for subcommand in ["bootload", "listen", "send-data", "decode", "completions"] {
        assert!(stdout.contains(subcommand), "missing {subcommand}: {stdout}");
    }

    Ok(())
}

#[test]
fn decode_prints_each_frame() -> Result<(), Box<dyn std::error::Error>> {
    let codec = Codec::from(WireFormat::Esp3);
    let mut capture = codec.encode_to_vec(&Frame::new(
        Destination::Base,
        FrameType::DebugString,
        &b"hello\r\n"[..],
    ))?;

    let mut corrupt = codec.encode_to_vec(&Frame::new(
        Destination::Base,
        FrameType::DataString,
        &b"{\"a\":1}"[..],
    ))?;
    corrupt[7] ^= 0x02;
    capture.extend(corrupt);
    capture.extend(codec.encode_to_vec(&Frame::empty(Destination::Base, FrameType::Ack))?);

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("capture.bin");
    fs::write(&path, capture)?;

    let stdout = stdout_of(
        Command::cargo_bin("mkiilink")?
            .arg("decode")
            .arg(&path)
            .args(["--format", "esp3"]),
    );

    assert!(stdout.contains("DebugString for base, 7 bytes: \"hello\""), "{stdout}");
    assert!(stdout.contains("bad CRC, DataString"), "{stdout}");
    assert!(stdout.contains("Ack for base, 0 bytes"), "{stdout}");

    Ok(())
}

#[test]
fn bootload_against_a_simulated_node() -> Result<(), Box<dyn std::error::Error>> {
    let stdout = stdout_of(Command::cargo_bin("mkiilink")?.args([
        "bootload",
        "--simulate",
        "--no-udp",
        "--hello",
        "--bms-hello",
    ]));

    assert!(stdout.contains("H7 Bootloader Compiled"), "{stdout}");
    assert!(stdout.contains("SONYC Mel BMS Compiled"), "{stdout}");

    Ok(())
}

#[test]
fn conflicting_programs_are_refused() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let image = dir.path().join("app.bin");
    fs::write(&image, [0u8; 64])?;

    Command::cargo_bin("mkiilink")?
        .args(["bootload", "--simulate", "--no-udp", "--program"])
        .arg(&image)
        .arg("--program-bms")
        .arg(&image)
        .assert()
        .failure();

    Ok(())
}

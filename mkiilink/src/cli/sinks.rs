//! Destinations for frames received by the host
//!
//! Debug strings go to the console, data strings to a file and a local UDP
//! listener, and audio to a raw capture file.

use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufWriter, Write},
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use comfy_table::{modifiers, presets::UTF8_FULL, Attribute, Cell, Color, Table};
use log::{debug, error, info, warn};
use miette::{IntoDiagnostic, Result, WrapErr};

use super::OutputArgs;
use crate::{
    flasher::FrameObserver,
    frame::{Frame, FrameType},
};

/// Frame and byte counts per frame type
#[derive(Debug, Default, Clone)]
pub struct FrameStats {
    counts: HashMap<FrameType, (usize, usize)>,
    errors: usize,
}

impl FrameStats {
    pub fn record(&mut self, frame: &Frame) {
        let entry = self.counts.entry(frame.frame_type).or_default();
        entry.0 += 1;
        entry.1 += frame.payload.len();
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    /// Frames of `ty` seen so far and their payload bytes
    pub fn get(&self, ty: FrameType) -> (usize, usize) {
        self.counts.get(&ty).copied().unwrap_or_default()
    }

    pub fn frames(&self) -> usize {
        self.counts.values().map(|(frames, _)| frames).sum()
    }

    pub fn errors(&self) -> usize {
        self.errors
    }

    pub fn table(&self) -> Table {
        let mut rows: Vec<_> = self.counts.iter().collect();
        rows.sort_by_key(|(ty, _)| ty.as_u32());

        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(modifiers::UTF8_ROUND_CORNERS)
            .set_header(vec![
                Cell::new("Frame type")
                    .fg(Color::Green)
                    .add_attribute(Attribute::Bold),
                Cell::new("Frames")
                    .fg(Color::Cyan)
                    .add_attribute(Attribute::Bold),
                Cell::new("Bytes")
                    .fg(Color::Yellow)
                    .add_attribute(Attribute::Bold),
            ]);

        for (ty, (frames, bytes)) in rows {
            table.add_row(vec![
                Cell::new(ty).fg(Color::Green),
                Cell::new(frames).fg(Color::Cyan),
                Cell::new(bytes).fg(Color::Yellow),
            ]);
        }

        if self.errors > 0 {
            table.add_row(vec![
                Cell::new("decode errors").fg(Color::Red),
                Cell::new(self.errors).fg(Color::Red),
                Cell::new(""),
            ]);
        }

        table
    }
}

/// Routes each received frame to the outputs selected on the command line
pub struct FrameSinks {
    debug_file: Option<BufWriter<File>>,
    data_file: Option<BufWriter<File>>,
    audio_file: Option<BufWriter<File>>,
    udp: Option<(UdpSocket, SocketAddr)>,
    timestamps: bool,
    stats: FrameStats,
}

fn create(path: Option<&Path>) -> Result<Option<BufWriter<File>>> {
    path.map(|path| {
        File::create(path)
            .map(BufWriter::new)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to create {}", path.display()))
    })
    .transpose()
}

impl FrameSinks {
    /// Open the files in `args` and, given a port, the UDP forward socket.
    pub fn open(args: &OutputArgs, udp_port: Option<u16>) -> Result<Self> {
        let udp = match udp_port {
            Some(port) => {
                let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
                    .into_diagnostic()
                    .wrap_err("Failed to open the UDP forward socket")?;
                Some((socket, SocketAddr::from((Ipv4Addr::LOCALHOST, port))))
            }
            None => None,
        };

        Ok(FrameSinks {
            debug_file: create(args.debug_file.as_deref())?,
            data_file: create(args.data_file.as_deref())?,
            audio_file: create(args.audio_file.as_deref())?,
            udp,
            timestamps: args.timestamps,
            stats: FrameStats::default(),
        })
    }

    /// Sinks which only print debug strings
    pub fn console() -> Self {
        FrameSinks {
            debug_file: None,
            data_file: None,
            audio_file: None,
            udp: None,
            timestamps: false,
            stats: FrameStats::default(),
        }
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    /// Flush every open file.
    pub fn flush(&mut self) -> io::Result<()> {
        for file in [&mut self.debug_file, &mut self.data_file, &mut self.audio_file]
            .into_iter()
            .flatten()
        {
            file.flush()?;
        }

        Ok(())
    }

    fn stamp(&self) -> String {
        if !self.timestamps {
            return String::new();
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        format!("{now}: ")
    }

    fn debug_string(&mut self, frame: &Frame) -> io::Result<()> {
        let stamp = self.stamp();
        let text = String::from_utf8_lossy(&frame.payload);
        let text = text.trim_end_matches('\0');

        let mut stdout = io::stdout().lock();
        write!(stdout, "{stamp}{text}")?;
        stdout.flush()?;

        // BMS output stays on the console
        if frame.frame_type == FrameType::DebugString {
            if let Some(file) = &mut self.debug_file {
                write!(file, "{stamp}{text}")?;
            }
        }

        Ok(())
    }

    fn data_string(&mut self, frame: &Frame) -> io::Result<()> {
        if let Some((socket, target)) = &self.udp {
            if let Err(err) = socket.send_to(&frame.payload, target) {
                debug!("UDP forward to {target} failed: {err}");
            }
        }

        let stamp = self.stamp();
        if let Some(file) = &mut self.debug_file {
            file.write_all(stamp.as_bytes())?;
            file.write_all(&frame.payload)?;
        }

        if let Some(file) = &mut self.data_file {
            file.write_all(&frame.payload)?;
        }

        Ok(())
    }

    fn audio(&mut self, frame: &Frame) -> io::Result<()> {
        if let Some(file) = &mut self.audio_file {
            file.write_all(&frame.payload)?;
        }

        Ok(())
    }
}

impl FrameObserver for FrameSinks {
    fn observe(&mut self, frame: &Frame) {
        self.stats.record(frame);

        if !frame.is_valid() {
            warn!(
                "Received {} frame with bad CRC {:#010x}",
                frame.frame_type, frame.crc
            );
            return;
        }

        let result = match frame.frame_type {
            FrameType::DebugString | FrameType::DebugStringBms => self.debug_string(frame),
            FrameType::DataString => self.data_string(frame),
            FrameType::BinaryAudio => self.audio(frame),
            FrameType::StatsReportV7 => {
                info!("Stats report from {} ({} bytes)", frame.destination, frame.payload.len());
                Ok(())
            }
            other => {
                debug!("No sink for {other} frame ({} bytes)", frame.payload.len());
                Ok(())
            }
        };

        if let Err(err) = result {
            error!("Failed to write {} frame: {err}", frame.frame_type);
        }
    }
}

impl Drop for FrameSinks {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            error!("Failed to flush output files: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::frame::Destination;

    #[test]
    fn stats_count_frames_and_bytes_per_type() {
        let mut stats = FrameStats::default();
        stats.record(&Frame::new(Destination::Base, FrameType::DataString, &b"abc"[..]));
        stats.record(&Frame::new(Destination::Base, FrameType::DataString, &b"de"[..]));
        stats.record(&Frame::empty(Destination::Base, FrameType::Ack));
        stats.record_error();

        assert_eq!(stats.get(FrameType::DataString), (2, 5));
        assert_eq!(stats.get(FrameType::Ack), (1, 0));
        assert_eq!(stats.get(FrameType::Nack), (0, 0));
        assert_eq!(stats.frames(), 3);

        let table = stats.table().to_string();
        assert!(table.contains("DataString"));
        assert!(table.contains("decode errors"));
    }

    #[test]
    fn frames_land_in_their_files() {
        let dir = tempfile::tempdir().unwrap();
        let args = OutputArgs {
            data_file: Some(dir.path().join("data.txt")),
            audio_file: Some(dir.path().join("audio.raw")),
            debug_file: Some(dir.path().join("debug.txt")),
            timestamps: false,
            no_udp: true,
        };

        let mut sinks = FrameSinks::open(&args, None).unwrap();
        sinks.observe(&Frame::new(Destination::Base, FrameType::DebugString, &b"boot\r\n\0"[..]));
        sinks.observe(&Frame::new(Destination::Base, FrameType::DebugStringBms, &b"bms\r\n"[..]));
        sinks.observe(&Frame::new(Destination::Base, FrameType::DataString, &b"{\"t\":1}"[..]));
        sinks.observe(&Frame::new(Destination::Base, FrameType::BinaryAudio, vec![1, 2, 3, 4]));
        drop(sinks);

        assert_eq!(
            fs::read_to_string(dir.path().join("debug.txt")).unwrap(),
            "boot\r\n{\"t\":1}"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("data.txt")).unwrap(),
            "{\"t\":1}"
        );
        assert_eq!(fs::read(dir.path().join("audio.raw")).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn data_strings_are_forwarded_over_udp() {
        let listener = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let args = OutputArgs::default();
        let mut sinks = FrameSinks::open(&args, Some(port)).unwrap();
        sinks.observe(&Frame::new(Destination::Base, FrameType::DataString, &b"{\"db\":42}"[..]));

        let mut buf = [0; 64];
        let len = listener.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"{\"db\":42}");
    }
}

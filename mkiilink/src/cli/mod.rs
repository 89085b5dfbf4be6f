//! Types and functions for the command-line interface
//!
//! No stability guarantees apply

use std::{
    fs,
    io::{self, BufRead},
    path::PathBuf,
    time::Duration,
};

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use miette::{IntoDiagnostic, Result, WrapErr};
use serialport::FlowControl;

use self::{config::Config, serial::get_serial_port_info, sinks::FrameSinks, sinks::FrameStats};
use crate::{
    codec::{Codec, DecodeOutcome, DecoderState, FrameCodec, WireFormat},
    command::CommandSet,
    connection::{Connection, Port},
    error::Error,
    flasher::{Flasher, Plan},
    frame::{Frame, FrameType},
    interface::Interface,
    link::AbortSignal,
    progress::ProgressCallbacks,
    target::SimulatedDevice,
};

pub mod config;
pub mod sinks;

mod serial;

/// Serial read timeout when opening a port
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

const DEFAULT_BAUD: u32 = 115_200;

/// Establish a connection with a target device
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct ConnectArgs {
    /// Serial port connected to the node
    #[arg(short = 'p', long, env = "MKIILINK_PORT")]
    pub port: Option<String>,
    /// Baud rate of the serial port [default: 115200]
    #[arg(short = 'B', long, env = "MKIILINK_BAUD")]
    pub baud: Option<u32>,
    /// Wire format spoken on the link [default: stuffed]
    #[arg(long, value_enum)]
    pub format: Option<WireFormat>,
    /// Local UDP port data strings are forwarded to [default: 61393]
    #[arg(long)]
    pub udp_port: Option<u16>,
    /// Talk to an in-memory node instead of a serial port
    #[arg(long)]
    pub simulate: bool,
}

/// Where received frames are written
#[derive(Debug, Default, Args)]
#[non_exhaustive]
pub struct OutputArgs {
    /// Write data strings to this file
    #[arg(long)]
    pub data_file: Option<PathBuf>,
    /// Write binary audio to this file
    #[arg(long)]
    pub audio_file: Option<PathBuf>,
    /// Write debug and data strings to this file
    #[arg(long)]
    pub debug_file: Option<PathBuf>,
    /// Prefix each line with the Unix time it was received
    #[arg(long)]
    pub timestamps: bool,
    /// Do not forward data strings over UDP
    #[arg(long)]
    pub no_udp: bool,
}

/// Send bootloader commands, then optionally keep listening
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct BootloadArgs {
    /// Ask the application processor bootloader to identify itself
    #[arg(long)]
    pub hello: bool,
    /// Ask the BMS bootloader to identify itself
    #[arg(long)]
    pub bms_hello: bool,
    /// First sector to erase
    #[arg(long, allow_negative_numbers = true)]
    pub erase_start: Option<i64>,
    /// Last sector to erase, -1 for just the first one
    #[arg(long, allow_negative_numbers = true)]
    pub erase_end: Option<i64>,
    /// Binary to write to the application processor
    #[arg(long, conflicts_with = "program_bms")]
    pub program: Option<PathBuf>,
    /// Binary to write to the BMS
    #[arg(long)]
    pub program_bms: Option<PathBuf>,
    /// Address the binary is written to [default: 0x08020400]
    #[arg(long, value_parser = parse_u32)]
    pub program_addr: Option<u32>,
    /// Boot the application once done
    #[arg(long)]
    pub boot: bool,
    /// Allow erasing the bootloader sector
    #[arg(long)]
    pub allow_unsafe: bool,
    /// Keep listening after the commands complete
    #[arg(long)]
    pub listen: bool,

    #[command(flatten)]
    pub connect_args: ConnectArgs,
    #[command(flatten)]
    pub output_args: OutputArgs,
}

/// Receive frames until interrupted
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct ListenArgs {
    #[command(flatten)]
    pub connect_args: ConnectArgs,
    #[command(flatten)]
    pub output_args: OutputArgs,
}

/// Send each line of standard input as a data string
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct SendDataArgs {
    /// Keep listening once standard input is exhausted
    #[arg(long)]
    pub listen: bool,

    #[command(flatten)]
    pub connect_args: ConnectArgs,
    #[command(flatten)]
    pub output_args: OutputArgs,
}

/// Decode a captured byte stream
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct DecodeArgs {
    /// File holding the raw bytes received from a link
    pub file: PathBuf,
    /// Wire format of the capture [default: stuffed]
    #[arg(long, value_enum)]
    pub format: Option<WireFormat>,
}

/// Parse an integer which may be given in hexadecimal
pub fn parse_u32(input: &str) -> Result<u32, std::num::ParseIntError> {
    parse_int::parse(input)
}

/// Progress bar shown while programming
#[derive(Default)]
pub struct MkiilinkProgress {
    pb: Option<ProgressBar>,
}

impl ProgressCallbacks for MkiilinkProgress {
    fn init(&mut self, addr: u32, len: usize) {
        let pb = ProgressBar::new(len as u64)
            .with_message(format!("{addr:#010x}"))
            .with_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] [{bar:40}] {pos:>7}/{len:7} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            );

        self.pb = Some(pb);
    }

    fn update(&mut self, current: usize) {
        if let Some(ref pb) = self.pb {
            pb.set_position(current as u64);
        }
    }

    fn finish(&mut self, skipped: bool) {
        if let Some(ref pb) = self.pb {
            if skipped {
                pb.abandon_with_message("skipped");
            } else {
                pb.finish();
            }
        }
    }
}

/// Set `abort` when the user presses ctrl-c
pub fn abort_on_ctrlc(abort: &AbortSignal) -> Result<()> {
    let abort = abort.clone();
    ctrlc::set_handler(move || abort.abort())
        .into_diagnostic()
        .wrap_err("Failed to install the ctrl-c handler")
}

/// Open the port selected by `args` and the configuration file
pub fn connect(args: &ConnectArgs, config: &Config) -> Result<Connection<Box<dyn Port>>> {
    let codec = Codec::from(args.format.unwrap_or(config.link.format));

    let port: Box<dyn Port> = if args.simulate {
        info!("Using a simulated node");
        Box::new(SimulatedDevice::new(codec))
    } else {
        let port_info = get_serial_port_info(args, config)?;
        let baud = args
            .baud
            .or(config.connection.baudrate)
            .unwrap_or(DEFAULT_BAUD);

        println!("Serial port: '{}'", port_info.port_name);
        let serial_port = serialport::new(&port_info.port_name, baud)
            .flow_control(FlowControl::None)
            .timeout(DEFAULT_TIMEOUT)
            .open()
            .map_err(Error::from)
            .wrap_err_with(|| format!("Failed to open serial port {}", port_info.port_name))?;

        Box::new(Interface::new(serial_port))
    };

    Ok(Connection::with_capacity(
        port,
        codec,
        config.link.max_frame_size,
    ))
}

fn open_sinks(connect_args: &ConnectArgs, output_args: &OutputArgs, config: &Config) -> Result<FrameSinks> {
    let udp_port = if output_args.no_udp {
        None
    } else {
        Some(connect_args.udp_port.unwrap_or(config.forward.udp_port))
    };

    FrameSinks::open(output_args, udp_port)
}

fn print_summary(sinks: &FrameSinks) {
    println!("\nReceived {} frames", sinks.stats().frames());
    println!("{}", sinks.stats().table());
}

/// Collect the commands requested on the command line
pub fn requested_commands(args: &BootloadArgs) -> Result<CommandSet, Error> {
    let mut commands = CommandSet::empty();
    commands.set(CommandSet::HELLO, args.hello);
    commands.set(CommandSet::BMS_HELLO, args.bms_hello);
    commands.set(
        CommandSet::ERASE,
        args.erase_start.is_some() || args.erase_end.is_some(),
    );
    commands.set(CommandSet::PROGRAM, args.program.is_some());
    commands.set(CommandSet::BMS_PROGRAM, args.program_bms.is_some());
    commands.set(CommandSet::BOOT, args.boot);

    commands.validate()
}

fn read_image(path: Option<&PathBuf>) -> Result<Vec<u8>> {
    match path {
        Some(path) => fs::read(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to read {}", path.display())),
        None => Ok(Vec::new()),
    }
}

/// Run the requested bootloader commands
pub fn bootload(args: BootloadArgs, config: &Config) -> Result<()> {
    let commands = requested_commands(&args)?;
    if commands.is_empty() && !args.listen {
        warn!("No commands given, nothing to do");
        return Ok(());
    }

    let plan = Plan {
        erase_start: args.erase_start.unwrap_or(-1),
        erase_end: args.erase_end.unwrap_or(-1),
        allow_unsafe: args.allow_unsafe || config.bootloader.allow_unsafe,
        program_address: args
            .program_addr
            .unwrap_or(config.bootloader.program_address),
        image: read_image(args.program.as_ref())?,
        bms_image: read_image(args.program_bms.as_ref())?,
    };

    let connection = connect(&args.connect_args, config)?;
    let sinks = open_sinks(&args.connect_args, &args.output_args, config)?;

    let abort = AbortSignal::new();
    abort_on_ctrlc(&abort)?;

    let mut flasher = Flasher::from_connection(connection, sinks)
        .with_abort(abort)
        .with_chunk_size(config.bootloader.chunk_size);

    let mut result = flasher.run(commands, &plan, &mut MkiilinkProgress::default());
    if result.is_ok() && args.listen {
        result = flasher.listen();
    }

    print_summary(flasher.observer());
    result?;

    Ok(())
}

/// Print received frames until interrupted
pub fn listen(args: ListenArgs, config: &Config) -> Result<()> {
    let connection = connect(&args.connect_args, config)?;
    let sinks = open_sinks(&args.connect_args, &args.output_args, config)?;

    let abort = AbortSignal::new();
    abort_on_ctrlc(&abort)?;

    let mut flasher = Flasher::from_connection(connection, sinks).with_abort(abort);
    let result = flasher.listen();

    print_summary(flasher.observer());
    result?;

    Ok(())
}

/// Forward standard input to the application processor line by line
pub fn send_data(args: SendDataArgs, config: &Config) -> Result<()> {
    let connection = connect(&args.connect_args, config)?;
    let sinks = open_sinks(&args.connect_args, &args.output_args, config)?;

    let abort = AbortSignal::new();
    abort_on_ctrlc(&abort)?;

    let mut flasher = Flasher::from_connection(connection, sinks).with_abort(abort.clone());

    let mut stdin = io::stdin().lock();
    let mut line = Vec::new();
    while !abort.is_aborted() {
        line.clear();
        let read = stdin.read_until(b'\n', &mut line).into_diagnostic()?;
        if read == 0 {
            break;
        }

        flasher.send_data(&line)?;
    }

    if args.listen {
        flasher.listen()?;
    }

    Ok(())
}

/// One line describing a decoded frame
pub fn describe_frame(frame: &Frame) -> String {
    let mut line = format!(
        "{} for {}, {} bytes",
        frame.frame_type,
        frame.destination,
        frame.payload.len()
    );

    if matches!(
        frame.frame_type,
        FrameType::DebugString | FrameType::DebugStringBms | FrameType::DataString
    ) {
        line.push_str(&format!(": {:?}", frame.text()));
    }

    line
}

/// Decode a capture file, printing one line per frame or error
pub fn decode(args: DecodeArgs, config: &Config) -> Result<()> {
    let data = fs::read(&args.file)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to read {}", args.file.display()))?;

    let codec = Codec::from(args.format.unwrap_or(config.link.format));
    let mut state = DecoderState::new(config.link.max_frame_size);
    let mut stats = FrameStats::default();

    for (i, result) in codec.decode_all(&data, &mut state).into_iter().enumerate() {
        match result {
            Ok(frame) => {
                println!("{i:>5}: {}", describe_frame(&frame));
                stats.record(&frame);
            }
            Err(DecodeOutcome::CrcMismatch(frame)) => {
                println!("{i:>5}: bad CRC, {}", describe_frame(&frame));
                stats.record_error();
            }
            Err(outcome) => {
                println!("{i:>5}: {outcome}");
                stats.record_error();
            }
        }
    }

    if state.buffered() > 0 {
        println!("{} bytes of an unfinished frame at the end", state.buffered());
    }

    println!("{}", stats.table());

    Ok(())
}

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use log::{debug, LevelFilter};
use miette::Result;
use mkiilink::{
    cli::{
        bootload,
        config::Config,
        decode,
        listen,
        send_data,
        BootloadArgs,
        DecodeArgs,
        ListenArgs,
        SendDataArgs,
    },
    logging::initialize_logger,
};

#[derive(Debug, Parser)]
#[command(about, max_term_width = 100, propagate_version = true, version)]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Send bootloader commands to a node
    ///
    /// Commands run in a fixed order: hello, BMS hello, erase, program, BMS
    /// program, boot. Each one waits for the node's ACK before the next is
    /// sent, and a NACK stops the run.
    Bootload(BootloadArgs),
    /// Print and store frames received from a node until interrupted
    Listen(ListenArgs),
    /// Send standard input to the application processor as data strings
    SendData(SendDataArgs),
    /// Decode a file of bytes captured from a link
    Decode(DecodeArgs),
    /// Generate completions for the given shell
    Completions(CompletionsArgs),
}

#[derive(Debug, Args)]
struct CompletionsArgs {
    /// Shell to generate completions for
    shell: Shell,
}

fn main() -> Result<()> {
    miette::set_panic_hook();
    initialize_logger(LevelFilter::Info);

    // Attempt to parse any provided command-line arguments, or print the help
    // message and terminate if the invocation is not correct.
    let args = Cli::parse().subcommand;
    debug!("{:#?}", args);

    // Load any user configuration, if present.
    let config = Config::load()?;

    match args {
        Commands::Bootload(args) => bootload(args, &config),
        Commands::Listen(args) => listen(args, &config),
        Commands::SendData(args) => send_data(args, &config),
        Commands::Decode(args) => decode(args, &config),
        Commands::Completions(args) => {
            clap_complete::generate(
                args.shell,
                &mut Cli::command(),
                "mkiilink",
                &mut std::io::stdout(),
            );
            Ok(())
        }
    }
}

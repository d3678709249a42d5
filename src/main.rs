//! com-poll: drive a single serial channel from the command line.
//!
//!   RUST_LOG=superio_com=debug com-poll poll --port 3 --baud 9600

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use superio_com::adapters::serial_port::SerialPortOpener;
use superio_com::{ComConfig, SerialChannel};

/// Serial channel poller
#[derive(Parser)]
#[command(name = "com-poll")]
#[command(version)]
#[command(about = "Open a COM port, poll it or send a payload")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct PortArgs {
    /// Port number (3 for COM3 or /dev/ttyS3)
    #[arg(short, long)]
    port: u32,

    /// Baud rate
    #[arg(short, long, default_value_t = 9600)]
    baud: u32,

    /// JSON file with the Com* options (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List available serial ports
    List,

    /// Read from a port once per loop interval and log what arrives
    Poll {
        #[command(flatten)]
        port: PortArgs,

        /// Stop after this many reads
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Write a payload to a port
    Send {
        #[command(flatten)]
        port: PortArgs,

        /// Payload; hex digits when --hex is given
        data: String,

        /// Interpret the payload as hex
        #[arg(long)]
        hex: bool,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List => {
            for info in SerialPortOpener::list_ports()? {
                println!("{}\t{}", info.name, info.port_type);
            }
            Ok(())
        }
        Commands::Poll { port, count } => {
            let channel = open_channel(&port)?;
            let mut reads = 0;
            while count.map_or(true, |limit| reads < limit) {
                let data = channel.read()?;
                if !data.is_empty() {
                    log::info!("{} <- {}", channel.key(), to_hex(&data));
                }
                reads += 1;
            }
            channel.close();
            Ok(())
        }
        Commands::Send { port, data, hex } => {
            let payload = if hex {
                from_hex(&data)?
            } else {
                data.into_bytes()
            };
            let channel = open_channel(&port)?;
            let sent = channel.write(&payload)?;
            log::info!("{} -> {sent} bytes", channel.key());
            channel.close();
            Ok(())
        }
    }
}

fn open_channel(args: &PortArgs) -> Result<SerialChannel> {
    let config = match &args.config {
        Some(path) => ComConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ComConfig::default(),
    };

    let channel = SerialChannel::native(args.port, args.baud);
    channel.on_error(|_, port, baud, message| {
        log::error!("Port {port} at {baud} baud failed to open: {message}");
    });
    channel.initialize(&config)?;
    channel
        .open()
        .with_context(|| format!("Failed to open {}", channel.key()))?;
    Ok(channel)
}

fn to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn from_hex(text: &str) -> Result<Vec<u8>> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if !digits.is_ascii() {
        bail!("Hex payload contains non-hex characters");
    }
    if digits.len() % 2 != 0 {
        bail!("Hex payload has an odd number of digits");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("Invalid hex byte '{}'", &digits[i..i + 2]))
        })
        .collect()
}

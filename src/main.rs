// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

// XMODEM-family transfer engine
mod checksum;
mod chunk;
mod container;
mod digest;
mod error;
mod host;
mod link;
mod paths;
mod protocol;
mod receiver;
mod sender;
mod serial;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serialport::{DataBits, Parity, StopBits};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use checksum::ChecksumMode;
use container::{DEFAULT_PACK_BLOCK_SIZE, ZstdCodec};
use host::{HostContext, HostState, NoIdle};
use protocol::TransferConfig;
use serial::{RealSerialPort, TcpTransport, Transport};

#[derive(Parser)]
#[command(name = "xfer")]
#[command(about = "XMODEM-family file transfer with identity packets and compressed containers", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0 or COM1)
    #[arg(short, long, conflicts_with = "connect")]
    port: Option<String>,

    /// Network peer to use instead of a serial port (host:port)
    #[arg(long, value_name = "ADDR")]
    connect: Option<String>,

    /// Baud rate
    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name="BITS")]
    data_bits: u8,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none")]
    parity: String,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name="BITS")]
    stop_bits: u8,

    /// How long to wait for the remote before giving up
    #[arg(long, default_value = "10000", value_name = "MS")]
    timeout_ms: u64,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ChecksumArg {
    /// CRC16-CCITT
    Crc,
    /// 8-bit additive checksum
    Sum,
}

impl From<ChecksumArg> for ChecksumMode {
    fn from(arg: ChecksumArg) -> Self {
        match arg {
            ChecksumArg::Crc => ChecksumMode::Crc16,
            ChecksumArg::Sum => ChecksumMode::Additive,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file to the remote receiver
    Download {
        /// File to send
        file: PathBuf,
    },
    /// Receive a file from the remote sender; names ending in .lz are decompressed
    Upload {
        /// Where to store the file
        file: PathBuf,

        /// Checksum mode to request for data packets
        #[arg(long, value_enum, default_value = "crc")]
        checksum: ChecksumArg,
    },
    /// Build a compressed container from a plain file
    Pack {
        input: PathBuf,
        output: PathBuf,

        /// Plain bytes per compressed block
        #[arg(long, default_value_t = DEFAULT_PACK_BLOCK_SIZE, value_name = "BYTES")]
        block_size: usize,
    },
    /// Decompress a container into a plain file
    Unpack {
        input: PathBuf,
        output: PathBuf,
    },
}

fn parse_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(format!("Invalid data bits: {}. Must be 5, 6, 7, or 8", bits)),
    }
}

fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!("Invalid parity: {}. Must be 'none', 'odd', or 'even'", parity)),
    }
}

fn parse_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(format!("Invalid stop bits: {}. Must be 1 or 2", bits)),
    }
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn open_transport(cli: &Cli) -> Result<Box<dyn Transport>, String> {
    if let Some(addr) = &cli.connect {
        info!("Connecting to {}", addr);
        let transport = TcpTransport::connect(addr)
            .map_err(|e| format!("Failed to connect to {}: {}", addr, e))?;
        return Ok(Box::new(transport));
    }

    let port = cli.port.as_deref().ok_or("Either --port or --connect is required")?;
    let data_bits = parse_data_bits(cli.data_bits)?;
    let parity = parse_parity(&cli.parity)?;
    let stop_bits = parse_stop_bits(cli.stop_bits)?;

    info!("Opening serial port: {}", port);
    info!("Settings: {} baud, {:?}, {:?}, {:?}", cli.baud, data_bits, parity, stop_bits);

    let transport = RealSerialPort::open(port, cli.baud, data_bits, parity, stop_bits)
        .map_err(|e| format!("Failed to open serial port: {}", e))?;
    Ok(Box::new(transport))
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let codec = ZstdCodec::default();

    match &cli.command {
        Commands::Pack { input, output, block_size } => {
            match container::compress_file(input, output, &codec, *block_size) {
                Ok(summary) => println!(
                    "Packed {} bytes into {} blocks ({} bytes)",
                    summary.plain_bytes, summary.blocks, summary.container_bytes
                ),
                Err(e) => fail(e),
            }
            return;
        }
        Commands::Unpack { input, output } => {
            match container::decompress_file(input, output, &codec, &NoIdle) {
                Ok(summary) => println!(
                    "Unpacked {} blocks into {} bytes",
                    summary.blocks, summary.plain_bytes
                ),
                Err(e) => fail(e),
            }
            return;
        }
        Commands::Download { .. } | Commands::Upload { .. } => {}
    }

    let mut transport = open_transport(&cli).unwrap_or_else(|e| fail(e));

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || token.cancel()) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }

    let state = HostState::new();
    let host = HostContext::new(&state).with_cancel(cancel);
    let mut config = TransferConfig {
        timeout: Duration::from_millis(cli.timeout_ms),
        ..Default::default()
    };

    match &cli.command {
        Commands::Download { file } => {
            match sender::download(&host, transport.as_mut(), file, &config) {
                Ok(summary) => println!(
                    "Sent {} ({} bytes, {} packets, {} resends, identity {}{})",
                    file.display(),
                    summary.bytes,
                    summary.packets_sent,
                    summary.resends,
                    summary.identity,
                    if summary.compressed { ", compressed" } else { "" }
                ),
                Err(e) => fail(e),
            }
        }
        Commands::Upload { file, checksum } => {
            config.checksum_mode = (*checksum).into();
            match receiver::upload(&host, transport.as_mut(), file, &config, &codec) {
                Ok(summary) => {
                    println!(
                        "Received {} ({} bytes, {} packets, {} NAKs, identity {})",
                        file.display(),
                        summary.bytes,
                        summary.packets,
                        summary.naks,
                        summary.identity.as_deref().unwrap_or("none")
                    );
                    if let Some(size) = summary.decompressed {
                        println!("Decompressed to {} bytes", size);
                    }
                }
                Err(e) => fail(e),
            }
        }
        Commands::Pack { .. } | Commands::Unpack { .. } => {}
    }
}

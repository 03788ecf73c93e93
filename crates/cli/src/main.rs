mod config;
mod worker;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use lims_protocol::crc::{append_checksum, crc16_value, verify};
use tracing_subscriber::EnvFilter;

use config::{Kind, StationConfig};

/// LIMS device-command relay and station workers.
#[derive(Parser)]
#[command(name = "lims", version, about = "LIMS station relay and workers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the websocket relay hub
    Relay {
        /// Port to listen on
        #[arg(long, default_value = "8000")]
        port: u16,
    },

    /// Run a station worker connected to the relay
    Worker {
        /// Station TOML config
        #[arg(long)]
        config: Option<PathBuf>,
        /// Station kind, overriding the config file
        #[arg(long, value_enum)]
        kind: Option<Kind>,
        /// Relay websocket url, overriding the config file
        #[arg(long)]
        url: Option<String>,
        /// LIMS web API task results are submitted to
        #[arg(long)]
        server_url: Option<String>,
    },

    /// Compute or check the Modbus CRC16 of a hex frame
    Crc {
        /// Frame bytes in hex; whitespace is ignored
        hex: String,
        /// Treat the last two bytes as a checksum and check them
        #[arg(long)]
        verify: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Relay { port } => {
            let rt = runtime();
            if let Err(e) = rt.block_on(lims_relay::start_server(port)) {
                eprintln!("Relay error: {}", e);
                process::exit(1);
            }
        }
        Commands::Worker {
            config,
            kind,
            url,
            server_url,
        } => {
            let mut station = match StationConfig::load(config.as_deref()) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("error: {}", e);
                    process::exit(1);
                }
            };
            station.apply_env(|name| std::env::var(name).ok());
            if let Some(kind) = kind {
                station.station.kind = kind;
            }
            if url.is_some() {
                station.relay.url = url;
            }
            if server_url.is_some() {
                station.storage.task_store_url = server_url;
            }
            let rt = runtime();
            if let Err(e) = rt.block_on(worker::run(station)) {
                eprintln!("Worker error: {}", e);
                process::exit(1);
            }
        }
        Commands::Crc { hex, verify } => cmd_crc(&hex, verify),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("LIMS_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn runtime() -> tokio::runtime::Runtime {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to create tokio runtime: {}", e);
            process::exit(1);
        }
    }
}

fn cmd_crc(input: &str, check: bool) {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = match hex::decode(&cleaned) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("error: invalid hex '{}': {}", input, e);
            process::exit(1);
        }
    };

    if check {
        if verify(&bytes) {
            println!("ok");
        } else {
            println!("checksum mismatch");
            process::exit(1);
        }
        return;
    }

    println!("crc:   0x{:04X}", crc16_value(&bytes));
    println!("frame: {}", hex::encode_upper(append_checksum(&bytes)));
}

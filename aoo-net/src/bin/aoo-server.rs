//! Standalone rendezvous server.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use aoo_net::{Server, ServerOptions, DEFAULT_SERVER_PORT};

#[derive(Parser)]
#[command(
    name = "aoo-server",
    version,
    disable_version_flag = true,
    about = "Rendezvous server for audio-over-OSC peers"
)]
struct Cli {
    /// Port to listen on (TCP and UDP)
    #[arg(default_value_t = DEFAULT_SERVER_PORT)]
    port: u16,

    /// Enable server-side relay
    #[arg(short, long)]
    relay: bool,

    /// Log level: 0 = off, 1 = error, 2 = warn, 3 = info, 4 = debug
    #[arg(short = 'l', long = "log-level", default_value_t = 3)]
    log_level: u8,

    /// Print version and exit
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.log_level {
        0 => "off",
        1 => "error",
        2 => "warn",
        3 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .init();

    let mut server = match Server::new(cli.port, ServerOptions { relay: cli.relay }) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("couldn't start server on port {}: {}", cli.port, err);
            return ExitCode::FAILURE;
        }
    };

    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("server error: {err}");
            ExitCode::FAILURE
        }
    }
}

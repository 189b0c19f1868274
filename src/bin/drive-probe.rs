//! Hardware probe for the window drive.
//!
//! Usage:
//!   cargo run --bin drive-probe -- serial /dev/ttyUSB0
//!   cargo run --bin drive-probe -- telnet 10.0.0.30
//!
//! Connects once, prints the drive's identity and current state, and
//! disconnects. Useful for checking cabling and bridge settings before
//! pointing the full bridge at a drive.

use clap::{Parser, Subcommand};

use window_cover_bridge::device::{
    DeviceSession, DriveTiming, SerialTransport, TelnetTransport, Transport, WindowDrive,
};

#[derive(Parser)]
#[command(name = "drive-probe")]
#[command(about = "Probe a window drive and print its identity and state")]
struct Cli {
    #[command(subcommand)]
    connection: Connection,
}

#[derive(Subcommand)]
enum Connection {
    /// Probe a drive on a local serial port
    Serial {
        /// Serial device path
        #[arg(env = "SERIAL_PORT")]
        path: String,
    },
    /// Probe a drive behind an RS-232 to Ethernet bridge
    Telnet {
        /// Host name or address of the bridge
        #[arg(env = "TELNET_HOST")]
        host: String,

        /// TCP port of the bridge
        #[arg(long, env = "TELNET_PORT", default_value_t = 23)]
        port: u16,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let transport: Box<dyn Transport> = match cli.connection {
        Connection::Serial { path } => Box::new(SerialTransport::new(path)),
        Connection::Telnet { host, port } => Box::new(TelnetTransport::new(host, port)),
    };
    let endpoint = transport.describe();
    let mut drive = WindowDrive::new(transport, DriveTiming::default());

    match drive.connect() {
        Ok(true) => {}
        Ok(false) => {
            eprintln!("No answer from {endpoint}");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Failed to connect to {endpoint}: {e}");
            std::process::exit(1);
        }
    }

    let info = drive.info();
    let (status, position) = drive.status();
    println!("Device on {endpoint} is available");
    if let Some(info) = info {
        println!("  Device:   {}", info.device);
        println!("  Firmware: {}", info.version);
    }
    println!("  Status:   {status}");
    match position {
        Some(position) => println!("  Position: {position}%"),
        None => println!("  Position: unknown"),
    }
    drive.disconnect();
}

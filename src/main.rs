//! BleMidi GW - Bluetooth LE MIDI gateway
//!
//! Relays MIDI input from a Bluetooth LE peripheral to a local MIDI output.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use blemidi_gw::ble::{self, parse_address};
use blemidi_gw::midi_out::{self, MidiSink};
use blemidi_gw::scanner;
use blemidi_gw::session::DeviceSession;

/// BleMidi Gateway - relay Bluetooth LE MIDI devices to local MIDI outputs
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan for bluetooth MIDI devices
    Scan {
        /// The number of seconds that the scanner runs
        #[arg(short, long, default_value_t = 15)]
        timeout: u64,

        /// Also show non-MIDI bluetooth devices
        #[arg(long)]
        show_non_midi: bool,
    },

    /// Monitor input from a bluetooth MIDI device
    Monitor {
        /// The device's bluetooth address
        #[arg(short, long)]
        address: String,
    },

    /// List all local MIDI devices
    ListMidi,

    /// Forward bluetooth MIDI input to a local output
    Forward {
        /// The source device's bluetooth address
        #[arg(short, long)]
        source: String,

        /// Name of the destination MIDI output
        #[arg(short, long)]
        dest: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_logging(&args.log_level)?;

    match args.command {
        Command::Scan {
            timeout,
            show_non_midi,
        } => {
            let adapter = ble::default_adapter().await?;
            scanner::run_scan(&adapter, Duration::from_secs(timeout), show_non_midi).await?;
        }
        Command::Monitor { address } => monitor(&address).await?,
        Command::ListMidi => midi_out::list_ports()?,
        Command::Forward { source, dest } => forward(&source, &dest).await?,
    }

    Ok(())
}

/// Connect and pretty-print every decoded event until disconnect or Ctrl+C.
async fn monitor(address: &str) -> Result<()> {
    let address = parse_address(address)?;
    let adapter = ble::default_adapter().await?;
    let mut session = DeviceSession::new(adapter, address);

    session.on_channel_event(|event| println!("{event}"));
    session.on_sysex_event(|event| {
        let hex: String = event.data.iter().map(|b| format!(" {b:02X}")).collect();
        println!("SysEx message:{hex}");
    });

    session.connect().await?;
    info!("device connected");
    run_until_disconnect(&mut session).await
}

/// Connect and forward decoded events to the named local MIDI output.
async fn forward(source: &str, dest: &str) -> Result<()> {
    let address = parse_address(source)?;
    let sink = MidiSink::open_by_name(dest)?;
    info!("opened MIDI output '{}'", sink.port_name());
    let sink = Arc::new(Mutex::new(sink));

    let adapter = ble::default_adapter().await?;
    let mut session = DeviceSession::new(adapter, address);

    {
        let sink = Arc::clone(&sink);
        session.on_channel_event(move |event| {
            if let Err(err) = sink.lock().send_channel(event) {
                warn!("{err:#}");
            }
        });
    }
    {
        let sink = Arc::clone(&sink);
        session.on_sysex_event(move |event| {
            if let Err(err) = sink.lock().send_sysex(event) {
                warn!("{err:#}");
            }
        });
    }

    session.connect().await?;
    info!("devices connected, forwarding MIDI messages...");
    run_until_disconnect(&mut session).await
}

/// Block on the session's disconnect wait, racing it against Ctrl+C;
/// whichever finishes first wins and the session is torn down.
async fn run_until_disconnect(session: &mut DeviceSession) -> Result<()> {
    tokio::select! {
        _ = session.wait_until_disconnected() => {
            info!("device disconnected");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C pressed, stopping...");
        }
    }
    session.dispose().await;
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .init();

    Ok(())
}

//! Local MIDI output sink
//!
//! Thin wrapper over the platform MIDI driver: port listing, find-by-name,
//! and translation of decoded BLE-MIDI events into the local wire format.

use anyhow::{anyhow, Context, Result};
use colored::Colorize;
use midir::{MidiInput, MidiOutput, MidiOutputConnection};
use tracing::{debug, warn};

use crate::codec::{SYSEX_END, SYSEX_START};
use crate::decoder::{ChannelEvent, SysexEvent};

/// One open local MIDI output port.
pub struct MidiSink {
    conn: MidiOutputConnection,
    port_name: String,
}

impl MidiSink {
    /// Open the first output port whose name contains `pattern`
    /// (case-insensitive substring match).
    pub fn open_by_name(pattern: &str) -> Result<Self> {
        let midi_out = MidiOutput::new("blemidi-gw-output").context("Failed to create MIDI output")?;
        let wanted = pattern.to_lowercase();
        for port in midi_out.ports() {
            let Ok(name) = midi_out.port_name(&port) else {
                continue;
            };
            if name.to_lowercase().contains(&wanted) {
                let conn = midi_out
                    .connect(&port, "blemidi-gw")
                    .map_err(|e| anyhow!("Failed to connect to output port: {e}"))?;
                return Ok(Self {
                    conn,
                    port_name: name,
                });
            }
        }
        Err(anyhow!("Cannot find MIDI output '{pattern}'"))
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Send one decoded channel voice event. The status nibble selects the
    /// message kind; unsupported kinds are logged and dropped.
    pub fn send_channel(&mut self, event: &ChannelEvent) -> Result<()> {
        let Some(bytes) = encode_channel(event) else {
            warn!("ignoring unknown MIDI event 0x{:02X}", event.status);
            return Ok(());
        };
        self.conn
            .send(&bytes)
            .context("Failed to send MIDI message")?;
        debug!("sent {event}");
        Ok(())
    }

    /// Send one decoded SysEx event, re-framed with start/end markers.
    pub fn send_sysex(&mut self, event: &SysexEvent) -> Result<()> {
        let mut bytes = Vec::with_capacity(event.data.len() + 2);
        bytes.push(SYSEX_START);
        bytes.extend_from_slice(&event.data);
        bytes.push(SYSEX_END);
        self.conn
            .send(&bytes)
            .context("Failed to send SysEx message")?;
        debug!("sent SysEx ({} bytes)", event.data.len());
        Ok(())
    }
}

/// Wire bytes for the statuses the sink supports: note off/on, control
/// change, pitch bend.
fn encode_channel(event: &ChannelEvent) -> Option<[u8; 3]> {
    match event.status & 0xF0 {
        0x80 | 0x90 | 0xB0 | 0xE0 => {
            Some([event.status, event.data0 & 0x7F, event.data1 & 0x7F])
        }
        _ => None,
    }
}

/// Print all local MIDI input and output ports.
pub fn list_ports() -> Result<()> {
    let midi_in = MidiInput::new("blemidi-gw-scanner").context("Failed to create MIDI input")?;
    println!("{}", "----- MIDI in -----".bold());
    for (index, port) in midi_in.ports().iter().enumerate() {
        if let Ok(name) = midi_in.port_name(port) {
            println!("#{index}: {name}");
        }
    }
    println!();

    let midi_out = MidiOutput::new("blemidi-gw-scanner").context("Failed to create MIDI output")?;
    println!("{}", "----- MIDI out -----".bold());
    for (index, port) in midi_out.ports().iter().enumerate() {
        if let Ok(name) = midi_out.port_name(port) {
            println!("#{index}: {name}");
        }
    }
    println!();

    Ok(())
}

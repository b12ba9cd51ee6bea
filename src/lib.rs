//! Bluetooth LE MIDI gateway
//!
//! Bridges a BLE-MIDI peripheral to a local MIDI output: the packet decoder
//! reconstructs timestamped, running-status MIDI events from notification
//! payloads, and the device session manages discovery-assisted connection,
//! subscription and disconnect detection around it.

pub mod ble;
pub mod codec;
pub mod decoder;
pub mod midi_out;
pub mod scanner;
pub mod session;

pub use decoder::{ChannelEvent, DecodedEvent, PacketError, SysexEvent};
pub use session::{ConnectError, DeviceSession, SessionState};

//! BLE-MIDI packet decoder
//!
//! Consumes one complete notification payload and emits the decoded events in
//! order through a caller-supplied callback. Running status carries forward
//! only within a packet; any decode error aborts the current packet and
//! leaves earlier events delivered.

use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::codec::{self, DecoderCursor, SYSEX_END, SYSEX_START};

/// A decoded MIDI channel voice message with its reconstructed timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEvent {
    /// 13-bit BLE-MIDI timestamp (0..=8191), in milliseconds modulo 8192.
    pub timestamp: u16,
    pub status: u8,
    pub data0: u8,
    pub data1: u8,
}

impl ChannelEvent {
    /// Zero-based MIDI channel.
    pub fn channel(&self) -> u8 {
        self.status & 0x0F
    }
}

impl fmt::Display for ChannelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channel = self.channel() + 1;
        match self.status & 0xF0 {
            0x80 | 0x90 => {
                let action = if self.status & 0x10 != 0 { "on" } else { "off" };
                write!(
                    f,
                    "Channel {} note {}, note {}, velocity {}",
                    channel, action, self.data0, self.data1
                )
            }
            0xB0 => write!(
                f,
                "Channel {} control change: {} -> {}",
                channel, self.data0, self.data1
            ),
            0xE0 => {
                let pitch = self.data0 as u16 | (self.data1 as u16) << 7;
                let semitones = pitch as f64 / 4096.0 - 2.0;
                write!(
                    f,
                    "Channel {} pitch bend change: {:+.2} semitones",
                    channel, semitones
                )
            }
            _ => write!(f, "Unknown MIDI event 0x{:02X}", self.status),
        }
    }
}

/// A decoded System Exclusive message. Produced atomically per packet; the
/// payload holds 7-bit bytes only, terminator excluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysexEvent {
    pub timestamp: u16,
    pub data: Vec<u8>,
}

/// One event emitted by [`decode_packet`], in payload byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedEvent {
    Channel(ChannelEvent),
    Sysex(SysexEvent),
}

/// Packet-local decode failures. None of these are fatal to the session: the
/// offending packet is dropped and the next one starts from a fresh cursor.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    #[error("bad header byte")]
    BadHeader,
    #[error("missing timestamp byte before first message")]
    MissingTimestamp,
    #[error("data bytes before any status byte")]
    MissingStatus,
    #[error("short read (after timestamp byte)")]
    ShortRead,
    #[error("shortened MIDI message")]
    TruncatedMessage,
    #[error("malformed MIDI message")]
    MalformedMessage,
    #[error("malformed SysEx (no terminator)")]
    UnterminatedSysex,
    #[error("SysEx across multiple packets is unsupported")]
    SysexAcrossPackets,
}

impl PacketError {
    /// Capability limits are expected against real peripherals and are logged
    /// more quietly than outright framing corruption.
    pub fn is_capability_limit(self) -> bool {
        matches!(self, PacketError::SysexAcrossPackets)
    }
}

/// Decode one notification payload, invoking `emit` for each event in order.
///
/// On error, events already emitted stay emitted; decoding of this packet
/// stops and no state is kept for the next one.
pub fn decode_packet(
    payload: &[u8],
    mut emit: impl FnMut(DecodedEvent),
) -> Result<(), PacketError> {
    let high_bits = codec::header_timestamp_high(payload).ok_or(PacketError::BadHeader)?;
    let mut cursor = DecoderCursor::new(high_bits);
    let mut timestamp: u16 = 0;

    while cursor.position < payload.len() {
        // Optional low timestamp byte, then optional status byte. Any byte
        // with the high bit set at the start of a message is a candidate
        // timestamp byte first.
        let mut has_timestamp_byte = false;
        if codec::is_status_byte(payload[cursor.position]) {
            timestamp = codec::combine_timestamp(cursor.high_timestamp_bits, payload[cursor.position]);
            has_timestamp_byte = true;
            cursor.position += 1;
            if cursor.position >= payload.len() {
                return Err(PacketError::ShortRead);
            }
        }
        if codec::is_status_byte(payload[cursor.position]) {
            cursor.running_status = payload[cursor.position];
            cursor.position += 1;
        }

        if !cursor.seen_first_message && !has_timestamp_byte {
            return Err(PacketError::MissingTimestamp);
        }
        if cursor.running_status == 0 {
            return Err(PacketError::MissingStatus);
        }

        if cursor.running_status == SYSEX_START {
            let start = cursor.position;
            while cursor.position < payload.len()
                && !codec::is_status_byte(payload[cursor.position])
            {
                cursor.position += 1;
            }
            if cursor.position >= payload.len() {
                return Err(PacketError::SysexAcrossPackets);
            }
            if payload[cursor.position] != SYSEX_END {
                return Err(PacketError::UnterminatedSysex);
            }
            emit(DecodedEvent::Sysex(SysexEvent {
                timestamp,
                data: payload[start..cursor.position].to_vec(),
            }));
            cursor.position += 1;
            cursor.seen_first_message = true;
            continue;
        }

        if cursor.position >= payload.len() || codec::is_status_byte(payload[cursor.position]) {
            // System Common / Real-Time message: no data bytes follow in this
            // grammar. The cursor stays put; the next iteration consumes the
            // pending high-bit byte as a timestamp byte, so the loop always
            // advances.
            debug!(
                "system common / RT message received (status 0x{:02X})",
                cursor.running_status
            );
            continue;
        }

        if cursor.position + 2 > payload.len() {
            return Err(PacketError::TruncatedMessage);
        }
        let data0 = payload[cursor.position];
        let data1 = payload[cursor.position + 1];
        if codec::is_status_byte(data0) || codec::is_status_byte(data1) {
            return Err(PacketError::MalformedMessage);
        }
        emit(DecodedEvent::Channel(ChannelEvent {
            timestamp,
            status: cursor.running_status,
            data0,
            data1,
        }));
        cursor.position += 2;
        cursor.seen_first_message = true;
    }

    Ok(())
}

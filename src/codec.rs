//! BLE-MIDI timestamp/status codec
//!
//! Pure byte-level helpers shared by the packet decoder: header validation,
//! 13-bit timestamp reconstruction, and status-byte classification. Nothing
//! here holds state across calls.

/// MIDI System Exclusive start status.
pub const SYSEX_START: u8 = 0xF0;

/// MIDI System Exclusive end marker.
pub const SYSEX_END: u8 = 0xF7;

/// Largest value representable in BLE-MIDI's 13-bit timestamp field.
pub const TIMESTAMP_MAX: u16 = 0x1FFF;

/// True for any byte with the MIDI status bit (bit 7) set.
#[inline]
pub fn is_status_byte(byte: u8) -> bool {
    byte & 0x80 != 0
}

/// Validate the two-byte packet header and extract the high six timestamp
/// bits, pre-shifted into their final position.
///
/// Byte 0 must carry the `0b10` header tag in its two most significant bits,
/// and byte 1 must itself be a timestamp byte (high bit set) - it belongs to
/// the packet's first message. Returns `None` when the payload is shorter
/// than a header or either check fails.
pub fn header_timestamp_high(payload: &[u8]) -> Option<u16> {
    match payload {
        [b0, b1, ..] if *b0 >> 6 == 0b10 && is_status_byte(*b1) => {
            Some(((*b0 as u16) & 0x3F) << 7)
        }
        _ => None,
    }
}

/// Combine the header's high bits with a per-message low timestamp byte into
/// the full 13-bit timestamp.
#[inline]
pub fn combine_timestamp(high_bits: u16, low_byte: u8) -> u16 {
    high_bits | (low_byte & 0x7F) as u16
}

/// Per-packet decode position.
///
/// Reset for every notification payload: running status and timestamp context
/// never survive across packets, since each packet re-establishes the high
/// timestamp bits in its own header.
#[derive(Debug, Clone, Copy)]
pub struct DecoderCursor {
    /// Index of the next unconsumed payload byte.
    pub position: usize,
    /// Status carried forward within this packet; `0` until the packet's
    /// first explicit status byte is seen.
    pub running_status: u8,
    /// High six timestamp bits from the header, pre-shifted.
    pub high_timestamp_bits: u16,
    /// Whether at least one message has been emitted from this packet.
    pub seen_first_message: bool,
}

impl DecoderCursor {
    /// Cursor positioned just past the header byte; byte 1 is the first
    /// message's timestamp byte and is consumed by the decode loop.
    pub fn new(high_timestamp_bits: u16) -> Self {
        Self {
            position: 1,
            running_status: 0,
            high_timestamp_bits,
            seen_first_message: false,
        }
    }
}

//! BLE-MIDI GATT constants and Bluetooth plumbing shared by the scanner and
//! the device session.

use anyhow::{Context, Result};
use btleplug::api::{BDAddr, Manager as _};
use btleplug::platform::{Adapter, Manager};
use thiserror::Error;
use uuid::Uuid;

/// MIDI over Bluetooth LE service UUID.
pub const MIDI_SERVICE: Uuid = Uuid::from_u128(0x03B8_0E5A_EDE8_4B33_A751_6CE3_4EC4_C700);

/// The service's single MIDI data I/O characteristic (write / notify).
pub const MIDI_DATA_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x7772_E5DB_3868_4112_A1A9_F266_9D10_6BF3);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("malformed device address '{0}': expected 12 hex digits or aa:bb:cc:dd:ee:ff")]
    Malformed(String),
}

/// Parse a Bluetooth device address given either as 12 bare hex digits or in
/// the colon-separated form.
pub fn parse_address(input: &str) -> Result<BDAddr, AddressParseError> {
    let parsed = if input.contains(':') {
        BDAddr::from_str_delim(input)
    } else {
        BDAddr::from_str_no_delim(input)
    };
    parsed.map_err(|_| AddressParseError::Malformed(input.to_string()))
}

/// Open the platform Bluetooth manager and return the first adapter.
pub async fn default_adapter() -> Result<Adapter> {
    let manager = Manager::new()
        .await
        .context("Failed to open bluetooth manager")?;
    let adapters = manager
        .adapters()
        .await
        .context("Failed to enumerate bluetooth adapters")?;
    adapters.into_iter().next().context("No bluetooth adapter found")
}

//! BLE advertisement scanner
//!
//! Deduplicates advertisement sightings per device address, optionally
//! filtering for the MIDI service. Used by the `scan` verb for console
//! listing and, in a narrowly-filtered form, as the session's reconnection
//! aid.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use btleplug::api::{BDAddr, Central, CentralEvent, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Peripheral, PeripheralId};
use colored::Colorize;
use tokio_stream::StreamExt;
use tracing::debug;
use uuid::Uuid;

use crate::ble::MIDI_SERVICE;

/// Everything known about one advertising device, accreted across sightings.
#[derive(Debug, Default)]
struct ScanRecord {
    local_name: Option<String>,
    has_midi_service: bool,
    reported: bool,
}

/// A device that qualified for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub address: BDAddr,
    pub local_name: Option<String>,
}

/// Advertisement dedup/filter core. The discovered map belongs to exactly one
/// scan run and is dropped with it.
pub struct Scanner {
    discovered: HashMap<BDAddr, ScanRecord>,
    show_all: bool,
}

impl Scanner {
    pub fn new(show_all: bool) -> Self {
        Self {
            discovered: HashMap::new(),
            show_all,
        }
    }

    /// Record one advertisement sighting. Sightings may carry no name; the
    /// MIDI-service flag is monotonic and never unset. Returns a report the
    /// first time a device has both a name and a qualifying service (or
    /// show-all is enabled), and never twice for the same address.
    pub fn observe(
        &mut self,
        address: BDAddr,
        local_name: Option<&str>,
        services: &[Uuid],
    ) -> Option<ScanReport> {
        let record = self.discovered.entry(address).or_default();

        if let Some(name) = local_name {
            if !name.is_empty() {
                record.local_name = Some(name.to_string());
            }
        }
        if services.contains(&MIDI_SERVICE) {
            record.has_midi_service = true;
        }

        if !record.reported
            && record.local_name.is_some()
            && (record.has_midi_service || self.show_all)
        {
            record.reported = true;
            return Some(ScanReport {
                address,
                local_name: record.local_name.clone(),
            });
        }
        None
    }

    /// End-of-scan sweep: qualifying devices that never advertised a name,
    /// reported under their address alone.
    pub fn finish(self) -> Vec<ScanReport> {
        let show_all = self.show_all;
        let mut leftovers: Vec<ScanReport> = self
            .discovered
            .into_iter()
            .filter(|(_, record)| !record.reported && (record.has_midi_service || show_all))
            .map(|(address, _)| ScanReport {
                address,
                local_name: None,
            })
            .collect();
        leftovers.sort_by_key(|report| report.address);
        leftovers
    }
}

/// Run an advertisement scan for `duration`, printing devices as they
/// qualify and sweeping unnamed ones at the end.
pub async fn run_scan(adapter: &Adapter, duration: Duration, show_all: bool) -> Result<()> {
    let mut scanner = Scanner::new(show_all);
    let mut events = adapter
        .events()
        .await
        .context("Failed to subscribe to adapter events")?;
    adapter
        .start_scan(ScanFilter::default())
        .await
        .context("Failed to start advertisement scan")?;

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.next() => {
                let Some(event) = event else { break };
                let (CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)) = event
                else {
                    continue;
                };
                match sighting(adapter, &id).await {
                    Ok(Some((address, local_name, services))) => {
                        if let Some(report) =
                            scanner.observe(address, local_name.as_deref(), &services)
                        {
                            print_report(&report);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => debug!("failed to read advertisement properties: {err}"),
                }
            }
        }
    }

    if let Err(err) = adapter.stop_scan().await {
        debug!("failed to stop scan: {err}");
    }
    for report in scanner.finish() {
        print_report(&report);
    }
    println!("Scanner stopped.");
    Ok(())
}

/// Wait up to `wait` for an advertisement from `address` and hand back the
/// matching peripheral. A fresh, MIDI-service-filtered watch per call; state
/// is never shared with the console scan.
pub async fn discover_address(
    adapter: &Adapter,
    address: BDAddr,
    wait: Duration,
) -> Result<Option<Peripheral>, btleplug::Error> {
    let mut events = adapter.events().await?;
    adapter
        .start_scan(ScanFilter {
            services: vec![MIDI_SERVICE],
        })
        .await?;

    let found = tokio::time::timeout(wait, async {
        while let Some(event) = events.next().await {
            let (CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)) = event
            else {
                continue;
            };
            if let Ok(peripheral) = adapter.peripheral(&id).await {
                if peripheral.address() == address {
                    return Some(peripheral);
                }
            }
        }
        None
    })
    .await
    .unwrap_or(None);

    if let Err(err) = adapter.stop_scan().await {
        debug!("failed to stop rediscovery scan: {err}");
    }
    Ok(found)
}

async fn sighting(
    adapter: &Adapter,
    id: &PeripheralId,
) -> Result<Option<(BDAddr, Option<String>, Vec<Uuid>)>, btleplug::Error> {
    let peripheral = adapter.peripheral(id).await?;
    let Some(properties) = peripheral.properties().await? else {
        return Ok(None);
    };
    Ok(Some((
        properties.address,
        properties.local_name,
        properties.services,
    )))
}

fn print_report(report: &ScanReport) {
    match &report.local_name {
        Some(name) => println!("Found device: {} (at {})", name.green(), report.address),
        None => println!("Found device with no name at {}", report.address),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> BDAddr {
        BDAddr::from([0xE4, 0xB3, 0x18, 0x8C, 0x3D, last])
    }

    #[test]
    fn reports_each_device_at_most_once() {
        let mut scanner = Scanner::new(false);
        let first = scanner.observe(addr(1), Some("Piano"), &[MIDI_SERVICE]);
        assert_eq!(
            first,
            Some(ScanReport {
                address: addr(1),
                local_name: Some("Piano".to_string()),
            })
        );
        assert_eq!(scanner.observe(addr(1), Some("Piano"), &[MIDI_SERVICE]), None);
    }

    #[test]
    fn waits_for_both_name_and_service() {
        let mut scanner = Scanner::new(false);
        // Name only: no report yet
        assert_eq!(scanner.observe(addr(1), Some("Piano"), &[]), None);
        // Service only in a later nameless sighting: flag accretes, report fires
        let report = scanner.observe(addr(1), None, &[MIDI_SERVICE]);
        assert_eq!(
            report.and_then(|r| r.local_name),
            Some("Piano".to_string())
        );
    }

    #[test]
    fn service_flag_is_monotonic() {
        let mut scanner = Scanner::new(false);
        assert_eq!(scanner.observe(addr(1), None, &[MIDI_SERVICE]), None);
        // Sightings without the service list keep the earlier flag
        assert!(scanner.observe(addr(1), Some("Piano"), &[]).is_some());
    }

    #[test]
    fn non_midi_devices_hidden_unless_show_all() {
        let mut filtered = Scanner::new(false);
        assert_eq!(filtered.observe(addr(1), Some("Headphones"), &[]), None);
        assert!(filtered.finish().is_empty());

        let mut show_all = Scanner::new(true);
        assert!(show_all.observe(addr(1), Some("Headphones"), &[]).is_some());
    }

    #[test]
    fn sweep_reports_qualifying_nameless_devices() {
        let mut scanner = Scanner::new(false);
        scanner.observe(addr(2), None, &[MIDI_SERVICE]);
        scanner.observe(addr(1), None, &[MIDI_SERVICE]);
        scanner.observe(addr(3), None, &[]);
        let leftovers = scanner.finish();
        assert_eq!(
            leftovers,
            vec![
                ScanReport { address: addr(1), local_name: None },
                ScanReport { address: addr(2), local_name: None },
            ]
        );
    }

    #[test]
    fn empty_names_do_not_count() {
        let mut scanner = Scanner::new(false);
        assert_eq!(scanner.observe(addr(1), Some(""), &[MIDI_SERVICE]), None);
        assert!(scanner.observe(addr(1), Some("Piano"), &[]).is_some());
    }
}

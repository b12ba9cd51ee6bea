//! BLE-MIDI device session
//!
//! Owns the lifecycle of one BLE-MIDI peripheral connection: connect (with a
//! single scan-assisted rediscovery fallback), exactly-one service and
//! characteristic discovery, notification subscription, serialized decode and
//! fan-out to listeners, disconnect detection, and idempotent teardown.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Peripheral as _, ValueNotification,
};
use btleplug::platform::{Adapter, Peripheral, PeripheralId};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::{MIDI_DATA_CHARACTERISTIC, MIDI_SERVICE};
use crate::decoder::{self, ChannelEvent, DecodedEvent, SysexEvent};
use crate::scanner;

/// Ceiling on the scan-assisted rediscovery wait during `connect`.
const REDISCOVERY_WAIT: Duration = Duration::from_secs(15);

/// Session lifecycle states. Listeners receive events only while `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingRediscovery,
    Connecting,
    DiscoveringService,
    DiscoveringCharacteristic,
    Subscribing,
    Active,
    Disconnected,
}

/// Connect-sequence failures. All are terminal for the attempt; intermediate
/// handles are released before any of these is returned.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("device {0} not found, even after rediscovery")]
    NotFound(BDAddr),
    #[error("expected exactly one MIDI service on target device, found {0}")]
    ServiceDiscovery(usize),
    #[error("expected exactly one MIDI data I/O characteristic, found {0}")]
    CharacteristicDiscovery(usize),
    #[error(transparent)]
    Ble(#[from] btleplug::Error),
}

type ChannelListener = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;
type SysexListener = Arc<dyn Fn(&SysexEvent) + Send + Sync>;

/// Decodes notification payloads and fans decoded events out to registered
/// listeners, in packet arrival order. Dispatch is serialized by the single
/// pump task; a panicking listener is caught and logged so decoding of later
/// events and packets continues.
#[derive(Default)]
pub struct EventDispatcher {
    channel: Mutex<Vec<ChannelListener>>,
    sysex: Mutex<Vec<SysexListener>>,
}

impl EventDispatcher {
    fn add_channel_listener(&self, listener: ChannelListener) {
        self.channel.lock().push(listener);
    }

    fn add_sysex_listener(&self, listener: SysexListener) {
        self.sysex.lock().push(listener);
    }

    fn clear(&self) {
        self.channel.lock().clear();
        self.sysex.lock().clear();
    }

    /// Decode one notification payload and forward each event. Packet-local
    /// errors are logged and drop only the rest of that packet.
    pub fn dispatch_packet(&self, payload: &[u8]) {
        let result = decoder::decode_packet(payload, |event| match event {
            DecodedEvent::Channel(event) => {
                for listener in self.channel.lock().clone() {
                    if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                        warn!("channel event listener panicked, continuing");
                    }
                }
            }
            DecodedEvent::Sysex(event) => {
                for listener in self.sysex.lock().clone() {
                    if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                        warn!("sysex event listener panicked, continuing");
                    }
                }
            }
        });
        if let Err(err) = result {
            if err.is_capability_limit() {
                debug!("dropping packet: {err}");
            } else {
                warn!("dropping packet: {err}");
            }
        }
    }
}

/// One-shot, level-triggered disconnect signal. Safe to fire before anyone
/// waits and safe to await after the signal already fired.
#[derive(Default)]
struct DisconnectSignal {
    fired: AtomicBool,
    notify: Notify,
}

impl DisconnectSignal {
    fn fire(&self) {
        self.fired.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn wait(&self) {
        // Register before checking the flag so a concurrent fire() cannot
        // slip between the check and the await.
        let notified = self.notify.notified();
        if self.fired.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}

/// A session with one BLE-MIDI peripheral.
pub struct DeviceSession {
    adapter: Adapter,
    address: BDAddr,
    state: Arc<Mutex<SessionState>>,
    dispatcher: Arc<EventDispatcher>,
    disconnect: Arc<DisconnectSignal>,
    peripheral: Option<Peripheral>,
    pump: Option<JoinHandle<()>>,
}

impl DeviceSession {
    pub fn new(adapter: Adapter, address: BDAddr) -> Self {
        Self {
            adapter,
            address,
            state: Arc::new(Mutex::new(SessionState::Idle)),
            dispatcher: Arc::new(EventDispatcher::default()),
            disconnect: Arc::new(DisconnectSignal::default()),
            peripheral: None,
            pump: None,
        }
    }

    /// Register a listener for decoded channel voice events. Listeners run on
    /// the session's pump task, serialized, in packet arrival order.
    pub fn on_channel_event(&self, listener: impl Fn(&ChannelEvent) + Send + Sync + 'static) {
        self.dispatcher.add_channel_listener(Arc::new(listener));
    }

    /// Register a listener for decoded SysEx events.
    pub fn on_sysex_event(&self, listener: impl Fn(&SysexEvent) + Send + Sync + 'static) {
        self.dispatcher.add_sysex_listener(Arc::new(listener));
    }

    /// Last known connection status.
    pub fn is_connected(&self) -> bool {
        *self.state.lock() == SessionState::Active
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Connect to the target device and subscribe to its MIDI notifications.
    ///
    /// Tries a direct connect against the platform's cached peripherals
    /// first; an unknown device triggers one scan-assisted rediscovery with a
    /// bounded wait before the attempt fails with `NotFound`. Discovery or
    /// subscription failures release every handle acquired so far - a leaked
    /// handle shows up later as AccessDenied on the characteristic.
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        match self.try_connect().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.set_state(SessionState::Disconnected);
                Err(err)
            }
        }
    }

    async fn try_connect(&mut self) -> Result<(), ConnectError> {
        self.set_state(SessionState::Connecting);

        let peripheral = match self.find_known_peripheral().await? {
            Some(peripheral) => peripheral,
            None => {
                self.set_state(SessionState::AwaitingRediscovery);
                info!("device {} not cached, scanning for it...", self.address);
                scanner::discover_address(&self.adapter, self.address, REDISCOVERY_WAIT)
                    .await?
                    .ok_or(ConnectError::NotFound(self.address))?
            }
        };

        if let Err(err) = self.establish(&peripheral).await {
            if let Err(release_err) = peripheral.disconnect().await {
                debug!("releasing failed connection: {release_err}");
            }
            return Err(err);
        }

        self.peripheral = Some(peripheral);
        self.set_state(SessionState::Active);
        Ok(())
    }

    /// Suspend until the platform reports the connection lost. Level
    /// triggered: returns immediately if the disconnect already happened.
    pub async fn wait_until_disconnected(&self) {
        self.disconnect.wait().await;
    }

    /// Idempotent teardown: stops the pump, detaches listeners, releases the
    /// platform connection and wakes any disconnect waiter. Safe to call from
    /// any state, including concurrently with an in-flight status callback.
    pub async fn dispose(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.dispatcher.clear();
        self.set_state(SessionState::Disconnected);
        if let Some(peripheral) = self.peripheral.take() {
            if let Err(err) = peripheral.disconnect().await {
                debug!("disconnect during dispose failed: {err}");
            }
        }
        self.disconnect.fire();
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    async fn find_known_peripheral(&self) -> Result<Option<Peripheral>, btleplug::Error> {
        for peripheral in self.adapter.peripherals().await? {
            if peripheral.address() == self.address {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    /// Connect, discover, subscribe and start the pump. Handles acquired here
    /// are released by the caller on error.
    async fn establish(&mut self, peripheral: &Peripheral) -> Result<(), ConnectError> {
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }

        self.set_state(SessionState::DiscoveringService);
        peripheral.discover_services().await?;
        let service = exactly_one(
            peripheral
                .services()
                .into_iter()
                .filter(|service| service.uuid == MIDI_SERVICE)
                .collect(),
        )
        .map_err(ConnectError::ServiceDiscovery)?;

        self.set_state(SessionState::DiscoveringCharacteristic);
        let characteristic: Characteristic = exactly_one(
            service
                .characteristics
                .iter()
                .filter(|characteristic| characteristic.uuid == MIDI_DATA_CHARACTERISTIC)
                .cloned()
                .collect(),
        )
        .map_err(ConnectError::CharacteristicDiscovery)?;

        self.set_state(SessionState::Subscribing);
        // Link encryption is left to platform pairing; the GATT layer exposes
        // no per-characteristic protection level here.
        if let Err(err) = peripheral.subscribe(&characteristic).await {
            // The platform may deliver notifications regardless.
            warn!("notify subscription request failed, continuing: {err}");
        }

        let notifications = peripheral.notifications().await?;
        let events = self.adapter.events().await?;
        self.pump = Some(tokio::spawn(pump_loop(
            peripheral.id(),
            characteristic.uuid,
            notifications,
            events,
            Arc::clone(&self.state),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.disconnect),
        )));
        Ok(())
    }
}

fn exactly_one<T>(mut items: Vec<T>) -> Result<T, usize> {
    if items.len() == 1 {
        Ok(items.remove(0))
    } else {
        Err(items.len())
    }
}

/// Single consumer for one session: processes notifications in platform
/// delivery order and watches for the disconnect signal. No packet is decoded
/// concurrently with another.
async fn pump_loop(
    id: PeripheralId,
    characteristic: Uuid,
    mut notifications: Pin<Box<dyn Stream<Item = ValueNotification> + Send>>,
    mut events: Pin<Box<dyn Stream<Item = CentralEvent> + Send>>,
    state: Arc<Mutex<SessionState>>,
    dispatcher: Arc<EventDispatcher>,
    disconnect: Arc<DisconnectSignal>,
) {
    loop {
        tokio::select! {
            notification = notifications.next() => match notification {
                Some(notification) if notification.uuid == characteristic => {
                    if *state.lock() == SessionState::Active {
                        dispatcher.dispatch_packet(&notification.value);
                    }
                }
                Some(_) => {}
                None => {
                    // Notification stream ends only when the platform drops
                    // the connection.
                    *state.lock() = SessionState::Disconnected;
                    disconnect.fire();
                    break;
                }
            },
            event = events.next() => match event {
                Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => {
                    *state.lock() = SessionState::Disconnected;
                    disconnect.fire();
                    break;
                }
                Some(_) => {}
                None => {
                    *state.lock() = SessionState::Disconnected;
                    disconnect.fire();
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::timeout;

    #[tokio::test]
    async fn disconnect_signal_before_wait_returns_immediately() {
        let signal = DisconnectSignal::default();
        signal.fire();
        timeout(Duration::from_millis(100), signal.wait())
            .await
            .expect("wait must return after a prior fire");
    }

    #[tokio::test]
    async fn disconnect_signal_wakes_waiter() {
        let signal = Arc::new(DisconnectSignal::default());
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.wait().await })
        };
        tokio::task::yield_now().await;
        signal.fire();
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must be woken")
            .expect("waiter task must not panic");
    }

    #[tokio::test]
    async fn disconnect_signal_is_level_triggered_for_late_waits() {
        let signal = DisconnectSignal::default();
        signal.fire();
        signal.wait().await;
        // A second wait after the fact must also return
        timeout(Duration::from_millis(100), signal.wait())
            .await
            .expect("repeat wait must return");
    }

    #[test]
    fn dispatcher_preserves_packet_order() {
        let dispatcher = EventDispatcher::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            dispatcher.add_channel_listener(Arc::new(move |event: &ChannelEvent| {
                seen.lock().push((event.status, event.data0, event.data1));
            }));
        }

        dispatcher.dispatch_packet(&[0x80, 0x81, 0x90, 0x40, 0x7F, 0x41, 0x50]);
        dispatcher.dispatch_packet(&[0x80, 0x82, 0x80, 0x40, 0x00]);

        assert_eq!(
            *seen.lock(),
            vec![(0x90, 0x40, 0x7F), (0x90, 0x41, 0x50), (0x80, 0x40, 0x00)]
        );
    }

    #[test]
    fn dispatcher_survives_panicking_listener() {
        let dispatcher = EventDispatcher::default();
        let delivered = Arc::new(AtomicUsize::new(0));

        dispatcher.add_channel_listener(Arc::new(|_: &ChannelEvent| {
            panic!("listener misbehaving");
        }));
        {
            let delivered = Arc::clone(&delivered);
            dispatcher.add_channel_listener(Arc::new(move |_: &ChannelEvent| {
                delivered.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // Two messages in one packet: both must reach the second listener
        dispatcher.dispatch_packet(&[0x80, 0x81, 0x90, 0x40, 0x7F, 0x41, 0x50]);
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dispatcher_routes_sysex_separately() {
        let dispatcher = EventDispatcher::default();
        let sysex = Arc::new(Mutex::new(Vec::new()));
        let channel_hits = Arc::new(AtomicUsize::new(0));
        {
            let sysex = Arc::clone(&sysex);
            dispatcher.add_sysex_listener(Arc::new(move |event: &SysexEvent| {
                sysex.lock().push(event.data.clone());
            }));
        }
        {
            let channel_hits = Arc::clone(&channel_hits);
            dispatcher.add_channel_listener(Arc::new(move |_: &ChannelEvent| {
                channel_hits.fetch_add(1, Ordering::SeqCst);
            }));
        }

        dispatcher.dispatch_packet(&[0x80, 0x81, 0xF0, 0x01, 0x02, 0x03, 0xF7]);

        assert_eq!(*sysex.lock(), vec![vec![0x01, 0x02, 0x03]]);
        assert_eq!(channel_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dispatcher_ignores_undecodable_packets() {
        let dispatcher = EventDispatcher::default();
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = Arc::clone(&hits);
            dispatcher.add_channel_listener(Arc::new(move |_: &ChannelEvent| {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }

        dispatcher.dispatch_packet(&[0x00, 0x00]);
        dispatcher.dispatch_packet(&[]);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // The session keeps decoding later packets
        dispatcher.dispatch_packet(&[0x80, 0x81, 0x90, 0x3C, 0x64]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exactly_one_rejects_other_cardinalities() {
        assert_eq!(exactly_one::<u8>(vec![]), Err(0));
        assert_eq!(exactly_one(vec![7u8]), Ok(7));
        assert_eq!(exactly_one(vec![1u8, 2]), Err(2));
    }
}

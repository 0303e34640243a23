use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cardlink_channel::{CardListener, Framer};
use cardlink_core::TransportError;
use tracing::{debug, info, warn};

use crate::connection::{spawn_event_pump, BleConnection, BleConnectionConfig};
use crate::link::{GattLink, LinkEvent, MockGattLink};

/// Platform bonding state of a discoverable peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondState {
    Unbonded,
    Bonding,
    Bonded,
}

/// A discoverable peer: platform identifier plus its bonding state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub id: String,
    pub name: Option<String>,
    pub bond_state: BondState,
}

/// Events a central delivers outside any single link: discovery results and
/// bond-state broadcasts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralEvent {
    DeviceDiscovered(DeviceHandle),
    BondStateChanged { id: String, state: BondState },
}

/// Platform BLE central. Scanning is filtered to the card service by the
/// implementation; bond-state changes arrive as [`CentralEvent`]s.
pub trait BleCentral: Send + Sync + 'static {
    fn radio_enabled(&self) -> bool;
    /// Best-effort request to power the radio on; callers re-check before
    /// connecting.
    fn request_enable(&self) -> Result<(), TransportError>;
    fn start_scan(&self) -> Result<(), TransportError>;
    fn stop_scan(&self);
    fn create_bond(&self, device: &DeviceHandle) -> Result<(), TransportError>;
    /// Blocks up to `timeout` for the next central-level event.
    fn next_event(&self, timeout: Duration) -> Option<CentralEvent>;
    /// Opens a physical link to the device: the command side plus the event
    /// stream a [`BleConnection`] is driven by.
    fn open_link(
        &self,
        device: &DeviceHandle,
    ) -> Result<(Arc<dyn GattLink>, Receiver<LinkEvent>), TransportError>;
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Bound on the wait for the bonded state after requesting a bond.
    pub bond_timeout: Duration,
    /// Bound on the link-established wait of the bond-persistence cycle.
    pub link_up_timeout: Duration,
    pub connection: BleConnectionConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            bond_timeout: Duration::from_secs(30),
            link_up_timeout: Duration::from_secs(6),
            connection: BleConnectionConfig::default(),
        }
    }
}

/// Identifies one scan registration; sessions stop independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSession(u64);

type ScanCallback = Arc<dyn Fn(DeviceHandle) + Send + Sync>;

/// Discovers card devices, drives the platform bonding handshake, and hands
/// bonded devices to the connection state machine.
pub struct CardDeviceManager<C: BleCentral> {
    central: Arc<C>,
    config: ManagerConfig,
    framer: Arc<dyn Framer>,
    listener: Mutex<Option<Arc<dyn CardListener>>>,
    scans: Arc<Mutex<HashMap<u64, ScanCallback>>>,
    bond_waiters: Arc<Mutex<HashMap<String, Sender<BondState>>>>,
    next_scan_id: AtomicU64,
    shutdown: Arc<AtomicBool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<C: BleCentral> CardDeviceManager<C> {
    pub fn new(central: C, framer: Arc<dyn Framer>, config: ManagerConfig) -> Self {
        let central = Arc::new(central);
        let scans: Arc<Mutex<HashMap<u64, ScanCallback>>> = Arc::default();
        let bond_waiters: Arc<Mutex<HashMap<String, Sender<BondState>>>> = Arc::default();
        let shutdown = Arc::new(AtomicBool::new(false));

        let dispatcher = {
            let central = Arc::clone(&central);
            let scans = Arc::clone(&scans);
            let bond_waiters = Arc::clone(&bond_waiters);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    match central.next_event(Duration::from_millis(100)) {
                        Some(CentralEvent::DeviceDiscovered(device)) => {
                            let callbacks: Vec<ScanCallback> =
                                scans.lock().unwrap().values().cloned().collect();
                            for callback in callbacks {
                                callback(device.clone());
                            }
                        }
                        Some(CentralEvent::BondStateChanged { id, state }) => {
                            let waiter = bond_waiters.lock().unwrap().get(&id).cloned();
                            if let Some(tx) = waiter {
                                let _ = tx.send(state);
                            }
                        }
                        None => {}
                    }
                }
            })
        };

        Self {
            central,
            config,
            framer,
            listener: Mutex::new(None),
            scans,
            bond_waiters,
            next_scan_id: AtomicU64::new(0),
            shutdown,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// The underlying platform central.
    pub fn central(&self) -> &C {
        &self.central
    }

    /// Registers the consumer that receives connected/disconnected callbacks
    /// for every connection this manager constructs.
    pub fn set_listener(&self, listener: Arc<dyn CardListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    /// Powers the radio on if it is off. Best effort only.
    pub fn ensure_radio_enabled(&self) -> Result<(), TransportError> {
        if self.central.radio_enabled() {
            return Ok(());
        }
        self.central.request_enable()
    }

    /// Starts a scan session; each discovered device handle is delivered to
    /// `on_device`. Sessions are independent; the physical scan runs while
    /// at least one session is active.
    pub fn scan(
        &self,
        on_device: impl Fn(DeviceHandle) + Send + Sync + 'static,
    ) -> Result<ScanSession, TransportError> {
        let id = self.next_scan_id.fetch_add(1, Ordering::SeqCst);
        let first = {
            let mut scans = self.scans.lock().unwrap();
            let first = scans.is_empty();
            scans.insert(id, Arc::new(on_device));
            first
        };
        if first {
            if let Err(err) = self.central.start_scan() {
                self.scans.lock().unwrap().remove(&id);
                return Err(err);
            }
            debug!("scan started");
        }
        Ok(ScanSession(id))
    }

    pub fn stop_scan(&self, session: ScanSession) {
        let stopped_last = {
            let mut scans = self.scans.lock().unwrap();
            scans.remove(&session.0).is_some() && scans.is_empty()
        };
        if stopped_last {
            self.central.stop_scan();
            debug!("scan stopped");
        }
    }

    /// Connects to a device, bonding first when required, and returns the
    /// connection once its handshake has been started. The registered
    /// listener receives `on_connected` when the handshake completes.
    pub fn connect(&self, device: &DeviceHandle) -> Result<Arc<BleConnection>, TransportError> {
        let listener = self
            .listener
            .lock()
            .unwrap()
            .clone()
            .ok_or(TransportError::Link("no card listener registered"))?;

        if device.bond_state != BondState::Bonded {
            self.bond(device)?;
        }

        let (link, events) = self.central.open_link(device)?;
        let connection = BleConnection::new(
            link,
            listener,
            Arc::clone(&self.framer),
            self.config.connection.clone(),
        );
        spawn_event_pump(Arc::clone(&connection), events);
        connection.open()?;
        info!(device = %device.id, "connection started");
        Ok(connection)
    }

    fn bond(&self, device: &DeviceHandle) -> Result<(), TransportError> {
        let (tx, rx) = mpsc::channel();
        self.bond_waiters
            .lock()
            .unwrap()
            .insert(device.id.clone(), tx);
        let result = self.bond_and_persist(device, &rx);
        self.bond_waiters.lock().unwrap().remove(&device.id);
        if result.is_err() {
            warn!(device = %device.id, "bonding failed");
        }
        result
    }

    fn bond_and_persist(
        &self,
        device: &DeviceHandle,
        bond_events: &Receiver<BondState>,
    ) -> Result<(), TransportError> {
        debug!(device = %device.id, "requesting bond");
        self.central
            .create_bond(device)
            .map_err(|_| TransportError::PairingFailed)?;

        let deadline = Instant::now() + self.config.bond_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::PairingFailed);
            }
            match bond_events.recv_timeout(remaining) {
                Ok(BondState::Bonded) => break,
                Ok(BondState::Bonding) => continue,
                Ok(BondState::Unbonded) | Err(_) => return Err(TransportError::PairingFailed),
            }
        }
        self.persist_bond(device)
    }

    /// One connect/disconnect cycle right after bonding; some platforms only
    /// persist a bond once a link has completed against it.
    fn persist_bond(&self, device: &DeviceHandle) -> Result<(), TransportError> {
        let (link, events) = self.central.open_link(device)?;
        link.connect()?;
        let deadline = Instant::now() + self.config.link_up_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                link.release();
                return Err(TransportError::Link("bond persistence connect timed out"));
            }
            match events.recv_timeout(remaining) {
                Ok(LinkEvent::LinkUp) => break,
                Ok(_) => continue,
                Err(_) => {
                    link.release();
                    return Err(TransportError::Link("link lost during bond persistence"));
                }
            }
        }
        link.disconnect();
        link.release();
        debug!(device = %device.id, "bond persisted");
        Ok(())
    }
}

impl<C: BleCentral> Drop for CardDeviceManager<C> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// One link opened by [`MockCentral`], kept around so tests can reach both
/// the command log and the event injection side.
#[derive(Clone)]
pub struct MockLinkHandle {
    pub device_id: String,
    pub link: Arc<MockGattLink>,
    pub events: Sender<LinkEvent>,
}

/// Scripted central for manager tests.
pub struct MockCentral {
    radio_enabled: AtomicBool,
    enable_requests: AtomicU64,
    scanning: AtomicBool,
    bond_requests: Mutex<Vec<String>>,
    bond_script: Mutex<Vec<BondState>>,
    auto_link_up: AtomicBool,
    auto_discovery: AtomicBool,
    auto_ack_writes: AtomicBool,
    events_tx: Sender<CentralEvent>,
    events_rx: Mutex<Receiver<CentralEvent>>,
    links: Mutex<Vec<MockLinkHandle>>,
}

impl Default for MockCentral {
    fn default() -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            radio_enabled: AtomicBool::new(true),
            enable_requests: AtomicU64::new(0),
            scanning: AtomicBool::new(false),
            bond_requests: Mutex::new(Vec::new()),
            bond_script: Mutex::new(vec![BondState::Bonding, BondState::Bonded]),
            auto_link_up: AtomicBool::new(false),
            auto_discovery: AtomicBool::new(false),
            auto_ack_writes: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(events_rx),
            links: Mutex::new(Vec::new()),
        }
    }
}

impl MockCentral {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_radio_enabled(&self, enabled: bool) {
        self.radio_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn enable_requests(&self) -> u64 {
        self.enable_requests.load(Ordering::SeqCst)
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Bond-state sequence replayed (as central events) on `create_bond`.
    pub fn set_bond_script(&self, script: Vec<BondState>) {
        *self.bond_script.lock().unwrap() = script;
    }

    /// When enabled, every opened link immediately acknowledges connect,
    /// discovery, notification setup, and fragment writes.
    pub fn set_auto_link_events(&self, enabled: bool) {
        self.auto_link_up.store(enabled, Ordering::SeqCst);
        self.auto_discovery.store(enabled, Ordering::SeqCst);
        self.auto_ack_writes.store(enabled, Ordering::SeqCst);
    }

    pub fn bond_requests(&self) -> Vec<String> {
        self.bond_requests.lock().unwrap().clone()
    }

    pub fn push_event(&self, event: CentralEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn opened_links(&self) -> Vec<MockLinkHandle> {
        self.links.lock().unwrap().clone()
    }
}

impl BleCentral for MockCentral {
    fn radio_enabled(&self) -> bool {
        self.radio_enabled.load(Ordering::SeqCst)
    }

    fn request_enable(&self) -> Result<(), TransportError> {
        self.enable_requests.fetch_add(1, Ordering::SeqCst);
        self.radio_enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn start_scan(&self) -> Result<(), TransportError> {
        self.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_scan(&self) {
        self.scanning.store(false, Ordering::SeqCst);
    }

    fn create_bond(&self, device: &DeviceHandle) -> Result<(), TransportError> {
        self.bond_requests.lock().unwrap().push(device.id.clone());
        for state in self.bond_script.lock().unwrap().iter() {
            let _ = self.events_tx.send(CentralEvent::BondStateChanged {
                id: device.id.clone(),
                state: *state,
            });
        }
        Ok(())
    }

    fn next_event(&self, timeout: Duration) -> Option<CentralEvent> {
        self.events_rx.lock().unwrap().recv_timeout(timeout).ok()
    }

    fn open_link(
        &self,
        device: &DeviceHandle,
    ) -> Result<(Arc<dyn GattLink>, Receiver<LinkEvent>), TransportError> {
        let link = Arc::new(MockGattLink::new());
        let (tx, rx) = mpsc::channel();
        link.attach_events(tx.clone());
        if self.auto_link_up.load(Ordering::SeqCst) {
            link.set_auto_link_up(true);
        }
        if self.auto_discovery.load(Ordering::SeqCst) {
            link.set_auto_discovery(true);
        }
        if self.auto_ack_writes.load(Ordering::SeqCst) {
            link.set_auto_ack_writes(true);
        }
        self.links.lock().unwrap().push(MockLinkHandle {
            device_id: device.id.clone(),
            link: Arc::clone(&link),
            events: tx,
        });
        Ok((link, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkCommand;
    use cardlink_channel::{CardChannel, SingleFragmentFramer};

    struct NullListener;

    impl CardListener for NullListener {
        fn on_connected(&self, _channel: Box<dyn CardChannel + Send>) {}
        fn on_disconnected(&self) {}
    }

    fn device(id: &str, bond_state: BondState) -> DeviceHandle {
        DeviceHandle {
            id: id.into(),
            name: Some("Card".into()),
            bond_state,
        }
    }

    fn manager(central: MockCentral) -> CardDeviceManager<MockCentral> {
        let manager = CardDeviceManager::new(
            central,
            Arc::new(SingleFragmentFramer),
            ManagerConfig {
                bond_timeout: Duration::from_millis(500),
                link_up_timeout: Duration::from_millis(500),
                connection: BleConnectionConfig::default(),
            },
        );
        manager.set_listener(Arc::new(NullListener));
        manager
    }

    #[test]
    fn bonded_device_connects_without_bonding_request() {
        let central = MockCentral::new();
        central.set_auto_link_events(true);
        let manager = manager(central);

        let connection = manager
            .connect(&device("aa:bb", BondState::Bonded))
            .expect("connect should succeed");
        assert!(manager.central.bond_requests().is_empty());
        let links = manager.central.opened_links();
        assert_eq!(links.len(), 1);
        assert!(links[0].link.take_commands().contains(&LinkCommand::Connect));
        connection.close();
    }

    #[test]
    fn unbonded_device_bonds_then_runs_persistence_cycle() {
        let central = MockCentral::new();
        central.set_auto_link_events(true);
        let manager = manager(central);

        let connection = manager
            .connect(&device("aa:cc", BondState::Unbonded))
            .expect("bond and connect should succeed");
        assert_eq!(manager.central.bond_requests(), vec!["aa:cc".to_string()]);

        let links = manager.central.opened_links();
        assert_eq!(links.len(), 2, "persistence cycle plus the real link");
        let cycle = links[0].link.take_commands();
        assert_eq!(
            cycle,
            vec![
                LinkCommand::Connect,
                LinkCommand::Disconnect,
                LinkCommand::Release,
            ]
        );
        connection.close();
    }

    #[test]
    fn failed_bond_surfaces_pairing_failed() {
        let central = MockCentral::new();
        central.set_bond_script(vec![BondState::Bonding, BondState::Unbonded]);
        let manager = manager(central);

        let Err(err) = manager.connect(&device("aa:dd", BondState::Unbonded)) else {
            panic!("bond failure must propagate");
        };
        assert!(matches!(err, TransportError::PairingFailed));
        assert!(manager.central.opened_links().is_empty());
    }

    #[test]
    fn bond_timeout_surfaces_pairing_failed() {
        let central = MockCentral::new();
        central.set_bond_script(vec![BondState::Bonding]);
        let manager = manager(central);

        let Err(err) = manager.connect(&device("aa:ee", BondState::Unbonded)) else {
            panic!("bond timeout must propagate");
        };
        assert!(matches!(err, TransportError::PairingFailed));
    }

    #[test]
    fn connect_requires_a_listener() {
        let central = MockCentral::new();
        let manager = CardDeviceManager::new(
            central,
            Arc::new(SingleFragmentFramer),
            ManagerConfig::default(),
        );
        assert!(matches!(
            manager.connect(&device("aa:ff", BondState::Bonded)),
            Err(TransportError::Link(_))
        ));
    }

    #[test]
    fn scan_sessions_are_independent() {
        let manager = manager(MockCentral::new());
        let (tx_a, rx_a) = mpsc::channel();
        let (tx_b, rx_b) = mpsc::channel();

        let session_a = manager
            .scan(move |d| {
                let _ = tx_a.send(d.id);
            })
            .unwrap();
        let session_b = manager
            .scan(move |d| {
                let _ = tx_b.send(d.id);
            })
            .unwrap();
        assert!(manager.central.is_scanning());

        manager
            .central
            .push_event(CentralEvent::DeviceDiscovered(device("d1", BondState::Unbonded)));
        assert_eq!(rx_a.recv_timeout(Duration::from_secs(1)).unwrap(), "d1");
        assert_eq!(rx_b.recv_timeout(Duration::from_secs(1)).unwrap(), "d1");

        manager.stop_scan(session_a);
        assert!(manager.central.is_scanning(), "one session still active");
        manager
            .central
            .push_event(CentralEvent::DeviceDiscovered(device("d2", BondState::Unbonded)));
        assert_eq!(rx_b.recv_timeout(Duration::from_secs(1)).unwrap(), "d2");
        assert!(rx_a.recv_timeout(Duration::from_millis(200)).is_err());

        manager.stop_scan(session_b);
        assert!(!manager.central.is_scanning());
    }

    #[test]
    fn ensure_radio_enabled_is_best_effort() {
        let central = MockCentral::new();
        central.set_radio_enabled(false);
        let manager = manager(central);

        manager.ensure_radio_enabled().unwrap();
        assert_eq!(manager.central.enable_requests(), 1);
        assert!(manager.central.radio_enabled());
        // Already on: no further platform request.
        manager.ensure_radio_enabled().unwrap();
        assert_eq!(manager.central.enable_requests(), 1);
    }
}

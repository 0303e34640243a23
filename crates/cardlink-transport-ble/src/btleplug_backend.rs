//! Hardware backend built on btleplug. One worker thread owns the adapter
//! and a current-thread tokio runtime; each open link gets its own task that
//! maps [`GattLink`] commands onto GATT operations and streams notifications
//! back as [`LinkEvent`]s.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent as RadioEvent, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures_util::StreamExt;
use tokio::sync::{mpsc as tokio_mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use cardlink_core::TransportError;

use crate::link::{GattLink, LinkEvent};
use crate::manager::{BleCentral, BondState, CentralEvent, DeviceHandle};
use crate::protocol::{CARD_NOTIFY_CHAR_UUID, CARD_SERVICE_UUID, CARD_WRITE_CHAR_UUID};

#[derive(Debug, Clone)]
pub struct BtleplugCentralConfig {
    pub connect_timeout: Duration,
    pub central_queue_capacity: usize,
}

impl Default for BtleplugCentralConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(6),
            central_queue_capacity: 256,
        }
    }
}

enum LinkOp {
    Connect,
    DiscoverServices,
    EnableNotifications,
    WriteFragment(Vec<u8>),
    Disconnect,
    Release,
}

enum WorkerCommand {
    StartScan,
    StopScan,
    Bond {
        id: String,
    },
    OpenLink {
        id: String,
        events: std_mpsc::Sender<LinkEvent>,
        reply: oneshot::Sender<Result<tokio_mpsc::Sender<LinkOp>, TransportError>>,
    },
}

/// [`GattLink`] handle whose operations run on the backend worker.
pub struct BtleplugGattLink {
    ops: tokio_mpsc::Sender<LinkOp>,
}

impl BtleplugGattLink {
    fn submit(&self, op: LinkOp) -> Result<(), TransportError> {
        self.ops
            .blocking_send(op)
            .map_err(|_| TransportError::Link("radio worker unavailable"))
    }
}

impl GattLink for BtleplugGattLink {
    fn connect(&self) -> Result<(), TransportError> {
        self.submit(LinkOp::Connect)
    }

    fn discover_services(&self) -> Result<(), TransportError> {
        self.submit(LinkOp::DiscoverServices)
    }

    fn enable_notifications(&self) -> Result<(), TransportError> {
        self.submit(LinkOp::EnableNotifications)
    }

    fn write_fragment(&self, fragment: &[u8]) -> Result<(), TransportError> {
        self.submit(LinkOp::WriteFragment(fragment.to_vec()))
    }

    fn disconnect(&self) {
        let _ = self.ops.blocking_send(LinkOp::Disconnect);
    }

    fn release(&self) {
        let _ = self.ops.blocking_send(LinkOp::Release);
    }
}

/// btleplug-backed [`BleCentral`].
pub struct BtleplugCentral {
    cmd_tx: tokio_mpsc::Sender<WorkerCommand>,
    event_rx: Mutex<std_mpsc::Receiver<CentralEvent>>,
    radio_ready: Arc<AtomicBool>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugCentral {
    pub fn spawn(config: BtleplugCentralConfig) -> Result<Self, TransportError> {
        let (cmd_tx, cmd_rx) = tokio_mpsc::channel::<WorkerCommand>(32);
        let (event_tx, event_rx) =
            std_mpsc::sync_channel::<CentralEvent>(config.central_queue_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let radio_ready = Arc::new(AtomicBool::new(false));

        let worker_ready = Arc::clone(&radio_ready);
        let worker_config = config.clone();
        let worker = thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(_) => return,
            };
            runtime.block_on(run_worker(
                worker_config,
                worker_ready,
                cmd_rx,
                event_tx,
                shutdown_rx,
            ));
        });

        Ok(Self {
            cmd_tx,
            event_rx: Mutex::new(event_rx),
            radio_ready,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    fn command(&self, command: WorkerCommand) -> Result<(), TransportError> {
        self.cmd_tx
            .blocking_send(command)
            .map_err(|_| TransportError::Link("radio worker unavailable"))
    }
}

impl BleCentral for BtleplugCentral {
    fn radio_enabled(&self) -> bool {
        self.radio_ready.load(Ordering::SeqCst)
    }

    fn request_enable(&self) -> Result<(), TransportError> {
        // btleplug offers no power-on call; surfacing the request is all the
        // platform allows. Callers re-check before connecting.
        warn!("radio enable requested, but the platform cannot be powered on programmatically");
        Ok(())
    }

    fn start_scan(&self) -> Result<(), TransportError> {
        self.command(WorkerCommand::StartScan)
    }

    fn stop_scan(&self) {
        let _ = self.command(WorkerCommand::StopScan);
    }

    fn create_bond(&self, device: &DeviceHandle) -> Result<(), TransportError> {
        self.command(WorkerCommand::Bond {
            id: device.id.clone(),
        })
    }

    fn next_event(&self, timeout: Duration) -> Option<CentralEvent> {
        self.event_rx.lock().unwrap().recv_timeout(timeout).ok()
    }

    fn open_link(
        &self,
        device: &DeviceHandle,
    ) -> Result<(Arc<dyn GattLink>, std_mpsc::Receiver<LinkEvent>), TransportError> {
        let (events_tx, events_rx) = std_mpsc::channel::<LinkEvent>();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(WorkerCommand::OpenLink {
            id: device.id.clone(),
            events: events_tx,
            reply: reply_tx,
        })?;
        let ops = reply_rx
            .blocking_recv()
            .map_err(|_| TransportError::Link("radio worker unavailable"))??;
        Ok((Arc::new(BtleplugGattLink { ops }), events_rx))
    }
}

impl Drop for BtleplugCentral {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

struct ProfileUuids {
    service: Uuid,
    write_char: Uuid,
    notify_char: Uuid,
}

async fn run_worker(
    config: BtleplugCentralConfig,
    radio_ready: Arc<AtomicBool>,
    mut cmd_rx: tokio_mpsc::Receiver<WorkerCommand>,
    event_tx: std_mpsc::SyncSender<CentralEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let (Ok(service), Ok(write_char), Ok(notify_char)) = (
        Uuid::parse_str(CARD_SERVICE_UUID),
        Uuid::parse_str(CARD_WRITE_CHAR_UUID),
        Uuid::parse_str(CARD_NOTIFY_CHAR_UUID),
    ) else {
        return;
    };
    let uuids = Arc::new(ProfileUuids {
        service,
        write_char,
        notify_char,
    });

    let manager = match Manager::new().await {
        Ok(m) => m,
        Err(_) => return,
    };
    let adapter = match manager.adapters().await {
        Ok(adapters) => match adapters.into_iter().next() {
            Some(a) => a,
            None => return,
        },
        Err(_) => return,
    };
    radio_ready.store(true, Ordering::SeqCst);

    let mut radio_events = match adapter.events().await {
        Ok(e) => e,
        Err(_) => return,
    };
    let mut links: HashMap<PeripheralId, std_mpsc::Sender<LinkEvent>> = HashMap::new();
    // Link tasks report back here when they end so their map entry (and the
    // event sender it holds) does not outlive the link.
    let (done_tx, mut done_rx) = tokio_mpsc::channel::<PeripheralId>(8);

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            maybe_done = done_rx.recv() => {
                if let Some(id) = maybe_done {
                    links.remove(&id);
                }
            }
            maybe_event = radio_events.next() => {
                let Some(event) = maybe_event else { break };
                handle_radio_event(&adapter, event, &mut links, &event_tx).await;
            }
            maybe_cmd = cmd_rx.recv() => {
                let Some(cmd) = maybe_cmd else { break };
                handle_command(&adapter, &config, &uuids, cmd, &mut links, &event_tx, &done_tx).await;
            }
        }
    }
}

async fn handle_radio_event(
    adapter: &Adapter,
    event: RadioEvent,
    links: &mut HashMap<PeripheralId, std_mpsc::Sender<LinkEvent>>,
    event_tx: &std_mpsc::SyncSender<CentralEvent>,
) {
    match event {
        RadioEvent::DeviceDiscovered(id) => {
            let name = match adapter.peripheral(&id).await {
                Ok(peripheral) => peripheral
                    .properties()
                    .await
                    .ok()
                    .flatten()
                    .and_then(|p| p.local_name),
                Err(_) => None,
            };
            // The OS owns pairing state on this platform; devices are
            // reported bonded and pairing happens on demand during connect.
            let handle = DeviceHandle {
                id: id.to_string(),
                name,
                bond_state: BondState::Bonded,
            };
            if event_tx.try_send(CentralEvent::DeviceDiscovered(handle)).is_err() {
                warn!("central event queue full, dropping discovery");
            }
        }
        RadioEvent::DeviceDisconnected(id) => {
            if let Some(events) = links.get(&id) {
                let _ = events.send(LinkEvent::LinkDown);
            }
        }
        _ => {}
    }
}

async fn handle_command(
    adapter: &Adapter,
    config: &BtleplugCentralConfig,
    uuids: &Arc<ProfileUuids>,
    command: WorkerCommand,
    links: &mut HashMap<PeripheralId, std_mpsc::Sender<LinkEvent>>,
    event_tx: &std_mpsc::SyncSender<CentralEvent>,
    done_tx: &tokio_mpsc::Sender<PeripheralId>,
) {
    match command {
        WorkerCommand::StartScan => {
            let filter = ScanFilter {
                services: vec![uuids.service],
            };
            if adapter.start_scan(filter).await.is_err() {
                warn!("scan start failed");
            }
        }
        WorkerCommand::StopScan => {
            let _ = adapter.stop_scan().await;
        }
        WorkerCommand::Bond { id } => {
            // Pairing is driven by the OS during connect/encryption; one
            // connect attempt is what "create bond" maps to here.
            let _ = event_tx.try_send(CentralEvent::BondStateChanged {
                id: id.clone(),
                state: BondState::Bonding,
            });
            let bonded = match find_peripheral(adapter, &id).await {
                Some(peripheral) => {
                    let connected =
                        tokio::time::timeout(config.connect_timeout, peripheral.connect())
                            .await
                            .map(|r| r.is_ok())
                            .unwrap_or(false);
                    if connected {
                        let _ = peripheral.disconnect().await;
                    }
                    connected
                }
                None => false,
            };
            let state = if bonded {
                BondState::Bonded
            } else {
                BondState::Unbonded
            };
            let _ = event_tx.try_send(CentralEvent::BondStateChanged { id, state });
        }
        WorkerCommand::OpenLink { id, events, reply } => {
            let Some(peripheral) = find_peripheral(adapter, &id).await else {
                let _ = reply.send(Err(TransportError::Link("device not found")));
                return;
            };
            let (ops_tx, ops_rx) = tokio_mpsc::channel::<LinkOp>(8);
            let peripheral_id = peripheral.id();
            links.insert(peripheral_id.clone(), events.clone());
            let link_uuids = Arc::clone(uuids);
            let link_config = config.clone();
            let done = done_tx.clone();
            tokio::spawn(async move {
                run_link(peripheral, link_config, link_uuids, ops_rx, events).await;
                let _ = done.send(peripheral_id).await;
            });
            let _ = reply.send(Ok(ops_tx));
        }
    }
}

async fn find_peripheral(adapter: &Adapter, id: &str) -> Option<Peripheral> {
    let peripherals = adapter.peripherals().await.ok()?;
    peripherals.into_iter().find(|p| p.id().to_string() == id)
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Option<Characteristic> {
    peripheral.characteristics().iter().find(|c| c.uuid == uuid).cloned()
}

async fn run_link(
    peripheral: Peripheral,
    config: BtleplugCentralConfig,
    uuids: Arc<ProfileUuids>,
    mut ops: tokio_mpsc::Receiver<LinkOp>,
    events: std_mpsc::Sender<LinkEvent>,
) {
    let mut notify_task: Option<tokio::task::JoinHandle<()>> = None;

    while let Some(op) = ops.recv().await {
        match op {
            LinkOp::Connect => {
                let up = tokio::time::timeout(config.connect_timeout, peripheral.connect())
                    .await
                    .map(|r| r.is_ok())
                    .unwrap_or(false);
                debug!(up, "link connect finished");
                let _ = events.send(if up {
                    LinkEvent::LinkUp
                } else {
                    LinkEvent::LinkDown
                });
            }
            LinkOp::DiscoverServices => {
                let found = peripheral.discover_services().await.is_ok()
                    && peripheral.services().iter().any(|s| s.uuid == uuids.service);
                let _ = events.send(LinkEvent::ServiceDiscovered { found });
            }
            LinkOp::EnableNotifications => {
                let subscribed = match find_characteristic(&peripheral, uuids.notify_char) {
                    Some(ch) => peripheral.subscribe(&ch).await.is_ok(),
                    None => false,
                };
                if !subscribed {
                    let _ = events.send(LinkEvent::LinkDown);
                    continue;
                }
                if let Ok(mut stream) = peripheral.notifications().await {
                    let notify_char = uuids.notify_char;
                    let notify_events = events.clone();
                    notify_task = Some(tokio::spawn(async move {
                        while let Some(data) = stream.next().await {
                            if data.uuid == notify_char {
                                let _ = notify_events.send(LinkEvent::Notification(data.value));
                            }
                        }
                    }));
                }
                let _ = events.send(LinkEvent::NotificationsEnabled);
            }
            LinkOp::WriteFragment(bytes) => {
                let ok = match find_characteristic(&peripheral, uuids.write_char) {
                    Some(ch) => peripheral
                        .write(&ch, &bytes, WriteType::WithResponse)
                        .await
                        .is_ok(),
                    None => false,
                };
                let _ = events.send(LinkEvent::WriteCompleted { ok });
            }
            LinkOp::Disconnect => {
                let _ = peripheral.disconnect().await;
            }
            LinkOp::Release => {
                let _ = peripheral.disconnect().await;
                break;
            }
        }
    }

    if let Some(task) = notify_task {
        task.abort();
    }
}

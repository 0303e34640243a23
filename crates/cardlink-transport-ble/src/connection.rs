use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use cardlink_channel::{CardChannel, CardListener, FragmentIo, Framer};
use cardlink_core::{ApduCommand, ApduResponse, TransportError};
use tracing::{debug, warn};

use crate::link::{GattLink, LinkEvent};
use crate::protocol::{
    parse_mtu_response, DEFAULT_MTU, EXCHANGE_TIMEOUT, MTU_EXCHANGE_REQUEST,
    PAIRING_KEY_ITERATIONS,
};

/// Lifecycle of one physical link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    ServiceDiscovery,
    NotificationSetup,
    MtuHandshake,
    Ready,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Idle,
    Pending,
    Completed { ok: bool },
}

#[derive(Debug, Clone)]
pub struct BleConnectionConfig {
    /// Bound on the write-confirmation wait and the inbound-fragment wait.
    pub exchange_timeout: Duration,
    /// Inbound fragment queue bound; fragments past it are dropped.
    pub inbound_queue_capacity: usize,
}

impl Default for BleConnectionConfig {
    fn default() -> Self {
        Self {
            exchange_timeout: EXCHANGE_TIMEOUT,
            inbound_queue_capacity: 64,
        }
    }
}

/// Inbound-queue accounting, mirrored into logs when fragments are dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FragmentQueueStats {
    pub received: u64,
    pub dropped: u64,
}

struct Inner {
    state: LinkState,
    mtu: usize,
    write: WriteState,
    last_error: Option<TransportError>,
    inbound_tx: Option<SyncSender<Vec<u8>>>,
}

/// One physical radio link to one card, driven by [`LinkEvent`]s from the
/// platform binding through a single synchronized transition function.
///
/// The event-delivery context mutates the shared state; the caller context
/// blocks on it in [`write_fragment`](Self::write_fragment) and
/// [`read_fragment`](Self::read_fragment). Both waits are bounded and both
/// re-check the lifecycle state, so a concurrent `close()` fails them
/// promptly instead of letting them hang.
pub struct BleConnection {
    link: Arc<dyn GattLink>,
    listener: Arc<dyn CardListener>,
    framer: Arc<dyn Framer>,
    config: BleConnectionConfig,
    inner: Mutex<Inner>,
    cond: Condvar,
    inbound_rx: Mutex<Receiver<Vec<u8>>>,
    received: AtomicU64,
    dropped: AtomicU64,
}

impl BleConnection {
    pub fn new(
        link: Arc<dyn GattLink>,
        listener: Arc<dyn CardListener>,
        framer: Arc<dyn Framer>,
        config: BleConnectionConfig,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::sync_channel(config.inbound_queue_capacity);
        Arc::new(Self {
            link,
            listener,
            framer,
            config,
            inner: Mutex::new(Inner {
                state: LinkState::Disconnected,
                mtu: DEFAULT_MTU,
                write: WriteState::Idle,
                last_error: None,
                inbound_tx: Some(inbound_tx),
            }),
            cond: Condvar::new(),
            inbound_rx: Mutex::new(inbound_rx),
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Initiates the physical connection. Valid once, from `Disconnected`.
    pub fn open(&self) -> Result<(), TransportError> {
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                LinkState::Disconnected => inner.state = LinkState::Connecting,
                LinkState::Closed => return Err(TransportError::Closed),
                _ => return Err(TransportError::Link("connection already started")),
            }
        }
        if let Err(err) = self.link.connect() {
            self.fail(err.clone());
            return Err(err);
        }
        Ok(())
    }

    pub fn state(&self) -> LinkState {
        self.inner.lock().unwrap().state
    }

    /// True only in the Ready state.
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Ready
    }

    /// Negotiated transfer unit; the default of 20 until the handshake
    /// overwrites it.
    pub fn mtu(&self) -> usize {
        self.inner.lock().unwrap().mtu
    }

    /// Terminal error recorded by the last failed transition, if any.
    pub fn last_error(&self) -> Option<TransportError> {
        self.inner.lock().unwrap().last_error.clone()
    }

    pub fn queue_stats(&self) -> FragmentQueueStats {
        FragmentQueueStats {
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// The synchronized transition function. Every radio event funnels
    /// through here; duplicate events that would not change the observable
    /// state are ignored without notifying anyone.
    pub fn handle_event(self: &Arc<Self>, event: LinkEvent) -> Result<(), TransportError> {
        match event {
            LinkEvent::LinkUp => {
                {
                    let mut inner = self.inner.lock().unwrap();
                    if inner.state != LinkState::Connecting {
                        return Ok(());
                    }
                    inner.state = LinkState::ServiceDiscovery;
                }
                self.submit(|| self.link.discover_services())
            }
            LinkEvent::LinkDown => {
                let was_ready;
                {
                    let mut inner = self.inner.lock().unwrap();
                    if matches!(inner.state, LinkState::Disconnected | LinkState::Closed) {
                        return Ok(());
                    }
                    was_ready = inner.state == LinkState::Ready;
                    inner.state = LinkState::Disconnected;
                    inner.inbound_tx = None;
                }
                self.cond.notify_all();
                if was_ready {
                    debug!("link lost while ready");
                    let listener = Arc::clone(&self.listener);
                    dispatch(move || listener.on_disconnected());
                }
                Ok(())
            }
            LinkEvent::ServiceDiscovered { found: true } => {
                {
                    let mut inner = self.inner.lock().unwrap();
                    if inner.state != LinkState::ServiceDiscovery {
                        return Ok(());
                    }
                    inner.state = LinkState::NotificationSetup;
                }
                self.submit(|| self.link.enable_notifications())
            }
            LinkEvent::ServiceDiscovered { found: false } => {
                {
                    let inner = self.inner.lock().unwrap();
                    if inner.state != LinkState::ServiceDiscovery {
                        return Ok(());
                    }
                }
                // Permanent for this device; the caller decides what to do.
                warn!("peer does not expose the card service");
                self.fail(TransportError::ProtocolMismatch);
                self.link.disconnect();
                Err(TransportError::ProtocolMismatch)
            }
            LinkEvent::NotificationsEnabled => {
                {
                    let mut inner = self.inner.lock().unwrap();
                    if inner.state != LinkState::NotificationSetup {
                        return Ok(());
                    }
                    inner.state = LinkState::MtuHandshake;
                }
                self.submit(|| self.link.write_fragment(&MTU_EXCHANGE_REQUEST))
            }
            LinkEvent::WriteCompleted { ok } => {
                let mut inner = self.inner.lock().unwrap();
                if inner.write == WriteState::Pending {
                    inner.write = WriteState::Completed { ok };
                    drop(inner);
                    self.cond.notify_all();
                }
                Ok(())
            }
            LinkEvent::Notification(bytes) => self.on_notification(bytes),
        }
    }

    fn on_notification(self: &Arc<Self>, bytes: Vec<u8>) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            LinkState::MtuHandshake => match parse_mtu_response(&bytes) {
                Some(mtu) => {
                    inner.mtu = mtu;
                    inner.state = LinkState::Ready;
                    drop(inner);
                    debug!(mtu, "capability handshake complete");
                    let listener = Arc::clone(&self.listener);
                    let channel = BleCardChannel::new(Arc::clone(self));
                    dispatch(move || listener.on_connected(Box::new(channel)));
                    Ok(())
                }
                None => {
                    drop(inner);
                    warn!("unexpected reply during capability handshake");
                    self.fail(TransportError::ProtocolMismatch);
                    self.link.disconnect();
                    Err(TransportError::ProtocolMismatch)
                }
            },
            // Once ready, notifications are payload fragments and the
            // handshake tag is never reinterpreted.
            LinkState::Ready => {
                self.received.fetch_add(1, Ordering::Relaxed);
                if let Some(tx) = inner.inbound_tx.as_ref() {
                    match tx.try_send(bytes) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            warn!("inbound fragment queue full, dropping fragment");
                        }
                        Err(TrySendError::Disconnected(_)) => {}
                    }
                }
                Ok(())
            }
            _ => {
                debug!("ignoring notification outside handshake");
                Ok(())
            }
        }
    }

    /// Transmits one fragment and blocks until the radio stack confirms it.
    /// One write in flight at a time; the physical characteristic holds a
    /// single value.
    pub fn write_fragment(&self, fragment: &[u8]) -> Result<(), TransportError> {
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                LinkState::Ready => {}
                LinkState::Closed => return Err(TransportError::Closed),
                _ => return Err(TransportError::NotConnected),
            }
            if inner.write == WriteState::Pending {
                return Err(TransportError::Link("fragment write already pending"));
            }
            inner.write = WriteState::Pending;
        }
        if let Err(err) = self.link.write_fragment(fragment) {
            self.inner.lock().unwrap().write = WriteState::Idle;
            return Err(err);
        }

        let timeout = self.config.exchange_timeout;
        let inner = self.inner.lock().unwrap();
        let (mut inner, _) = self
            .cond
            .wait_timeout_while(inner, timeout, |i| {
                i.write == WriteState::Pending && i.state == LinkState::Ready
            })
            .unwrap();
        let outcome = inner.write;
        inner.write = WriteState::Idle;
        let state = inner.state;
        drop(inner);

        match outcome {
            WriteState::Completed { ok: true } => Ok(()),
            WriteState::Completed { ok: false } => Err(TransportError::WriteFailed),
            WriteState::Pending | WriteState::Idle => match state {
                LinkState::Ready => Err(TransportError::WriteTimeout(timeout.as_millis() as u64)),
                LinkState::Closed => Err(TransportError::Closed),
                _ => Err(TransportError::NotConnected),
            },
        }
    }

    /// Blocks for the oldest inbound fragment, FIFO, bounded by the exchange
    /// timeout. Copies at most `buf.len()` bytes; short reads are legal.
    pub fn read_fragment(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        {
            let inner = self.inner.lock().unwrap();
            match inner.state {
                LinkState::Ready => {}
                LinkState::Closed => return Err(TransportError::Closed),
                _ => return Err(TransportError::NotConnected),
            }
        }
        let timeout = self.config.exchange_timeout;
        let rx = self.inbound_rx.lock().unwrap();
        match rx.recv_timeout(timeout) {
            Ok(bytes) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            Err(RecvTimeoutError::Timeout) => {
                Err(TransportError::ReadTimeout(timeout.as_millis() as u64))
            }
            // Sender dropped: the queue was discarded by teardown or close.
            Err(RecvTimeoutError::Disconnected) => match self.state() {
                LinkState::Closed => Err(TransportError::Closed),
                _ => Err(TransportError::NotConnected),
            },
        }
    }

    /// Releases the physical link. Valid from any state, idempotent, and
    /// causes any in-flight write/read wait to fail promptly.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == LinkState::Closed {
                return;
            }
            inner.state = LinkState::Closed;
            inner.inbound_tx = None;
        }
        self.cond.notify_all();
        self.link.release();
        debug!("connection closed");
    }

    fn submit(
        &self,
        op: impl FnOnce() -> Result<(), TransportError>,
    ) -> Result<(), TransportError> {
        if let Err(err) = op() {
            warn!(error = %err, "link command failed");
            self.fail(err.clone());
            self.link.disconnect();
            return Err(err);
        }
        Ok(())
    }

    fn fail(&self, err: TransportError) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == LinkState::Closed {
                return;
            }
            inner.state = LinkState::Disconnected;
            inner.last_error = Some(err);
            inner.inbound_tx = None;
        }
        self.cond.notify_all();
    }
}

/// Runs listener callbacks off the radio event context so an app-controlled
/// handler can never re-enter the radio stack's event delivery.
fn dispatch(f: impl FnOnce() + Send + 'static) {
    let _ = thread::Builder::new()
        .name("cardlink-listener".into())
        .spawn(f);
}

/// Drains a platform link's event stream into the transition function.
/// Ends when the link drops its sender or the connection is closed.
pub fn spawn_event_pump(
    connection: Arc<BleConnection>,
    events: mpsc::Receiver<LinkEvent>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while let Ok(event) = events.recv() {
            if let Err(err) = connection.handle_event(event) {
                warn!(error = %err, "link event rejected");
            }
            if connection.state() == LinkState::Closed {
                break;
            }
        }
    })
}

/// Thin [`CardChannel`] facade over a [`BleConnection`]; also the
/// [`FragmentIo`] the external framing algorithm drives.
pub struct BleCardChannel {
    connection: Arc<BleConnection>,
    framer: Arc<dyn Framer>,
}

impl BleCardChannel {
    pub fn new(connection: Arc<BleConnection>) -> Self {
        let framer = Arc::clone(&connection.framer);
        Self { connection, framer }
    }

    pub fn connection(&self) -> &Arc<BleConnection> {
        &self.connection
    }
}

impl CardChannel for BleCardChannel {
    fn send(&mut self, command: &ApduCommand) -> Result<ApduResponse, TransportError> {
        if !self.connection.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let mtu = self.connection.mtu();
        let framer = Arc::clone(&self.framer);
        framer.exchange(command, mtu, self)
    }

    fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    fn pairing_key_iterations(&self) -> u32 {
        PAIRING_KEY_ITERATIONS
    }

    fn close(&mut self) {
        self.connection.close();
    }
}

impl FragmentIo for BleCardChannel {
    fn write_fragment(&mut self, fragment: &[u8]) -> Result<(), TransportError> {
        self.connection.write_fragment(fragment)
    }

    fn read_fragment(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.connection.read_fragment(buf)
    }
}

impl Drop for BleCardChannel {
    fn drop(&mut self) {
        // Last-resort safety net; callers are expected to close explicitly.
        self.connection.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{LinkCommand, MockGattLink};
    use cardlink_channel::SingleFragmentFramer;

    pub(crate) struct RecordingListener {
        state: Mutex<ListenerState>,
        cond: Condvar,
    }

    #[derive(Default)]
    struct ListenerState {
        connected: usize,
        disconnected: usize,
        channels: Vec<Box<dyn CardChannel + Send>>,
    }

    impl RecordingListener {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(ListenerState::default()),
                cond: Condvar::new(),
            })
        }

        pub(crate) fn connected_count(&self) -> usize {
            self.state.lock().unwrap().connected
        }

        pub(crate) fn disconnected_count(&self) -> usize {
            self.state.lock().unwrap().disconnected
        }

        pub(crate) fn wait_connected(&self, at_least: usize) -> bool {
            let state = self.state.lock().unwrap();
            let (_state, res) = self
                .cond
                .wait_timeout_while(state, Duration::from_secs(1), |s| s.connected < at_least)
                .unwrap();
            !res.timed_out()
        }

        pub(crate) fn wait_disconnected(&self, at_least: usize) -> bool {
            let state = self.state.lock().unwrap();
            let (_state, res) = self
                .cond
                .wait_timeout_while(state, Duration::from_secs(1), |s| s.disconnected < at_least)
                .unwrap();
            !res.timed_out()
        }
    }

    impl CardListener for RecordingListener {
        fn on_connected(&self, channel: Box<dyn CardChannel + Send>) {
            let mut state = self.state.lock().unwrap();
            state.connected += 1;
            state.channels.push(channel);
            drop(state);
            self.cond.notify_all();
        }

        fn on_disconnected(&self) {
            self.state.lock().unwrap().disconnected += 1;
            self.cond.notify_all();
        }
    }

    fn new_connection() -> (Arc<BleConnection>, Arc<MockGattLink>, Arc<RecordingListener>) {
        let link = Arc::new(MockGattLink::new());
        let listener = RecordingListener::new();
        let conn = BleConnection::new(
            Arc::clone(&link) as Arc<dyn GattLink>,
            Arc::clone(&listener) as Arc<dyn CardListener>,
            Arc::new(SingleFragmentFramer),
            BleConnectionConfig::default(),
        );
        (conn, link, listener)
    }

    fn drive_to_ready(conn: &Arc<BleConnection>, mtu: u8) {
        conn.open().unwrap();
        conn.handle_event(LinkEvent::LinkUp).unwrap();
        conn.handle_event(LinkEvent::ServiceDiscovered { found: true })
            .unwrap();
        conn.handle_event(LinkEvent::NotificationsEnabled).unwrap();
        conn.handle_event(LinkEvent::Notification(vec![0x08, 0, 0, 0, 0, mtu]))
            .unwrap();
    }

    #[test]
    fn connected_only_in_ready_state() {
        let (conn, _link, _listener) = new_connection();
        assert!(!conn.is_connected());
        conn.open().unwrap();
        assert!(!conn.is_connected());
        conn.handle_event(LinkEvent::LinkUp).unwrap();
        assert_eq!(conn.state(), LinkState::ServiceDiscovery);
        assert!(!conn.is_connected());
        conn.handle_event(LinkEvent::ServiceDiscovered { found: true })
            .unwrap();
        assert!(!conn.is_connected());
        conn.handle_event(LinkEvent::NotificationsEnabled).unwrap();
        assert_eq!(conn.state(), LinkState::MtuHandshake);
        assert!(!conn.is_connected());
        conn.handle_event(LinkEvent::Notification(vec![0x08, 0, 0, 0, 0, 0x20]))
            .unwrap();
        assert!(conn.is_connected());
        conn.close();
        assert!(!conn.is_connected());
        assert_eq!(conn.state(), LinkState::Closed);
    }

    #[test]
    fn handshake_issues_capability_request_and_negotiates_mtu() {
        let (conn, link, listener) = new_connection();
        assert_eq!(conn.mtu(), DEFAULT_MTU);
        drive_to_ready(&conn, 0x2f);
        assert_eq!(conn.mtu(), 47);
        assert!(listener.wait_connected(1));
        assert_eq!(listener.connected_count(), 1);
        assert!(link
            .take_commands()
            .contains(&LinkCommand::WriteFragment(MTU_EXCHANGE_REQUEST.to_vec())));
    }

    #[test]
    fn tagless_handshake_reply_aborts_with_protocol_mismatch() {
        let (conn, link, listener) = new_connection();
        conn.open().unwrap();
        conn.handle_event(LinkEvent::LinkUp).unwrap();
        conn.handle_event(LinkEvent::ServiceDiscovered { found: true })
            .unwrap();
        conn.handle_event(LinkEvent::NotificationsEnabled).unwrap();
        let err = conn
            .handle_event(LinkEvent::Notification(vec![0x01, 0x02]))
            .expect_err("tagless reply must abort the handshake");
        assert!(matches!(err, TransportError::ProtocolMismatch));
        assert_eq!(conn.state(), LinkState::Disconnected);
        assert!(!conn.is_connected());
        assert!(matches!(
            conn.last_error(),
            Some(TransportError::ProtocolMismatch)
        ));
        assert!(link.take_commands().contains(&LinkCommand::Disconnect));
        assert!(!listener.wait_connected(1));
    }

    #[test]
    fn missing_service_surfaces_protocol_mismatch() {
        let (conn, link, _listener) = new_connection();
        conn.open().unwrap();
        conn.handle_event(LinkEvent::LinkUp).unwrap();
        let err = conn
            .handle_event(LinkEvent::ServiceDiscovered { found: false })
            .expect_err("absent service is a permanent failure");
        assert!(matches!(err, TransportError::ProtocolMismatch));
        assert_eq!(conn.state(), LinkState::Disconnected);
        assert!(link.take_commands().contains(&LinkCommand::Disconnect));
    }

    #[test]
    fn duplicate_link_up_produces_no_second_connected_callback() {
        let (conn, _link, listener) = new_connection();
        drive_to_ready(&conn, 0x20);
        assert!(listener.wait_connected(1));
        conn.handle_event(LinkEvent::LinkUp).unwrap();
        conn.handle_event(LinkEvent::LinkUp).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(listener.connected_count(), 1);
        assert!(conn.is_connected());
    }

    #[test]
    fn link_down_from_ready_notifies_disconnect_once() {
        let (conn, _link, listener) = new_connection();
        drive_to_ready(&conn, 0x20);
        conn.handle_event(LinkEvent::LinkDown).unwrap();
        assert!(listener.wait_disconnected(1));
        conn.handle_event(LinkEvent::LinkDown).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(listener.disconnected_count(), 1);
        assert_eq!(conn.state(), LinkState::Disconnected);
    }

    #[test]
    fn notifications_after_ready_are_queued_not_reinterpreted() {
        let (conn, _link, _listener) = new_connection();
        drive_to_ready(&conn, 0x20);
        // A 0x08-tagged payload after ready is data, not a handshake reply.
        conn.handle_event(LinkEvent::Notification(vec![0x08, 0, 0, 0, 0, 0x7f]))
            .unwrap();
        assert_eq!(conn.mtu(), 32);
        let mut buf = [0u8; 16];
        let n = conn.read_fragment(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x08, 0, 0, 0, 0, 0x7f]);
    }

    #[test]
    fn close_is_idempotent_and_releases_once_per_call_path() {
        let (conn, link, _listener) = new_connection();
        drive_to_ready(&conn, 0x20);
        conn.close();
        assert_eq!(conn.state(), LinkState::Closed);
        conn.close();
        assert_eq!(conn.state(), LinkState::Closed);
        let releases = link
            .take_commands()
            .into_iter()
            .filter(|c| *c == LinkCommand::Release)
            .count();
        assert_eq!(releases, 1);
    }

    #[test]
    fn write_fragment_requires_ready() {
        let (conn, _link, _listener) = new_connection();
        assert!(matches!(
            conn.write_fragment(&[1]),
            Err(TransportError::NotConnected)
        ));
        conn.close();
        assert!(matches!(
            conn.write_fragment(&[1]),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn write_fragment_reports_radio_nack_as_write_failed() {
        let (conn, link, _listener) = new_connection();
        drive_to_ready(&conn, 0x20);
        let writer = {
            let conn = Arc::clone(&conn);
            thread::spawn(move || conn.write_fragment(&[0xaa]))
        };
        // Wait for the write to be submitted before acking it as failed.
        while !link
            .written_fragments()
            .contains(&vec![0xaa]) {
            thread::sleep(Duration::from_millis(5));
        }
        conn.handle_event(LinkEvent::WriteCompleted { ok: false })
            .unwrap();
        assert!(matches!(
            writer.join().unwrap(),
            Err(TransportError::WriteFailed)
        ));
    }

    #[test]
    fn channel_facade_exchanges_one_command() {
        let (conn, link, _listener) = new_connection();
        drive_to_ready(&conn, 0x20);
        let mut channel = BleCardChannel::new(Arc::clone(&conn));
        assert!(channel.is_connected());
        assert_eq!(channel.pairing_key_iterations(), PAIRING_KEY_ITERATIONS);

        let exchanger = thread::spawn(move || {
            let cmd = ApduCommand::new(0x00, 0xa4, 0x04, 0x00, vec![0x01]);
            let rsp = channel.send(&cmd)?;
            Ok::<_, TransportError>(rsp)
        });
        while link.written_fragments().len() < 2 {
            thread::sleep(Duration::from_millis(5));
        }
        conn.handle_event(LinkEvent::WriteCompleted { ok: true })
            .unwrap();
        conn.handle_event(LinkEvent::Notification(vec![0x05, 0x90, 0x00]))
            .unwrap();
        let rsp = exchanger.join().unwrap().unwrap();
        assert_eq!(rsp.data(), &[0x05]);
        assert!(rsp.is_ok());
    }

    #[test]
    fn channel_drop_closes_the_connection() {
        let (conn, _link, _listener) = new_connection();
        drive_to_ready(&conn, 0x20);
        drop(BleCardChannel::new(Arc::clone(&conn)));
        assert_eq!(conn.state(), LinkState::Closed);
    }

    #[test]
    fn event_pump_exits_once_every_link_sender_is_gone() {
        let (conn, _link, _listener) = new_connection();
        let (tx, rx) = mpsc::channel();
        let pump = spawn_event_pump(Arc::clone(&conn), rx);
        // The platform side must not retain sender clones past the link's
        // lifetime, or this thread would park in recv() forever.
        drop(tx);
        pump.join().unwrap();
        assert_eq!(conn.state(), LinkState::Disconnected);
    }
}

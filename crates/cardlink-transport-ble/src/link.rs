use std::sync::mpsc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use cardlink_core::TransportError;

/// Events the radio stack delivers asynchronously for one physical link.
/// Each maps to one GATT callback of the underlying platform binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Physical link established.
    LinkUp,
    /// Physical link lost or torn down by the peer.
    LinkDown,
    /// Service discovery finished; `found` is false when the peer does not
    /// expose the card service.
    ServiceDiscovered { found: bool },
    /// Notification delivery on the response characteristic is enabled.
    NotificationsEnabled,
    /// Outcome of the last characteristic write.
    WriteCompleted { ok: bool },
    /// One inbound notification payload.
    Notification(Vec<u8>),
}

/// Commands the state machine issues to a platform link. Submissions only;
/// outcomes come back as [`LinkEvent`]s on the radio event context.
pub trait GattLink: Send + Sync {
    /// Initiates the physical connection.
    fn connect(&self) -> Result<(), TransportError>;
    /// Starts discovery of the card service and its characteristics.
    fn discover_services(&self) -> Result<(), TransportError>;
    /// Enables notifications on the response characteristic by writing its
    /// configuration descriptor.
    fn enable_notifications(&self) -> Result<(), TransportError>;
    /// Submits one outbound fragment to the write characteristic.
    fn write_fragment(&self, fragment: &[u8]) -> Result<(), TransportError>;
    /// Tears the physical link down.
    fn disconnect(&self);
    /// Releases the OS-level link resource. Must be idempotent.
    fn release(&self);
}

/// Command record kept by [`MockGattLink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    Connect,
    DiscoverServices,
    EnableNotifications,
    WriteFragment(Vec<u8>),
    Disconnect,
    Release,
}

/// Scripted link for tests: records every command and can optionally answer
/// some of them with events on an attached channel.
#[derive(Debug, Default)]
pub struct MockGattLink {
    commands: Mutex<Vec<LinkCommand>>,
    events: Mutex<Option<mpsc::Sender<LinkEvent>>>,
    auto_link_up: AtomicBool,
    auto_discovery: AtomicBool,
    auto_ack_writes: AtomicBool,
}

impl MockGattLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches the sender that auto-acknowledge events are emitted on.
    pub fn attach_events(&self, events: mpsc::Sender<LinkEvent>) {
        *self.events.lock().unwrap() = Some(events);
    }

    /// When enabled, `connect()` immediately reports `LinkUp`.
    pub fn set_auto_link_up(&self, enabled: bool) {
        self.auto_link_up.store(enabled, Ordering::SeqCst);
    }

    /// When enabled, service discovery immediately reports the card service
    /// present and notification setup immediately confirms.
    pub fn set_auto_discovery(&self, enabled: bool) {
        self.auto_discovery.store(enabled, Ordering::SeqCst);
    }

    /// When enabled, every fragment write immediately reports success.
    pub fn set_auto_ack_writes(&self, enabled: bool) {
        self.auto_ack_writes.store(enabled, Ordering::SeqCst);
    }

    /// Drains and returns all commands issued so far.
    pub fn take_commands(&self) -> Vec<LinkCommand> {
        std::mem::take(&mut *self.commands.lock().unwrap())
    }

    /// Fragments written so far, without draining the command log.
    pub fn written_fragments(&self) -> Vec<Vec<u8>> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter_map(|cmd| match cmd {
                LinkCommand::WriteFragment(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, command: LinkCommand) {
        self.commands.lock().unwrap().push(command);
    }

    fn emit(&self, event: LinkEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }
}

impl GattLink for MockGattLink {
    fn connect(&self) -> Result<(), TransportError> {
        self.record(LinkCommand::Connect);
        if self.auto_link_up.load(Ordering::SeqCst) {
            self.emit(LinkEvent::LinkUp);
        }
        Ok(())
    }

    fn discover_services(&self) -> Result<(), TransportError> {
        self.record(LinkCommand::DiscoverServices);
        if self.auto_discovery.load(Ordering::SeqCst) {
            self.emit(LinkEvent::ServiceDiscovered { found: true });
        }
        Ok(())
    }

    fn enable_notifications(&self) -> Result<(), TransportError> {
        self.record(LinkCommand::EnableNotifications);
        if self.auto_discovery.load(Ordering::SeqCst) {
            self.emit(LinkEvent::NotificationsEnabled);
        }
        Ok(())
    }

    fn write_fragment(&self, fragment: &[u8]) -> Result<(), TransportError> {
        self.record(LinkCommand::WriteFragment(fragment.to_vec()));
        if self.auto_ack_writes.load(Ordering::SeqCst) {
            self.emit(LinkEvent::WriteCompleted { ok: true });
        }
        Ok(())
    }

    fn disconnect(&self) {
        self.record(LinkCommand::Disconnect);
    }

    fn release(&self) {
        self.record(LinkCommand::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_link_records_commands_in_order() {
        let link = MockGattLink::new();
        link.connect().unwrap();
        link.write_fragment(&[1, 2]).unwrap();
        link.release();
        assert_eq!(
            link.take_commands(),
            vec![
                LinkCommand::Connect,
                LinkCommand::WriteFragment(vec![1, 2]),
                LinkCommand::Release,
            ]
        );
    }

    #[test]
    fn mock_link_auto_acks_when_configured() {
        let link = MockGattLink::new();
        let (tx, rx) = mpsc::channel();
        link.attach_events(tx);
        link.set_auto_link_up(true);
        link.set_auto_ack_writes(true);

        link.connect().unwrap();
        link.write_fragment(&[9]).unwrap();
        assert_eq!(rx.try_recv().unwrap(), LinkEvent::LinkUp);
        assert_eq!(rx.try_recv().unwrap(), LinkEvent::WriteCompleted { ok: true });
    }
}

//! BLE transport for CARDLINK.
//!
//! Turns the radio stack's asynchronous, notification-driven event model
//! into the synchronous, ordered, timeout-bounded fragment exchange the
//! card protocol stack expects. The platform binding is abstracted behind
//! [`GattLink`]/[`BleCentral`]; enable the `btleplug` feature for the
//! hardware backend.

#[cfg(feature = "btleplug")]
pub mod btleplug_backend;
pub mod connection;
pub mod link;
pub mod manager;
pub mod protocol;

pub use connection::{
    spawn_event_pump, BleCardChannel, BleConnection, BleConnectionConfig, FragmentQueueStats,
    LinkState,
};
pub use link::{GattLink, LinkCommand, LinkEvent, MockGattLink};
pub use manager::{
    BleCentral, BondState, CardDeviceManager, CentralEvent, DeviceHandle, ManagerConfig,
    MockCentral, MockLinkHandle, ScanSession,
};

//! Diagnostic CLI for the BLE card transport: scan for cards and open a
//! connection to one, reporting the negotiated transfer unit.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for card devices and print each one discovered
    Scan {
        /// How long to scan, in seconds
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
    /// Connect to a card by platform device id and report the handshake
    Connect {
        /// Device id as printed by `scan`
        id: String,
        /// How long to wait for the handshake, in seconds
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
}

fn main() {
    let filter = std::env::var("CARDLINK_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Scan { seconds } => ble::scan(seconds),
        Commands::Connect { id, seconds } => ble::connect(&id, seconds),
    };
    std::process::exit(code);
}

#[cfg(feature = "btleplug")]
mod ble {
    use std::sync::{Arc, Condvar, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use tracing::{error, info};

    use cardlink_channel::{CardChannel, CardListener, SingleFragmentFramer};
    use cardlink_transport_ble::btleplug_backend::{BtleplugCentral, BtleplugCentralConfig};
    use cardlink_transport_ble::{CardDeviceManager, DeviceHandle, ManagerConfig};

    fn manager() -> Result<CardDeviceManager<BtleplugCentral>, i32> {
        let central = BtleplugCentral::spawn(BtleplugCentralConfig::default()).map_err(|err| {
            error!(error = %err, "failed to start the BLE backend");
            1
        })?;
        // The worker needs a moment to claim an adapter.
        thread::sleep(Duration::from_millis(500));
        let manager = CardDeviceManager::new(
            central,
            Arc::new(SingleFragmentFramer),
            ManagerConfig::default(),
        );
        if let Err(err) = manager.ensure_radio_enabled() {
            error!(error = %err, "radio unavailable");
            return Err(1);
        }
        Ok(manager)
    }

    pub fn scan(seconds: u64) -> i32 {
        let manager = match manager() {
            Ok(m) => m,
            Err(code) => return code,
        };
        let session = match manager.scan(|device| {
            println!(
                "{}  {}",
                device.id,
                device.name.as_deref().unwrap_or("(unnamed)")
            );
        }) {
            Ok(session) => session,
            Err(err) => {
                error!(error = %err, "scan failed to start");
                return 1;
            }
        };
        info!(seconds, "scanning");
        thread::sleep(Duration::from_secs(seconds));
        manager.stop_scan(session);
        0
    }

    struct ReportingListener {
        channel: Mutex<Option<Box<dyn CardChannel + Send>>>,
        cond: Condvar,
    }

    impl ReportingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                channel: Mutex::new(None),
                cond: Condvar::new(),
            })
        }

        fn wait_channel(&self, timeout: Duration) -> Option<Box<dyn CardChannel + Send>> {
            let slot = self.channel.lock().unwrap();
            let (mut slot, _) = self
                .cond
                .wait_timeout_while(slot, timeout, |s| s.is_none())
                .unwrap();
            slot.take()
        }
    }

    impl CardListener for ReportingListener {
        fn on_connected(&self, channel: Box<dyn CardChannel + Send>) {
            *self.channel.lock().unwrap() = Some(channel);
            self.cond.notify_all();
        }

        fn on_disconnected(&self) {
            info!("card disconnected");
        }
    }

    pub fn connect(id: &str, seconds: u64) -> i32 {
        let manager = match manager() {
            Ok(m) => m,
            Err(code) => return code,
        };
        let listener = ReportingListener::new();
        manager.set_listener(Arc::clone(&listener) as Arc<dyn CardListener>);

        // Scan until the requested device shows up; connecting needs the
        // platform to have seen it first.
        let (found_tx, found_rx) = std::sync::mpsc::channel::<DeviceHandle>();
        let wanted = id.to_string();
        let session = match manager.scan(move |device| {
            if device.id == wanted {
                let _ = found_tx.send(device);
            }
        }) {
            Ok(session) => session,
            Err(err) => {
                error!(error = %err, "scan failed to start");
                return 1;
            }
        };
        let device = found_rx.recv_timeout(Duration::from_secs(seconds));
        manager.stop_scan(session);
        let device = match device {
            Ok(device) => device,
            Err(_) => {
                error!(id, "device not seen during scan");
                return 1;
            }
        };

        let start = Instant::now();
        let connection = match manager.connect(&device) {
            Ok(connection) => connection,
            Err(err) => {
                error!(error = %err, "connect failed");
                return 1;
            }
        };
        let Some(mut channel) = listener.wait_channel(Duration::from_secs(seconds)) else {
            error!(
                elapsed_ms = start.elapsed().as_millis() as u64,
                error = ?connection.last_error(),
                "handshake did not complete"
            );
            connection.close();
            return 1;
        };
        println!(
            "connected to {} in {}ms, transfer unit {} bytes",
            device.id,
            start.elapsed().as_millis(),
            connection.mtu()
        );
        channel.close();
        0
    }
}

#[cfg(not(feature = "btleplug"))]
mod ble {
    pub fn scan(_seconds: u64) -> i32 {
        eprintln!("built without the btleplug feature; rebuild with --features btleplug");
        2
    }

    pub fn connect(_id: &str, _seconds: u64) -> i32 {
        eprintln!("built without the btleplug feature; rebuild with --features btleplug");
        2
    }
}

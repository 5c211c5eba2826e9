//! Bluetooth Service Module
//!
//! Runs the [`ConnectionManager`] as a single task. Radio events and
//! application commands are consumed from one `select!` loop, so every state
//! transition, registry mutation and value callback happens on one serialized
//! context.

use crate::domain::models::AppEvent;
use crate::infrastructure::bluetooth::connection::{ConnectionConfig, ConnectionManager};
use crate::infrastructure::bluetooth::protocol::{RadioEvent, RadioLink};
use crate::infrastructure::bluetooth::resource::DataResource;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Requests from the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BluetoothCommand {
    StartScan,
    StopScan,
    Shutdown,
}

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService {
    manager: ConnectionManager,
    radio_events: mpsc::UnboundedReceiver<RadioEvent>,
    commands: mpsc::UnboundedReceiver<BluetoothCommand>,
}

impl BluetoothService {
    /// Create a new Bluetooth service
    ///
    /// `link` carries commands to the radio backend, `radio_events` carries
    /// its events back.
    pub fn new(
        config: ConnectionConfig,
        link: RadioLink,
        radio_events: mpsc::UnboundedReceiver<RadioEvent>,
        commands: mpsc::UnboundedReceiver<BluetoothCommand>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            manager: ConnectionManager::new(config, link, event_sender),
            radio_events,
            commands,
        }
    }

    /// Register a resource. Call before [`run`](Self::run).
    pub fn register<R>(&mut self, resource: R)
    where
        R: DataResource + 'static,
    {
        self.manager.register(resource);
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Process events until shut down or both channels close
    pub async fn run(mut self) -> ConnectionManager {
        info!(
            "Bluetooth service started with {} resource(s)",
            self.manager.registry().len()
        );
        let mut radio_open = true;
        let mut commands_open = true;

        while radio_open || commands_open {
            tokio::select! {
                // Application requests first
                biased;

                command = self.commands.recv(), if commands_open => match command {
                    Some(BluetoothCommand::StartScan) => self.manager.begin_scan(),
                    Some(BluetoothCommand::StopScan) => self.manager.stop_scan(),
                    Some(BluetoothCommand::Shutdown) => {
                        self.manager.stop_scan();
                        break;
                    }
                    None => commands_open = false,
                },
                event = self.radio_events.recv(), if radio_open => match event {
                    Some(event) => {
                        debug!("Radio event: {:?}", event);
                        self.manager.handle_event(event);
                    }
                    None => {
                        info!("Radio backend closed its event channel");
                        radio_open = false;
                    }
                },
            }
        }

        info!("Bluetooth service stopped");
        self.manager
    }
}

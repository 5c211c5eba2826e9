//! BLE Connection Module
//!
//! The connection lifecycle state machine:
//!
//! ```text
//! Idle ──begin_scan──▶ Scanning ──match──▶ Connecting ──connected──▶ DiscoveringServices
//!                         ▲                  │    ▲                         │
//!                         └──connect failed──┘    │                characteristics
//!                                                 │                         ▼
//!                                                 └────disconnected──────  Bound
//! ```
//!
//! Every transition happens in [`ConnectionManager::handle_event`] or in the
//! two application calls [`ConnectionManager::begin_scan`] and
//! [`ConnectionManager::stop_scan`]. The manager never waits on the radio: it
//! queues a [`RadioCommand`] and the outcome arrives later as another event.

use crate::domain::codec::RawPayload;
use crate::domain::models::{AppEvent, ConnectionStatus, MessageSeverity, StatusMessage};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::protocol::{
    Advertisement, CharacteristicHandle, DiscoveredCharacteristic, DiscoveredService,
    PeripheralHandle, PeripheralStatus, RadioCommand, RadioEvent, RadioLink, RadioState,
    RestoredPeripheral, ServiceHandle,
};
use crate::infrastructure::bluetooth::registry::ResourceRegistry;
use crate::infrastructure::bluetooth::resource::DataResource;
use crate::infrastructure::bluetooth::scanner::BleScanner;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Where the manager is in the connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting(PeripheralHandle),
    DiscoveringServices(PeripheralHandle),
    Bound(PeripheralHandle),
}

impl ConnectionState {
    /// The active peripheral, if any
    pub fn peripheral(&self) -> Option<PeripheralHandle> {
        match *self {
            Self::Idle | Self::Scanning => None,
            Self::Connecting(p) | Self::DiscoveringServices(p) | Self::Bound(p) => Some(p),
        }
    }
}

/// Connection failures. Both are recovered locally and only logged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("failed to connect to {peripheral}: {reason}")]
    ConnectFailed {
        peripheral: PeripheralHandle,
        reason: String,
    },
    #[error("restoration state contains no connected or connecting peripheral")]
    RestorationMismatch,
}

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Advertised name of the peripheral to connect to
    pub device_name: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for ConnectionConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            device_name: settings.device_name.clone(),
        }
    }
}

/// Owns the radio session for the single configured peripheral
pub struct ConnectionManager {
    link: RadioLink,
    registry: ResourceRegistry,
    scanner: BleScanner,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    radio_state: RadioState,
    state: ConnectionState,
    /// begin_scan() was requested before the radio was ready
    wants_scan: bool,
    /// Services of the active peripheral and the characteristics found in each
    services: HashMap<ServiceHandle, Vec<CharacteristicHandle>>,
    /// Services whose characteristics have not been enumerated yet
    pending_services: HashSet<ServiceHandle>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        link: RadioLink,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            registry: ResourceRegistry::new(link.clone()),
            scanner: BleScanner::new(link.clone(), config.device_name),
            link,
            event_sender,
            radio_state: RadioState::Unknown,
            state: ConnectionState::Idle,
            wants_scan: false,
            services: HashMap::new(),
            pending_services: HashSet::new(),
        }
    }

    pub fn register<R>(&mut self, resource: R)
    where
        R: DataResource + 'static,
    {
        self.registry.register(resource);
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn radio_state(&self) -> RadioState {
        self.radio_state
    }

    pub fn wants_scan(&self) -> bool {
        self.wants_scan
    }

    /// Scan for the configured peripheral
    ///
    /// Does nothing while a peripheral is connected or being connected. If
    /// the radio is not powered on yet the request is remembered and replayed
    /// once it is.
    pub fn begin_scan(&mut self) {
        if let Some(peripheral) = self.state.peripheral() {
            self.wants_scan = false;
            info!(
                "Requested scan but already connected/connecting to {}",
                peripheral
            );
            return;
        }

        if self.radio_state != RadioState::PoweredOn {
            self.wants_scan = true;
            info!("Requested scan but bluetooth not ready ({:?})", self.radio_state);
            return;
        }

        self.wants_scan = false;
        if self.scanner.is_scanning() {
            debug!("Scan already running");
            return;
        }

        self.scanner.start(&self.registry.required_service_ids());
        self.state = ConnectionState::Scanning;
        self.send_log(
            &format!("Scanning for {}...", self.scanner.device_name()),
            MessageSeverity::Info,
        );
    }

    /// Stop scanning and forget any deferred scan request
    pub fn stop_scan(&mut self) {
        self.wants_scan = false;
        self.scanner.stop();
        if self.state == ConnectionState::Scanning {
            self.state = ConnectionState::Idle;
        }
    }

    /// Apply one event from the radio stack
    pub fn handle_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::StateChanged(state) => self.on_radio_state(state),
            RadioEvent::Restored { peripherals } => self.on_restored(peripherals),
            RadioEvent::PeripheralDiscovered(advertisement) => {
                self.on_advertisement(advertisement)
            }
            RadioEvent::Connected(peripheral) => self.on_connected(peripheral),
            RadioEvent::ConnectFailed { peripheral, error } => {
                self.on_connect_failed(peripheral, error)
            }
            RadioEvent::Disconnected { peripheral, error } => {
                self.on_disconnected(peripheral, error)
            }
            RadioEvent::ServicesDiscovered {
                peripheral,
                services,
                error,
            } => self.on_services_discovered(peripheral, services, error),
            RadioEvent::ServicesInvalidated {
                peripheral,
                services,
            } => self.on_services_invalidated(peripheral, services),
            RadioEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                characteristics,
                error,
            } => self.on_characteristics_discovered(peripheral, service, characteristics, error),
            RadioEvent::ValueUpdated {
                characteristic,
                value,
                error,
            } => match error {
                Some(e) => warn!("Value update for {} failed: {}", characteristic, e),
                None => self
                    .registry
                    .on_value_updated(characteristic, RawPayload::from(value)),
            },
            RadioEvent::WriteConfirmed {
                characteristic,
                error,
            } => match error {
                Some(e) => warn!("Write to {} failed: {}", characteristic, e),
                None => debug!("Write to {} confirmed", characteristic),
            },
            RadioEvent::NotifyStateChanged {
                characteristic,
                enabled,
                error,
            } => match error {
                Some(e) => warn!(
                    "Could not set notifications on {} to {}: {}",
                    characteristic, enabled, e
                ),
                None => debug!("Notifications on {} now {}", characteristic, enabled),
            },
        }
    }

    fn on_radio_state(&mut self, state: RadioState) {
        let previous = std::mem::replace(&mut self.radio_state, state);
        info!("Radio state changed: {:?} -> {:?}", previous, state);
        if previous == state {
            return;
        }

        if state != RadioState::PoweredOn {
            self.on_radio_lost();
            return;
        }

        match self.state {
            ConnectionState::Connecting(peripheral) => {
                info!("Finishing connecting to {}", peripheral);
                self.link.submit(RadioCommand::Connect(peripheral));
            }
            ConnectionState::DiscoveringServices(peripheral) | ConnectionState::Bound(peripheral) => {
                info!("Already connected to {}, discovering services", peripheral);
                self.discover_services(peripheral);
            }
            ConnectionState::Idle | ConnectionState::Scanning => {
                if self.wants_scan {
                    info!("Initiating scan since bluetooth is enabled");
                    self.begin_scan();
                }
            }
        }
    }

    fn on_radio_lost(&mut self) {
        self.release_characteristics();
        self.registry.unbind_all();
        self.scanner.reset();

        match self.state {
            ConnectionState::Idle => {}
            ConnectionState::Scanning => {
                // Resume once power comes back
                self.state = ConnectionState::Idle;
                self.wants_scan = true;
            }
            ConnectionState::Connecting(peripheral) => {
                debug!("Keeping connect request for {} until power returns", peripheral);
            }
            ConnectionState::DiscoveringServices(peripheral) | ConnectionState::Bound(peripheral) => {
                self.send_status(ConnectionStatus::Disconnected);
                self.state = ConnectionState::Connecting(peripheral);
            }
        }
    }

    fn on_restored(&mut self, peripherals: Vec<RestoredPeripheral>) {
        info!("Restoring radio state ({} peripheral(s))", peripherals.len());

        if let Some(active) = self.state.peripheral() {
            warn!("Ignoring restoration state, already tracking {}", active);
            return;
        }

        let restored = peripherals.into_iter().find(|p| {
            matches!(
                p.status,
                PeripheralStatus::Connected | PeripheralStatus::Connecting
            )
        });
        let Some(restored) = restored else {
            warn!("{}", ConnectionError::RestorationMismatch);
            return;
        };

        self.wants_scan = false;
        if self.scanner.is_scanning() {
            self.scanner.stop();
        }
        let powered = self.radio_state == RadioState::PoweredOn;

        match restored.status {
            PeripheralStatus::Connected => {
                info!("Restored connected peripheral {}", restored.handle);
                self.send_status(ConnectionStatus::Connected);
                self.state = ConnectionState::DiscoveringServices(restored.handle);
                if powered {
                    self.discover_services(restored.handle);
                }
            }
            _ => {
                info!("Still connecting to restored peripheral {}", restored.handle);
                self.send_status(ConnectionStatus::Connecting);
                self.state = ConnectionState::Connecting(restored.handle);
                if powered {
                    self.link.submit(RadioCommand::Connect(restored.handle));
                }
            }
        }
    }

    fn on_advertisement(&mut self, advertisement: Advertisement) {
        if self.state != ConnectionState::Scanning {
            debug!(
                "Ignoring advertisement from {} while {:?}",
                advertisement.peripheral, self.state
            );
            return;
        }

        if !self.scanner.matches(&advertisement) {
            return;
        }

        info!(
            "Found {} at {}",
            self.scanner.device_name(),
            advertisement.peripheral
        );
        self.scanner.stop();
        self.connect(advertisement.peripheral);
    }

    fn on_connected(&mut self, peripheral: PeripheralHandle) {
        if self.state != ConnectionState::Connecting(peripheral) {
            warn!("Unexpected connection to {} while {:?}", peripheral, self.state);
            return;
        }

        info!("Connected to peripheral {}", peripheral);
        self.send_status(ConnectionStatus::Connected);
        self.discover_services(peripheral);
    }

    fn on_connect_failed(&mut self, peripheral: PeripheralHandle, error: Option<String>) {
        if self.state != ConnectionState::Connecting(peripheral) {
            debug!("Ignoring connect failure for {}", peripheral);
            return;
        }

        let error = ConnectionError::ConnectFailed {
            peripheral,
            reason: error.unwrap_or_else(|| "unknown error".to_string()),
        };
        warn!("{}", error);
        self.send_log(&error.to_string(), MessageSeverity::Warning);
        self.send_status(ConnectionStatus::Disconnected);

        self.state = ConnectionState::Idle;
        self.begin_scan();
    }

    fn on_disconnected(&mut self, peripheral: PeripheralHandle, error: Option<String>) {
        if self.state.peripheral() != Some(peripheral) {
            debug!("Ignoring disconnect from inactive {}", peripheral);
            return;
        }

        match error {
            Some(e) => warn!("Disconnected from peripheral {}: {}", peripheral, e),
            None => info!("Disconnected from peripheral {}", peripheral),
        }
        self.send_status(ConnectionStatus::Disconnected);
        self.release_characteristics();

        // Connect requests do not expire, so there is no need to scan again
        self.connect(peripheral);
    }

    fn on_services_discovered(
        &mut self,
        peripheral: PeripheralHandle,
        services: Vec<DiscoveredService>,
        error: Option<String>,
    ) {
        if self.state != ConnectionState::DiscoveringServices(peripheral) {
            debug!("Ignoring service discovery for {}", peripheral);
            return;
        }
        if let Some(e) = error {
            warn!("Service discovery on {} failed: {}", peripheral, e);
            return;
        }

        let required = self.registry.required_service_ids();
        for service in services {
            if !required.contains(&service.id) {
                debug!("Skipping unrequested service {}", service.id);
                continue;
            }
            debug!("Discovering characteristics of {} ({})", service.handle, service.id);
            self.services.entry(service.handle).or_default();
            self.pending_services.insert(service.handle);
            self.link.submit(RadioCommand::DiscoverCharacteristics {
                peripheral,
                service: service.handle,
            });
        }

        if self.pending_services.is_empty() {
            warn!("No required services found on {}", peripheral);
            self.state = ConnectionState::Bound(peripheral);
        }
    }

    fn on_services_invalidated(&mut self, peripheral: PeripheralHandle, services: Vec<ServiceHandle>) {
        match self.state {
            ConnectionState::DiscoveringServices(p) | ConnectionState::Bound(p) if p == peripheral => {}
            _ => {
                debug!("Ignoring service change on {}", peripheral);
                return;
            }
        }

        info!("Peripheral {} modified {} service(s)", peripheral, services.len());
        for service in services {
            self.pending_services.remove(&service);
            for characteristic in self.services.remove(&service).unwrap_or_default() {
                self.registry.on_disconnected(characteristic);
            }
        }
        self.discover_services(peripheral);
    }

    fn on_characteristics_discovered(
        &mut self,
        peripheral: PeripheralHandle,
        service: ServiceHandle,
        characteristics: Vec<DiscoveredCharacteristic>,
        error: Option<String>,
    ) {
        if self.state.peripheral() != Some(peripheral) || !self.services.contains_key(&service) {
            debug!("Ignoring characteristics of {} on {}", service, peripheral);
            return;
        }

        match error {
            Some(e) => warn!("Characteristic discovery for {} failed: {}", service, e),
            None => {
                let current: Vec<CharacteristicHandle> =
                    characteristics.iter().map(|c| c.handle).collect();
                let previous = self
                    .services
                    .insert(service, current.clone())
                    .unwrap_or_default();
                for stale in previous.into_iter().filter(|h| !current.contains(h)) {
                    self.registry.on_disconnected(stale);
                }

                for characteristic in characteristics {
                    debug!("Characteristic {} ({})", characteristic.handle, characteristic.id);
                    self.registry
                        .on_discovered(characteristic.handle, characteristic.id);
                    // Seed the initial value
                    self.link.submit(RadioCommand::ReadValue(characteristic.handle));
                }
            }
        }

        self.pending_services.remove(&service);
        if self.pending_services.is_empty()
            && self.state == ConnectionState::DiscoveringServices(peripheral)
        {
            self.state = ConnectionState::Bound(peripheral);
            info!(
                "Peripheral {} bound ({} characteristic(s))",
                peripheral,
                self.registry.bound_count()
            );
            self.send_log(
                &format!("Connected to {}", self.scanner.device_name()),
                MessageSeverity::Success,
            );
        }
    }

    fn connect(&mut self, peripheral: PeripheralHandle) {
        self.state = ConnectionState::Connecting(peripheral);
        self.send_status(ConnectionStatus::Connecting);
        self.link.submit(RadioCommand::Connect(peripheral));
    }

    fn discover_services(&mut self, peripheral: PeripheralHandle) {
        self.state = ConnectionState::DiscoveringServices(peripheral);
        self.link.submit(RadioCommand::DiscoverServices {
            peripheral,
            services: self.registry.required_service_ids().into_iter().collect(),
        });
    }

    /// Unbind every characteristic of every known service
    fn release_characteristics(&mut self) {
        for (_, characteristics) in self.services.drain() {
            for characteristic in characteristics {
                self.registry.on_disconnected(characteristic);
            }
        }
        self.pending_services.clear();
    }

    fn send_status(&self, status: ConnectionStatus) {
        let _ = self.event_sender.send(AppEvent::ConnectionStatus(status));
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

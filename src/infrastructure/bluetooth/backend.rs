//! btleplug Radio Backend
//!
//! Performs [`RadioCommand`]s against the first local adapter and reports the
//! outcomes as [`RadioEvent`]s. Commands for one peripheral run in order on
//! that peripheral's worker; scan commands run on their own task.

use crate::domain::models::{CharacteristicId, ServiceId};
use crate::infrastructure::bluetooth::protocol::{
    Advertisement, CharacteristicHandle, DiscoveredCharacteristic, DiscoveredService,
    PeripheralHandle, PeripheralStatus, RadioCommand, RadioEvent, RadioState, RestoredPeripheral,
    ServiceHandle,
};
use crate::infrastructure::bluetooth::worker::{Forwarders, PeripheralWorkers};
use anyhow::Result;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Maps opaque handles to btleplug objects
///
/// Handles are keyed by identity, so rediscovering the same characteristic
/// yields the same handle.
#[derive(Default)]
struct HandleTable {
    next: u64,
    peripherals: HashMap<PeripheralHandle, Peripheral>,
    peripheral_ids: HashMap<PeripheralId, PeripheralHandle>,
    services: HashMap<ServiceHandle, (PeripheralHandle, ServiceId)>,
    service_keys: HashMap<(PeripheralHandle, ServiceId), ServiceHandle>,
    characteristics: HashMap<CharacteristicHandle, (PeripheralHandle, Characteristic)>,
    characteristic_keys:
        HashMap<(PeripheralHandle, ServiceId, CharacteristicId), CharacteristicHandle>,
    forwarders: Forwarders,
}

impl HandleTable {
    fn allocate(&mut self) -> u64 {
        self.next += 1;
        self.next
    }

    fn peripheral_handle(&mut self, peripheral: &Peripheral) -> PeripheralHandle {
        let id = peripheral.id();
        if let Some(handle) = self.peripheral_ids.get(&id) {
            return *handle;
        }
        let handle = PeripheralHandle(self.allocate());
        self.peripheral_ids.insert(id, handle);
        self.peripherals.insert(handle, peripheral.clone());
        handle
    }

    fn service_handle(&mut self, peripheral: PeripheralHandle, id: ServiceId) -> ServiceHandle {
        if let Some(handle) = self.service_keys.get(&(peripheral, id)) {
            return *handle;
        }
        let handle = ServiceHandle(self.allocate());
        self.service_keys.insert((peripheral, id), handle);
        self.services.insert(handle, (peripheral, id));
        handle
    }

    fn characteristic_handle(
        &mut self,
        peripheral: PeripheralHandle,
        characteristic: &Characteristic,
    ) -> CharacteristicHandle {
        let key = (peripheral, characteristic.service_uuid, characteristic.uuid);
        if let Some(handle) = self.characteristic_keys.get(&key) {
            return *handle;
        }
        let handle = CharacteristicHandle(self.allocate());
        self.characteristic_keys.insert(key, handle);
        self.characteristics
            .insert(handle, (peripheral, characteristic.clone()));
        handle
    }

    fn find_characteristic(
        &self,
        peripheral: PeripheralHandle,
        uuid: CharacteristicId,
    ) -> Option<CharacteristicHandle> {
        self.characteristics
            .iter()
            .find(|(_, (p, c))| *p == peripheral && c.uuid == uuid)
            .map(|(handle, _)| *handle)
    }
}

/// Radio backend on top of btleplug
#[derive(Clone)]
pub struct BtleplugRadio {
    adapter: Adapter,
    table: Arc<Mutex<HandleTable>>,
    events: mpsc::UnboundedSender<RadioEvent>,
}

impl BtleplugRadio {
    /// Open the first adapter and start serving `commands`
    ///
    /// Peripherals that are already connected when the backend starts are
    /// reported as restoration state before the radio reports power.
    pub async fn start(
        mut commands: mpsc::UnboundedReceiver<RadioCommand>,
        events: mpsc::UnboundedSender<RadioEvent>,
    ) -> Result<JoinHandle<()>> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No Bluetooth adapter found"))?;
        info!("Using Bluetooth adapter {}", adapter.adapter_info().await?);

        let radio = Self {
            adapter,
            table: Arc::new(Mutex::new(HandleTable::default())),
            events,
        };

        radio.report_restored().await?;
        let mut central_events = radio.adapter.events().await?;
        radio.emit(RadioEvent::StateChanged(RadioState::PoweredOn));

        let mut workers = PeripheralWorkers::new({
            let radio = radio.clone();
            move |command| {
                let radio = radio.clone();
                async move { radio.perform(command).await }
            }
        });

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = central_events.next() => match event {
                        Some(event) => radio.on_central_event(event).await,
                        None => {
                            warn!("Adapter event stream ended");
                            radio.emit(RadioEvent::StateChanged(RadioState::Unknown));
                            break;
                        }
                    },
                    command = commands.recv() => match command {
                        Some(command) => workers.dispatch(radio.owner(&command), command),
                        None => {
                            debug!("Command channel closed, stopping radio backend");
                            break;
                        }
                    },
                }
            }
        }))
    }

    async fn report_restored(&self) -> Result<()> {
        let mut restored = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            if peripheral.is_connected().await.unwrap_or(false) {
                let handle = self.table().peripheral_handle(&peripheral);
                if let Err(e) = self.watch_notifications(handle, &peripheral).await {
                    warn!("Could not watch notifications of {}: {}", handle, e);
                }
                restored.push(RestoredPeripheral {
                    handle,
                    status: PeripheralStatus::Connected,
                });
            }
        }

        if !restored.is_empty() {
            info!("Found {} already connected peripheral(s)", restored.len());
            self.emit(RadioEvent::Restored {
                peripherals: restored,
            });
        }
        Ok(())
    }

    async fn on_central_event(&self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                if let Err(e) = self.report_advertisement(&id).await {
                    debug!("Could not read advertisement of {:?}: {}", id, e);
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let handle = self.table().peripheral_ids.get(&id).copied();
                if let Some(peripheral) = handle {
                    self.emit(RadioEvent::Disconnected {
                        peripheral,
                        error: None,
                    });
                }
            }
            // Connections are reported by the connect task itself
            _ => {}
        }
    }

    async fn report_advertisement(&self, id: &PeripheralId) -> Result<()> {
        let peripheral = self.adapter.peripheral(id).await?;
        let Some(properties) = peripheral.properties().await? else {
            return Ok(());
        };
        let handle = self.table().peripheral_handle(&peripheral);
        self.emit(RadioEvent::PeripheralDiscovered(Advertisement {
            peripheral: handle,
            name: None,
            local_name: properties.local_name,
            service_ids: properties.services,
            rssi: properties.rssi,
        }));
        Ok(())
    }

    async fn perform(&self, command: RadioCommand) {
        debug!("Performing {:?}", command);
        match command {
            RadioCommand::StartScan { services } => {
                if let Err(e) = self.adapter.start_scan(ScanFilter { services }).await {
                    error!("Failed to start scan: {}", e);
                }
            }
            RadioCommand::StopScan => {
                if let Err(e) = self.adapter.stop_scan().await {
                    warn!("Failed to stop scan: {}", e);
                }
            }
            RadioCommand::Connect(peripheral) => self.connect(peripheral).await,
            RadioCommand::DiscoverServices {
                peripheral,
                services,
            } => {
                let result = self.discover_services(peripheral, &services).await;
                let (services, error) = split(result);
                self.emit(RadioEvent::ServicesDiscovered {
                    peripheral,
                    services,
                    error,
                });
            }
            RadioCommand::DiscoverCharacteristics {
                peripheral,
                service,
            } => {
                let result = self.discover_characteristics(peripheral, service);
                let (characteristics, error) = split(result);
                self.emit(RadioEvent::CharacteristicsDiscovered {
                    peripheral,
                    service,
                    characteristics,
                    error,
                });
            }
            RadioCommand::ReadValue(characteristic) => {
                let result = match self.characteristic(characteristic) {
                    Ok((peripheral, c)) => peripheral.read(&c).await.map_err(anyhow::Error::from),
                    Err(e) => Err(e),
                };
                let (value, error) = split(result);
                self.emit(RadioEvent::ValueUpdated {
                    characteristic,
                    value,
                    error,
                });
            }
            RadioCommand::WriteValue {
                characteristic,
                value,
                with_response,
            } => {
                let write_type = if with_response {
                    WriteType::WithResponse
                } else {
                    WriteType::WithoutResponse
                };
                let result = match self.characteristic(characteristic) {
                    Ok((peripheral, c)) => peripheral
                        .write(&c, value.as_bytes(), write_type)
                        .await
                        .map_err(anyhow::Error::from),
                    Err(e) => Err(e),
                };
                self.emit(RadioEvent::WriteConfirmed {
                    characteristic,
                    error: result.err().map(|e| e.to_string()),
                });
            }
            RadioCommand::SetNotify {
                characteristic,
                enabled,
            } => {
                let result = match self.characteristic(characteristic) {
                    Ok((peripheral, c)) if enabled => {
                        peripheral.subscribe(&c).await.map_err(anyhow::Error::from)
                    }
                    Ok((peripheral, c)) => {
                        peripheral.unsubscribe(&c).await.map_err(anyhow::Error::from)
                    }
                    Err(e) => Err(e),
                };
                self.emit(RadioEvent::NotifyStateChanged {
                    characteristic,
                    enabled,
                    error: result.err().map(|e| e.to_string()),
                });
            }
        }
    }

    async fn connect(&self, handle: PeripheralHandle) {
        let result = match self.peripheral(handle) {
            Ok(peripheral) => self.open(handle, peripheral).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => self.emit(RadioEvent::Connected(handle)),
            Err(e) => self.emit(RadioEvent::ConnectFailed {
                peripheral: handle,
                error: Some(e.to_string()),
            }),
        }
    }

    /// Connect unless the link is already up, then make sure notifications flow
    async fn open(&self, handle: PeripheralHandle, peripheral: Peripheral) -> Result<()> {
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        self.watch_notifications(handle, &peripheral).await
    }

    /// Forward the peripheral's notifications as value updates
    ///
    /// The btleplug stream belongs to the peripheral and outlives the link, so
    /// a live forwarder is kept across reconnects rather than started again.
    async fn watch_notifications(
        &self,
        handle: PeripheralHandle,
        peripheral: &Peripheral,
    ) -> Result<()> {
        let live = self.table().forwarders.is_live(handle);
        if live {
            return Ok(());
        }

        let mut notifications = peripheral.notifications().await?;
        let radio = self.clone();
        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let characteristic = radio.table().find_characteristic(handle, notification.uuid);
                match characteristic {
                    Some(characteristic) => radio.emit(RadioEvent::ValueUpdated {
                        characteristic,
                        value: notification.value,
                        error: None,
                    }),
                    None => debug!("Notification from undiscovered {}", notification.uuid),
                }
            }
            debug!("Notification stream for {} ended", handle);
        });
        self.table().forwarders.insert(handle, task);
        Ok(())
    }

    async fn discover_services(
        &self,
        handle: PeripheralHandle,
        wanted: &[ServiceId],
    ) -> Result<Vec<DiscoveredService>> {
        let peripheral = self.peripheral(handle)?;
        peripheral.discover_services().await?;

        let mut table = self.table();
        Ok(peripheral
            .services()
            .into_iter()
            .filter(|s| wanted.is_empty() || wanted.contains(&s.uuid))
            .map(|s| DiscoveredService {
                handle: table.service_handle(handle, s.uuid),
                id: s.uuid,
            })
            .collect())
    }

    fn discover_characteristics(
        &self,
        handle: PeripheralHandle,
        service: ServiceHandle,
    ) -> Result<Vec<DiscoveredCharacteristic>> {
        let peripheral = self.peripheral(handle)?;
        let (_, service_id) = self
            .table()
            .services
            .get(&service)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Unknown {}", service))?;
        let found = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service_id)
            .ok_or_else(|| anyhow::anyhow!("Service {} no longer present", service_id))?;

        let mut table = self.table();
        Ok(found
            .characteristics
            .iter()
            .map(|c| DiscoveredCharacteristic {
                handle: table.characteristic_handle(handle, c),
                id: c.uuid,
            })
            .collect())
    }

    /// Peripheral whose queue `command` runs on
    fn owner(&self, command: &RadioCommand) -> Option<PeripheralHandle> {
        match command {
            RadioCommand::StartScan { .. } | RadioCommand::StopScan => None,
            RadioCommand::Connect(peripheral)
            | RadioCommand::DiscoverServices { peripheral, .. }
            | RadioCommand::DiscoverCharacteristics { peripheral, .. } => Some(*peripheral),
            RadioCommand::ReadValue(characteristic)
            | RadioCommand::WriteValue { characteristic, .. }
            | RadioCommand::SetNotify { characteristic, .. } => self
                .table()
                .characteristics
                .get(characteristic)
                .map(|(peripheral, _)| *peripheral),
        }
    }

    fn peripheral(&self, handle: PeripheralHandle) -> Result<Peripheral> {
        self.table()
            .peripherals
            .get(&handle)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown {}", handle))
    }

    fn characteristic(&self, handle: CharacteristicHandle) -> Result<(Peripheral, Characteristic)> {
        let (peripheral, characteristic) = self
            .table()
            .characteristics
            .get(&handle)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown {}", handle))?;
        Ok((self.peripheral(peripheral)?, characteristic))
    }

    fn table(&self) -> MutexGuard<'_, HandleTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: RadioEvent) {
        if self.events.send(event).is_err() {
            debug!("Connection manager is gone, dropping radio event");
        }
    }
}

fn split<T: Default>(result: Result<T>) -> (T, Option<String>) {
    match result {
        Ok(value) => (value, None),
        Err(e) => (T::default(), Some(e.to_string())),
    }
}

//! Radio Stack Protocol
//!
//! The boundary between the connection core and whatever radio backend drives
//! it. The backend reports everything that happens as a [`RadioEvent`] and
//! performs every [`RadioCommand`] asynchronously; neither side ever blocks
//! on the other.
//!
//! Peripherals, services and characteristics are referred to by opaque
//! handles issued by the backend. A handle is never reused within a process.

use crate::domain::codec::RawPayload;
use crate::domain::models::{CharacteristicId, ServiceId};
use std::fmt;
use tokio::sync::mpsc;
use tracing::warn;

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    };
}

handle_type!(
    /// A peripheral known to the radio backend
    PeripheralHandle,
    "peripheral"
);
handle_type!(
    /// A service discovered on a connected peripheral
    ServiceHandle,
    "service"
);
handle_type!(
    /// A characteristic discovered within a service
    CharacteristicHandle,
    "characteristic"
);

/// Power/authorization state of the local radio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

/// Connection status of a peripheral as reported by the radio stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Advertisement received while scanning
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub peripheral: PeripheralHandle,
    /// Name the radio stack knows the peripheral by (GAP device name)
    pub name: Option<String>,
    /// Local-name field carried in the advertisement payload
    pub local_name: Option<String>,
    pub service_ids: Vec<ServiceId>,
    pub rssi: Option<i16>,
}

#[derive(Debug, Clone)]
pub struct DiscoveredService {
    pub handle: ServiceHandle,
    pub id: ServiceId,
}

#[derive(Debug, Clone)]
pub struct DiscoveredCharacteristic {
    pub handle: CharacteristicHandle,
    pub id: CharacteristicId,
}

/// Peripheral handed back by the OS when the process is relaunched to
/// restore radio state
#[derive(Debug, Clone)]
pub struct RestoredPeripheral {
    pub handle: PeripheralHandle,
    pub status: PeripheralStatus,
}

/// Inbound events from the radio stack
///
/// `error` fields carry the stack's description of a failed operation.
#[derive(Debug, Clone)]
pub enum RadioEvent {
    StateChanged(RadioState),
    Restored {
        peripherals: Vec<RestoredPeripheral>,
    },
    PeripheralDiscovered(Advertisement),
    Connected(PeripheralHandle),
    ConnectFailed {
        peripheral: PeripheralHandle,
        error: Option<String>,
    },
    Disconnected {
        peripheral: PeripheralHandle,
        error: Option<String>,
    },
    ServicesDiscovered {
        peripheral: PeripheralHandle,
        services: Vec<DiscoveredService>,
        error: Option<String>,
    },
    /// The peripheral changed its GATT database; these services are gone
    ServicesInvalidated {
        peripheral: PeripheralHandle,
        services: Vec<ServiceHandle>,
    },
    CharacteristicsDiscovered {
        peripheral: PeripheralHandle,
        service: ServiceHandle,
        characteristics: Vec<DiscoveredCharacteristic>,
        error: Option<String>,
    },
    ValueUpdated {
        characteristic: CharacteristicHandle,
        value: Vec<u8>,
        error: Option<String>,
    },
    WriteConfirmed {
        characteristic: CharacteristicHandle,
        error: Option<String>,
    },
    NotifyStateChanged {
        characteristic: CharacteristicHandle,
        enabled: bool,
        error: Option<String>,
    },
}

/// Outbound requests to the radio stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCommand {
    StartScan {
        services: Vec<ServiceId>,
    },
    StopScan,
    Connect(PeripheralHandle),
    DiscoverServices {
        peripheral: PeripheralHandle,
        services: Vec<ServiceId>,
    },
    DiscoverCharacteristics {
        peripheral: PeripheralHandle,
        service: ServiceHandle,
    },
    ReadValue(CharacteristicHandle),
    WriteValue {
        characteristic: CharacteristicHandle,
        value: RawPayload,
        with_response: bool,
    },
    SetNotify {
        characteristic: CharacteristicHandle,
        enabled: bool,
    },
}

/// Sending half of the outbound command channel
///
/// Cheap to clone; every resource holds one once registered.
#[derive(Debug, Clone)]
pub struct RadioLink {
    sender: mpsc::UnboundedSender<RadioCommand>,
}

impl RadioLink {
    pub fn new(sender: mpsc::UnboundedSender<RadioCommand>) -> Self {
        Self { sender }
    }

    /// Create a link together with the receiver the backend consumes
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RadioCommand>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }

    /// Queue a command. Returns false if the backend has gone away.
    pub fn submit(&self, command: RadioCommand) -> bool {
        match self.sender.send(command) {
            Ok(()) => true,
            Err(mpsc::error::SendError(command)) => {
                warn!("Radio backend is gone, dropping {:?}", command);
                false
            }
        }
    }
}

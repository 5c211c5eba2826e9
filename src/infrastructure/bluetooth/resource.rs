//! Typed Resources
//!
//! A [`Resource`] binds one codec to one service/characteristic pair and
//! survives connection churn: it is created unbound at startup, bound when its
//! characteristic is discovered, and unbound again when the peripheral goes
//! away.

use crate::domain::codec::{Codec, RawPayload};
use crate::domain::models::{CharacteristicId, ServiceId};
use crate::domain::resources::ResourceKind;
use crate::infrastructure::bluetooth::protocol::{CharacteristicHandle, RadioCommand, RadioLink};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

/// The resource has no live characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("resource {characteristic_id} is not bound to a characteristic")]
pub struct NotBound {
    pub characteristic_id: CharacteristicId,
}

/// Identity shared by a resource and all of its clones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(u64);

impl ResourceId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Type-erased view the registry routes through
pub trait DataResource: Send + Sync {
    fn id(&self) -> ResourceId;
    fn service_id(&self) -> ServiceId;
    fn characteristic_id(&self) -> CharacteristicId;
    fn wants_notifications(&self) -> bool;

    /// Give the resource the channel it transmits on
    fn attach(&self, link: RadioLink);

    fn bind(&self, handle: CharacteristicHandle);
    fn unbind(&self);
    fn bound_handle(&self) -> Option<CharacteristicHandle>;

    fn receive(&self, payload: &RawPayload);
}

type ValueCallback<V> = Arc<dyn Fn(V) + Send + Sync>;

struct State<V> {
    link: Option<RadioLink>,
    handle: Option<CharacteristicHandle>,
    on_value: Option<ValueCallback<V>>,
}

struct Shared<C: Codec> {
    id: ResourceId,
    service_id: ServiceId,
    characteristic_id: CharacteristicId,
    wants_notifications: bool,
    state: Mutex<State<C::Value>>,
}

/// Typed endpoint backed by one GATT characteristic
pub struct Resource<C: Codec> {
    shared: Arc<Shared<C>>,
}

impl<C: Codec> Clone for Resource<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Codec> Resource<C> {
    pub fn new(
        service_id: ServiceId,
        characteristic_id: CharacteristicId,
        wants_notifications: bool,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: ResourceId::next(),
                service_id,
                characteristic_id,
                wants_notifications,
                state: Mutex::new(State {
                    link: None,
                    handle: None,
                    on_value: None,
                }),
            }),
        }
    }

    /// Resource described by a [`ResourceKind`]
    pub fn of<K>() -> Self
    where
        K: ResourceKind<Codec = C>,
    {
        Self::new(K::SERVICE_ID, K::CHARACTERISTIC_ID, K::WANTS_NOTIFICATIONS)
    }

    /// Register the value-changed callback, replacing any previous one
    pub fn on_value_changed<F>(&self, callback: F)
    where
        F: Fn(C::Value) + Send + Sync + 'static,
    {
        self.state().on_value = Some(Arc::new(callback));
    }

    pub fn is_bound(&self) -> bool {
        self.state().handle.is_some()
    }

    /// Encode `value` and write it, with response, to the bound characteristic
    pub fn send(&self, value: &C::Value) -> Result<(), NotBound> {
        let (handle, link) = self.bound()?;
        debug!("Sending {:?} to {}", value, handle);
        link.submit(RadioCommand::WriteValue {
            characteristic: handle,
            value: C::encode(value),
            with_response: true,
        });
        Ok(())
    }

    /// Ask the peripheral to start or stop pushing updates
    pub fn set_notifications(&self, enabled: bool) -> Result<(), NotBound> {
        let (handle, link) = self.bound()?;
        link.submit(RadioCommand::SetNotify {
            characteristic: handle,
            enabled,
        });
        Ok(())
    }

    fn bound(&self) -> Result<(CharacteristicHandle, RadioLink), NotBound> {
        let state = self.state();
        match (state.handle, state.link.as_ref()) {
            (Some(handle), Some(link)) => Ok((handle, link.clone())),
            _ => Err(NotBound {
                characteristic_id: self.shared.characteristic_id,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<C::Value>> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: Codec> DataResource for Resource<C> {
    fn id(&self) -> ResourceId {
        self.shared.id
    }

    fn service_id(&self) -> ServiceId {
        self.shared.service_id
    }

    fn characteristic_id(&self) -> CharacteristicId {
        self.shared.characteristic_id
    }

    fn wants_notifications(&self) -> bool {
        self.shared.wants_notifications
    }

    fn attach(&self, link: RadioLink) {
        self.state().link = Some(link);
    }

    fn bind(&self, handle: CharacteristicHandle) {
        self.state().handle = Some(handle);
        info!("Resource {} bound to {}", self.shared.characteristic_id, handle);

        if self.shared.wants_notifications {
            // Bound without push updates is still usable
            if let Err(e) = self.set_notifications(true) {
                warn!("Could not enable notifications: {}", e);
            }
        }
    }

    fn unbind(&self) {
        if let Some(handle) = self.state().handle.take() {
            info!("Resource {} unbound from {}", self.shared.characteristic_id, handle);
        }
    }

    fn bound_handle(&self) -> Option<CharacteristicHandle> {
        self.state().handle
    }

    fn receive(&self, payload: &RawPayload) {
        let value = match C::decode(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "Dropping invalid payload {:?} for {}: {}",
                    payload, self.shared.characteristic_id, e
                );
                return;
            }
        };

        // Run the callback outside the lock so it may call back into us
        let callback = self.state().on_value.clone();
        match callback {
            Some(callback) => callback(value),
            None => debug!(
                "No value callback for {}, dropping {:?}",
                self.shared.characteristic_id, value
            ),
        }
    }
}

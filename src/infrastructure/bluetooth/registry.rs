//! Resource Registry
//!
//! Routes discovery, disconnect and value events to resources without the
//! connection manager knowing any resource's value type.

use crate::domain::codec::RawPayload;
use crate::domain::models::{CharacteristicId, ServiceId};
use crate::infrastructure::bluetooth::protocol::{CharacteristicHandle, RadioLink};
use crate::infrastructure::bluetooth::resource::DataResource;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ResourceRegistry {
    link: RadioLink,
    resources: Vec<Arc<dyn DataResource>>,
    /// Bound characteristic -> every resource bound to it
    bindings: HashMap<CharacteristicHandle, Vec<Arc<dyn DataResource>>>,
}

impl ResourceRegistry {
    pub fn new(link: RadioLink) -> Self {
        Self {
            link,
            resources: Vec::new(),
            bindings: HashMap::new(),
        }
    }

    /// Track a resource. Registering the same resource again replaces it.
    pub fn register<R>(&mut self, resource: R)
    where
        R: DataResource + 'static,
    {
        let resource: Arc<dyn DataResource> = Arc::new(resource);

        if let Some(pos) = self.resources.iter().position(|r| r.id() == resource.id()) {
            debug!(
                "Resource {} registered twice, replacing",
                resource.characteristic_id()
            );
            let previous = self.resources.remove(pos);
            self.remove_binding(previous.as_ref());
        }

        resource.attach(self.link.clone());
        self.resources.push(resource);
    }

    /// Bind every resource whose characteristic id matches
    pub fn on_discovered(&mut self, handle: CharacteristicHandle, id: CharacteristicId) {
        for resource in &self.resources {
            if resource.characteristic_id() != id {
                continue;
            }

            // A resource owns at most one characteristic
            if let Some(old) = resource.bound_handle() {
                if old != handle {
                    Self::detach(&mut self.bindings, old, resource.as_ref());
                }
            }

            let bound = self.bindings.entry(handle).or_default();
            if !bound.iter().any(|r| r.id() == resource.id()) {
                bound.push(Arc::clone(resource));
            }
            resource.bind(handle);
        }
    }

    /// Unbind whatever is bound to `handle`. Unknown handles are ignored.
    pub fn on_disconnected(&mut self, handle: CharacteristicHandle) {
        match self.bindings.remove(&handle) {
            Some(bound) => {
                for resource in bound {
                    resource.unbind();
                }
            }
            None => debug!("Disconnect for unbound {}", handle),
        }
    }

    /// Forward a value to the resources bound to `handle`
    pub fn on_value_updated(&self, handle: CharacteristicHandle, payload: RawPayload) {
        match self.bindings.get(&handle) {
            Some(bound) => {
                for resource in bound {
                    resource.receive(&payload);
                }
            }
            None => warn!("No registered resource for {}, dropping {:?}", handle, payload),
        }
    }

    /// Unbind everything, e.g. when the radio powers off
    pub fn unbind_all(&mut self) {
        for (_, bound) in self.bindings.drain() {
            for resource in bound {
                resource.unbind();
            }
        }
    }

    /// Services the registered resources live in
    pub fn required_service_ids(&self) -> BTreeSet<ServiceId> {
        self.resources.iter().map(|r| r.service_id()).collect()
    }

    pub fn is_bound(&self, handle: CharacteristicHandle) -> bool {
        self.bindings.contains_key(&handle)
    }

    pub fn bound_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    fn remove_binding(&mut self, resource: &dyn DataResource) {
        if let Some(handle) = resource.bound_handle() {
            Self::detach(&mut self.bindings, handle, resource);
        }
    }

    fn detach(
        bindings: &mut HashMap<CharacteristicHandle, Vec<Arc<dyn DataResource>>>,
        handle: CharacteristicHandle,
        resource: &dyn DataResource,
    ) {
        if let Some(bound) = bindings.get_mut(&handle) {
            bound.retain(|r| r.id() != resource.id());
            if bound.is_empty() {
                bindings.remove(&handle);
            }
        }
        resource.unbind();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::codec::{BinaryState, BinaryStateCodec, ScaledFractionCodec};
    use crate::domain::resources::{
        BatteryLevel, Led, ResourceKind, BATTERY_LEVEL_CHAR_UUID, BOOST_SERVICE_UUID,
        LED_CHAR_UUID, LED_SERVICE_UUID,
    };
    use crate::infrastructure::bluetooth::protocol::RadioCommand;
    use crate::infrastructure::bluetooth::resource::{NotBound, Resource};
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedReceiver;

    const LED: CharacteristicHandle = CharacteristicHandle(1);
    const BATTERY: CharacteristicHandle = CharacteristicHandle(2);

    fn registry() -> (ResourceRegistry, UnboundedReceiver<RadioCommand>) {
        let (link, receiver) = RadioLink::channel();
        (ResourceRegistry::new(link), receiver)
    }

    fn recorded<C: crate::domain::codec::Codec>(
        resource: &Resource<C>,
    ) -> Arc<Mutex<Vec<C::Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        resource.on_value_changed(move |value| sink.lock().unwrap().push(value));
        seen
    }

    #[test]
    fn test_bind_and_read() {
        let (mut registry, _commands) = registry();
        let led = Resource::<BinaryStateCodec>::of::<Led>();
        let seen = recorded(&led);
        registry.register(led.clone());

        registry.on_discovered(LED, LED_CHAR_UUID);
        registry.on_value_updated(LED, RawPayload::from([0x01]));

        assert!(led.is_bound());
        assert_eq!(*seen.lock().unwrap(), vec![BinaryState::On]);
    }

    #[test]
    fn test_invalid_payload_is_dropped() {
        let (mut registry, _commands) = registry();
        let led = Resource::<BinaryStateCodec>::of::<Led>();
        let seen = recorded(&led);
        registry.register(led.clone());

        registry.on_discovered(LED, LED_CHAR_UUID);
        registry.on_value_updated(LED, RawPayload::from([0x02]));

        assert!(seen.lock().unwrap().is_empty());
        assert!(led.is_bound());
    }

    #[test]
    fn test_disconnect_clears_binding() {
        let (mut registry, _commands) = registry();
        let led = Resource::<BinaryStateCodec>::of::<Led>();
        registry.register(led.clone());

        registry.on_discovered(LED, LED_CHAR_UUID);
        assert!(registry.is_bound(LED));

        registry.on_disconnected(LED);
        assert!(!registry.is_bound(LED));
        assert_eq!(
            led.send(&BinaryState::On),
            Err(NotBound {
                characteristic_id: LED_CHAR_UUID
            })
        );

        // Already gone, and never bound
        registry.on_disconnected(LED);
        registry.on_disconnected(CharacteristicHandle(99));
    }

    #[test]
    fn test_values_route_only_to_bound_resource() {
        let (mut registry, _commands) = registry();
        let led = Resource::<BinaryStateCodec>::of::<Led>();
        let battery = Resource::<ScaledFractionCodec>::of::<BatteryLevel>();
        let led_seen = recorded(&led);
        let battery_seen = recorded(&battery);
        registry.register(led);
        registry.register(battery);

        registry.on_discovered(LED, LED_CHAR_UUID);
        registry.on_discovered(BATTERY, BATTERY_LEVEL_CHAR_UUID);
        registry.on_value_updated(BATTERY, RawPayload::from([0xC8, 0x00]));

        assert!(led_seen.lock().unwrap().is_empty());
        assert_eq!(*battery_seen.lock().unwrap(), vec![2.0]);
    }

    #[test]
    fn test_value_for_unknown_handle_is_dropped() {
        let (mut registry, _commands) = registry();
        let led = Resource::<BinaryStateCodec>::of::<Led>();
        let seen = recorded(&led);
        registry.register(led);

        registry.on_value_updated(LED, RawPayload::from([0x01]));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unmatched_characteristic_binds_nothing() {
        let (mut registry, _commands) = registry();
        registry.register(Resource::<BinaryStateCodec>::of::<Led>());

        registry.on_discovered(BATTERY, BATTERY_LEVEL_CHAR_UUID);
        assert_eq!(registry.bound_count(), 0);
    }

    #[test]
    fn test_duplicate_registration_keeps_one_binding() {
        let (mut registry, _commands) = registry();
        let led = Resource::<BinaryStateCodec>::of::<Led>();
        let seen = recorded(&led);
        registry.register(led.clone());
        registry.on_discovered(LED, LED_CHAR_UUID);

        registry.register(led.clone());
        assert_eq!(registry.len(), 1);
        assert!(!led.is_bound());

        registry.on_discovered(LED, LED_CHAR_UUID);
        registry.on_discovered(LED, LED_CHAR_UUID);
        registry.on_value_updated(LED, RawPayload::from([0x00]));

        assert_eq!(registry.bound_count(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![BinaryState::Off]);
    }

    #[test]
    fn test_rediscovery_moves_binding_to_new_handle() {
        let (mut registry, _commands) = registry();
        let led = Resource::<BinaryStateCodec>::of::<Led>();
        registry.register(led.clone());

        registry.on_discovered(LED, LED_CHAR_UUID);
        registry.on_discovered(CharacteristicHandle(5), LED_CHAR_UUID);

        assert!(!registry.is_bound(LED));
        assert!(registry.is_bound(CharacteristicHandle(5)));
        assert_eq!(led.bound_handle(), Some(CharacteristicHandle(5)));
    }

    #[test]
    fn test_shared_identifier_binds_both_resources() {
        let (mut registry, _commands) = registry();
        let first = Resource::<BinaryStateCodec>::of::<Led>();
        let second = Resource::<BinaryStateCodec>::of::<Led>();
        let first_seen = recorded(&first);
        let second_seen = recorded(&second);
        registry.register(first);
        registry.register(second);

        registry.on_discovered(LED, LED_CHAR_UUID);
        registry.on_value_updated(LED, RawPayload::from([0x01]));

        assert_eq!(first_seen.lock().unwrap().len(), 1);
        assert_eq!(second_seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_discovery_requests_notifications_for_push_resources() {
        let (mut registry, mut commands) = registry();
        registry.register(Resource::<ScaledFractionCodec>::of::<BatteryLevel>());

        registry.on_discovered(BATTERY, BATTERY_LEVEL_CHAR_UUID);

        assert_eq!(
            commands.try_recv().ok(),
            Some(RadioCommand::SetNotify {
                characteristic: BATTERY,
                enabled: true,
            })
        );
    }

    #[test]
    fn test_required_service_ids_are_deduplicated() {
        let (mut registry, _commands) = registry();
        registry.register(Resource::<BinaryStateCodec>::of::<Led>());
        registry.register(Resource::<ScaledFractionCodec>::of::<BatteryLevel>());
        registry.register(Resource::<ScaledFractionCodec>::of::<BatteryLevel>());

        let services = registry.required_service_ids();
        assert_eq!(services.len(), 2);
        assert!(services.contains(&LED_SERVICE_UUID));
        assert!(services.contains(&BOOST_SERVICE_UUID));
        assert_eq!(BatteryLevel::SERVICE_ID, BOOST_SERVICE_UUID);
    }

    #[test]
    fn test_unbind_all() {
        let (mut registry, _commands) = registry();
        let led = Resource::<BinaryStateCodec>::of::<Led>();
        let battery = Resource::<ScaledFractionCodec>::of::<BatteryLevel>();
        registry.register(led.clone());
        registry.register(battery.clone());
        registry.on_discovered(LED, LED_CHAR_UUID);
        registry.on_discovered(BATTERY, BATTERY_LEVEL_CHAR_UUID);

        registry.unbind_all();

        assert_eq!(registry.bound_count(), 0);
        assert!(!led.is_bound());
        assert!(!battery.is_bound());
    }
}

//! Accessories own services and, for bridges, other accessories.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use hap_core::category::Category;
use hap_core::error::AccessoryError;
use hap_core::hap_type;
use hap_storage::IdentifierCache;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::characteristic::{
    ChangeReason, Characteristic, CharacteristicChange, CharacteristicEvent, CharacteristicWarning,
};
use crate::controller::{Controller, ControllerStorage, ControllerType, StateChangeNotifier};
use crate::handler::ConnectionId;
use crate::observer::{Observers, SubscriptionHandle};
use crate::resource::ResourceProvider;
use crate::service::{Service, ServiceEvent};
use crate::types;
use crate::value::CharValue;

/// `aid` of the top-level accessory.
pub const PRIMARY_AID: u64 = 1;

#[derive(Debug, Clone)]
pub enum AccessoryEvent {
    CharacteristicChange {
        aid: u64,
        characteristic: Arc<Characteristic>,
        change: CharacteristicChange,
    },
    CharacteristicWarning {
        aid: u64,
        characteristic: Arc<Characteristic>,
        warning: CharacteristicWarning,
    },
    /// Identify was requested; `paired` is false for the unauthenticated request.
    Identify { aid: u64, paired: bool },
    /// Services, characteristics or bridged accessories were added or removed.
    ConfigurationChange,
}

struct ServiceSlot {
    service: Arc<Service>,
    subscription: Option<SubscriptionHandle>,
}

impl Drop for ServiceSlot {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
    }
}

struct BridgedSlot {
    accessory: Arc<Accessory>,
    subscription: Option<SubscriptionHandle>,
}

impl Drop for BridgedSlot {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
    }
}

struct ControllerEntry {
    controller: Arc<dyn Controller>,
    services: Vec<Arc<Service>>,
}

pub struct Accessory {
    uuid: Uuid,
    name: String,
    category: Category,
    aid: AtomicU64,
    bridged: AtomicBool,
    published: AtomicBool,
    services: RwLock<Vec<ServiceSlot>>,
    bridged_accessories: RwLock<Vec<BridgedSlot>>,
    controllers: Mutex<BTreeMap<ControllerType, ControllerEntry>>,
    controller_storage: RwLock<Option<Arc<ControllerStorage>>>,
    resource_provider: RwLock<Option<Arc<dyn ResourceProvider>>>,
    observers: Observers<AccessoryEvent>,
    this: Weak<Accessory>,
}

impl Accessory {
    /// New accessory with its accessory information service.
    pub fn new(name: impl Into<String>, uuid: Uuid, category: Category) -> Arc<Self> {
        let name = name.into();
        let info = types::accessory_information(&name);
        let accessory = Arc::new_cyclic(|this| Self {
            uuid,
            name,
            category,
            aid: AtomicU64::new(0),
            bridged: AtomicBool::new(false),
            published: AtomicBool::new(false),
            services: RwLock::new(Vec::new()),
            bridged_accessories: RwLock::new(Vec::new()),
            controllers: Mutex::new(BTreeMap::new()),
            controller_storage: RwLock::new(None),
            resource_provider: RwLock::new(None),
            observers: Observers::new(),
            this: this.clone(),
        });
        accessory.attach_service(info);
        accessory
    }

    /// A bridge, identified by a UUID derived from its name.
    pub fn new_bridge(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        let uuid = hap_type::generate(&format!("hap-rs:bridge:{}", name));
        Self::new(name, uuid, Category::Bridge)
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn aid(&self) -> u64 {
        self.aid.load(Ordering::SeqCst)
    }

    pub fn is_bridged(&self) -> bool {
        self.bridged.load(Ordering::SeqCst)
    }

    pub fn is_bridge(&self) -> bool {
        self.category == Category::Bridge || !self.bridged_accessories.read().is_empty()
    }

    pub fn is_published(&self) -> bool {
        self.published.load(Ordering::SeqCst)
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&AccessoryEvent) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.observers.subscribe(listener)
    }

    // --- services ---

    /// Add a service. A second service of the same type needs a distinct subtype.
    pub fn add_service(&self, service: Arc<Service>) -> Result<Arc<Service>, AccessoryError> {
        if self.service(service.uuid(), service.subtype()).is_some() {
            return Err(AccessoryError::DuplicateService {
                uuid: hap_type::to_short_form(&service.uuid()),
                subtype: service.subtype().map(str::to_string),
            });
        }
        self.attach_service(Arc::clone(&service));
        self.observers.emit(&AccessoryEvent::ConfigurationChange);
        Ok(service)
    }

    fn attach_service(&self, service: Arc<Service>) {
        let accessory = self.this.clone();
        let is_information = service.uuid() == types::ACCESSORY_INFORMATION;
        let subscription = service.subscribe(move |event| {
            if let Some(accessory) = accessory.upgrade() {
                accessory.forward_service_event(event, is_information);
            }
        });
        self.services.write().push(ServiceSlot {
            service,
            subscription: Some(subscription),
        });
    }

    fn forward_service_event(&self, event: &ServiceEvent, is_information: bool) {
        let aid = self.aid();
        match event {
            ServiceEvent::Characteristic {
                characteristic,
                event: CharacteristicEvent::Change(change),
            } => {
                if is_information
                    && characteristic.uuid() == types::IDENTIFY
                    && change.reason == ChangeReason::Write
                    && change.new == CharValue::Bool(true)
                {
                    info!(aid, accessory = %self.name, "Identify requested");
                    self.observers
                        .emit(&AccessoryEvent::Identify { aid, paired: true });
                }
                self.observers.emit(&AccessoryEvent::CharacteristicChange {
                    aid,
                    characteristic: Arc::clone(characteristic),
                    change: change.clone(),
                });
            }
            ServiceEvent::Characteristic {
                characteristic,
                event: CharacteristicEvent::Warning(warning),
            } => {
                self.observers.emit(&AccessoryEvent::CharacteristicWarning {
                    aid,
                    characteristic: Arc::clone(characteristic),
                    warning: warning.clone(),
                });
            }
            ServiceEvent::ConfigurationChange => {
                self.observers.emit(&AccessoryEvent::ConfigurationChange);
            }
        }
    }

    /// Remove a service. Removing the primary service leaves the accessory
    /// without one; links from other services to it are dropped.
    pub fn remove_service(
        &self,
        uuid: Uuid,
        subtype: Option<&str>,
    ) -> Result<Arc<Service>, AccessoryError> {
        let mut services = self.services.write();
        let index = services
            .iter()
            .position(|slot| slot.service.matches(uuid, subtype))
            .ok_or_else(|| AccessoryError::NotFound(format!("service {}", uuid)))?;
        let slot = services.remove(index);
        let remaining: Vec<Arc<Service>> =
            services.iter().map(|s| Arc::clone(&s.service)).collect();
        drop(services);

        let removed = Arc::clone(&slot.service);
        drop(slot);
        if removed.is_primary() {
            removed.set_primary(false);
        }
        for service in &remaining {
            service.remove_linked_service(&removed);
        }
        self.observers.emit(&AccessoryEvent::ConfigurationChange);
        Ok(removed)
    }

    /// Mark `service` as the only primary service.
    pub fn set_primary_service(&self, service: &Arc<Service>) -> Result<(), AccessoryError> {
        let services = self.services();
        if !services.iter().any(|s| Arc::ptr_eq(s, service)) {
            return Err(AccessoryError::NotFound(format!("service {}", service.name())));
        }
        for s in &services {
            s.set_primary(Arc::ptr_eq(s, service));
        }
        self.observers.emit(&AccessoryEvent::ConfigurationChange);
        Ok(())
    }

    pub fn primary_service(&self) -> Option<Arc<Service>> {
        self.services().into_iter().find(|s| s.is_primary())
    }

    pub fn service(&self, uuid: Uuid, subtype: Option<&str>) -> Option<Arc<Service>> {
        self.services
            .read()
            .iter()
            .find(|slot| slot.service.matches(uuid, subtype))
            .map(|slot| Arc::clone(&slot.service))
    }

    /// First service whose display name or type matches `key`.
    pub fn service_by_name_or_type(&self, key: &str) -> Option<Arc<Service>> {
        let by_type = hap_type::parse(key).ok();
        self.services()
            .into_iter()
            .find(|s| s.name() == key || Some(s.uuid()) == by_type)
    }

    pub fn services(&self) -> Vec<Arc<Service>> {
        self.services
            .read()
            .iter()
            .map(|slot| Arc::clone(&slot.service))
            .collect()
    }

    pub fn information_service(&self) -> Option<Arc<Service>> {
        self.service(types::ACCESSORY_INFORMATION, None)
    }

    // --- bridging ---

    pub fn add_bridged_accessory(
        &self,
        accessory: Arc<Accessory>,
    ) -> Result<Arc<Accessory>, AccessoryError> {
        if self.is_bridged() {
            return Err(AccessoryError::InvalidValue(
                "a bridged accessory cannot host other accessories".into(),
            ));
        }
        if accessory.uuid == self.uuid
            || self
                .bridged_accessories
                .read()
                .iter()
                .any(|slot| slot.accessory.uuid == accessory.uuid)
        {
            return Err(AccessoryError::DuplicateAccessory(accessory.uuid.to_string()));
        }

        accessory.bridged.store(true, Ordering::SeqCst);
        if let Some(storage) = self.controller_storage.read().clone() {
            accessory.attach_controller_storage(storage);
        }

        let bridge = self.this.clone();
        let subscription = accessory.subscribe(move |event| {
            if let Some(bridge) = bridge.upgrade() {
                bridge.observers.emit(event);
            }
        });
        self.bridged_accessories.write().push(BridgedSlot {
            accessory: Arc::clone(&accessory),
            subscription: Some(subscription),
        });
        debug!(bridge = %self.name, accessory = %accessory.name, "Bridged accessory added");
        self.observers.emit(&AccessoryEvent::ConfigurationChange);
        Ok(accessory)
    }

    pub fn remove_bridged_accessory(&self, uuid: Uuid) -> Result<Arc<Accessory>, AccessoryError> {
        let mut bridged = self.bridged_accessories.write();
        let index = bridged
            .iter()
            .position(|slot| slot.accessory.uuid == uuid)
            .ok_or_else(|| AccessoryError::NotFound(format!("accessory {}", uuid)))?;
        let slot = bridged.remove(index);
        drop(bridged);

        let accessory = Arc::clone(&slot.accessory);
        drop(slot);
        accessory.bridged.store(false, Ordering::SeqCst);
        self.observers.emit(&AccessoryEvent::ConfigurationChange);
        Ok(accessory)
    }

    pub fn bridged_accessories(&self) -> Vec<Arc<Accessory>> {
        self.bridged_accessories
            .read()
            .iter()
            .map(|slot| Arc::clone(&slot.accessory))
            .collect()
    }

    /// This accessory followed by its bridged accessories.
    pub fn all_accessories(&self) -> Vec<Arc<Accessory>> {
        let mut all: Vec<Arc<Accessory>> = self.this.upgrade().into_iter().collect();
        all.extend(self.bridged_accessories());
        all
    }

    // --- identifiers ---

    /// Assign `aid`s and `iid`s for the whole tree in one tracked pass.
    ///
    /// Unused identifiers expire, except while a bridge has no bridged
    /// accessories yet.
    pub fn assign_ids(&self, cache: &mut IdentifierCache) {
        cache.start_tracking_usage();
        self.aid.store(PRIMARY_AID, Ordering::SeqCst);
        self.assign_iids(cache);
        let bridged = self.bridged_accessories();
        for accessory in &bridged {
            let aid = cache.get_aid(&accessory.uuid.to_string());
            accessory.aid.store(aid, Ordering::SeqCst);
            accessory.assign_iids(cache);
        }
        let purge = !(self.is_bridge() && bridged.is_empty());
        cache.stop_tracking_usage(purge);
    }

    fn assign_iids(&self, cache: &mut IdentifierCache) {
        let accessory = self.uuid.to_string();
        for service in self.services() {
            let service_uuid = service.uuid().to_string();
            let subtype = service.subtype();
            if service.uuid() == types::ACCESSORY_INFORMATION && subtype.is_none() {
                service.set_iid(1);
            } else {
                service.set_iid(cache.get_service_iid(&accessory, &service_uuid, subtype));
            }
            for characteristic in service.characteristics() {
                characteristic.set_iid(cache.get_characteristic_iid(
                    &accessory,
                    &service_uuid,
                    subtype,
                    &characteristic.uuid().to_string(),
                ));
            }
        }
    }

    pub fn find_accessory(&self, aid: u64) -> Option<Arc<Accessory>> {
        self.all_accessories().into_iter().find(|a| a.aid() == aid)
    }

    pub fn find_characteristic(&self, aid: u64, iid: u64) -> Option<Arc<Characteristic>> {
        self.find_accessory(aid)?
            .services()
            .iter()
            .find_map(|s| s.characteristic_by_iid(iid))
    }

    /// Unauthenticated identify of an unpaired accessory.
    pub fn identify(&self) {
        info!(accessory = %self.name, "Identify requested (unpaired)");
        self.observers.emit(&AccessoryEvent::Identify {
            aid: self.aid(),
            paired: false,
        });
    }

    // --- publication ---

    /// Mark the tree as published, adding the protocol information service.
    pub fn mark_published(&self) -> Result<(), AccessoryError> {
        if self.is_bridged() {
            return Err(AccessoryError::InvalidValue(
                "bridged accessories are published through their bridge".into(),
            ));
        }
        if self.published.swap(true, Ordering::SeqCst) {
            return Err(AccessoryError::AlreadyPublished);
        }
        if self.service(types::PROTOCOL_INFORMATION, None).is_none() {
            self.attach_service(types::protocol_information());
        }
        Ok(())
    }

    pub fn mark_unpublished(&self) {
        self.published.store(false, Ordering::SeqCst);
    }

    /// `/accessories` body; `value_of` may override cached values.
    pub fn to_hap_json(&self, value_of: &dyn Fn(u64, &Characteristic) -> Option<Value>) -> Value {
        let accessories: Vec<Value> = self
            .all_accessories()
            .iter()
            .map(|accessory| {
                let aid = accessory.aid();
                let services: Vec<Value> = accessory
                    .services()
                    .iter()
                    .map(|s| s.to_hap_json(&|c| value_of(aid, c)))
                    .collect();
                json!({ "aid": aid, "services": services })
            })
            .collect();
        json!({ "accessories": accessories })
    }

    /// Hash of the tree's shape; values do not contribute.
    pub fn structure_hash(&self) -> String {
        let accessories: Vec<Value> = self
            .all_accessories()
            .iter()
            .map(|accessory| {
                let services: Vec<Value> =
                    accessory.services().iter().map(|s| s.structure_json()).collect();
                json!({ "aid": accessory.aid(), "services": services })
            })
            .collect();
        let bytes = serde_json::to_vec(&accessories).unwrap_or_default();
        hex::encode(Sha256::digest(bytes))
    }

    // --- controllers ---

    /// Attach a controller extension, restoring its saved state.
    pub fn configure_controller(
        &self,
        controller: Arc<dyn Controller>,
    ) -> Result<(), AccessoryError> {
        let kind = controller.controller_type();
        if self.controllers.lock().contains_key(&kind) {
            return Err(AccessoryError::Controller(format!(
                "{} already configured",
                kind
            )));
        }

        let mut owned = Vec::new();
        let mut existing = Vec::new();
        for service in controller.construct_services() {
            match self.service(service.uuid(), service.subtype()) {
                Some(present) => existing.push(present),
                None => owned.push(self.add_service(service)?),
            }
        }
        if !existing.is_empty() {
            controller.init_with_services(&existing);
        }
        owned.extend(existing);

        if let Some(storage) = self.controller_storage.read().clone() {
            if let Some(state) = storage.get(self.uuid, kind) {
                if let Err(e) = controller.deserialize(state) {
                    warn!(controller = %kind, error = %e, "Discarding saved controller state");
                }
            }
        }

        controller.configure_services(self.state_notifier(&controller));
        self.controllers.lock().insert(
            kind,
            ControllerEntry {
                controller,
                services: owned,
            },
        );
        debug!(accessory = %self.name, controller = %kind, "Controller configured");
        Ok(())
    }

    fn state_notifier(&self, controller: &Arc<dyn Controller>) -> StateChangeNotifier {
        let accessory = self.this.clone();
        let controller = Arc::downgrade(controller);
        Arc::new(move || {
            if let (Some(accessory), Some(controller)) = (accessory.upgrade(), controller.upgrade())
            {
                accessory.persist_controller_state(controller.as_ref());
            }
        })
    }

    fn persist_controller_state(&self, controller: &dyn Controller) {
        let storage = self.controller_storage.read().clone();
        if let Some(storage) = storage {
            if let Err(e) = storage.set(self.uuid, controller.controller_type(), controller.serialize())
            {
                warn!(error = %e, "Failed to save controller state");
            }
        }
    }

    /// Detach a controller and remove the services it brought.
    pub fn remove_controller(
        &self,
        kind: ControllerType,
    ) -> Result<Arc<dyn Controller>, AccessoryError> {
        let entry = self
            .controllers
            .lock()
            .remove(&kind)
            .ok_or_else(|| AccessoryError::UnknownController(kind.to_string()))?;
        entry.controller.handle_controller_removed();
        for service in &entry.services {
            let _ = self.remove_service(service.uuid(), service.subtype());
        }
        if let Some(storage) = self.controller_storage.read().clone() {
            if let Err(e) = storage.set(self.uuid, kind, None) {
                warn!(error = %e, "Failed to drop controller state");
            }
        }
        Ok(entry.controller)
    }

    pub fn controller(&self, kind: ControllerType) -> Option<Arc<dyn Controller>> {
        self.controllers
            .lock()
            .get(&kind)
            .map(|entry| Arc::clone(&entry.controller))
    }

    fn controller_list(&self) -> Vec<Arc<dyn Controller>> {
        self.controllers
            .lock()
            .values()
            .map(|entry| Arc::clone(&entry.controller))
            .collect()
    }

    /// Link persisted controller state, restoring already configured controllers.
    pub fn attach_controller_storage(&self, storage: Arc<ControllerStorage>) {
        *self.controller_storage.write() = Some(Arc::clone(&storage));
        for controller in self.controller_list() {
            if let Some(state) = storage.get(self.uuid, controller.controller_type()) {
                if let Err(e) = controller.deserialize(state) {
                    warn!(error = %e, "Discarding saved controller state");
                }
            }
        }
        for accessory in self.bridged_accessories() {
            accessory.attach_controller_storage(Arc::clone(&storage));
        }
    }

    /// Every pairing was removed.
    pub fn handle_factory_reset(&self) {
        for controller in self.controller_list() {
            controller.handle_factory_reset();
        }
        for accessory in self.bridged_accessories() {
            accessory.handle_factory_reset();
        }
        if !self.is_bridged() {
            if let Some(storage) = self.controller_storage.read().clone() {
                if let Err(e) = storage.clear() {
                    warn!(error = %e, "Failed to clear controller storage");
                }
            }
        }
    }

    pub fn handle_connection_closed(&self, connection: ConnectionId) {
        for controller in self.controller_list() {
            controller.handle_connection_closed(connection);
        }
        for accessory in self.bridged_accessories() {
            accessory.handle_connection_closed(connection);
        }
    }

    // --- resources ---

    pub fn set_resource_provider(&self, provider: Arc<dyn ResourceProvider>) {
        *self.resource_provider.write() = Some(provider);
    }

    pub fn resource_provider(&self) -> Option<Arc<dyn ResourceProvider>> {
        self.resource_provider.read().clone()
    }
}

impl std::fmt::Debug for Accessory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accessory")
            .field("name", &self.name)
            .field("uuid", &self.uuid)
            .field("aid", &self.aid())
            .field("category", &self.category)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::characteristic::WriteOptions;
    use crate::controller::MockController;
    use crate::handler::RequestContext;
    use hap_storage::{MemoryStorage, Storage};

    fn lamp(name: &str) -> Arc<Accessory> {
        let accessory = Accessory::new(
            name,
            hap_type::generate(&format!("test:{}", name)),
            Category::Lightbulb,
        );
        let bulb = accessory.add_service(types::lightbulb(name)).unwrap();
        bulb.add_characteristic(types::brightness()).unwrap();
        accessory
    }

    fn published_bridge() -> (Arc<Accessory>, Arc<Accessory>, IdentifierCache) {
        let bridge = Accessory::new_bridge("Bridge");
        let lamp = bridge.add_bridged_accessory(lamp("Lamp")).unwrap();
        let mut cache = IdentifierCache::new("CC:22:3D:E3:CE:30");
        bridge.assign_ids(&mut cache);
        (bridge, lamp, cache)
    }

    mod services {
        use super::*;

        #[test]
        fn information_service_is_present() {
            let accessory = lamp("Lamp");
            let info = accessory.information_service().unwrap();
            assert_eq!(info.iid(), 1);
            assert!(info.characteristic(types::IDENTIFY).is_some());
        }

        #[test]
        fn duplicate_type_needs_subtype() {
            let accessory = lamp("Lamp");
            assert!(matches!(
                accessory.add_service(types::lightbulb("Second")),
                Err(AccessoryError::DuplicateService { .. })
            ));
            accessory
                .add_service(types::switch("Left", Some("left")))
                .unwrap();
            accessory
                .add_service(types::switch("Right", Some("right")))
                .unwrap();
            assert!(matches!(
                accessory.add_service(types::switch("Left again", Some("left"))),
                Err(AccessoryError::DuplicateService { .. })
            ));
        }

        #[test]
        fn lookups() {
            let accessory = lamp("Lamp");
            accessory
                .add_service(types::switch("Left", Some("left")))
                .unwrap();
            assert!(accessory.service(types::SWITCH, Some("left")).is_some());
            assert!(accessory.service(types::SWITCH, None).is_none());
            assert_eq!(
                accessory.service_by_name_or_type("43").unwrap().uuid(),
                types::LIGHTBULB
            );
            assert_eq!(
                accessory.service_by_name_or_type("Left").unwrap().subtype(),
                Some("left")
            );
        }

        #[test]
        fn removing_primary_clears_it() {
            let accessory = lamp("Lamp");
            let bulb = accessory.service(types::LIGHTBULB, None).unwrap();
            let switch = accessory.add_service(types::switch("S", None)).unwrap();
            switch.add_linked_service(&bulb);
            accessory.set_primary_service(&bulb).unwrap();
            assert!(Arc::ptr_eq(&accessory.primary_service().unwrap(), &bulb));

            accessory.remove_service(types::LIGHTBULB, None).unwrap();
            assert!(accessory.primary_service().is_none());
            assert!(switch.linked_services().is_empty());
            assert!(accessory.remove_service(types::LIGHTBULB, None).is_err());
        }

        #[test]
        fn set_primary_is_exclusive() {
            let accessory = lamp("Lamp");
            let bulb = accessory.service(types::LIGHTBULB, None).unwrap();
            let switch = accessory.add_service(types::switch("S", None)).unwrap();
            accessory.set_primary_service(&bulb).unwrap();
            accessory.set_primary_service(&switch).unwrap();
            assert!(!bulb.is_primary());
            assert!(switch.is_primary());

            let foreign = types::switch("Foreign", None);
            assert!(accessory.set_primary_service(&foreign).is_err());
        }
    }

    mod identifiers {
        use super::*;

        #[test]
        fn bridge_is_aid_one_and_bridged_start_at_two() {
            let (bridge, lamp, _cache) = published_bridge();
            assert_eq!(bridge.aid(), 1);
            assert_eq!(lamp.aid(), 2);
            let bulb = lamp.service(types::LIGHTBULB, None).unwrap();
            assert!(bulb.iid() >= 2);
            assert!(bulb.characteristics().iter().all(|c| c.iid() >= 2));
        }

        #[test]
        fn iids_unique_within_accessory() {
            let (_bridge, lamp, _cache) = published_bridge();
            let mut seen = std::collections::BTreeSet::new();
            for service in lamp.services() {
                if service.uuid() != types::ACCESSORY_INFORMATION {
                    assert!(seen.insert(service.iid()));
                }
                for characteristic in service.characteristics() {
                    assert!(seen.insert(characteristic.iid()));
                }
            }
        }

        #[test]
        fn stable_across_reassignment() {
            let (bridge, lamp, mut cache) = published_bridge();
            let brightness = lamp
                .service(types::LIGHTBULB, None)
                .unwrap()
                .characteristic(types::BRIGHTNESS)
                .unwrap();
            let before = brightness.iid();
            bridge.assign_ids(&mut cache);
            assert_eq!(brightness.iid(), before);
        }

        #[test]
        fn find_characteristic_by_ids() {
            let (bridge, lamp, _cache) = published_bridge();
            let on = lamp
                .service(types::LIGHTBULB, None)
                .unwrap()
                .characteristic(types::ON)
                .unwrap();
            let found = bridge.find_characteristic(2, on.iid()).unwrap();
            assert!(Arc::ptr_eq(&found, &on));
            assert!(bridge.find_characteristic(2, 999).is_none());
            assert!(bridge.find_characteristic(9, on.iid()).is_none());
        }

        #[test]
        fn empty_bridge_keeps_cached_aids() {
            let mut cache = IdentifierCache::new("u");
            let lamp_uuid = hap_type::generate("test:Lamp");
            let aid = cache.get_aid(&lamp_uuid.to_string());

            let bridge = Accessory::new_bridge("Bridge");
            bridge.assign_ids(&mut cache);

            let lamp = bridge.add_bridged_accessory(lamp("Lamp")).unwrap();
            bridge.assign_ids(&mut cache);
            assert_eq!(lamp.aid(), aid);
        }

        #[test]
        fn duplicate_bridged_accessory() {
            let bridge = Accessory::new_bridge("Bridge");
            bridge.add_bridged_accessory(lamp("Lamp")).unwrap();
            assert!(matches!(
                bridge.add_bridged_accessory(lamp("Lamp")),
                Err(AccessoryError::DuplicateAccessory(_))
            ));
        }
    }

    mod events {
        use super::*;

        fn record(accessory: &Accessory) -> (Arc<Mutex<Vec<AccessoryEvent>>>, SubscriptionHandle) {
            let events = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&events);
            let handle = accessory.subscribe(move |e| sink.lock().push(e.clone()));
            (events, handle)
        }

        #[test]
        fn bridged_change_reaches_bridge_with_aid() {
            let (bridge, lamp, _cache) = published_bridge();
            let (events, _h) = record(&bridge);
            lamp.service(types::LIGHTBULB, None)
                .unwrap()
                .characteristic(types::ON)
                .unwrap()
                .update_value(true);

            let events = events.lock();
            assert!(events.iter().any(|e| matches!(
                e,
                AccessoryEvent::CharacteristicChange { aid: 2, change, .. }
                    if change.reason == ChangeReason::Event
            )));
        }

        #[tokio::test]
        async fn identify_write_raises_identify() {
            let (_bridge, lamp, _cache) = published_bridge();
            let (events, _h) = record(&lamp);
            let identify = lamp
                .information_service()
                .unwrap()
                .characteristic(types::IDENTIFY)
                .unwrap();
            identify
                .handle_set(
                    &json!(true),
                    &WriteOptions::default(),
                    &RequestContext::remote(ConnectionId(1), "c", true),
                )
                .await
                .unwrap();
            assert!(events
                .lock()
                .iter()
                .any(|e| matches!(e, AccessoryEvent::Identify { aid: 2, paired: true })));
        }

        #[test]
        fn structural_changes_are_reported() {
            let accessory = lamp("Lamp");
            let (events, _h) = record(&accessory);
            accessory.add_service(types::switch("S", None)).unwrap();
            accessory
                .service(types::SWITCH, None)
                .unwrap()
                .add_characteristic(types::brightness())
                .unwrap();
            let count = events
                .lock()
                .iter()
                .filter(|e| matches!(e, AccessoryEvent::ConfigurationChange))
                .count();
            assert_eq!(count, 2);
        }

        #[test]
        fn removed_bridged_accessory_is_silent() {
            let (bridge, lamp, _cache) = published_bridge();
            bridge.remove_bridged_accessory(lamp.uuid()).unwrap();
            let (events, _h) = record(&bridge);
            lamp.service(types::LIGHTBULB, None)
                .unwrap()
                .characteristic(types::ON)
                .unwrap()
                .update_value(true);
            assert!(events.lock().is_empty());
        }
    }

    mod publication {
        use super::*;

        #[test]
        fn publish_once() {
            let bridge = Accessory::new_bridge("Bridge");
            bridge.mark_published().unwrap();
            assert!(bridge
                .service(types::PROTOCOL_INFORMATION, None)
                .is_some());
            assert!(matches!(
                bridge.mark_published(),
                Err(AccessoryError::AlreadyPublished)
            ));
        }

        #[test]
        fn hash_ignores_values_but_tracks_shape() {
            let (bridge, lamp, mut cache) = published_bridge();
            let before = bridge.structure_hash();

            lamp.service(types::LIGHTBULB, None)
                .unwrap()
                .characteristic(types::BRIGHTNESS)
                .unwrap()
                .update_value(80);
            assert_eq!(bridge.structure_hash(), before);

            lamp.add_service(types::switch("S", None)).unwrap();
            bridge.assign_ids(&mut cache);
            let grown = bridge.structure_hash();
            assert_ne!(grown, before);

            lamp.remove_service(types::SWITCH, None).unwrap();
            bridge.assign_ids(&mut cache);
            assert_eq!(bridge.structure_hash(), before);
        }

        #[test]
        fn json_lists_every_accessory() {
            let (bridge, _lamp, _cache) = published_bridge();
            let json = bridge.to_hap_json(&|_, _| None);
            let accessories = json["accessories"].as_array().unwrap();
            assert_eq!(accessories.len(), 2);
            assert_eq!(accessories[0]["aid"], json!(1));
            assert_eq!(accessories[1]["aid"], json!(2));
            assert_eq!(accessories[0]["services"][0]["iid"], json!(1));
        }
    }

    mod controllers {
        use super::*;

        fn mock_controller() -> MockController {
            let mut controller = MockController::new();
            controller
                .expect_controller_type()
                .return_const(ControllerType::Remote);
            controller
                .expect_construct_services()
                .returning(|| vec![types::switch("Remote", Some("remote"))]);
            controller.expect_configure_services().times(1).return_const(());
            controller
        }

        #[test]
        fn configure_adds_services_and_remove_drops_them() {
            let accessory = lamp("Lamp");
            let mut controller = mock_controller();
            controller
                .expect_handle_controller_removed()
                .times(1)
                .return_const(());
            accessory.configure_controller(Arc::new(controller)).unwrap();
            assert!(accessory.service(types::SWITCH, Some("remote")).is_some());
            assert!(accessory.controller(ControllerType::Remote).is_some());

            accessory.remove_controller(ControllerType::Remote).unwrap();
            assert!(accessory.service(types::SWITCH, Some("remote")).is_none());
            assert!(matches!(
                accessory.remove_controller(ControllerType::Remote),
                Err(AccessoryError::UnknownController(_))
            ));
        }

        #[test]
        fn existing_services_are_adopted() {
            let accessory = lamp("Lamp");
            accessory
                .add_service(types::switch("Remote", Some("remote")))
                .unwrap();
            let mut controller = mock_controller();
            controller
                .expect_init_with_services()
                .withf(|existing| existing.len() == 1)
                .times(1)
                .return_const(());
            accessory.configure_controller(Arc::new(controller)).unwrap();
        }

        #[test]
        fn saved_state_is_restored() {
            let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
            let controllers = Arc::new(ControllerStorage::load(storage, "u").unwrap());
            let accessory = lamp("Lamp");
            controllers
                .set(accessory.uuid(), ControllerType::Remote, Some(json!({"k": 1})))
                .unwrap();
            accessory.attach_controller_storage(controllers);

            let mut controller = mock_controller();
            controller
                .expect_deserialize()
                .withf(|state| state == &json!({"k": 1}))
                .times(1)
                .returning(|_| Ok(()));
            accessory.configure_controller(Arc::new(controller)).unwrap();
        }

        #[test]
        fn factory_reset_cascades_to_bridged_controllers() {
            let bridge = Accessory::new_bridge("Bridge");
            let lamp = bridge.add_bridged_accessory(lamp("Lamp")).unwrap();
            let mut controller = mock_controller();
            controller
                .expect_handle_factory_reset()
                .times(1)
                .return_const(());
            lamp.configure_controller(Arc::new(controller)).unwrap();
            bridge.handle_factory_reset();
        }
    }
}

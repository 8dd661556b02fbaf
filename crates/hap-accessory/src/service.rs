//! Services group characteristics into one device function.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use hap_core::error::AccessoryError;
use hap_core::hap_type;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::characteristic::{Characteristic, CharacteristicEvent};
use crate::observer::{Observers, SubscriptionHandle};

#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Characteristic {
        characteristic: Arc<Characteristic>,
        event: CharacteristicEvent,
    },
    /// Characteristics were added or removed.
    ConfigurationChange,
}

struct Member {
    characteristic: Arc<Characteristic>,
    subscription: Option<SubscriptionHandle>,
}

impl Drop for Member {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
    }
}

pub struct Service {
    uuid: Uuid,
    subtype: Option<String>,
    name: String,
    iid: AtomicU64,
    primary: AtomicBool,
    hidden: AtomicBool,
    characteristics: RwLock<Vec<Member>>,
    linked: RwLock<Vec<Weak<Service>>>,
    observers: Observers<ServiceEvent>,
    this: Weak<Service>,
}

impl Service {
    pub fn new(name: impl Into<String>, uuid: Uuid, subtype: Option<&str>) -> Arc<Self> {
        let name = name.into();
        let subtype = subtype.map(str::to_string);
        Arc::new_cyclic(|this| Self {
            uuid,
            subtype,
            name,
            iid: AtomicU64::new(0),
            primary: AtomicBool::new(false),
            hidden: AtomicBool::new(false),
            characteristics: RwLock::new(Vec::new()),
            linked: RwLock::new(Vec::new()),
            observers: Observers::new(),
            this: this.clone(),
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn subtype(&self) -> Option<&str> {
        self.subtype.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn iid(&self) -> u64 {
        self.iid.load(Ordering::SeqCst)
    }

    pub(crate) fn set_iid(&self, iid: u64) {
        self.iid.store(iid, Ordering::SeqCst);
    }

    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    pub(crate) fn set_primary(&self, primary: bool) {
        self.primary.store(primary, Ordering::SeqCst);
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden.load(Ordering::SeqCst)
    }

    pub fn set_hidden(&self, hidden: bool) {
        self.hidden.store(hidden, Ordering::SeqCst);
    }

    /// Whether this service matches the given type and subtype.
    pub fn matches(&self, uuid: Uuid, subtype: Option<&str>) -> bool {
        self.uuid == uuid && self.subtype() == subtype
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&ServiceEvent) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.observers.subscribe(listener)
    }

    /// Attach a characteristic; its events are forwarded to this service.
    pub fn add_characteristic(
        &self,
        characteristic: Arc<Characteristic>,
    ) -> Result<Arc<Characteristic>, AccessoryError> {
        if self.characteristic(characteristic.uuid()).is_some() {
            return Err(AccessoryError::DuplicateCharacteristic(
                characteristic.name().to_string(),
            ));
        }
        self.attach_characteristic(Arc::clone(&characteristic));
        Ok(characteristic)
    }

    /// Attach without the duplicate check; for freshly built services.
    pub(crate) fn attach_characteristic(&self, characteristic: Arc<Characteristic>) {
        let service = self.this.clone();
        let source = Arc::downgrade(&characteristic);
        let subscription = characteristic.subscribe(move |event| {
            if let (Some(service), Some(characteristic)) = (service.upgrade(), source.upgrade()) {
                service.observers.emit(&ServiceEvent::Characteristic {
                    characteristic,
                    event: event.clone(),
                });
            }
        });
        self.characteristics.write().push(Member {
            characteristic,
            subscription: Some(subscription),
        });
        self.observers.emit(&ServiceEvent::ConfigurationChange);
    }

    pub fn remove_characteristic(&self, uuid: Uuid) -> Result<Arc<Characteristic>, AccessoryError> {
        let mut members = self.characteristics.write();
        let index = members
            .iter()
            .position(|m| m.characteristic.uuid() == uuid)
            .ok_or_else(|| AccessoryError::NotFound(format!("characteristic {}", uuid)))?;
        let member = members.remove(index);
        drop(members);

        let characteristic = Arc::clone(&member.characteristic);
        drop(member);
        self.observers.emit(&ServiceEvent::ConfigurationChange);
        Ok(characteristic)
    }

    pub fn characteristic(&self, uuid: Uuid) -> Option<Arc<Characteristic>> {
        self.characteristics
            .read()
            .iter()
            .find(|m| m.characteristic.uuid() == uuid)
            .map(|m| Arc::clone(&m.characteristic))
    }

    /// Look up by display name or by type (short or long UUID form).
    pub fn characteristic_by_name_or_type(&self, key: &str) -> Option<Arc<Characteristic>> {
        let by_type = hap_type::parse(key).ok();
        self.characteristics
            .read()
            .iter()
            .find(|m| m.characteristic.name() == key || Some(m.characteristic.uuid()) == by_type)
            .map(|m| Arc::clone(&m.characteristic))
    }

    pub fn characteristic_by_iid(&self, iid: u64) -> Option<Arc<Characteristic>> {
        self.characteristics
            .read()
            .iter()
            .find(|m| m.characteristic.iid() == iid)
            .map(|m| Arc::clone(&m.characteristic))
    }

    pub fn characteristics(&self) -> Vec<Arc<Characteristic>> {
        self.characteristics
            .read()
            .iter()
            .map(|m| Arc::clone(&m.characteristic))
            .collect()
    }

    pub fn add_linked_service(&self, other: &Arc<Service>) {
        let mut linked = self.linked.write();
        linked.retain(|w| w.strong_count() > 0);
        if !linked.iter().any(|w| w.ptr_eq(&Arc::downgrade(other))) {
            linked.push(Arc::downgrade(other));
            drop(linked);
            self.observers.emit(&ServiceEvent::ConfigurationChange);
        }
    }

    pub fn remove_linked_service(&self, other: &Service) {
        let mut linked = self.linked.write();
        let before = linked.len();
        linked.retain(|w| w.strong_count() > 0 && !std::ptr::eq(w.as_ptr(), other));
        if linked.len() != before {
            drop(linked);
            self.observers.emit(&ServiceEvent::ConfigurationChange);
        }
    }

    pub fn linked_services(&self) -> Vec<Arc<Service>> {
        self.linked.read().iter().filter_map(Weak::upgrade).collect()
    }

    fn header_json(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("iid".into(), json!(self.iid()));
        map.insert("type".into(), json!(hap_type::to_short_form(&self.uuid)));
        map.insert("primary".into(), json!(self.is_primary()));
        map.insert("hidden".into(), json!(self.is_hidden()));
        let linked: Vec<u64> = self.linked_services().iter().map(|s| s.iid()).collect();
        if !linked.is_empty() {
            map.insert("linked".into(), json!(linked));
        }
        map
    }

    /// HAP JSON with values supplied by `value_of`.
    pub fn to_hap_json(&self, value_of: &dyn Fn(&Characteristic) -> Option<Value>) -> Value {
        let mut map = self.header_json();
        let characteristics: Vec<Value> = self
            .characteristics()
            .iter()
            .map(|c| {
                let mut json = c.to_hap_json(None, None);
                if let (Some(value), Value::Object(obj)) = (value_of(c), &mut json) {
                    if obj.contains_key("value") {
                        obj.insert("value".into(), value);
                    }
                }
                json
            })
            .collect();
        map.insert("characteristics".into(), Value::Array(characteristics));
        Value::Object(map)
    }

    pub fn structure_json(&self) -> Value {
        let mut map = self.header_json();
        if let Some(subtype) = &self.subtype {
            map.insert("subtype".into(), json!(subtype));
        }
        let characteristics: Vec<Value> = self
            .characteristics()
            .iter()
            .map(|c| c.structure_json())
            .collect();
        map.insert("characteristics".into(), Value::Array(characteristics));
        Value::Object(map)
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("uuid", &self.uuid)
            .field("subtype", &self.subtype)
            .field("iid", &self.iid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{CharProps, Format, Perm};
    use parking_lot::Mutex;

    fn on() -> Arc<Characteristic> {
        Characteristic::new(
            "On",
            hap_type::from_short(0x25),
            CharProps::new(Format::Bool, &[Perm::PairedRead, Perm::PairedWrite, Perm::Notify]),
        )
    }

    fn lightbulb() -> Arc<Service> {
        Service::new("Lamp", hap_type::from_short(0x43), None)
    }

    #[test]
    fn duplicate_characteristic_rejected() {
        let service = lightbulb();
        service.add_characteristic(on()).unwrap();
        assert!(matches!(
            service.add_characteristic(on()),
            Err(AccessoryError::DuplicateCharacteristic(_))
        ));
    }

    #[test]
    fn lookup_by_name_or_type() {
        let service = lightbulb();
        let added = service.add_characteristic(on()).unwrap();
        assert!(Arc::ptr_eq(
            &service.characteristic_by_name_or_type("On").unwrap(),
            &added
        ));
        assert!(Arc::ptr_eq(
            &service.characteristic_by_name_or_type("25").unwrap(),
            &added
        ));
        assert!(service.characteristic_by_name_or_type("Brightness").is_none());
    }

    #[test]
    fn forwards_characteristic_events() {
        let service = lightbulb();
        let characteristic = service.add_characteristic(on()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _h = service.subscribe(move |e| {
            if let ServiceEvent::Characteristic { characteristic, .. } = e {
                sink.lock().push(characteristic.name().to_string());
            }
        });

        characteristic.update_value(true);
        assert_eq!(*seen.lock(), vec!["On".to_string()]);
    }

    #[test]
    fn removed_characteristic_stops_forwarding() {
        let service = lightbulb();
        let characteristic = service.add_characteristic(on()).unwrap();
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        let _h = service.subscribe(move |e| {
            if matches!(e, ServiceEvent::Characteristic { .. }) {
                *sink.lock() += 1;
            }
        });

        service.remove_characteristic(characteristic.uuid()).unwrap();
        characteristic.update_value(true);
        assert_eq!(*count.lock(), 0);
        assert!(service.remove_characteristic(characteristic.uuid()).is_err());
    }

    #[test]
    fn linked_services_are_weak() {
        let service = lightbulb();
        let other = Service::new("Switch", hap_type::from_short(0x49), None);
        service.add_linked_service(&other);
        service.add_linked_service(&other);
        assert_eq!(service.linked_services().len(), 1);

        service.remove_linked_service(&other);
        assert!(service.linked_services().is_empty());

        let transient = Service::new("Temp", hap_type::from_short(0x49), Some("t"));
        service.add_linked_service(&transient);
        drop(transient);
        assert!(service.linked_services().is_empty());
    }

    #[test]
    fn json_shape() {
        let service = lightbulb();
        service.set_iid(7);
        service.set_primary(true);
        let characteristic = service.add_characteristic(on()).unwrap();
        characteristic.set_iid(8);

        let json = service.to_hap_json(&|_| Some(json!(true)));
        assert_eq!(json["iid"], json!(7));
        assert_eq!(json["type"], json!("43"));
        assert_eq!(json["primary"], json!(true));
        assert_eq!(json["characteristics"][0]["value"], json!(true));
    }
}

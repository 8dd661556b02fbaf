//! A single characteristic: value storage, permissions and change events.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use hap_core::hap_type;
use hap_core::status::HapStatus;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::handler::{AuthorizationHandler, ConnectionId, ReadHandler, RequestContext, WriteHandler};
use crate::observer::{Observers, SubscriptionHandle};
use crate::value::{CharProps, CharValue, Perm};

/// Why a value changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    /// A read handler produced a different value.
    Read,
    /// A controller or the application wrote the value.
    Write,
    /// The application pushed a new state.
    Event,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CharacteristicChange {
    pub old: CharValue,
    pub new: CharValue,
    pub reason: ChangeReason,
    /// Connection that caused the change, excluded from notifications.
    pub originator: Option<ConnectionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    SlowRead,
    SlowWrite,
    TimeoutRead,
    TimeoutWrite,
    Warning,
    Error,
    Debug,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CharacteristicWarning {
    pub kind: WarningKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CharacteristicEvent {
    Change(CharacteristicChange),
    Warning(CharacteristicWarning),
}

/// Flags escorting a network write.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// The write was released by a valid prepare (`pid`).
    pub timed: bool,
    pub auth_data: Option<String>,
    /// The controller asked for a write response (`r`).
    pub response: bool,
}

pub struct Characteristic {
    uuid: Uuid,
    name: String,
    iid: AtomicU64,
    props: RwLock<CharProps>,
    value: Mutex<CharValue>,
    read_handler: RwLock<Option<Arc<dyn ReadHandler>>>,
    write_handler: RwLock<Option<Arc<dyn WriteHandler>>>,
    auth_handler: RwLock<Option<Arc<AuthorizationHandler>>>,
    subscribers: AtomicUsize,
    observers: Observers<CharacteristicEvent>,
}

impl Characteristic {
    pub fn new(name: impl Into<String>, uuid: Uuid, props: CharProps) -> Arc<Self> {
        let value = props.format.default_value();
        Arc::new(Self {
            uuid,
            name: name.into(),
            iid: AtomicU64::new(0),
            props: RwLock::new(props),
            value: Mutex::new(value),
            read_handler: RwLock::new(None),
            write_handler: RwLock::new(None),
            auth_handler: RwLock::new(None),
            subscribers: AtomicUsize::new(0),
            observers: Observers::new(),
        })
    }

    /// Same as [`Characteristic::new`] with an initial value.
    pub fn with_value(
        name: impl Into<String>,
        uuid: Uuid,
        props: CharProps,
        value: impl Into<CharValue>,
    ) -> Arc<Self> {
        let characteristic = Self::new(name, uuid, props);
        characteristic.store_coerced(value.into());
        characteristic
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
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

    pub fn props(&self) -> CharProps {
        self.props.read().clone()
    }

    /// Change the static description, e.g. to narrow a range.
    pub fn set_props(&self, update: impl FnOnce(&mut CharProps)) {
        update(&mut self.props.write());
    }

    pub fn has_perm(&self, perm: Perm) -> bool {
        self.props.read().has(perm)
    }

    /// Cached value, without invoking the read handler.
    pub fn value(&self) -> CharValue {
        self.value.lock().clone()
    }

    pub fn on_read(&self, handler: impl ReadHandler + 'static) {
        *self.read_handler.write() = Some(Arc::new(handler));
    }

    pub fn on_write(&self, handler: impl WriteHandler + 'static) {
        *self.write_handler.write() = Some(Arc::new(handler));
    }

    pub fn on_authorization(&self, handler: impl Fn(Option<&str>) -> bool + Send + Sync + 'static) {
        *self.auth_handler.write() = Some(Arc::new(handler));
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&CharacteristicEvent) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.observers.subscribe(listener)
    }

    /// Write from the application; runs the write handler.
    pub async fn set_value(&self, value: impl Into<CharValue>) -> Result<(), HapStatus> {
        let Some(value) = self.coerce_or_warn(value.into()) else {
            return Ok(());
        };
        let handler = self.write_handler.read().clone();
        if let Some(handler) = handler {
            handler.write(value.clone(), &RequestContext::local()).await?;
        }
        let old = self.replace(value.clone());
        self.emit_change(old, value, ChangeReason::Write, None);
        Ok(())
    }

    /// Push a new state from the device without running handlers.
    pub fn update_value(&self, value: impl Into<CharValue>) {
        let Some(value) = self.coerce_or_warn(value.into()) else {
            return;
        };
        let old = self.replace(value.clone());
        self.emit_change(old, value, ChangeReason::Event, None);
    }

    /// Read on behalf of a controller.
    pub async fn handle_get(&self, ctx: &RequestContext) -> Result<CharValue, HapStatus> {
        {
            let props = self.props.read();
            if !props.has(Perm::PairedRead) {
                return Err(HapStatus::WriteOnlyCharacteristic);
            }
            if props.admin_only.read && !ctx.is_admin {
                return Err(HapStatus::InsufficientPrivileges);
            }
        }

        let handler = self.read_handler.read().clone();
        let Some(handler) = handler else {
            return Ok(self.value());
        };

        let produced = handler.read(ctx).await.map_err(|status| {
            debug!(characteristic = %self.name, ?status, "Read handler failed");
            status
        })?;
        let Some(value) = self.coerce_or_warn(produced) else {
            return Err(HapStatus::ServiceCommunicationFailure);
        };
        let old = self.replace(value.clone());
        if old != value {
            self.emit_change(old, value.clone(), ChangeReason::Read, ctx.connection);
        }
        Ok(value)
    }

    /// Write on behalf of a controller.
    ///
    /// Returns the write-response value when one was requested and the
    /// characteristic supports it.
    pub async fn handle_set(
        &self,
        raw: &Value,
        options: &WriteOptions,
        ctx: &RequestContext,
    ) -> Result<Option<CharValue>, HapStatus> {
        let value = {
            let props = self.props.read();
            if !props.has(Perm::PairedWrite) {
                return Err(HapStatus::ReadOnlyCharacteristic);
            }
            if props.admin_only.write && !ctx.is_admin {
                return Err(HapStatus::InsufficientPrivileges);
            }
            if props.has(Perm::AdditionalAuthorization) {
                if let Some(authorize) = self.auth_handler.read().clone() {
                    if !authorize(options.auth_data.as_deref()) {
                        return Err(HapStatus::InsufficientAuthorization);
                    }
                }
            }
            if props.has(Perm::TimedWrite) && !options.timed {
                return Err(HapStatus::InvalidValueInRequest);
            }
            props.validate_network(raw)?
        };

        let handler = self.write_handler.read().clone();
        let response = match handler {
            Some(handler) => handler.write(value.clone(), ctx).await?,
            None => None,
        };

        let old = self.replace(value.clone());
        self.emit_change(old, value.clone(), ChangeReason::Write, ctx.connection);

        if options.response && self.has_perm(Perm::WriteResponse) {
            Ok(Some(response.unwrap_or(value)))
        } else {
            Ok(None)
        }
    }

    /// Check whether `ctx` may enable notifications.
    pub fn can_subscribe(&self, ctx: &RequestContext) -> Result<(), HapStatus> {
        let props = self.props.read();
        if !props.has(Perm::Notify) {
            return Err(HapStatus::NotificationNotSupported);
        }
        if props.admin_only.notify && !ctx.is_admin {
            return Err(HapStatus::InsufficientPrivileges);
        }
        Ok(())
    }

    pub fn add_subscriber(&self) {
        self.subscribers.fetch_add(1, Ordering::SeqCst);
    }

    pub fn remove_subscriber(&self) {
        let _ = self
            .subscribers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }

    /// Raise a warning (slow handler, timeout, invalid value...).
    pub fn emit_warning(&self, kind: WarningKind, message: impl Into<String>) {
        self.observers
            .emit(&CharacteristicEvent::Warning(CharacteristicWarning {
                kind,
                message: message.into(),
            }));
    }

    /// Full HAP JSON of this characteristic.
    ///
    /// `value` is omitted for write-only characteristics; `ev` is only
    /// included when the caller knows the subscription state.
    pub fn to_hap_json(&self, value: Option<&CharValue>, ev: Option<bool>) -> Value {
        let props = self.props.read();
        let mut map = Map::new();
        map.insert("iid".into(), json!(self.iid()));
        map.insert("type".into(), json!(hap_type::to_short_form(&self.uuid)));
        map.insert("perms".into(), props.perms_json());
        map.extend(props.meta_json());
        map.insert("description".into(), json!(self.name));
        if props.has(Perm::PairedRead) {
            let current;
            let value = match value {
                Some(v) => v,
                None => {
                    current = self.value();
                    &current
                }
            };
            map.insert("value".into(), value.to_json());
        }
        if let Some(ev) = ev {
            map.insert("ev".into(), json!(ev));
        }
        Value::Object(map)
    }

    /// Shape-only JSON used for the configuration hash.
    pub fn structure_json(&self) -> Value {
        let props = self.props.read();
        let mut map = Map::new();
        map.insert("iid".into(), json!(self.iid()));
        map.insert("type".into(), json!(hap_type::to_short_form(&self.uuid)));
        map.insert("perms".into(), props.perms_json());
        map.extend(props.meta_json());
        Value::Object(map)
    }

    fn replace(&self, value: CharValue) -> CharValue {
        std::mem::replace(&mut *self.value.lock(), value)
    }

    fn store_coerced(&self, value: CharValue) {
        if let Some(value) = self.coerce_or_warn(value) {
            self.replace(value);
        }
    }

    fn coerce_or_warn(&self, value: CharValue) -> Option<CharValue> {
        let coerced = self.props.read().coerce(value);
        match coerced {
            Ok((value, None)) => Some(value),
            Ok((value, Some(message))) => {
                warn!(characteristic = %self.name, "{}", message);
                self.emit_warning(WarningKind::Warning, message);
                Some(value)
            }
            Err(message) => {
                warn!(characteristic = %self.name, "Ignoring value: {}", message);
                self.emit_warning(WarningKind::Warning, message);
                None
            }
        }
    }

    fn emit_change(
        &self,
        old: CharValue,
        new: CharValue,
        reason: ChangeReason,
        originator: Option<ConnectionId>,
    ) {
        self.observers
            .emit(&CharacteristicEvent::Change(CharacteristicChange {
                old,
                new,
                reason,
                originator,
            }));
    }
}

impl std::fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Characteristic")
            .field("name", &self.name)
            .field("uuid", &self.uuid)
            .field("iid", &self.iid())
            .field("value", &self.value())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{read_fn, write_fn};
    use crate::value::Format;

    fn brightness() -> Arc<Characteristic> {
        Characteristic::new(
            "Brightness",
            hap_type::from_short(0x08),
            CharProps::new(Format::Int, &[Perm::PairedRead, Perm::PairedWrite, Perm::Notify])
                .with_range(0.0, 100.0, 1.0),
        )
    }

    fn record_events(ch: &Characteristic) -> (Arc<Mutex<Vec<CharacteristicEvent>>>, SubscriptionHandle) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let handle = ch.subscribe(move |e| sink.lock().push(e.clone()));
        (events, handle)
    }

    fn admin() -> RequestContext {
        RequestContext::remote(ConnectionId(1), "ctrl", true)
    }

    mod programmatic {
        use super::*;

        #[test]
        fn update_value_emits_event_reason() {
            let ch = brightness();
            let (events, _h) = record_events(&ch);
            ch.update_value(40);
            assert_eq!(ch.value(), CharValue::Int(40));
            let events = events.lock();
            assert_eq!(
                events[0],
                CharacteristicEvent::Change(CharacteristicChange {
                    old: CharValue::Int(0),
                    new: CharValue::Int(40),
                    reason: ChangeReason::Event,
                    originator: None,
                })
            );
        }

        #[test]
        fn out_of_range_update_clamps_and_warns() {
            let ch = brightness();
            let (events, _h) = record_events(&ch);
            ch.update_value(250);
            assert_eq!(ch.value(), CharValue::Int(100));
            assert!(events.lock().iter().any(|e| matches!(
                e,
                CharacteristicEvent::Warning(CharacteristicWarning {
                    kind: WarningKind::Warning,
                    ..
                })
            )));
        }

        #[test]
        fn mismatched_type_is_ignored() {
            let ch = brightness();
            ch.update_value(20);
            ch.update_value("bright");
            assert_eq!(ch.value(), CharValue::Int(20));
        }

        #[tokio::test]
        async fn set_value_runs_write_handler() {
            let ch = brightness();
            let written = Arc::new(Mutex::new(None));
            let sink = Arc::clone(&written);
            ch.on_write(write_fn(move |value, _ctx| {
                let sink = Arc::clone(&sink);
                async move {
                    *sink.lock() = Some(value);
                    Ok(None)
                }
            }));
            let (events, _h) = record_events(&ch);

            ch.set_value(75).await.unwrap();
            assert_eq!(*written.lock(), Some(CharValue::Int(75)));
            assert!(matches!(
                &events.lock()[0],
                CharacteristicEvent::Change(CharacteristicChange {
                    reason: ChangeReason::Write,
                    ..
                })
            ));
        }

        #[tokio::test]
        async fn rejected_set_value_keeps_old_value() {
            let ch = brightness();
            ch.update_value(10);
            ch.on_write(write_fn(|_v, _ctx| async { Err(HapStatus::ResourceBusy) }));
            assert_eq!(ch.set_value(90).await, Err(HapStatus::ResourceBusy));
            assert_eq!(ch.value(), CharValue::Int(10));
        }
    }

    mod network_read {
        use super::*;

        #[tokio::test]
        async fn write_only_is_refused() {
            let ch = Characteristic::new(
                "Identify",
                hap_type::from_short(0x14),
                CharProps::new(Format::Bool, &[Perm::PairedWrite]),
            );
            assert_eq!(
                ch.handle_get(&admin()).await,
                Err(HapStatus::WriteOnlyCharacteristic)
            );
        }

        #[tokio::test]
        async fn admin_only_read() {
            let ch = brightness();
            ch.set_props(|p| p.admin_only.read = true);
            let user = RequestContext::remote(ConnectionId(2), "user", false);
            assert_eq!(
                ch.handle_get(&user).await,
                Err(HapStatus::InsufficientPrivileges)
            );
            assert!(ch.handle_get(&admin()).await.is_ok());
        }

        #[tokio::test]
        async fn read_handler_change_has_read_reason() {
            let ch = brightness();
            ch.on_read(read_fn(|_ctx| async { Ok(CharValue::Int(33)) }));
            let (events, _h) = record_events(&ch);

            assert_eq!(ch.handle_get(&admin()).await, Ok(CharValue::Int(33)));
            assert_eq!(ch.handle_get(&admin()).await, Ok(CharValue::Int(33)));

            let events = events.lock();
            assert_eq!(events.len(), 1);
            assert!(matches!(
                &events[0],
                CharacteristicEvent::Change(CharacteristicChange {
                    reason: ChangeReason::Read,
                    originator: Some(ConnectionId(1)),
                    ..
                })
            ));
        }

        #[tokio::test]
        async fn read_handler_status_propagates() {
            let ch = brightness();
            ch.on_read(read_fn(|_ctx| async {
                Err(HapStatus::ServiceCommunicationFailure)
            }));
            assert_eq!(
                ch.handle_get(&admin()).await,
                Err(HapStatus::ServiceCommunicationFailure)
            );
        }
    }

    mod network_write {
        use super::*;

        #[tokio::test]
        async fn validated_and_recorded_with_originator() {
            let ch = brightness();
            let (events, _h) = record_events(&ch);
            let result = ch
                .handle_set(&json!(60), &WriteOptions::default(), &admin())
                .await;
            assert_eq!(result, Ok(None));
            assert_eq!(ch.value(), CharValue::Int(60));
            assert!(matches!(
                &events.lock()[0],
                CharacteristicEvent::Change(CharacteristicChange {
                    reason: ChangeReason::Write,
                    originator: Some(ConnectionId(1)),
                    ..
                })
            ));
        }

        #[tokio::test]
        async fn invalid_value_is_rejected_without_mutation() {
            let ch = brightness();
            let result = ch
                .handle_set(&json!(500), &WriteOptions::default(), &admin())
                .await;
            assert_eq!(result, Err(HapStatus::InvalidValueInRequest));
            assert_eq!(ch.value(), CharValue::Int(0));
        }

        #[tokio::test]
        async fn read_only_characteristic() {
            let ch = Characteristic::new(
                "Model",
                hap_type::from_short(0x21),
                CharProps::new(Format::String, &[Perm::PairedRead]),
            );
            assert_eq!(
                ch.handle_set(&json!("x"), &WriteOptions::default(), &admin())
                    .await,
                Err(HapStatus::ReadOnlyCharacteristic)
            );
        }

        #[tokio::test]
        async fn timed_write_requires_prepare() {
            let ch = brightness();
            ch.set_props(|p| p.perms.push(Perm::TimedWrite));
            let untimed = ch
                .handle_set(&json!(5), &WriteOptions::default(), &admin())
                .await;
            assert_eq!(untimed, Err(HapStatus::InvalidValueInRequest));
            assert_eq!(ch.value(), CharValue::Int(0));

            let timed = WriteOptions {
                timed: true,
                ..WriteOptions::default()
            };
            assert!(ch.handle_set(&json!(5), &timed, &admin()).await.is_ok());
        }

        #[tokio::test]
        async fn additional_authorization() {
            let ch = brightness();
            ch.set_props(|p| p.perms.push(Perm::AdditionalAuthorization));
            ch.on_authorization(|data| data == Some("c2VjcmV0"));

            let wrong = WriteOptions {
                auth_data: Some("bm9wZQ==".into()),
                ..WriteOptions::default()
            };
            assert_eq!(
                ch.handle_set(&json!(1), &wrong, &admin()).await,
                Err(HapStatus::InsufficientAuthorization)
            );

            let right = WriteOptions {
                auth_data: Some("c2VjcmV0".into()),
                ..WriteOptions::default()
            };
            assert!(ch.handle_set(&json!(1), &right, &admin()).await.is_ok());
        }

        #[tokio::test]
        async fn write_response() {
            let ch = brightness();
            ch.set_props(|p| p.perms.push(Perm::WriteResponse));
            ch.on_write(write_fn(|_v, _ctx| async { Ok(Some(CharValue::Int(99))) }));
            let options = WriteOptions {
                response: true,
                ..WriteOptions::default()
            };
            assert_eq!(
                ch.handle_set(&json!(3), &options, &admin()).await,
                Ok(Some(CharValue::Int(99)))
            );
        }
    }

    mod notifications {
        use super::*;

        #[test]
        fn subscription_checks() {
            let ch = brightness();
            assert!(ch.can_subscribe(&admin()).is_ok());

            ch.set_props(|p| p.admin_only.notify = true);
            let user = RequestContext::remote(ConnectionId(2), "user", false);
            assert_eq!(
                ch.can_subscribe(&user),
                Err(HapStatus::InsufficientPrivileges)
            );

            let model = Characteristic::new(
                "Model",
                hap_type::from_short(0x21),
                CharProps::new(Format::String, &[Perm::PairedRead]),
            );
            assert_eq!(
                model.can_subscribe(&admin()),
                Err(HapStatus::NotificationNotSupported)
            );
        }

        #[test]
        fn subscriber_count_never_underflows() {
            let ch = brightness();
            ch.remove_subscriber();
            ch.add_subscriber();
            assert_eq!(ch.subscriber_count(), 1);
            ch.remove_subscriber();
            ch.remove_subscriber();
            assert_eq!(ch.subscriber_count(), 0);
        }
    }

    mod json_form {
        use super::*;

        #[test]
        fn full_representation() {
            let ch = brightness();
            ch.set_iid(10);
            ch.update_value(42);
            let value = ch.to_hap_json(None, Some(true));
            assert_eq!(value["iid"], json!(10));
            assert_eq!(value["type"], json!("8"));
            assert_eq!(value["value"], json!(42));
            assert_eq!(value["ev"], json!(true));
            assert_eq!(value["maxValue"], json!(100));
        }

        #[test]
        fn structure_omits_value() {
            let ch = brightness();
            ch.update_value(42);
            assert!(ch.structure_json().get("value").is_none());
        }
    }
}

//! Controller extensions attached to an accessory, and their persisted state.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use hap_core::error::{AccessoryError, StorageError};
use hap_storage::storage::{load_json, persist_suffix, save_json, Storage};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::handler::ConnectionId;
use crate::service::Service;

/// Kinds of controller an accessory can host; at most one of each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ControllerType {
    AdaptiveLighting,
    CameraStream,
    Doorbell,
    Remote,
}

impl ControllerType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AdaptiveLighting => "characteristic-transition",
            Self::CameraStream => "camera",
            Self::Doorbell => "doorbell",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for ControllerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Called by a controller whenever its serialized state changed.
pub type StateChangeNotifier = Arc<dyn Fn() + Send + Sync>;

/// Capability interface of a controller extension.
#[cfg_attr(test, mockall::automock)]
pub trait Controller: Send + Sync {
    fn controller_type(&self) -> ControllerType;

    /// Services the controller needs on its accessory.
    fn construct_services(&self) -> Vec<Arc<Service>>;

    /// Adopt services that already existed on the accessory instead of the
    /// freshly constructed ones.
    fn init_with_services(&self, existing: &[Arc<Service>]);

    /// Install handlers; the notifier persists state changes.
    fn configure_services(&self, on_state_change: StateChangeNotifier);

    fn handle_controller_removed(&self);

    /// All pairings were removed.
    fn handle_factory_reset(&self);

    fn serialize(&self) -> Option<Value>;

    fn deserialize(&self, state: Value) -> Result<(), AccessoryError>;

    fn handle_connection_closed(&self, connection: ConnectionId);
}

type StateTable = BTreeMap<String, BTreeMap<String, Value>>;

/// Serialized controller states of every accessory behind one bridge.
///
/// Stored as `{ accessory uuid: { controller type: state } }`.
pub struct ControllerStorage {
    storage: Arc<dyn Storage>,
    key: String,
    states: Mutex<StateTable>,
}

impl ControllerStorage {
    pub fn storage_key(username: &str) -> String {
        format!("ControllerStorage.{}.json", persist_suffix(username))
    }

    /// Load saved states; a malformed document starts empty.
    pub fn load(storage: Arc<dyn Storage>, username: &str) -> Result<Self, StorageError> {
        let key = Self::storage_key(username);
        let states = match load_json::<StateTable>(storage.as_ref(), &key) {
            Ok(states) => states.unwrap_or_default(),
            Err(StorageError::Malformed { key, reason }) => {
                warn!(key = %key, reason = %reason, "Malformed controller storage; starting empty");
                StateTable::new()
            }
            Err(e) => return Err(e),
        };
        Ok(Self {
            storage,
            key,
            states: Mutex::new(states),
        })
    }

    pub fn get(&self, accessory: Uuid, controller: ControllerType) -> Option<Value> {
        self.states
            .lock()
            .get(&accessory.to_string())
            .and_then(|m| m.get(controller.as_str()))
            .cloned()
    }

    /// Record (or with `None`, drop) one controller's state and save.
    pub fn set(
        &self,
        accessory: Uuid,
        controller: ControllerType,
        state: Option<Value>,
    ) -> Result<(), StorageError> {
        let mut states = self.states.lock();
        let entry = states.entry(accessory.to_string()).or_default();
        match state {
            Some(state) => {
                entry.insert(controller.as_str().to_string(), state);
            }
            None => {
                entry.remove(controller.as_str());
            }
        }
        if entry.is_empty() {
            states.remove(&accessory.to_string());
        }
        debug!(%accessory, %controller, "Saving controller state");
        save_json(self.storage.as_ref(), &self.key, &*states)
    }

    /// Drop everything, e.g. on factory reset.
    pub fn clear(&self) -> Result<(), StorageError> {
        self.states.lock().clear();
        self.storage.remove(&self.key)
    }
}

impl fmt::Debug for ControllerStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerStorage")
            .field("key", &self.key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hap_storage::MemoryStorage;
    use serde_json::json;

    const USERNAME: &str = "CC:22:3D:E3:CE:30";

    #[test]
    fn type_ids() {
        assert_eq!(
            ControllerType::AdaptiveLighting.to_string(),
            "characteristic-transition"
        );
        assert_eq!(ControllerType::CameraStream.as_str(), "camera");
    }

    #[test]
    fn set_get_and_reload() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let accessory = Uuid::new_v4();
        let controllers = ControllerStorage::load(Arc::clone(&storage), USERNAME).unwrap();
        controllers
            .set(accessory, ControllerType::AdaptiveLighting, Some(json!({"active": true})))
            .unwrap();

        let reloaded = ControllerStorage::load(Arc::clone(&storage), USERNAME).unwrap();
        assert_eq!(
            reloaded.get(accessory, ControllerType::AdaptiveLighting),
            Some(json!({"active": true}))
        );
        assert!(reloaded.get(accessory, ControllerType::Remote).is_none());
        assert!(storage
            .get("ControllerStorage.CC223DE3CE30.json")
            .unwrap()
            .is_some());
    }

    #[test]
    fn none_removes_entry() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let accessory = Uuid::new_v4();
        let controllers = ControllerStorage::load(storage, USERNAME).unwrap();
        controllers
            .set(accessory, ControllerType::Doorbell, Some(json!(1)))
            .unwrap();
        controllers.set(accessory, ControllerType::Doorbell, None).unwrap();
        assert!(controllers.get(accessory, ControllerType::Doorbell).is_none());
    }

    #[test]
    fn malformed_document_starts_empty() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        storage
            .set(&ControllerStorage::storage_key(USERNAME), b"\"nope\"")
            .unwrap();
        let controllers = ControllerStorage::load(storage, USERNAME).unwrap();
        assert!(controllers
            .get(Uuid::new_v4(), ControllerType::Remote)
            .is_none());
    }

    #[test]
    fn clear_removes_document() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let controllers = ControllerStorage::load(Arc::clone(&storage), USERNAME).unwrap();
        controllers
            .set(Uuid::new_v4(), ControllerType::Remote, Some(json!({})))
            .unwrap();
        controllers.clear().unwrap();
        assert!(storage
            .get(&ControllerStorage::storage_key(USERNAME))
            .unwrap()
            .is_none());
    }
}

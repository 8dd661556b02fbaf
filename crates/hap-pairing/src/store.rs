//! Serialized access to the pairing record.
//!
//! Every mutation is applied to a copy, persisted, and only then committed,
//! so a storage failure leaves both the in-memory and the durable record
//! untouched.

use std::sync::Arc;

use hap_core::category::Category;
use hap_core::error::StorageError;
use hap_crypto::ed25519::IdentityKeyPair;
use hap_storage::{AccessoryInfo, AddPairingOutcome, PairedClient, Permission, Storage};
use parking_lot::RwLock;
use tracing::{info, warn};

/// Result of removing a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovePairingOutcome {
    /// The identifier was not paired.
    NotFound,
    /// The controller was removed; the accessory still has an admin.
    Removed,
    /// No admin remained, so every pairing was dropped.
    Unpaired { removed: Vec<String> },
}

/// Shared handle on the accessory's [`AccessoryInfo`].
pub struct PairingStore {
    storage: Arc<dyn Storage>,
    info: RwLock<AccessoryInfo>,
}

impl PairingStore {
    pub fn new(storage: Arc<dyn Storage>, info: AccessoryInfo) -> Self {
        Self {
            storage,
            info: RwLock::new(info),
        }
    }

    /// Load the record for `username`, creating and saving a fresh one when
    /// none (or only a malformed one) exists.
    ///
    /// The display name, category and setup data of an existing record are
    /// refreshed from the arguments.
    pub fn open(
        storage: Arc<dyn Storage>,
        username: &str,
        display_name: &str,
        category: Category,
        pincode: &str,
        setup_id: &str,
    ) -> Result<Self, StorageError> {
        let info = match AccessoryInfo::load(storage.as_ref(), username)? {
            Some(mut info) => {
                info.display_name = display_name.to_string();
                info.category = category;
                info.pincode = pincode.to_string();
                info.setup_id = setup_id.to_string();
                info
            }
            None => {
                info!(username, "Creating new accessory record");
                AccessoryInfo::create(username, display_name, category, pincode, setup_id)
            }
        };
        info.save(storage.as_ref())?;
        Ok(Self::new(storage, info))
    }

    /// Copy of the current record.
    pub fn snapshot(&self) -> AccessoryInfo {
        self.info.read().clone()
    }

    pub fn username(&self) -> String {
        self.info.read().username.clone()
    }

    pub fn pincode(&self) -> String {
        self.info.read().pincode.clone()
    }

    pub fn setup_id(&self) -> String {
        self.info.read().setup_id.clone()
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.info.read().public_key()
    }

    pub fn signing_key(&self) -> IdentityKeyPair {
        self.info.read().signing_key()
    }

    pub fn config_version(&self) -> u32 {
        self.info.read().config_version()
    }

    pub fn is_paired(&self) -> bool {
        self.info.read().is_paired()
    }

    pub fn is_admin(&self, controller: &str) -> bool {
        self.info.read().is_admin(controller)
    }

    /// Long-term public key of a paired controller.
    pub fn controller_key(&self, controller: &str) -> Option<[u8; 32]> {
        self.info
            .read()
            .paired_client(controller)
            .map(|c| c.public_key)
    }

    pub fn pairings(&self) -> Vec<(String, PairedClient)> {
        self.info
            .read()
            .paired_clients()
            .map(|(id, client)| (id.to_string(), client.clone()))
            .collect()
    }

    /// Record the structural hash; returns `true` when the configuration
    /// version changed.
    pub fn check_config_hash(&self, hash: &str) -> Result<bool, StorageError> {
        let version_before = self.config_version();
        let changed = self.update(|info| info.check_config_hash(hash))?;
        Ok(changed && self.config_version() != version_before)
    }

    pub fn add_pairing(
        &self,
        controller: &str,
        public_key: [u8; 32],
        permission: Permission,
    ) -> Result<AddPairingOutcome, StorageError> {
        let mut info = self.info.write();
        let mut next = info.clone();
        let outcome = next.add_paired_client(controller, public_key, permission);
        if outcome != AddPairingOutcome::KeyMismatch {
            next.save(self.storage.as_ref())?;
            *info = next;
        }
        Ok(outcome)
    }

    /// Remove a controller; dropping the last admin unpairs the accessory.
    pub fn remove_pairing(&self, controller: &str) -> Result<RemovePairingOutcome, StorageError> {
        let mut info = self.info.write();
        let mut next = info.clone();
        if !next.remove_paired_client(controller) {
            return Ok(RemovePairingOutcome::NotFound);
        }

        let outcome = if next.has_admin() {
            RemovePairingOutcome::Removed
        } else {
            let mut removed = vec![controller.to_string()];
            removed.extend(next.clear_paired_clients());
            info!(count = removed.len(), "Last admin removed; accessory unpaired");
            RemovePairingOutcome::Unpaired { removed }
        };

        next.save(self.storage.as_ref())?;
        *info = next;
        Ok(outcome)
    }

    /// Drop every pairing, e.g. for a factory reset requested by the application.
    pub fn reset_pairings(&self) -> Result<Vec<String>, StorageError> {
        let mut info = self.info.write();
        let mut next = info.clone();
        let removed = next.clear_paired_clients();
        next.save(self.storage.as_ref())?;
        *info = next;
        Ok(removed)
    }

    fn update<T>(&self, f: impl FnOnce(&mut AccessoryInfo) -> T) -> Result<T, StorageError> {
        let mut info = self.info.write();
        let mut next = info.clone();
        let result = f(&mut next);
        if let Err(e) = next.save(self.storage.as_ref()) {
            warn!(error = %e, "Failed to persist accessory record");
            return Err(e);
        }
        *info = next;
        Ok(result)
    }
}

impl std::fmt::Debug for PairingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = self.info.read();
        f.debug_struct("PairingStore")
            .field("username", &info.username)
            .field("paired", &info.is_paired())
            .finish()
    }
}

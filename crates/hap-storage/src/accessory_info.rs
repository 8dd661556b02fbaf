//! The durable pairing record of a published accessory.

use std::collections::BTreeMap;

use hap_core::category::Category;
use hap_core::error::StorageError;
use hap_crypto::ed25519::IdentityKeyPair;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::storage::{load_json, persist_suffix, save_json, Storage};

/// Highest configuration version before wrapping back to 1.
pub const MAX_CONFIG_VERSION: u32 = 65535;

/// Rights of a paired controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    User,
    Admin,
}

impl Permission {
    /// TLV8 `Permissions` byte.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::User => 0x00,
            Self::Admin => 0x01,
        }
    }

    pub fn from_byte(b: u8) -> Self {
        if b & 0x01 == 0x01 {
            Self::Admin
        } else {
            Self::User
        }
    }
}

/// A controller registered through pair-setup or add-pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedClient {
    #[serde(with = "hex::serde")]
    pub public_key: [u8; 32],
    pub permission: Permission,
}

/// Outcome of [`AccessoryInfo::add_paired_client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddPairingOutcome {
    Added,
    PermissionUpdated,
    /// The identifier is paired with a different long-term key.
    KeyMismatch,
}

/// Long-term keys, setup data, paired controllers and configuration version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessoryInfo {
    pub username: String,
    pub display_name: String,
    pub category: Category,
    pub pincode: String,
    pub setup_id: String,
    #[serde(with = "hex::serde")]
    sign_seed: [u8; 32],
    #[serde(with = "hex::serde")]
    sign_public: [u8; 32],
    paired_clients: BTreeMap<String, PairedClient>,
    config_version: u32,
    #[serde(default)]
    config_hash: String,
}

impl AccessoryInfo {
    /// Fresh record with a newly generated long-term key pair.
    pub fn create(
        username: impl Into<String>,
        display_name: impl Into<String>,
        category: Category,
        pincode: impl Into<String>,
        setup_id: impl Into<String>,
    ) -> Self {
        let keypair = IdentityKeyPair::generate();
        Self {
            username: username.into(),
            display_name: display_name.into(),
            category,
            pincode: pincode.into(),
            setup_id: setup_id.into(),
            sign_seed: keypair.seed(),
            sign_public: keypair.public_key(),
            paired_clients: BTreeMap::new(),
            config_version: 1,
            config_hash: String::new(),
        }
    }

    /// Storage key for a username.
    pub fn storage_key(username: &str) -> String {
        format!("AccessoryInfo.{}.json", persist_suffix(username))
    }

    /// Load the record for `username`.
    ///
    /// A malformed document is logged and reported as absent, so the caller
    /// starts over with an unpaired accessory.
    pub fn load(storage: &dyn Storage, username: &str) -> Result<Option<Self>, StorageError> {
        let key = Self::storage_key(username);
        match load_json::<Self>(storage, &key) {
            Ok(Some(info)) if IdentityKeyPair::from_seed(&info.sign_seed).public_key() != info.sign_public => {
                warn!(key = %key, "Stored long-term key pair is inconsistent; ignoring record");
                Ok(None)
            }
            Ok(found) => Ok(found),
            Err(StorageError::Malformed { key, reason }) => {
                warn!(key = %key, reason = %reason, "Malformed accessory record; ignoring");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, storage: &dyn Storage) -> Result<(), StorageError> {
        save_json(storage, &Self::storage_key(&self.username), self)
    }

    /// Delete the persisted record for `username`.
    pub fn remove(storage: &dyn Storage, username: &str) -> Result<(), StorageError> {
        storage.remove(&Self::storage_key(username))
    }

    /// Accessory long-term key pair (LTSK/LTPK).
    pub fn signing_key(&self) -> IdentityKeyPair {
        IdentityKeyPair::from_seed(&self.sign_seed)
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.sign_public
    }

    /// Register a controller, or update its permission when the key matches.
    pub fn add_paired_client(
        &mut self,
        username: &str,
        public_key: [u8; 32],
        permission: Permission,
    ) -> AddPairingOutcome {
        match self.paired_clients.get_mut(username) {
            Some(existing) if existing.public_key != public_key => AddPairingOutcome::KeyMismatch,
            Some(existing) => {
                existing.permission = permission;
                AddPairingOutcome::PermissionUpdated
            }
            None => {
                info!(controller = %username, ?permission, "Controller paired");
                self.paired_clients.insert(
                    username.to_string(),
                    PairedClient {
                        public_key,
                        permission,
                    },
                );
                AddPairingOutcome::Added
            }
        }
    }

    /// Remove a controller. Returns `false` when it was not paired.
    pub fn remove_paired_client(&mut self, username: &str) -> bool {
        let removed = self.paired_clients.remove(username).is_some();
        if removed {
            info!(controller = %username, "Controller unpaired");
        }
        removed
    }

    /// Drop every pairing.
    pub fn clear_paired_clients(&mut self) -> Vec<String> {
        let removed: Vec<String> = self.paired_clients.keys().cloned().collect();
        self.paired_clients.clear();
        removed
    }

    pub fn paired_client(&self, username: &str) -> Option<&PairedClient> {
        self.paired_clients.get(username)
    }

    pub fn paired_clients(&self) -> impl Iterator<Item = (&str, &PairedClient)> {
        self.paired_clients.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_admin(&self, username: &str) -> bool {
        matches!(
            self.paired_clients.get(username),
            Some(PairedClient {
                permission: Permission::Admin,
                ..
            })
        )
    }

    pub fn has_admin(&self) -> bool {
        self.paired_clients
            .values()
            .any(|c| c.permission == Permission::Admin)
    }

    pub fn is_paired(&self) -> bool {
        !self.paired_clients.is_empty()
    }

    pub fn config_version(&self) -> u32 {
        self.config_version
    }

    /// Record the structural hash of the published tree.
    ///
    /// Returns `true` (and bumps the configuration version) when the hash
    /// differs from the stored one.
    pub fn check_config_hash(&mut self, hash: &str) -> bool {
        if self.config_hash == hash {
            return false;
        }
        let first_observation = self.config_hash.is_empty();
        self.config_hash = hash.to_string();
        if !first_observation {
            self.config_version = next_config_version(self.config_version);
            info!(version = self.config_version, "Configuration version incremented");
        }
        true
    }
}

fn next_config_version(current: u32) -> u32 {
    if current >= MAX_CONFIG_VERSION {
        1
    } else {
        current + 1
    }
}

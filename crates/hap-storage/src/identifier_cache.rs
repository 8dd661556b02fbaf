//! Stable `aid`/`iid` assignment that survives restarts.
//!
//! Keys are composite strings:
//!
//! ```text
//! <accessory uuid>                                  -> aid
//! <accessory uuid>|<service uuid>[|<subtype>]       -> service iid
//! <accessory uuid>|<service uuid>[|<subtype>]|<characteristic uuid> -> iid
//! ```

use std::collections::{BTreeMap, BTreeSet};

use hap_core::error::StorageError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::storage::{load_json, persist_suffix, save_json, Storage};

/// First `aid` handed to bridged accessories (1 is the bridge itself).
pub const FIRST_BRIDGED_AID: u64 = 2;

/// First `iid` handed out per accessory (1 is the accessory information service).
pub const FIRST_IID: u64 = 2;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
struct CacheDocument {
    cache: BTreeMap<String, u64>,
    next_aid: u64,
    #[serde(default)]
    next_iid: BTreeMap<String, u64>,
}

/// Persistent mapping from entity identities to integer IDs.
#[derive(Debug)]
pub struct IdentifierCache {
    username: String,
    doc: CacheDocument,
    used: Option<BTreeSet<String>>,
    saved_hash: Option<[u8; 32]>,
}

impl IdentifierCache {
    /// Empty cache for a bridge username.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            doc: CacheDocument {
                next_aid: FIRST_BRIDGED_AID,
                ..CacheDocument::default()
            },
            used: None,
            saved_hash: None,
        }
    }

    /// Storage key for a username.
    pub fn storage_key(username: &str) -> String {
        format!("IdentifierCache.{}.json", persist_suffix(username))
    }

    /// Load the cache for `username`, starting empty when absent or malformed.
    pub fn load(storage: &dyn Storage, username: &str) -> Result<Self, StorageError> {
        let mut cache = Self::new(username);
        match load_json::<CacheDocument>(storage, &Self::storage_key(username)) {
            Ok(Some(doc)) => {
                cache.saved_hash = Some(hash_document(&doc));
                cache.doc = doc;
                cache.doc.next_aid = cache.doc.next_aid.max(FIRST_BRIDGED_AID);
            }
            Ok(None) => {}
            Err(StorageError::Malformed { key, reason }) => {
                warn!(key = %key, reason = %reason, "Malformed identifier cache; starting empty");
            }
            Err(e) => return Err(e),
        }
        Ok(cache)
    }

    /// Persist the cache when its content changed since the last load/save.
    ///
    /// Returns whether a write happened.
    pub fn save(&mut self, storage: &dyn Storage) -> Result<bool, StorageError> {
        let hash = hash_document(&self.doc);
        if self.saved_hash == Some(hash) {
            return Ok(false);
        }
        save_json(storage, &Self::storage_key(&self.username), &self.doc)?;
        self.saved_hash = Some(hash);
        debug!(entries = self.doc.cache.len(), "Saved identifier cache");
        Ok(true)
    }

    /// Delete the persisted cache for `username`.
    pub fn remove(storage: &dyn Storage, username: &str) -> Result<(), StorageError> {
        storage.remove(&Self::storage_key(username))
    }

    /// Begin a usage-tracking pass.
    pub fn start_tracking_usage(&mut self) {
        self.used = Some(BTreeSet::new());
    }

    /// End the pass and expire every key not touched during it.
    ///
    /// With `purge == false` the pass ends without expiring anything.
    pub fn stop_tracking_usage(&mut self, purge: bool) {
        let Some(used) = self.used.take() else {
            return;
        };
        if !purge {
            return;
        }
        let before = self.doc.cache.len();
        self.doc.cache.retain(|key, _| used.contains(key));
        self.doc
            .next_iid
            .retain(|accessory, _| used.contains(accessory.as_str()));
        let expired = before - self.doc.cache.len();
        if expired > 0 {
            debug!(expired, "Expired unused identifiers");
        }
    }

    /// `aid` for a bridged accessory.
    pub fn get_aid(&mut self, accessory_uuid: &str) -> u64 {
        let key = accessory_uuid.to_string();
        self.lookup_or_assign(key, |doc| {
            let aid = doc.next_aid;
            doc.next_aid += 1;
            aid
        })
    }

    /// `iid` for a service within an accessory.
    pub fn get_service_iid(
        &mut self,
        accessory_uuid: &str,
        service_uuid: &str,
        subtype: Option<&str>,
    ) -> u64 {
        let key = service_key(accessory_uuid, service_uuid, subtype);
        self.assign_iid(accessory_uuid, key)
    }

    /// `iid` for a characteristic within a service.
    pub fn get_characteristic_iid(
        &mut self,
        accessory_uuid: &str,
        service_uuid: &str,
        subtype: Option<&str>,
        characteristic_uuid: &str,
    ) -> u64 {
        let key = format!(
            "{}|{}",
            service_key(accessory_uuid, service_uuid, subtype),
            characteristic_uuid
        );
        self.assign_iid(accessory_uuid, key)
    }

    /// Number of cached keys.
    pub fn len(&self) -> usize {
        self.doc.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc.cache.is_empty()
    }

    fn assign_iid(&mut self, accessory_uuid: &str, key: String) -> u64 {
        let accessory = accessory_uuid.to_string();
        self.mark(&accessory);
        self.lookup_or_assign(key, |doc| {
            let next = doc.next_iid.entry(accessory).or_insert(FIRST_IID);
            let iid = *next;
            *next += 1;
            iid
        })
    }

    fn lookup_or_assign(
        &mut self,
        key: String,
        allocate: impl FnOnce(&mut CacheDocument) -> u64,
    ) -> u64 {
        self.mark(&key);
        if let Some(id) = self.doc.cache.get(&key) {
            return *id;
        }
        let id = allocate(&mut self.doc);
        self.doc.cache.insert(key, id);
        id
    }

    fn mark(&mut self, key: &str) {
        if let Some(used) = self.used.as_mut() {
            used.insert(key.to_string());
        }
    }
}

fn service_key(accessory_uuid: &str, service_uuid: &str, subtype: Option<&str>) -> String {
    match subtype {
        Some(subtype) => format!("{}|{}|{}", accessory_uuid, service_uuid, subtype),
        None => format!("{}|{}", accessory_uuid, service_uuid),
    }
}

fn hash_document(doc: &CacheDocument) -> [u8; 32] {
    let bytes = serde_json::to_vec(doc).unwrap_or_default();
    Sha256::digest(bytes).into()
}

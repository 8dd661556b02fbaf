//! # hap-storage
//!
//! Persistence for a published HomeKit accessory.
//!
//! This crate provides:
//! - The [`Storage`] key/value abstraction with in-memory and on-disk backends
//! - [`AccessoryInfo`], the durable pairing record
//! - [`IdentifierCache`], stable `aid`/`iid` assignment

pub mod accessory_info;
pub mod identifier_cache;
pub mod storage;

pub use accessory_info::{AccessoryInfo, AddPairingOutcome, PairedClient, Permission};
pub use identifier_cache::IdentifierCache;
pub use storage::{FileStorage, MemoryStorage, Storage};

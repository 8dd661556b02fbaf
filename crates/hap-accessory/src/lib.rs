//! # hap-accessory
//!
//! The accessory object model exposed over HAP.
//!
//! This crate provides:
//! - Characteristics with format validation, permissions and async handlers
//! - Services and accessories, including bridges and stable identifiers
//! - Change and warning events propagated from characteristic to bridge
//! - Controller extensions with persisted state
//! - An adaptive lighting controller
//!
//! Entities are shared as `Arc`s and mutated through interior locks, so the
//! server and the application can hold the same tree.

pub mod accessory;
pub mod adaptive_lighting;
pub mod characteristic;
pub mod controller;
pub mod handler;
pub mod observer;
pub mod resource;
pub mod service;
pub mod types;
pub mod value;

pub use accessory::{Accessory, AccessoryEvent, PRIMARY_AID};
pub use adaptive_lighting::AdaptiveLightingController;
pub use characteristic::{
    ChangeReason, Characteristic, CharacteristicChange, CharacteristicEvent,
    CharacteristicWarning, WarningKind, WriteOptions,
};
pub use controller::{Controller, ControllerStorage, ControllerType, StateChangeNotifier};
pub use handler::{read_fn, write_fn, ConnectionId, ReadHandler, RequestContext, WriteHandler};
pub use observer::{Observers, SubscriptionHandle};
pub use resource::{ResourceProvider, ResourceRequest};
pub use service::{Service, ServiceEvent};
pub use value::{CharProps, CharValue, Format, Perm};

//! # hap-core
//!
//! Core types and error definitions shared across all HAP crates.
//!
//! This crate provides:
//! - Common error types
//! - HAP characteristic status, HTTP status and TLV8 pairing error codes
//! - Accessory categories
//! - Connection identifiers
//! - HAP type UUID helpers
//! - Setup code, setup URI and setup hash rendering

pub mod category;
pub mod connection;
pub mod error;
pub mod hap_type;
pub mod setup;
pub mod status;

pub use category::Category;
pub use connection::ConnectionId;
pub use error::{
    AccessoryError, CryptoError, DiscoveryError, Error, HttpError, PairingError, ParseError,
    Result, StorageError,
};
pub use status::{HapStatus, HttpStatus, TlvError};

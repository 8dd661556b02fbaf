//! # hap-pairing
//!
//! Pairing and session security for a HomeKit accessory.
//!
//! This crate implements:
//! - Accessory-side pair-setup (SRP-6a, M1-M6) with attempt limits and backoff
//! - Accessory-side pair-verify (Curve25519 + Ed25519, M1-M4)
//! - The encrypted transport framing used after pair-verify
//! - Add, remove and list pairings for admin controllers
//! - Controller-side handshake drivers for tests and tooling

pub mod channel;
pub mod controller;
pub mod pair_setup;
pub mod pair_verify;
pub mod pairings;
pub mod session;
pub mod store;

pub use channel::EncryptedChannel;
pub use controller::{AccessoryPairing, ControllerIdentity, PairSetupClient, PairVerifyClient};
pub use pair_setup::{BackoffConfig, PairSetupServer, SetupPolicy, SetupRejection, SetupResponse};
pub use pair_verify::{PairVerifyServer, VerifiedSession, VerifyResponse};
pub use pairings::{handle_pairings, PairingsEffect, PairingsResponse};
pub use session::{Session, SessionState};
pub use store::{PairingStore, RemovePairingOutcome};

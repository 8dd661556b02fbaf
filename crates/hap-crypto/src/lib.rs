//! # hap-crypto
//!
//! Cryptographic building blocks for HomeKit pairing and sessions.
//!
//! This crate provides:
//! - TLV8 codec for pairing messages
//! - SRP-6a (3072-bit) for pair-setup, accessory and controller sides
//! - Curve25519 ECDH for pair-verify
//! - Ed25519 long-term identity keys
//! - ChaCha20-Poly1305 session framing
//! - HKDF-SHA512 for key derivation
//!
//! All secret material is zeroized on drop.

pub mod chacha;
pub mod curve25519;
pub mod ed25519;
pub mod hkdf;
pub mod keys;
pub mod srp;
pub mod tlv;

pub use chacha::ControlCipher;
pub use curve25519::EcdhKeyPair;
pub use ed25519::IdentityKeyPair;
pub use keys::{EncryptionKey, SessionKeys, SharedSecret};
pub use srp::{SrpClient, SrpServer};
pub use tlv::{PairingMethod, Tlv8, TlvType};

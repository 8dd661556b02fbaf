//! Error types for the HomeKit accessory server.

use thiserror::Error;

use crate::status::TlvError;

/// Primary error type for all HAP operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("Pairing error: {0}")]
    Pairing(#[from] PairingError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Accessory error: {0}")]
    Accessory(#[from] AccessoryError),

    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Operation timed out")]
    Timeout,
}

/// Errors during mDNS advertisement.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("mDNS daemon error: {0}")]
    Daemon(String),

    #[error("Service registration failed: {0}")]
    Registration(String),

    #[error("Advertiser not initialized with a port")]
    NoPort,
}

/// Errors during pair-setup, pair-verify and pairing management.
#[derive(Error, Debug)]
pub enum PairingError {
    #[error("Invalid setup code: {0}")]
    InvalidPin(String),

    #[error("Accessory returned error {code} in state M{state}")]
    Rejected { state: u8, code: TlvError },

    #[error("SRP verification failed")]
    SrpVerificationFailed,

    #[error("Signature verification failed")]
    SignatureInvalid,

    #[error("Pairing state mismatch: expected {expected}, got {actual}")]
    StateMismatch { expected: u8, actual: u8 },

    #[error("TLV parsing error: {0}")]
    TlvParse(String),

    #[error("Missing required TLV type: {0}")]
    MissingTlv(u8),

    #[error("Unknown controller: {0}")]
    UnknownController(String),

    #[error("Pairing not found: {0}")]
    NotFound(String),

    #[error("Invalid pairing state: {0}")]
    InvalidState(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Cryptographic operation errors.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Authentication tag mismatch")]
    AuthTagMismatch,

    #[error("SRP proof mismatch")]
    ProofMismatch,

    #[error("Signature verification failed")]
    BadSignature,
}

/// Parsing errors for various formats.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid hex value: {0}")]
    InvalidHex(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Persistence failures.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Malformed record {key}: {reason}")]
    Malformed { key: String, reason: String },
}

/// Errors raised by the accessory model.
#[derive(Error, Debug)]
pub enum AccessoryError {
    #[error("Service {uuid} with subtype {subtype:?} already exists")]
    DuplicateService {
        uuid: String,
        subtype: Option<String>,
    },

    #[error("Characteristic {0} already exists on service")]
    DuplicateCharacteristic(String),

    #[error("Accessory {0} already bridged")]
    DuplicateAccessory(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("No controller registered for type {0}")]
    UnknownController(String),

    #[error("Controller error: {0}")]
    Controller(String),

    #[error("Accessory is already published")]
    AlreadyPublished,
}

/// Errors while decoding HTTP traffic.
#[derive(Error, Debug)]
pub enum HttpError {
    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("Request body too large: {0} bytes")]
    BodyTooLarge(usize),
}

/// Convenience Result type.
pub type Result<T> = std::result::Result<T, Error>;

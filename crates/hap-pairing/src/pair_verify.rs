//! Accessory side of pair-verify (M1-M4).
//!
//! An ephemeral Curve25519 exchange authenticated by both parties' long-term
//! Ed25519 keys. The resulting shared secret yields the session keys for the
//! encrypted transport.

use hap_core::connection::ConnectionId;
use hap_core::error::PairingError;
use hap_core::status::TlvError;
use hap_crypto::chacha::{decrypt_with_nonce, encrypt_with_nonce, nonce_from_string};
use hap_crypto::curve25519::{public_key_from_slice, EcdhKeyPair};
use hap_crypto::ed25519::verify;
use hap_crypto::hkdf;
use hap_crypto::keys::{SessionKeys, SharedSecret};
use hap_crypto::tlv::{Tlv8, TlvType};
use tracing::{debug, info, warn};

use crate::store::PairingStore;

const PV_MSG02_NONCE: &[u8] = b"PV-Msg02";
const PV_MSG03_NONCE: &[u8] = b"PV-Msg03";

/// Keys and identity of a freshly verified session.
pub struct VerifiedSession {
    pub controller: String,
    pub keys: SessionKeys,
}

/// Response to one pair-verify request.
pub struct VerifyResponse {
    pub body: Vec<u8>,
    /// Set once M4 has been produced; the transport switches to encryption
    /// after the response is written.
    pub verified: Option<VerifiedSession>,
}

impl VerifyResponse {
    fn reply(tlv: Tlv8) -> Self {
        Self {
            body: tlv.encode(),
            verified: None,
        }
    }
}

struct Exchange {
    accessory_public: [u8; 32],
    controller_public: [u8; 32],
    shared_secret: [u8; 32],
    key: [u8; 32],
}

/// Per-connection pair-verify state machine.
#[derive(Default)]
pub struct PairVerifyServer {
    exchange: Option<Exchange>,
}

impl PairVerifyServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&mut self, store: &PairingStore, connection: ConnectionId, body: &[u8]) -> VerifyResponse {
        let request = match Tlv8::parse(body) {
            Ok(request) => request,
            Err(e) => {
                warn!(%connection, error = %e, "Malformed pair-verify request");
                return self.fail(2, TlvError::Unknown);
            }
        };

        match request.state() {
            Some(1) => match self.handle_m1(store, &request) {
                Ok(tlv) => {
                    debug!(%connection, "Pair-verify M1 -> M2");
                    VerifyResponse::reply(tlv)
                }
                Err(e) => {
                    warn!(%connection, error = %e, "Pair-verify M1 failed");
                    self.fail(2, TlvError::Unknown)
                }
            },
            Some(3) if self.exchange.is_some() => match self.handle_m3(store, &request) {
                Ok(verified) => {
                    info!(%connection, controller = %verified.controller, "Pair-verify complete");
                    VerifyResponse {
                        body: Tlv8::with_state(4).encode(),
                        verified: Some(verified),
                    }
                }
                Err(e) => {
                    info!(%connection, error = %e, "Pair-verify M3 rejected");
                    self.fail(4, TlvError::Authentication)
                }
            },
            other => {
                warn!(%connection, state = ?other, "Unexpected pair-verify state");
                let reply_state = other.map(|s| s.saturating_add(1)).unwrap_or(2);
                self.fail(reply_state, TlvError::Unknown)
            }
        }
    }

    fn handle_m1(&mut self, store: &PairingStore, request: &Tlv8) -> Result<Tlv8, PairingError> {
        let controller_public = request
            .get(TlvType::PublicKey)
            .ok_or(PairingError::MissingTlv(TlvType::PublicKey as u8))?;
        let controller_public =
            public_key_from_slice(controller_public).map_err(|e| PairingError::Protocol(e.to_string()))?;

        let ecdh = EcdhKeyPair::generate();
        let accessory_public = ecdh.public_key();
        let shared_secret = ecdh
            .diffie_hellman(&controller_public)
            .map_err(|e| PairingError::Protocol(e.to_string()))?;
        let key = hkdf::derive_pair_verify_key(&shared_secret)
            .map_err(|e| PairingError::Protocol(e.to_string()))?;

        let username = store.username();
        let mut info = Vec::with_capacity(64 + username.len());
        info.extend_from_slice(&accessory_public);
        info.extend_from_slice(username.as_bytes());
        info.extend_from_slice(&controller_public);

        let mut sub = Tlv8::new();
        sub.push(TlvType::Identifier, username.into_bytes());
        sub.push(TlvType::Signature, store.signing_key().sign(&info).to_vec());
        let encrypted = encrypt_with_nonce(&key, &nonce_from_string(PV_MSG02_NONCE), &sub.encode())
            .map_err(|e| PairingError::Protocol(e.to_string()))?;

        self.exchange = Some(Exchange {
            accessory_public,
            controller_public,
            shared_secret,
            key,
        });

        let mut tlv = Tlv8::with_state(2);
        tlv.push(TlvType::PublicKey, accessory_public.to_vec());
        tlv.push(TlvType::EncryptedData, encrypted);
        Ok(tlv)
    }

    fn handle_m3(&mut self, store: &PairingStore, request: &Tlv8) -> Result<VerifiedSession, PairingError> {
        let exchange = self
            .exchange
            .take()
            .ok_or_else(|| PairingError::InvalidState("M3 before M1".to_string()))?;
        let encrypted = request
            .get(TlvType::EncryptedData)
            .ok_or(PairingError::MissingTlv(TlvType::EncryptedData as u8))?;

        let plaintext = decrypt_with_nonce(&exchange.key, &nonce_from_string(PV_MSG03_NONCE), encrypted)
            .map_err(|e| PairingError::Protocol(e.to_string()))?;
        let sub = Tlv8::parse(&plaintext).map_err(|e| PairingError::TlvParse(e.to_string()))?;
        let identifier = sub
            .get(TlvType::Identifier)
            .ok_or(PairingError::MissingTlv(TlvType::Identifier as u8))?;
        let signature = sub
            .get(TlvType::Signature)
            .ok_or(PairingError::MissingTlv(TlvType::Signature as u8))?;

        let controller = String::from_utf8_lossy(identifier).into_owned();
        let controller_ltpk = store
            .controller_key(&controller)
            .ok_or_else(|| PairingError::UnknownController(controller.clone()))?;

        let mut info = Vec::with_capacity(64 + identifier.len());
        info.extend_from_slice(&exchange.controller_public);
        info.extend_from_slice(identifier);
        info.extend_from_slice(&exchange.accessory_public);
        verify(&controller_ltpk, &info, signature).map_err(|_| PairingError::SignatureInvalid)?;

        let keys = SessionKeys::derive_accessory_keys(&SharedSecret::new(exchange.shared_secret.to_vec()))
            .map_err(|e| PairingError::Protocol(e.to_string()))?;
        Ok(VerifiedSession { controller, keys })
    }

    fn fail(&mut self, state: u8, error: TlvError) -> VerifyResponse {
        self.exchange = None;
        VerifyResponse::reply(Tlv8::error_response(state, error))
    }
}

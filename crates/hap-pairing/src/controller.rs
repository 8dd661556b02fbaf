//! Controller side of the handshakes.
//!
//! Drives pair-setup, pair-verify and the pairings endpoint against an
//! accessory. Used by the integration tests and by tooling that needs to talk
//! to a running bridge.

use hap_core::error::PairingError;
use hap_core::status::TlvError;
use hap_crypto::chacha::{decrypt_with_nonce, encrypt_with_nonce, nonce_from_string};
use hap_crypto::curve25519::{public_key_from_slice, EcdhKeyPair};
use hap_crypto::ed25519::{verify, IdentityKeyPair};
use hap_crypto::hkdf;
use hap_crypto::keys::{SessionKeys, SharedSecret};
use hap_crypto::srp::{SrpChallenge, SrpClient, SrpProof};
use hap_crypto::tlv::{PairingMethod, Tlv8, TlvType};
use hap_storage::Permission;
use uuid::Uuid;

use crate::pair_setup::SRP_IDENTITY;

/// A controller's pairing identifier and long-term key pair.
///
/// The same identifier must be presented in pair-setup M5 and pair-verify M3.
#[derive(Clone, Debug)]
pub struct ControllerIdentity {
    id: String,
    keypair: IdentityKeyPair,
}

impl ControllerIdentity {
    /// Random key pair with an upper-case UUID identifier.
    pub fn generate() -> Self {
        Self::with_id(
            IdentityKeyPair::generate(),
            Uuid::new_v4().to_string().to_uppercase(),
        )
    }

    pub fn with_id(keypair: IdentityKeyPair, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            keypair,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.keypair.public_key()
    }

    pub fn keypair(&self) -> &IdentityKeyPair {
        &self.keypair
    }
}

/// What pair-setup learns about the accessory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessoryPairing {
    pub identifier: String,
    pub public_key: [u8; 32],
}

/// Parse a response and check it carries `expected` state and no error.
fn expect_state(body: &[u8], expected: u8) -> Result<Tlv8, PairingError> {
    let tlv = Tlv8::parse(body).map_err(|e| PairingError::TlvParse(e.to_string()))?;
    if let Some(code) = tlv.error() {
        return Err(PairingError::Rejected {
            state: expected,
            code: TlvError::from_byte(code).unwrap_or(TlvError::Unknown),
        });
    }
    match tlv.state() {
        Some(state) if state == expected => Ok(tlv),
        Some(actual) => Err(PairingError::StateMismatch { expected, actual }),
        None => Err(PairingError::MissingTlv(TlvType::State as u8)),
    }
}

fn required<'a>(tlv: &'a Tlv8, typ: TlvType) -> Result<&'a [u8], PairingError> {
    tlv.get(typ).ok_or(PairingError::MissingTlv(typ as u8))
}

fn protocol(e: impl std::fmt::Display) -> PairingError {
    PairingError::Protocol(e.to_string())
}

/// Controller half of pair-setup.
pub struct PairSetupClient {
    srp: SrpClient,
    proof: Option<SrpProof>,
    session_key: Option<[u8; 32]>,
}

impl PairSetupClient {
    pub fn new(pincode: &str) -> Self {
        Self {
            srp: SrpClient::new(SRP_IDENTITY, pincode.as_bytes()),
            proof: None,
            session_key: None,
        }
    }

    /// M1: `{State=1, Method=PairSetup}`.
    pub fn m1(&self) -> Vec<u8> {
        let mut tlv = Tlv8::with_state(1);
        tlv.push(TlvType::Method, vec![PairingMethod::PairSetup as u8]);
        tlv.encode()
    }

    /// Consume M2 (salt, B) and produce M3 (A, proof).
    pub fn process_m2(&mut self, body: &[u8]) -> Result<Vec<u8>, PairingError> {
        let tlv = expect_state(body, 2)?;
        let salt: [u8; 16] = required(&tlv, TlvType::Salt)?
            .try_into()
            .map_err(|_| protocol("salt must be 16 bytes"))?;
        let server_public_key = required(&tlv, TlvType::PublicKey)?.to_vec();

        let proof = self
            .srp
            .process_challenge(&SrpChallenge {
                salt,
                server_public_key,
            })
            .map_err(protocol)?;

        let mut m3 = Tlv8::with_state(3);
        m3.push(TlvType::PublicKey, self.srp.public_key());
        m3.push(TlvType::Proof, proof.client_proof.clone());
        self.proof = Some(proof);
        Ok(m3.encode())
    }

    /// Check the accessory's SRP proof.
    pub fn process_m4(&mut self, body: &[u8]) -> Result<(), PairingError> {
        let tlv = expect_state(body, 4)?;
        let proof = self
            .proof
            .as_ref()
            .ok_or_else(|| PairingError::InvalidState("M4 before M2".to_string()))?;
        if !self
            .srp
            .verify_server_proof(required(&tlv, TlvType::Proof)?, &proof.expected_server_proof)
        {
            return Err(PairingError::SrpVerificationFailed);
        }
        self.session_key = Some(hkdf::derive_pair_setup_key(&proof.shared_secret).map_err(protocol)?);
        Ok(())
    }

    /// M5: the controller's identifier, LTPK and signature, encrypted.
    pub fn m5(&self, identity: &ControllerIdentity) -> Result<Vec<u8>, PairingError> {
        let (Some(proof), Some(session_key)) = (self.proof.as_ref(), self.session_key.as_ref())
        else {
            return Err(PairingError::InvalidState("M5 before M4".to_string()));
        };

        let device_x = hkdf::derive_controller_sign_key(&proof.shared_secret).map_err(protocol)?;
        let mut info = device_x.to_vec();
        info.extend_from_slice(identity.id().as_bytes());
        info.extend_from_slice(&identity.public_key());

        let mut inner = Tlv8::new();
        inner.push(TlvType::Identifier, identity.id().as_bytes().to_vec());
        inner.push(TlvType::PublicKey, identity.public_key().to_vec());
        inner.push(TlvType::Signature, identity.keypair().sign(&info).to_vec());

        let encrypted = encrypt_with_nonce(session_key, &nonce_from_string(b"PS-Msg05"), &inner.encode())
            .map_err(protocol)?;
        let mut m5 = Tlv8::with_state(5);
        m5.push(TlvType::EncryptedData, encrypted);
        Ok(m5.encode())
    }

    /// Decrypt M6 and verify the accessory's signature.
    pub fn process_m6(&self, body: &[u8]) -> Result<AccessoryPairing, PairingError> {
        let tlv = expect_state(body, 6)?;
        let (Some(proof), Some(session_key)) = (self.proof.as_ref(), self.session_key.as_ref())
        else {
            return Err(PairingError::InvalidState("M6 before M4".to_string()));
        };

        let plaintext = decrypt_with_nonce(
            session_key,
            &nonce_from_string(b"PS-Msg06"),
            required(&tlv, TlvType::EncryptedData)?,
        )
        .map_err(protocol)?;
        let inner = Tlv8::parse(&plaintext).map_err(|e| PairingError::TlvParse(e.to_string()))?;
        let identifier = required(&inner, TlvType::Identifier)?;
        let public_key: [u8; 32] = required(&inner, TlvType::PublicKey)?
            .try_into()
            .map_err(|_| protocol("accessory LTPK must be 32 bytes"))?;

        let accessory_x = hkdf::derive_accessory_sign_key(&proof.shared_secret).map_err(protocol)?;
        let mut info = accessory_x.to_vec();
        info.extend_from_slice(identifier);
        info.extend_from_slice(&public_key);
        verify(&public_key, &info, required(&inner, TlvType::Signature)?)
            .map_err(|_| PairingError::SignatureInvalid)?;

        Ok(AccessoryPairing {
            identifier: String::from_utf8_lossy(identifier).into_owned(),
            public_key,
        })
    }
}

/// Controller half of pair-verify.
pub struct PairVerifyClient {
    identity: ControllerIdentity,
    ecdh: Option<EcdhKeyPair>,
    public: [u8; 32],
    shared_secret: Option<[u8; 32]>,
}

impl PairVerifyClient {
    pub fn new(identity: ControllerIdentity) -> Self {
        let ecdh = EcdhKeyPair::generate();
        Self {
            identity,
            public: ecdh.public_key(),
            ecdh: Some(ecdh),
            shared_secret: None,
        }
    }

    /// M1: `{State=1, PublicKey}`.
    pub fn m1(&self) -> Vec<u8> {
        let mut tlv = Tlv8::with_state(1);
        tlv.push(TlvType::PublicKey, self.public.to_vec());
        tlv.encode()
    }

    /// Verify the accessory in M2 against its known LTPK and produce M3.
    pub fn process_m2(&mut self, body: &[u8], accessory_ltpk: &[u8; 32]) -> Result<Vec<u8>, PairingError> {
        let tlv = expect_state(body, 2)?;
        let accessory_public =
            public_key_from_slice(required(&tlv, TlvType::PublicKey)?).map_err(protocol)?;
        let ecdh = self
            .ecdh
            .take()
            .ok_or_else(|| PairingError::InvalidState("M2 already processed".to_string()))?;
        let shared = ecdh.diffie_hellman(&accessory_public).map_err(protocol)?;
        let key = hkdf::derive_pair_verify_key(&shared).map_err(protocol)?;

        let plaintext = decrypt_with_nonce(
            &key,
            &nonce_from_string(b"PV-Msg02"),
            required(&tlv, TlvType::EncryptedData)?,
        )
        .map_err(protocol)?;
        let inner = Tlv8::parse(&plaintext).map_err(|e| PairingError::TlvParse(e.to_string()))?;

        let mut info = accessory_public.to_vec();
        info.extend_from_slice(required(&inner, TlvType::Identifier)?);
        info.extend_from_slice(&self.public);
        verify(accessory_ltpk, &info, required(&inner, TlvType::Signature)?)
            .map_err(|_| PairingError::SignatureInvalid)?;

        let mut info = self.public.to_vec();
        info.extend_from_slice(self.identity.id().as_bytes());
        info.extend_from_slice(&accessory_public);

        let mut sub = Tlv8::new();
        sub.push(TlvType::Identifier, self.identity.id().as_bytes().to_vec());
        sub.push(TlvType::Signature, self.identity.keypair().sign(&info).to_vec());
        let encrypted = encrypt_with_nonce(&key, &nonce_from_string(b"PV-Msg03"), &sub.encode())
            .map_err(protocol)?;

        self.shared_secret = Some(shared);
        let mut m3 = Tlv8::with_state(3);
        m3.push(TlvType::EncryptedData, encrypted);
        Ok(m3.encode())
    }

    /// Accept M4 and derive the controller's session keys.
    pub fn process_m4(&self, body: &[u8]) -> Result<SessionKeys, PairingError> {
        expect_state(body, 4)?;
        let shared = self
            .shared_secret
            .ok_or_else(|| PairingError::InvalidState("M4 before M2".to_string()))?;
        SessionKeys::derive_controller_keys(&SharedSecret::new(shared.to_vec())).map_err(protocol)
    }
}

/// `{State=1, Method=AddPairing, Identifier, PublicKey, Permissions}`.
pub fn add_pairing_request(identifier: &str, public_key: &[u8; 32], permission: Permission) -> Vec<u8> {
    let mut tlv = Tlv8::with_state(1);
    tlv.push(TlvType::Method, vec![PairingMethod::AddPairing as u8]);
    tlv.push(TlvType::Identifier, identifier.as_bytes().to_vec());
    tlv.push(TlvType::PublicKey, public_key.to_vec());
    tlv.push(TlvType::Permissions, vec![permission.as_byte()]);
    tlv.encode()
}

pub fn remove_pairing_request(identifier: &str) -> Vec<u8> {
    let mut tlv = Tlv8::with_state(1);
    tlv.push(TlvType::Method, vec![PairingMethod::RemovePairing as u8]);
    tlv.push(TlvType::Identifier, identifier.as_bytes().to_vec());
    tlv.encode()
}

pub fn list_pairings_request() -> Vec<u8> {
    let mut tlv = Tlv8::with_state(1);
    tlv.push(TlvType::Method, vec![PairingMethod::ListPairings as u8]);
    tlv.encode()
}

/// Check a pairings response for an error.
pub fn parse_pairings_response(body: &[u8]) -> Result<(), PairingError> {
    expect_state(body, 2).map(|_| ())
}

/// Decode a list-pairings response into `(identifier, LTPK, permission)`.
pub fn parse_pairings_list(body: &[u8]) -> Result<Vec<(String, [u8; 32], Permission)>, PairingError> {
    let tlv = expect_state(body, 2)?;
    tlv.split()
        .iter()
        .map(|entry| {
            let identifier = String::from_utf8_lossy(required(entry, TlvType::Identifier)?).into_owned();
            let public_key: [u8; 32] = required(entry, TlvType::PublicKey)?
                .try_into()
                .map_err(|_| protocol("controller LTPK must be 32 bytes"))?;
            let permission = Permission::from_byte(
                required(entry, TlvType::Permissions)?
                    .first()
                    .copied()
                    .unwrap_or(0),
            );
            Ok((identifier, public_key, permission))
        })
        .collect()
}

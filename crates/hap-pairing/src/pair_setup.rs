//! Accessory side of pair-setup (M1-M6).
//!
//! M1/M2 run the SRP-6a exchange keyed by the setup code, M3/M4 verify the
//! controller's proof, and M5/M6 exchange long-term Ed25519 keys inside a
//! ChaCha20-Poly1305 envelope. Failures are answered with a TLV error item and
//! never touch the pairing record.

use std::time::Duration;

use hap_core::connection::ConnectionId;
use hap_core::error::{CryptoError, PairingError};
use hap_core::status::TlvError;
use hap_crypto::chacha::{decrypt_with_nonce, encrypt_with_nonce, nonce_from_string};
use hap_crypto::ed25519::verify;
use hap_crypto::hkdf;
use hap_crypto::srp::SrpServer;
use hap_crypto::tlv::{Tlv8, TlvType};
use hap_storage::{AddPairingOutcome, Permission};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::store::PairingStore;

/// SRP username used by every HAP pair-setup.
pub const SRP_IDENTITY: &[u8] = b"Pair-Setup";

const PS_MSG05_NONCE: &[u8] = b"PS-Msg05";
const PS_MSG06_NONCE: &[u8] = b"PS-Msg06";

/// Attempt limits for pair-setup.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Failed attempts after which setup is refused for good.
    pub max_tries: u32,
    /// Consecutive failures tolerated before backoff starts.
    pub free_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_tries: 100,
            free_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600),
        }
    }
}

/// Why a new pair-setup was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupRejection {
    Busy,
    MaxTries,
    Backoff(Duration),
}

#[derive(Debug, Default)]
struct PolicyState {
    owner: Option<ConnectionId>,
    failed_attempts: u32,
    consecutive_failures: u32,
    retry_after: Option<Instant>,
}

/// Accessory-wide pair-setup admission: one setup at a time, bounded
/// attempts, exponential backoff.
#[derive(Debug, Default)]
pub struct SetupPolicy {
    config: BackoffConfig,
    state: Mutex<PolicyState>,
}

impl SetupPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PolicyState::default()),
        }
    }

    /// Claim the setup slot for `connection`.
    pub fn begin(&self, connection: ConnectionId) -> Result<(), SetupRejection> {
        let mut state = self.state.lock();
        if matches!(state.owner, Some(owner) if owner != connection) {
            return Err(SetupRejection::Busy);
        }
        if state.failed_attempts >= self.config.max_tries {
            return Err(SetupRejection::MaxTries);
        }
        if let Some(retry_after) = state.retry_after {
            let now = Instant::now();
            if retry_after > now {
                return Err(SetupRejection::Backoff(retry_after - now));
            }
        }
        state.owner = Some(connection);
        Ok(())
    }

    pub fn record_failure(&self, connection: ConnectionId) {
        let mut state = self.state.lock();
        state.failed_attempts += 1;
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.config.free_attempts {
            let exponent = state.consecutive_failures - self.config.free_attempts;
            let delay = self
                .config
                .base_delay
                .saturating_mul(2u32.saturating_pow(exponent.min(31)))
                .min(self.config.max_delay);
            state.retry_after = Some(Instant::now() + delay);
            debug!(?delay, failures = state.consecutive_failures, "Pair-setup backoff");
        }
        if state.owner == Some(connection) {
            state.owner = None;
        }
    }

    pub fn record_success(&self, connection: ConnectionId) {
        let mut state = self.state.lock();
        state.failed_attempts = 0;
        state.consecutive_failures = 0;
        state.retry_after = None;
        if state.owner == Some(connection) {
            state.owner = None;
        }
    }

    /// Free the slot when `connection` owns it (disconnect mid-setup).
    pub fn release(&self, connection: ConnectionId) {
        let mut state = self.state.lock();
        if state.owner == Some(connection) {
            state.owner = None;
        }
    }

    pub fn failed_attempts(&self) -> u32 {
        self.state.lock().failed_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetupStage {
    AwaitingM1,
    AwaitingM3,
    AwaitingM5,
    Complete,
}

/// Response to one pair-setup request.
#[derive(Debug)]
pub struct SetupResponse {
    pub body: Vec<u8>,
    /// Controller identifier, once M6 has been sent.
    pub paired: Option<String>,
}

impl SetupResponse {
    fn reply(tlv: Tlv8) -> Self {
        Self {
            body: tlv.encode(),
            paired: None,
        }
    }

    fn error(state: u8, error: TlvError) -> Self {
        Self::reply(Tlv8::error_response(state, error))
    }
}

/// Per-connection pair-setup state machine.
pub struct PairSetupServer {
    stage: SetupStage,
    srp: Option<SrpServer>,
    shared_secret: Option<Vec<u8>>,
    session_key: Option<[u8; 32]>,
}

impl Default for PairSetupServer {
    fn default() -> Self {
        Self::new()
    }
}

impl PairSetupServer {
    pub fn new() -> Self {
        Self {
            stage: SetupStage::AwaitingM1,
            srp: None,
            shared_secret: None,
            session_key: None,
        }
    }

    /// Between M1 and M6.
    pub fn in_progress(&self) -> bool {
        matches!(self.stage, SetupStage::AwaitingM3 | SetupStage::AwaitingM5)
    }

    pub fn is_complete(&self) -> bool {
        self.stage == SetupStage::Complete
    }

    pub fn handle(
        &mut self,
        store: &PairingStore,
        policy: &SetupPolicy,
        connection: ConnectionId,
        body: &[u8],
    ) -> SetupResponse {
        let request = match Tlv8::parse(body) {
            Ok(request) => request,
            Err(e) => {
                warn!(%connection, error = %e, "Malformed pair-setup request");
                return self.fail(policy, connection, 2, TlvError::Unknown, false);
            }
        };

        match request.state() {
            Some(1) => self.handle_m1(store, policy, connection),
            Some(3) if self.stage == SetupStage::AwaitingM3 => {
                self.handle_m3(policy, connection, &request)
            }
            Some(5) if self.stage == SetupStage::AwaitingM5 => {
                self.handle_m5(store, policy, connection, &request)
            }
            other => {
                warn!(%connection, state = ?other, stage = ?self.stage, "Unexpected pair-setup state");
                let reply_state = other.map(|s| s.saturating_add(1)).unwrap_or(2);
                self.fail(policy, connection, reply_state, TlvError::Unknown, false)
            }
        }
    }

    fn handle_m1(
        &mut self,
        store: &PairingStore,
        policy: &SetupPolicy,
        connection: ConnectionId,
    ) -> SetupResponse {
        if store.is_paired() {
            info!(%connection, "Pair-setup refused: accessory already paired");
            return SetupResponse::error(2, TlvError::Unavailable);
        }
        if let Err(rejection) = policy.begin(connection) {
            info!(%connection, ?rejection, "Pair-setup refused");
            return match rejection {
                SetupRejection::Busy => SetupResponse::error(2, TlvError::Busy),
                SetupRejection::MaxTries => SetupResponse::error(2, TlvError::MaxTries),
                SetupRejection::Backoff(delay) => {
                    let mut tlv = Tlv8::error_response(2, TlvError::Backoff);
                    tlv.push(
                        TlvType::RetryDelay,
                        hap_crypto::tlv::write_uint(delay.as_secs().max(1)),
                    );
                    SetupResponse::reply(tlv)
                }
            };
        }

        let srp = SrpServer::new(SRP_IDENTITY, store.pincode().as_bytes());
        let mut tlv = Tlv8::with_state(2);
        tlv.push(TlvType::Salt, srp.salt().to_vec());
        tlv.push(TlvType::PublicKey, srp.public_key());

        debug!(%connection, "Pair-setup M1 -> M2");
        self.srp = Some(srp);
        self.shared_secret = None;
        self.session_key = None;
        self.stage = SetupStage::AwaitingM3;
        SetupResponse::reply(tlv)
    }

    fn handle_m3(
        &mut self,
        policy: &SetupPolicy,
        connection: ConnectionId,
        request: &Tlv8,
    ) -> SetupResponse {
        let (Some(client_public), Some(client_proof)) =
            (request.get(TlvType::PublicKey), request.get(TlvType::Proof))
        else {
            return self.fail(policy, connection, 4, TlvError::Unknown, false);
        };
        let Some(srp) = self.srp.as_ref() else {
            return self.fail(policy, connection, 4, TlvError::Unknown, false);
        };

        let session = match srp.verify_client(client_public, client_proof) {
            Ok(session) => session,
            Err(e) => {
                info!(%connection, error = %e, "Pair-setup M3: wrong setup code");
                return self.fail(policy, connection, 4, TlvError::Authentication, true);
            }
        };
        let session_key = match hkdf::derive_pair_setup_key(&session.shared_secret) {
            Ok(key) => key,
            Err(e) => {
                warn!(%connection, error = %e, "Pair-setup key derivation failed");
                return self.fail(policy, connection, 4, TlvError::Unknown, false);
            }
        };

        let mut tlv = Tlv8::with_state(4);
        tlv.push(TlvType::Proof, session.server_proof.clone());

        debug!(%connection, "Pair-setup M3 -> M4");
        self.shared_secret = Some(session.shared_secret);
        self.session_key = Some(session_key);
        self.stage = SetupStage::AwaitingM5;
        SetupResponse::reply(tlv)
    }

    fn handle_m5(
        &mut self,
        store: &PairingStore,
        policy: &SetupPolicy,
        connection: ConnectionId,
        request: &Tlv8,
    ) -> SetupResponse {
        let (controller, controller_ltpk) = match self.verify_controller(request) {
            Ok(found) => found,
            Err(e) => {
                info!(%connection, error = %e, "Pair-setup M5 rejected");
                return self.fail(policy, connection, 6, TlvError::Authentication, true);
            }
        };

        match store.add_pairing(&controller, controller_ltpk, Permission::Admin) {
            Ok(AddPairingOutcome::KeyMismatch) => {
                return self.fail(policy, connection, 6, TlvError::Unknown, false);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(%connection, error = %e, "Failed to persist new pairing");
                return self.fail(policy, connection, 6, TlvError::Unknown, false);
            }
        }

        let body = match self.accessory_exchange(store) {
            Ok(body) => body,
            Err(e) => {
                warn!(%connection, error = %e, "Pair-setup M6 construction failed");
                return self.fail(policy, connection, 6, TlvError::Unknown, false);
            }
        };

        info!(%connection, %controller, "Pair-setup complete");
        policy.record_success(connection);
        self.stage = SetupStage::Complete;
        self.srp = None;
        SetupResponse {
            body,
            paired: Some(controller),
        }
    }

    /// Decrypt M5 and check the controller's signature.
    fn verify_controller(&self, request: &Tlv8) -> Result<(String, [u8; 32]), PairingError> {
        let encrypted = request
            .get(TlvType::EncryptedData)
            .ok_or(PairingError::MissingTlv(TlvType::EncryptedData as u8))?;
        let (Some(session_key), Some(shared_secret)) =
            (self.session_key.as_ref(), self.shared_secret.as_ref())
        else {
            return Err(PairingError::InvalidState("no SRP session".to_string()));
        };

        let plaintext = decrypt_with_nonce(session_key, &nonce_from_string(PS_MSG05_NONCE), encrypted)
            .map_err(|e| PairingError::Protocol(format!("M5 decryption: {}", e)))?;
        let inner = Tlv8::parse(&plaintext).map_err(|e| PairingError::TlvParse(e.to_string()))?;

        let identifier = inner
            .get(TlvType::Identifier)
            .ok_or(PairingError::MissingTlv(TlvType::Identifier as u8))?;
        let ltpk = inner
            .get(TlvType::PublicKey)
            .ok_or(PairingError::MissingTlv(TlvType::PublicKey as u8))?;
        let signature = inner
            .get(TlvType::Signature)
            .ok_or(PairingError::MissingTlv(TlvType::Signature as u8))?;

        let ltpk: [u8; 32] = ltpk.try_into().map_err(|_| {
            PairingError::Protocol(format!("controller LTPK has {} bytes", ltpk.len()))
        })?;
        let controller = String::from_utf8(identifier.to_vec())
            .map_err(|_| PairingError::Protocol("controller identifier is not UTF-8".to_string()))?;

        let device_x = hkdf::derive_controller_sign_key(shared_secret)
            .map_err(|e| PairingError::Protocol(e.to_string()))?;
        let mut info = Vec::with_capacity(32 + identifier.len() + 32);
        info.extend_from_slice(&device_x);
        info.extend_from_slice(identifier);
        info.extend_from_slice(&ltpk);
        verify(&ltpk, &info, signature).map_err(|_| PairingError::SignatureInvalid)?;

        Ok((controller, ltpk))
    }

    /// Build M6: the accessory's identifier, LTPK and signature, encrypted.
    fn accessory_exchange(&self, store: &PairingStore) -> Result<Vec<u8>, CryptoError> {
        let (Some(session_key), Some(shared_secret)) =
            (self.session_key.as_ref(), self.shared_secret.as_ref())
        else {
            return Err(CryptoError::KeyDerivation("no SRP session".to_string()));
        };

        let username = store.username();
        let keypair = store.signing_key();
        let accessory_x = hkdf::derive_accessory_sign_key(shared_secret)?;

        let mut info = Vec::with_capacity(32 + username.len() + 32);
        info.extend_from_slice(&accessory_x);
        info.extend_from_slice(username.as_bytes());
        info.extend_from_slice(&keypair.public_key());

        let mut inner = Tlv8::new();
        inner.push(TlvType::Identifier, username.into_bytes());
        inner.push(TlvType::PublicKey, keypair.public_key().to_vec());
        inner.push(TlvType::Signature, keypair.sign(&info).to_vec());

        let encrypted = encrypt_with_nonce(
            session_key,
            &nonce_from_string(PS_MSG06_NONCE),
            &inner.encode(),
        )?;

        let mut tlv = Tlv8::with_state(6);
        tlv.push(TlvType::EncryptedData, encrypted);
        Ok(tlv.encode())
    }

    fn fail(
        &mut self,
        policy: &SetupPolicy,
        connection: ConnectionId,
        state: u8,
        error: TlvError,
        counts_as_attempt: bool,
    ) -> SetupResponse {
        if counts_as_attempt {
            policy.record_failure(connection);
        } else {
            policy.release(connection);
        }
        self.stage = SetupStage::AwaitingM1;
        self.srp = None;
        self.shared_secret = None;
        self.session_key = None;
        SetupResponse::error(state, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{ControllerIdentity, PairSetupClient};
    use hap_core::category::Category;
    use hap_storage::{MemoryStorage, Storage};
    use std::sync::Arc;

    const PIN: &str = "031-45-154";

    fn store() -> PairingStore {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        PairingStore::open(storage, "CC:22:3D:E3:CE:30", "Bridge", Category::Bridge, PIN, "ABCD")
            .unwrap()
    }

    fn run_setup(
        store: &PairingStore,
        policy: &SetupPolicy,
        connection: ConnectionId,
        pin: &str,
    ) -> Result<String, TlvError> {
        let identity = ControllerIdentity::generate();
        let mut client = PairSetupClient::new(pin);
        let mut server = PairSetupServer::new();

        let m2 = server.handle(store, policy, connection, &client.m1());
        let m3 = client.process_m2(&m2.body).map_err(rejection)?;
        let m4 = server.handle(store, policy, connection, &m3);
        client.process_m4(&m4.body).map_err(rejection)?;
        let m5 = client.m5(&identity).map_err(rejection)?;
        let m6 = server.handle(store, policy, connection, &m5);
        client.process_m6(&m6.body).map_err(rejection)?;
        Ok(m6.paired.unwrap())
    }

    fn rejection(e: PairingError) -> TlvError {
        match e {
            PairingError::Rejected { code, .. } => code,
            other => panic!("unexpected error {:?}", other),
        }
    }

    mod flow {
        use super::*;

        #[test]
        fn full_setup_registers_admin() {
            let store = store();
            let policy = SetupPolicy::default();
            let controller = run_setup(&store, &policy, ConnectionId(1), PIN).unwrap();
            assert!(store.is_admin(&controller));
        }

        #[test]
        fn wrong_pin_is_authentication_error() {
            let store = store();
            let policy = SetupPolicy::default();
            assert_eq!(
                run_setup(&store, &policy, ConnectionId(1), "111-22-333"),
                Err(TlvError::Authentication)
            );
            assert!(!store.is_paired());
            assert_eq!(policy.failed_attempts(), 1);
        }

        #[test]
        fn already_paired_is_unavailable() {
            let store = store();
            let policy = SetupPolicy::default();
            run_setup(&store, &policy, ConnectionId(1), PIN).unwrap();
            assert_eq!(
                run_setup(&store, &policy, ConnectionId(2), PIN),
                Err(TlvError::Unavailable)
            );
        }

        #[test]
        fn out_of_order_message_is_rejected() {
            let store = store();
            let policy = SetupPolicy::default();
            let mut server = PairSetupServer::new();
            let response = server.handle(&store, &policy, ConnectionId(1), &Tlv8::with_state(5).encode());
            let tlv = Tlv8::parse(&response.body).unwrap();
            assert_eq!(tlv.state(), Some(6));
            assert_eq!(tlv.error_code(), Some(TlvError::Unknown));
        }
    }

    mod policy {
        use super::*;

        #[test]
        fn second_connection_is_busy() {
            let store = store();
            let policy = SetupPolicy::default();
            let mut first = PairSetupServer::new();
            let mut second = PairSetupServer::new();
            let m1 = Tlv8::with_state(1).encode();

            first.handle(&store, &policy, ConnectionId(1), &m1);
            assert!(first.in_progress());
            let response = second.handle(&store, &policy, ConnectionId(2), &m1);
            assert_eq!(
                Tlv8::parse(&response.body).unwrap().error_code(),
                Some(TlvError::Busy)
            );

            policy.release(ConnectionId(1));
            let response = second.handle(&store, &policy, ConnectionId(2), &m1);
            assert!(Tlv8::parse(&response.body).unwrap().error().is_none());
        }

        #[tokio::test(start_paused = true)]
        async fn backoff_after_third_failure() {
            let policy = SetupPolicy::default();
            let conn = ConnectionId(1);
            for _ in 0..2 {
                policy.begin(conn).unwrap();
                policy.record_failure(conn);
            }
            policy.begin(conn).unwrap();
            policy.record_failure(conn);
            assert_eq!(
                policy.begin(conn),
                Err(SetupRejection::Backoff(Duration::from_secs(1)))
            );

            tokio::time::advance(Duration::from_secs(1)).await;
            policy.begin(conn).unwrap();
            policy.record_failure(conn);
            assert_eq!(
                policy.begin(conn),
                Err(SetupRejection::Backoff(Duration::from_secs(2)))
            );
        }

        #[test]
        fn max_tries() {
            let policy = SetupPolicy::new(BackoffConfig {
                max_tries: 2,
                free_attempts: 10,
                ..BackoffConfig::default()
            });
            let conn = ConnectionId(1);
            for _ in 0..2 {
                policy.begin(conn).unwrap();
                policy.record_failure(conn);
            }
            assert_eq!(policy.begin(conn), Err(SetupRejection::MaxTries));
        }

        #[test]
        fn backoff_is_reported_with_retry_delay() {
            let store = store();
            let policy = SetupPolicy::new(BackoffConfig {
                free_attempts: 1,
                base_delay: Duration::from_secs(30),
                ..BackoffConfig::default()
            });
            policy.record_failure(ConnectionId(9));

            let mut server = PairSetupServer::new();
            let response = server.handle(&store, &policy, ConnectionId(1), &Tlv8::with_state(1).encode());
            let tlv = Tlv8::parse(&response.body).unwrap();
            assert_eq!(tlv.error_code(), Some(TlvError::Backoff));
            assert!(tlv.retry_delay().unwrap() >= 29);
        }
    }
}

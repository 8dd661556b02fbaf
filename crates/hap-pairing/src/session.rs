//! Per-connection security state.
//!
//! A [`Session`] follows one TCP connection from accept to close: it runs the
//! pairing handshakes, remembers which controller verified, and hands the
//! session keys to the transport. Accessory-wide state (the pairing record,
//! the setup policy) is shared through `Arc`s.

use std::sync::Arc;

use hap_core::connection::ConnectionId;
use hap_crypto::keys::SessionKeys;
use tracing::debug;

use crate::pair_setup::{PairSetupServer, SetupPolicy, SetupResponse};
use crate::pair_verify::PairVerifyServer;
use crate::pairings::{handle_pairings, PairingsResponse};
use crate::store::PairingStore;

/// Where a connection stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// The accessory has no pairings.
    Unpaired,
    /// This connection is between pair-setup M1 and M6.
    PairSetupInProgress,
    /// The accessory is paired but this connection has not verified.
    PairedUnverified,
    /// Pair-verify succeeded; traffic is encrypted.
    Verified { controller: String },
}

pub struct Session {
    connection: ConnectionId,
    store: Arc<PairingStore>,
    policy: Arc<SetupPolicy>,
    setup: PairSetupServer,
    verify: PairVerifyServer,
    controller: Option<String>,
    pending_keys: Option<SessionKeys>,
}

impl Session {
    pub fn new(connection: ConnectionId, store: Arc<PairingStore>, policy: Arc<SetupPolicy>) -> Self {
        Self {
            connection,
            store,
            policy,
            setup: PairSetupServer::new(),
            verify: PairVerifyServer::new(),
            controller: None,
            pending_keys: None,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn state(&self) -> SessionState {
        if let Some(controller) = &self.controller {
            SessionState::Verified {
                controller: controller.clone(),
            }
        } else if self.setup.in_progress() {
            SessionState::PairSetupInProgress
        } else if self.store.is_paired() {
            SessionState::PairedUnverified
        } else {
            SessionState::Unpaired
        }
    }

    pub fn is_verified(&self) -> bool {
        self.controller.is_some()
    }

    /// Pairing identifier of the verified controller.
    pub fn controller(&self) -> Option<&str> {
        self.controller.as_deref()
    }

    /// Re-evaluated on every call so permission changes apply immediately.
    pub fn is_admin(&self) -> bool {
        self.controller
            .as_deref()
            .is_some_and(|c| self.store.is_admin(c))
    }

    /// Unauthenticated identify is only allowed before the first pairing.
    pub fn can_identify(&self) -> bool {
        !self.store.is_paired()
    }

    pub fn pair_setup(&mut self, body: &[u8]) -> SetupResponse {
        self.setup
            .handle(&self.store, &self.policy, self.connection, body)
    }

    /// Run a pair-verify step. On success the keys are held until
    /// [`take_session_keys`](Self::take_session_keys), since M4 itself goes
    /// out in the clear.
    pub fn pair_verify(&mut self, body: &[u8]) -> Vec<u8> {
        let response = self.verify.handle(&self.store, self.connection, body);
        if let Some(verified) = response.verified {
            debug!(connection = %self.connection, controller = %verified.controller, "Session verified");
            self.controller = Some(verified.controller);
            self.pending_keys = Some(verified.keys);
        }
        response.body
    }

    pub fn take_session_keys(&mut self) -> Option<SessionKeys> {
        self.pending_keys.take()
    }

    /// Pairings requests; `None` when the connection is not verified.
    pub fn pairings(&mut self, body: &[u8]) -> Option<PairingsResponse> {
        let controller = self.controller.as_deref()?;
        Some(handle_pairings(&self.store, controller, body))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.policy.release(self.connection);
    }
}

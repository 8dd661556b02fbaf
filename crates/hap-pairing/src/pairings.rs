//! The `/pairings` endpoint: add, remove and list controllers.
//!
//! Only verified admin controllers may use it.

use hap_core::status::TlvError;
use hap_crypto::tlv::{PairingMethod, Tlv8, TlvType};
use hap_storage::{AddPairingOutcome, Permission};
use tracing::{debug, info, warn};

use crate::store::{PairingStore, RemovePairingOutcome};

/// Side effects the server must carry out after answering.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PairingsEffect {
    #[default]
    None,
    /// Controllers whose pairing was removed; their connections must close.
    Removed(Vec<String>),
    /// The last admin was removed and the accessory is unpaired.
    Unpaired(Vec<String>),
}

#[derive(Debug)]
pub struct PairingsResponse {
    pub body: Vec<u8>,
    pub effect: PairingsEffect,
}

impl PairingsResponse {
    fn ok(tlv: Tlv8) -> Self {
        Self {
            body: tlv.encode(),
            effect: PairingsEffect::None,
        }
    }

    fn error(error: TlvError) -> Self {
        Self::ok(Tlv8::error_response(2, error))
    }
}

/// Answer a pairings request on behalf of the verified `controller`.
pub fn handle_pairings(store: &PairingStore, controller: &str, body: &[u8]) -> PairingsResponse {
    let request = match Tlv8::parse(body) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Malformed pairings request");
            return PairingsResponse::error(TlvError::Unknown);
        }
    };

    if !store.is_admin(controller) {
        info!(%controller, "Pairings request from non-admin controller");
        return PairingsResponse::error(TlvError::Authentication);
    }

    match request.method() {
        Some(PairingMethod::AddPairing) => add_pairing(store, &request),
        Some(PairingMethod::RemovePairing) => remove_pairing(store, &request),
        Some(PairingMethod::ListPairings) => list_pairings(store),
        other => {
            warn!(method = ?other, "Unsupported pairings method");
            PairingsResponse::error(TlvError::Unknown)
        }
    }
}

fn add_pairing(store: &PairingStore, request: &Tlv8) -> PairingsResponse {
    let (Some(identifier), Some(public_key), Some(permissions)) = (
        request.get(TlvType::Identifier),
        request.get(TlvType::PublicKey),
        request.get(TlvType::Permissions),
    ) else {
        return PairingsResponse::error(TlvError::Unknown);
    };
    let Ok(public_key) = <[u8; 32]>::try_from(public_key) else {
        return PairingsResponse::error(TlvError::Unknown);
    };
    let identifier = String::from_utf8_lossy(identifier);
    let permission = Permission::from_byte(permissions.first().copied().unwrap_or(0));

    match store.add_pairing(&identifier, public_key, permission) {
        Ok(AddPairingOutcome::KeyMismatch) => {
            warn!(controller = %identifier, "Add-pairing with a different long-term key");
            PairingsResponse::error(TlvError::Unknown)
        }
        Ok(_) => PairingsResponse::ok(Tlv8::with_state(2)),
        Err(e) => {
            warn!(error = %e, "Failed to persist pairing");
            PairingsResponse::error(TlvError::Unknown)
        }
    }
}

fn remove_pairing(store: &PairingStore, request: &Tlv8) -> PairingsResponse {
    let Some(identifier) = request.get(TlvType::Identifier) else {
        return PairingsResponse::error(TlvError::Unknown);
    };
    let identifier = String::from_utf8_lossy(identifier).into_owned();

    let effect = match store.remove_pairing(&identifier) {
        // already gone: still a success on the wire
        Ok(RemovePairingOutcome::NotFound) => {
            debug!(controller = %identifier, "Pairing to remove not found");
            PairingsEffect::None
        }
        Ok(RemovePairingOutcome::Removed) => PairingsEffect::Removed(vec![identifier]),
        Ok(RemovePairingOutcome::Unpaired { removed }) => PairingsEffect::Unpaired(removed),
        Err(e) => {
            warn!(error = %e, "Failed to persist pairing removal");
            return PairingsResponse::error(TlvError::Unknown);
        }
    };
    PairingsResponse {
        body: Tlv8::with_state(2).encode(),
        effect,
    }
}

fn list_pairings(store: &PairingStore) -> PairingsResponse {
    let mut tlv = Tlv8::with_state(2);
    for (i, (identifier, client)) in store.pairings().into_iter().enumerate() {
        if i > 0 {
            tlv.push_separator();
        }
        tlv.push(TlvType::Identifier, identifier.into_bytes());
        tlv.push(TlvType::PublicKey, client.public_key.to_vec());
        tlv.push(TlvType::Permissions, vec![client.permission.as_byte()]);
    }
    PairingsResponse::ok(tlv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{
        add_pairing_request, list_pairings_request, parse_pairings_list, parse_pairings_response,
        remove_pairing_request,
    };
    use hap_core::category::Category;
    use hap_core::error::PairingError;
    use hap_storage::{MemoryStorage, Storage};
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn store() -> PairingStore {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let store = PairingStore::open(
            storage,
            "CC:22:3D:E3:CE:30",
            "Bridge",
            Category::Bridge,
            "031-45-154",
            "ABCD",
        )
        .unwrap();
        store.add_pairing("admin", [1; 32], Permission::Admin).unwrap();
        store
    }

    fn rejected_code(body: &[u8]) -> TlvError {
        match parse_pairings_response(body) {
            Err(PairingError::Rejected { code, .. }) => code,
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    mod add {
        use super::*;

        #[test]
        fn admin_adds_user() {
            let store = store();
            let response = handle_pairings(
                &store,
                "admin",
                &add_pairing_request("phone", &[2; 32], Permission::User),
            );
            parse_pairings_response(&response.body).unwrap();
            assert_eq!(store.controller_key("phone"), Some([2; 32]));
            assert!(!store.is_admin("phone"));
        }

        #[test]
        fn user_cannot_add() {
            let store = store();
            store.add_pairing("phone", [2; 32], Permission::User).unwrap();
            let response = handle_pairings(
                &store,
                "phone",
                &add_pairing_request("tablet", &[3; 32], Permission::User),
            );
            assert_eq!(rejected_code(&response.body), TlvError::Authentication);
            assert!(store.controller_key("tablet").is_none());
        }

        #[test]
        fn different_key_is_unknown_error() {
            let store = store();
            let response = handle_pairings(
                &store,
                "admin",
                &add_pairing_request("admin", &[9; 32], Permission::Admin),
            );
            assert_eq!(rejected_code(&response.body), TlvError::Unknown);
        }

        #[test]
        fn same_key_updates_permission() {
            let store = store();
            store.add_pairing("phone", [2; 32], Permission::User).unwrap();
            handle_pairings(
                &store,
                "admin",
                &add_pairing_request("phone", &[2; 32], Permission::Admin),
            );
            assert!(store.is_admin("phone"));
        }
    }

    mod remove {
        use super::*;

        #[test]
        fn removing_user_reports_controller() {
            let store = store();
            store.add_pairing("phone", [2; 32], Permission::User).unwrap();
            let response = handle_pairings(&store, "admin", &remove_pairing_request("phone"));
            assert_eq!(response.effect, PairingsEffect::Removed(vec!["phone".to_string()]));
        }

        #[test]
        fn removing_last_admin_unpairs() {
            let store = store();
            store.add_pairing("phone", [2; 32], Permission::User).unwrap();
            let response = handle_pairings(&store, "admin", &remove_pairing_request("admin"));
            assert_eq!(
                response.effect,
                PairingsEffect::Unpaired(vec!["admin".to_string(), "phone".to_string()])
            );
            assert!(store.pairings().is_empty());
        }

        #[test]
        #[traced_test]
        fn removing_unknown_is_success_without_effect() {
            let store = store();
            let response = handle_pairings(&store, "admin", &remove_pairing_request("ghost"));
            parse_pairings_response(&response.body).unwrap();
            assert_eq!(response.effect, PairingsEffect::None);
            assert!(logs_contain("Pairing to remove not found"));
        }
    }

    #[test]
    fn list_returns_every_pairing() {
        let store = store();
        store.add_pairing("phone", [2; 32], Permission::User).unwrap();
        let response = handle_pairings(&store, "admin", &list_pairings_request());
        let list = parse_pairings_list(&response.body).unwrap();
        assert_eq!(
            list,
            vec![
                ("admin".to_string(), [1; 32], Permission::Admin),
                ("phone".to_string(), [2; 32], Permission::User),
            ]
        );
    }
}

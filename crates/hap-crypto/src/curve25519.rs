//! Curve25519 ECDH for pair-verify.

use hap_core::error::CryptoError;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::ZeroizeOnDrop;

/// Ephemeral Curve25519 key pair, consumed by the exchange.
#[derive(ZeroizeOnDrop)]
pub struct EcdhKeyPair {
    #[zeroize(skip)]
    public: [u8; 32],
    secret: [u8; 32],
}

impl EcdhKeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            public: public.to_bytes(),
            secret: secret.to_bytes(),
        }
    }

    /// Create from existing secret key bytes.
    pub fn from_secret(secret: &[u8; 32]) -> Self {
        let static_secret = StaticSecret::from(*secret);
        let public = PublicKey::from(&static_secret);
        Self {
            public: public.to_bytes(),
            secret: *secret,
        }
    }

    /// Get the public key (32 bytes).
    pub fn public_key(&self) -> [u8; 32] {
        self.public
    }

    /// Compute the shared secret with a peer public key.
    ///
    /// All-zero peer keys and low-order points (all-zero output) are rejected.
    pub fn diffie_hellman(self, peer_public: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
        if peer_public.iter().all(|&b| b == 0) {
            return Err(CryptoError::InvalidPublicKey(
                "peer public key is all zeros".to_string(),
            ));
        }

        let static_secret = StaticSecret::from(self.secret);
        let shared = static_secret.diffie_hellman(&PublicKey::from(*peer_public));

        let shared_bytes = shared.to_bytes();
        if shared_bytes.iter().all(|&b| b == 0) {
            return Err(CryptoError::InvalidPublicKey(
                "low-order peer point".to_string(),
            ));
        }

        Ok(shared_bytes)
    }
}

/// Interpret a TLV value as a 32-byte Curve25519 public key.
pub fn public_key_from_slice(bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: bytes.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arr(hex_str: &str) -> [u8; 32] {
        let bytes = hex::decode(hex_str).unwrap();
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        out
    }

    mod diffie_hellman {
        use super::*;

        #[test]
        fn both_parties_derive_same_secret() {
            let accessory = EcdhKeyPair::generate();
            let controller = EcdhKeyPair::generate();
            let accessory_public = accessory.public_key();
            let controller_public = controller.public_key();

            assert_ne!(accessory_public, controller_public);
            assert_eq!(
                accessory.diffie_hellman(&controller_public).unwrap(),
                controller.diffie_hellman(&accessory_public).unwrap()
            );
        }

        #[test]
        fn rejects_low_order_points() {
            let low_order = arr("ecffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff7f");
            let result = EcdhKeyPair::generate().diffie_hellman(&low_order);
            assert!(matches!(result, Err(CryptoError::InvalidPublicKey(_))));
        }

        #[test]
        fn rejects_all_zero_public_key() {
            assert!(EcdhKeyPair::generate().diffie_hellman(&[0u8; 32]).is_err());
        }
    }

    mod slices {
        use super::*;

        #[test]
        fn accepts_exactly_32_bytes() {
            assert_eq!(public_key_from_slice(&[7u8; 32]).unwrap(), [7u8; 32]);
            assert!(matches!(
                public_key_from_slice(&[7u8; 31]),
                Err(CryptoError::InvalidKeyLength {
                    expected: 32,
                    actual: 31
                })
            ));
        }
    }

    mod known_vectors {
        use super::*;

        #[test]
        fn rfc7748_test_vector() {
            let alice =
                EcdhKeyPair::from_secret(&arr("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a"));
            let bob =
                EcdhKeyPair::from_secret(&arr("5dab087e624a8a4b79e17f8b83800ee66f3bb1292618b6fd1c2f8b27ff88e0eb"));

            assert_eq!(
                alice.public_key(),
                arr("8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a")
            );
            assert_eq!(
                bob.public_key(),
                arr("de9edb7d7b7dc1b4d35b61c2ece435373f8343c85b78674dadfc7e146f882b4f")
            );

            let shared = alice.diffie_hellman(&bob.public_key()).unwrap();
            assert_eq!(
                shared,
                arr("4a5d9d5ba4ce2de1728e3bf480350f25e07e21c947d19e3376f09b3c1e161742")
            );
        }
    }
}

//! HKDF-SHA512 key derivation for pairing and session keys.

use hap_core::error::CryptoError;
use hkdf::Hkdf;
use sha2::Sha512;

/// Derive key using HKDF-SHA512.
///
/// # Arguments
/// * `ikm` - Input key material
/// * `salt` - Salt value (can be empty)
/// * `info` - Context/application-specific info
/// * `length` - Desired output length in bytes
pub fn derive_key(
    ikm: &[u8],
    salt: &[u8],
    info: &[u8],
    length: usize,
) -> Result<Vec<u8>, CryptoError> {
    let hk = Hkdf::<Sha512>::new(Some(salt), ikm);
    let mut okm = vec![0u8; length];
    hk.expand(info, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation("HKDF expand failed".to_string()))?;
    Ok(okm)
}

/// Derive a fixed-size key.
pub fn derive_key_32(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha512>::new(Some(salt), ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation("HKDF expand failed".to_string()))?;
    Ok(okm)
}

/// Well-known salt and info strings for HAP.
pub mod constants {
    pub const PAIR_SETUP_ENCRYPT_SALT: &[u8] = b"Pair-Setup-Encrypt-Salt";
    pub const PAIR_SETUP_ENCRYPT_INFO: &[u8] = b"Pair-Setup-Encrypt-Info";

    pub const PAIR_SETUP_CONTROLLER_SIGN_SALT: &[u8] = b"Pair-Setup-Controller-Sign-Salt";
    pub const PAIR_SETUP_CONTROLLER_SIGN_INFO: &[u8] = b"Pair-Setup-Controller-Sign-Info";

    pub const PAIR_SETUP_ACCESSORY_SIGN_SALT: &[u8] = b"Pair-Setup-Accessory-Sign-Salt";
    pub const PAIR_SETUP_ACCESSORY_SIGN_INFO: &[u8] = b"Pair-Setup-Accessory-Sign-Info";

    pub const PAIR_VERIFY_ENCRYPT_SALT: &[u8] = b"Pair-Verify-Encrypt-Salt";
    pub const PAIR_VERIFY_ENCRYPT_INFO: &[u8] = b"Pair-Verify-Encrypt-Info";

    pub const CONTROL_SALT: &[u8] = b"Control-Salt";
    pub const CONTROL_WRITE_KEY_INFO: &[u8] = b"Control-Write-Encryption-Key";
    pub const CONTROL_READ_KEY_INFO: &[u8] = b"Control-Read-Encryption-Key";
}

/// Derive pair-setup encryption key (M5/M6 sub-TLVs).
pub fn derive_pair_setup_key(shared_secret: &[u8]) -> Result<[u8; 32], CryptoError> {
    derive_key_32(
        shared_secret,
        constants::PAIR_SETUP_ENCRYPT_SALT,
        constants::PAIR_SETUP_ENCRYPT_INFO,
    )
}

/// Derive the iOSDeviceX value the controller signs in M5.
pub fn derive_controller_sign_key(shared_secret: &[u8]) -> Result<[u8; 32], CryptoError> {
    derive_key_32(
        shared_secret,
        constants::PAIR_SETUP_CONTROLLER_SIGN_SALT,
        constants::PAIR_SETUP_CONTROLLER_SIGN_INFO,
    )
}

/// Derive the AccessoryX value the accessory signs in M6.
pub fn derive_accessory_sign_key(shared_secret: &[u8]) -> Result<[u8; 32], CryptoError> {
    derive_key_32(
        shared_secret,
        constants::PAIR_SETUP_ACCESSORY_SIGN_SALT,
        constants::PAIR_SETUP_ACCESSORY_SIGN_INFO,
    )
}

/// Derive pair-verify encryption key.
pub fn derive_pair_verify_key(shared_secret: &[u8]) -> Result<[u8; 32], CryptoError> {
    derive_key_32(
        shared_secret,
        constants::PAIR_VERIFY_ENCRYPT_SALT,
        constants::PAIR_VERIFY_ENCRYPT_INFO,
    )
}

/// Derive the key for controller-to-accessory traffic.
pub fn derive_control_write_key(shared_secret: &[u8]) -> Result<[u8; 32], CryptoError> {
    derive_key_32(
        shared_secret,
        constants::CONTROL_SALT,
        constants::CONTROL_WRITE_KEY_INFO,
    )
}

/// Derive the key for accessory-to-controller traffic.
pub fn derive_control_read_key(shared_secret: &[u8]) -> Result<[u8; 32], CryptoError> {
    derive_key_32(
        shared_secret,
        constants::CONTROL_SALT,
        constants::CONTROL_READ_KEY_INFO,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    mod derive_key {
        use super::*;

        #[test]
        fn derives_requested_length() {
            let ikm = [0x0bu8; 22];
            assert_eq!(derive_key(&ikm, &[0u8; 13], &[], 16).unwrap().len(), 16);
            assert_eq!(derive_key(&ikm, &[0u8; 13], &[], 64).unwrap().len(), 64);
        }

        #[test]
        fn salt_and_info_separate_outputs() {
            let ikm = [0x0bu8; 22];
            assert_ne!(
                derive_key(&ikm, b"salt1", &[], 32).unwrap(),
                derive_key(&ikm, b"salt2", &[], 32).unwrap()
            );
            assert_ne!(
                derive_key(&ikm, &[], b"info1", 32).unwrap(),
                derive_key(&ikm, &[], b"info2", 32).unwrap()
            );
        }

        #[test]
        fn fixed_size_matches_variable() {
            let ikm = [0x0bu8; 22];
            let a = derive_key(&ikm, b"s", b"i", 32).unwrap();
            let b = derive_key_32(&ikm, b"s", b"i").unwrap();
            assert_eq!(a, b.to_vec());
        }

        #[test]
        fn oversized_output_fails() {
            // HKDF-SHA512 caps output at 255 * 64 bytes
            assert!(derive_key(b"ikm", b"salt", b"info", 255 * 64 + 1).is_err());
        }
    }

    mod hap_key_derivation {
        use super::*;

        #[test]
        fn every_label_produces_a_distinct_key() {
            let secret = [0xABu8; 64];
            let keys = [
                derive_pair_setup_key(&secret).unwrap(),
                derive_controller_sign_key(&secret).unwrap(),
                derive_accessory_sign_key(&secret).unwrap(),
                derive_pair_verify_key(&secret).unwrap(),
                derive_control_write_key(&secret).unwrap(),
                derive_control_read_key(&secret).unwrap(),
            ];
            for i in 0..keys.len() {
                for j in i + 1..keys.len() {
                    assert_ne!(keys[i], keys[j], "labels {} and {} collide", i, j);
                }
            }
        }
    }
}

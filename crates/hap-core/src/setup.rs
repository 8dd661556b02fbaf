//! Setup code handling: pincode validation, setup IDs, setup URI and setup hash.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha512};

use crate::category::Category;
use crate::error::ParseError;

/// Length of the base-36 payload in a setup URI.
const SETUP_PAYLOAD_LEN: usize = 9;

/// Flag bit announcing IP transport support.
const SUPPORTS_IP_FLAG: u64 = 1 << 28;

/// Alphabet for base-36 payloads and setup IDs.
const BASE36_DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Codes HomeKit refuses as too trivial.
const DISALLOWED_PINCODES: [&str; 12] = [
    "000-00-000",
    "111-11-111",
    "222-22-222",
    "333-33-333",
    "444-44-444",
    "555-55-555",
    "666-66-666",
    "777-77-777",
    "888-88-888",
    "999-99-999",
    "123-45-678",
    "876-54-321",
];

/// Validate a pincode of the form `XXX-XX-XXX`.
pub fn validate_pincode(pincode: &str) -> Result<(), ParseError> {
    let bytes = pincode.as_bytes();
    let well_formed = bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            3 | 6 => *b == b'-',
            _ => b.is_ascii_digit(),
        });
    if !well_formed {
        return Err(ParseError::InvalidFormat(format!(
            "pincode must look like XXX-XX-XXX, got {:?}",
            pincode
        )));
    }
    if DISALLOWED_PINCODES.contains(&pincode) {
        return Err(ParseError::InvalidValue(format!(
            "pincode {} is too trivial",
            pincode
        )));
    }
    Ok(())
}

/// Validate a four character setup ID (`[0-9A-Z]{4}`).
pub fn validate_setup_id(setup_id: &str) -> Result<(), ParseError> {
    if setup_id.len() == 4 && setup_id.bytes().all(|b| BASE36_DIGITS.contains(&b)) {
        Ok(())
    } else {
        Err(ParseError::InvalidFormat(format!(
            "setup id must be 4 characters of [0-9A-Z], got {:?}",
            setup_id
        )))
    }
}

/// Generate a random four character setup ID.
pub fn generate_setup_id() -> String {
    let mut rng = rand::thread_rng();
    (0..4)
        .map(|_| BASE36_DIGITS[rng.gen_range(0..BASE36_DIGITS.len())] as char)
        .collect()
}

/// Render the `X-HM://` setup URI encoded in QR codes and NFC tags.
///
/// Layout of the 64-bit payload before base-36 encoding:
///
/// ```text
/// bits  0..27  setup code as a decimal number
/// bit      28  supports IP
/// bit      31  low bit of the category
/// bits 32..    category >> 1
/// ```
pub fn setup_uri(pincode: &str, category: Category, setup_id: &str) -> Result<String, ParseError> {
    validate_pincode(pincode)?;
    validate_setup_id(setup_id)?;

    let digits: String = pincode.chars().filter(|c| *c != '-').collect();
    let code: u64 = digits
        .parse()
        .map_err(|_| ParseError::InvalidFormat(format!("pincode {:?}", pincode)))?;

    let category = category.as_u8() as u64;
    let mut low = code | SUPPORTS_IP_FLAG;
    if category & 1 == 1 {
        low |= 1 << 31;
    }
    let high = category >> 1;
    let payload = (high << 32) | low;

    Ok(format!(
        "X-HM://{:0>width$}{}",
        to_base36(payload),
        setup_id,
        width = SETUP_PAYLOAD_LEN
    ))
}

/// The `sh` TXT value: base64 of the first four bytes of SHA-512(setup ID || username).
pub fn setup_hash(setup_id: &str, username: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(setup_id.as_bytes());
    hasher.update(username.as_bytes());
    let digest = hasher.finalize();
    STANDARD.encode(&digest[..4])
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(BASE36_DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    mod pincode {
        use super::*;

        #[test]
        fn accepts_well_formed() {
            assert!(validate_pincode("031-45-154").is_ok());
        }

        #[test]
        fn rejects_bad_shape() {
            assert!(validate_pincode("03145154").is_err());
            assert!(validate_pincode("031-45-15").is_err());
            assert!(validate_pincode("031-4a-154").is_err());
            assert!(validate_pincode("03-145-154").is_err());
        }

        #[test]
        fn rejects_trivial_codes() {
            assert!(validate_pincode("111-11-111").is_err());
            assert!(validate_pincode("123-45-678").is_err());
        }
    }

    mod setup_id {
        use super::*;

        #[test]
        fn generated_ids_are_valid() {
            for _ in 0..32 {
                let id = generate_setup_id();
                assert!(validate_setup_id(&id).is_ok(), "{}", id);
            }
        }

        #[test]
        fn rejects_lowercase_and_wrong_length() {
            assert!(validate_setup_id("abcd").is_err());
            assert!(validate_setup_id("ABC").is_err());
            assert!(validate_setup_id("ABCDE").is_err());
        }
    }

    mod uri {
        use super::*;

        #[test]
        fn lightbulb_sets_category_low_bit() {
            let uri = setup_uri("031-45-154", Category::Lightbulb, "ABCD").unwrap();
            assert_eq!(uri, "X-HM://00522H1VMABCD");
        }

        #[test]
        fn bridge_payload() {
            let uri = setup_uri("031-45-154", Category::Bridge, "ABCD").unwrap();
            assert_eq!(uri, "X-HM://0023ISYWYABCD");
        }

        #[test]
        fn payload_is_always_nine_characters() {
            let uri = setup_uri("123-44-321", Category::Switch, "7OSX").unwrap();
            assert_eq!(uri, "X-HM://0080RMAYP7OSX");
            assert_eq!(uri.len(), "X-HM://".len() + 9 + 4);
        }

        #[test]
        fn rejects_invalid_inputs() {
            assert!(setup_uri("bad", Category::Bridge, "ABCD").is_err());
            assert!(setup_uri("031-45-154", Category::Bridge, "ab").is_err());
        }

        #[test]
        fn base36_of_zero() {
            assert_eq!(to_base36(0), "0");
            assert_eq!(to_base36(35), "Z");
            assert_eq!(to_base36(36), "10");
        }
    }

    mod hash {
        use super::*;

        #[test]
        fn known_setup_hash() {
            assert_eq!(setup_hash("ABCD", "CC:22:3D:E3:CE:30"), "GbM0Ug==");
        }

        #[test]
        fn depends_on_username() {
            assert_ne!(
                setup_hash("ABCD", "CC:22:3D:E3:CE:30"),
                setup_hash("ABCD", "CC:22:3D:E3:CE:31")
            );
        }
    }
}

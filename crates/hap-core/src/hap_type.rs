//! HAP type UUIDs and their short form.
//!
//! Apple-defined services and characteristics share the base
//! `XXXXXXXX-0000-1000-8000-0026BB765291`; on the wire they are written
//! as the leading segment with leading zeros stripped (e.g. `"25"`).

use uuid::Uuid;

use crate::error::ParseError;

/// Suffix shared by every Apple-defined HAP type.
pub const BASE_UUID_SUFFIX: &str = "-0000-1000-8000-0026BB765291";

/// Build a full UUID from an Apple short type such as `0x25`.
pub fn from_short(short: u32) -> Uuid {
    Uuid::from_fields(
        short,
        0x0000,
        0x1000,
        &[0x80, 0x00, 0x00, 0x26, 0xBB, 0x76, 0x52, 0x91],
    )
}

/// Parse either a short (`"25"`) or a long UUID string.
pub fn parse(text: &str) -> Result<Uuid, ParseError> {
    if text.len() <= 8 && !text.contains('-') {
        let short = u32::from_str_radix(text, 16)
            .map_err(|_| ParseError::InvalidValue(format!("invalid short uuid {}", text)))?;
        return Ok(from_short(short));
    }
    Uuid::parse_str(text).map_err(|e| ParseError::InvalidValue(format!("{}: {}", text, e)))
}

/// Whether the UUID uses the Apple base.
pub fn is_apple_defined(uuid: &Uuid) -> bool {
    uuid.hyphenated()
        .to_string()
        .to_uppercase()
        .ends_with(BASE_UUID_SUFFIX)
}

/// Wire representation: short form for Apple types, upper-case long form otherwise.
pub fn to_short_form(uuid: &Uuid) -> String {
    let long = uuid.hyphenated().to_string().to_uppercase();
    if is_apple_defined(uuid) {
        let head = &long[..8];
        let trimmed = head.trim_start_matches('0');
        if trimmed.is_empty() {
            "0".to_string()
        } else {
            trimmed.to_string()
        }
    } else {
        long
    }
}

/// Deterministic UUID for a name, used to derive accessory identities.
pub fn generate(name: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_short_uses_apple_base() {
        let on = from_short(0x25);
        assert_eq!(
            on.hyphenated().to_string().to_uppercase(),
            "00000025-0000-1000-8000-0026BB765291"
        );
        assert!(is_apple_defined(&on));
    }

    #[test]
    fn short_form_strips_leading_zeros() {
        assert_eq!(to_short_form(&from_short(0x25)), "25");
        assert_eq!(to_short_form(&from_short(0x3E)), "3E");
        assert_eq!(to_short_form(&from_short(0x143)), "143");
    }

    #[test]
    fn custom_uuid_keeps_long_form() {
        let custom = Uuid::parse_str("a1b2c3d4-0000-4000-8000-000000000001").unwrap();
        assert!(!is_apple_defined(&custom));
        assert_eq!(
            to_short_form(&custom),
            "A1B2C3D4-0000-4000-8000-000000000001"
        );
    }

    #[test]
    fn parse_accepts_short_and_long() {
        assert_eq!(parse("43").unwrap(), from_short(0x43));
        assert_eq!(
            parse("00000043-0000-1000-8000-0026BB765291").unwrap(),
            from_short(0x43)
        );
        assert!(parse("zz").is_err());
    }

    #[test]
    fn generate_is_deterministic() {
        assert_eq!(generate("hap-rs:lamp"), generate("hap-rs:lamp"));
        assert_ne!(generate("hap-rs:lamp"), generate("hap-rs:fan"));
    }
}

//! Characteristic formats, permissions, values and their validation.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hap_core::status::HapStatus;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Default `maxLen` for string characteristics.
pub const DEFAULT_MAX_LEN: usize = 64;

/// Default `maxDataLen` for data characteristics.
pub const DEFAULT_MAX_DATA_LEN: usize = 2_097_152;

/// Wire format of a characteristic value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Bool,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int,
    Float,
    String,
    Tlv8,
    Data,
}

impl Format {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Uint8 => "uint8",
            Self::Uint16 => "uint16",
            Self::Uint32 => "uint32",
            Self::Uint64 => "uint64",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Tlv8 => "tlv8",
            Self::Data => "data",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            Self::Uint8 | Self::Uint16 | Self::Uint32 | Self::Uint64 | Self::Int | Self::Float
        )
    }

    /// Natural range of integer formats.
    fn integer_bounds(self) -> Option<(f64, f64)> {
        match self {
            Self::Uint8 => Some((0.0, u8::MAX as f64)),
            Self::Uint16 => Some((0.0, u16::MAX as f64)),
            Self::Uint32 => Some((0.0, u32::MAX as f64)),
            Self::Uint64 => Some((0.0, u64::MAX as f64)),
            Self::Int => Some((i32::MIN as f64, i32::MAX as f64)),
            _ => None,
        }
    }

    /// Value a fresh characteristic of this format starts with.
    pub fn default_value(self) -> CharValue {
        match self {
            Self::Bool => CharValue::Bool(false),
            Self::Uint8 | Self::Uint16 | Self::Uint32 | Self::Uint64 => CharValue::UInt(0),
            Self::Int => CharValue::Int(0),
            Self::Float => CharValue::Float(0.0),
            Self::String => CharValue::String(String::new()),
            Self::Tlv8 | Self::Data => CharValue::Data(Vec::new()),
        }
    }
}

/// Characteristic permission flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Perm {
    #[serde(rename = "pr")]
    PairedRead,
    #[serde(rename = "pw")]
    PairedWrite,
    #[serde(rename = "ev")]
    Notify,
    #[serde(rename = "aa")]
    AdditionalAuthorization,
    #[serde(rename = "tw")]
    TimedWrite,
    #[serde(rename = "wr")]
    WriteResponse,
    #[serde(rename = "hd")]
    Hidden,
}

impl Perm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PairedRead => "pr",
            Self::PairedWrite => "pw",
            Self::Notify => "ev",
            Self::AdditionalAuthorization => "aa",
            Self::TimedWrite => "tw",
            Self::WriteResponse => "wr",
            Self::Hidden => "hd",
        }
    }
}

/// Operations restricted to admin controllers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdminOnly {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
}

/// A characteristic value.
#[derive(Debug, Clone, PartialEq)]
pub enum CharValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    /// Raw bytes of `data` and `tlv8` characteristics.
    Data(Vec<u8>),
}

impl CharValue {
    /// JSON form used in HAP bodies.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => json!(i),
            Self::UInt(u) => json!(u),
            Self::Float(f) => json!(f),
            Self::String(s) => Value::String(s.clone()),
            Self::Data(d) => Value::String(STANDARD.encode(d)),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(i) => Some(*i != 0),
            Self::UInt(u) => Some(*u != 0),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::UInt(u) => Some(*u as f64),
            Self::Float(f) => Some(*f),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Data(d) => Some(d),
            _ => None,
        }
    }
}

impl From<bool> for CharValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for CharValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for CharValue {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<u64> for CharValue {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<u32> for CharValue {
    fn from(v: u32) -> Self {
        Self::UInt(v as u64)
    }
}

impl From<u8> for CharValue {
    fn from(v: u8) -> Self {
        Self::UInt(v as u64)
    }
}

impl From<f64> for CharValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for CharValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for CharValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for CharValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Data(v)
    }
}

/// Static description of a characteristic.
#[derive(Debug, Clone)]
pub struct CharProps {
    pub format: Format,
    pub perms: Vec<Perm>,
    pub unit: Option<String>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub min_step: Option<f64>,
    pub max_len: Option<usize>,
    pub max_data_len: Option<usize>,
    pub valid_values: Option<Vec<i64>>,
    pub valid_values_range: Option<(i64, i64)>,
    pub admin_only: AdminOnly,
    /// Notify even for changes caused by reads.
    pub always_notify: bool,
    /// Bypass event coalescing.
    pub immediate_delivery: bool,
}

impl CharProps {
    pub fn new(format: Format, perms: &[Perm]) -> Self {
        Self {
            format,
            perms: perms.to_vec(),
            unit: None,
            min_value: None,
            max_value: None,
            min_step: None,
            max_len: None,
            max_data_len: None,
            valid_values: None,
            valid_values_range: None,
            admin_only: AdminOnly::default(),
            always_notify: false,
            immediate_delivery: false,
        }
    }

    pub fn with_range(mut self, min: f64, max: f64, step: f64) -> Self {
        self.min_value = Some(min);
        self.max_value = Some(max);
        self.min_step = Some(step);
        self
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    pub fn with_valid_values(mut self, values: &[i64]) -> Self {
        self.valid_values = Some(values.to_vec());
        self
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    pub fn has(&self, perm: Perm) -> bool {
        self.perms.contains(&perm)
    }

    fn effective_bounds(&self) -> (f64, f64) {
        let (lo, hi) = self
            .format
            .integer_bounds()
            .unwrap_or((f64::MIN, f64::MAX));
        (
            self.min_value.map_or(lo, |m| m.max(lo)),
            self.max_value.map_or(hi, |m| m.min(hi)),
        )
    }

    fn numeric_value(&self, number: f64) -> CharValue {
        match self.format {
            Format::Float => CharValue::Float(number),
            Format::Int => CharValue::Int(number.round() as i64),
            _ => CharValue::UInt(number.round().max(0.0) as u64),
        }
    }

    fn allowed_integer(&self, value: i64) -> bool {
        if let Some(valid) = &self.valid_values {
            if !valid.contains(&value) {
                return false;
            }
        }
        if let Some((lo, hi)) = self.valid_values_range {
            if value < lo || value > hi {
                return false;
            }
        }
        true
    }

    /// Validate a value written by a controller.
    pub fn validate_network(&self, value: &Value) -> Result<CharValue, HapStatus> {
        let invalid = HapStatus::InvalidValueInRequest;
        match self.format {
            Format::Bool => match value {
                Value::Bool(b) => Ok(CharValue::Bool(*b)),
                Value::Number(n) => match n.as_f64() {
                    Some(v) if v == 0.0 => Ok(CharValue::Bool(false)),
                    Some(v) if v == 1.0 => Ok(CharValue::Bool(true)),
                    _ => Err(invalid),
                },
                _ => Err(invalid),
            },
            f if f.is_numeric() => {
                let number = match value {
                    Value::Number(n) => n.as_f64().ok_or(invalid)?,
                    Value::Bool(b) => f64::from(u8::from(*b)),
                    _ => return Err(invalid),
                };
                if !number.is_finite() {
                    return Err(invalid);
                }
                let (lo, hi) = self.effective_bounds();
                if number < lo || number > hi {
                    return Err(invalid);
                }
                let converted = self.numeric_value(number);
                if f != Format::Float && !self.allowed_integer(number.round() as i64) {
                    return Err(invalid);
                }
                Ok(converted)
            }
            Format::String => match value {
                Value::String(s) if s.len() <= self.max_len.unwrap_or(DEFAULT_MAX_LEN) => {
                    Ok(CharValue::String(s.clone()))
                }
                _ => Err(invalid),
            },
            _ => match value {
                Value::String(s) => {
                    let bytes = STANDARD.decode(s).map_err(|_| invalid)?;
                    if self.format == Format::Data
                        && bytes.len() > self.max_data_len.unwrap_or(DEFAULT_MAX_DATA_LEN)
                    {
                        return Err(invalid);
                    }
                    Ok(CharValue::Data(bytes))
                }
                _ => Err(invalid),
            },
        }
    }

    /// Coerce a programmatic value into range.
    ///
    /// Returns the stored value and, when it had to be adjusted, a warning.
    /// `Err` carries a warning for values that cannot be coerced at all.
    pub fn coerce(&self, value: CharValue) -> Result<(CharValue, Option<String>), String> {
        match self.format {
            Format::Bool => value
                .as_bool()
                .map(|b| (CharValue::Bool(b), None))
                .ok_or_else(|| format!("expected bool, got {:?}", value)),
            f if f.is_numeric() => {
                let number = value
                    .as_f64()
                    .ok_or_else(|| format!("expected number, got {:?}", value))?;
                if !number.is_finite() {
                    return Err(format!("non-finite value {}", number));
                }
                let (lo, hi) = self.effective_bounds();
                let clamped = number.clamp(lo, hi);
                let warning = (clamped != number).then(|| {
                    format!("value {} out of range [{}, {}], clamped to {}", number, lo, hi, clamped)
                });
                Ok((self.numeric_value(clamped), warning))
            }
            Format::String => {
                let s = match value {
                    CharValue::String(s) => s,
                    CharValue::Null => String::new(),
                    other => return Err(format!("expected string, got {:?}", other)),
                };
                let max = self.max_len.unwrap_or(DEFAULT_MAX_LEN);
                if s.len() > max {
                    let mut end = max;
                    while !s.is_char_boundary(end) {
                        end -= 1;
                    }
                    Ok((
                        CharValue::String(s[..end].to_string()),
                        Some(format!("string longer than maxLen {}, truncated", max)),
                    ))
                } else {
                    Ok((CharValue::String(s), None))
                }
            }
            _ => match value {
                CharValue::Data(d) => Ok((CharValue::Data(d), None)),
                CharValue::Null => Ok((CharValue::Data(Vec::new()), None)),
                other => Err(format!("expected data, got {:?}", other)),
            },
        }
    }

    /// Metadata fields of the HAP JSON representation.
    pub fn meta_json(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("format".into(), json!(self.format.as_str()));
        if let Some(unit) = &self.unit {
            map.insert("unit".into(), json!(unit));
        }
        if let Some(min) = self.min_value {
            map.insert("minValue".into(), number_json(min));
        }
        if let Some(max) = self.max_value {
            map.insert("maxValue".into(), number_json(max));
        }
        if let Some(step) = self.min_step {
            map.insert("minStep".into(), number_json(step));
        }
        if self.format == Format::String {
            if let Some(max_len) = self.max_len {
                map.insert("maxLen".into(), json!(max_len));
            }
        }
        if let Some(max_data_len) = self.max_data_len {
            map.insert("maxDataLen".into(), json!(max_data_len));
        }
        if let Some(valid) = &self.valid_values {
            map.insert("valid-values".into(), json!(valid));
        }
        if let Some((lo, hi)) = self.valid_values_range {
            map.insert("valid-values-range".into(), json!([lo, hi]));
        }
        map
    }

    pub fn perms_json(&self) -> Value {
        Value::Array(self.perms.iter().map(|p| json!(p.as_str())).collect())
    }
}

fn number_json(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        json!(value as i64)
    } else {
        json!(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brightness() -> CharProps {
        CharProps::new(Format::Int, &[Perm::PairedRead, Perm::PairedWrite, Perm::Notify])
            .with_range(0.0, 100.0, 1.0)
            .with_unit("percentage")
    }

    mod network_validation {
        use super::*;

        #[test]
        fn bool_accepts_zero_and_one() {
            let props = CharProps::new(Format::Bool, &[Perm::PairedWrite]);
            assert_eq!(props.validate_network(&json!(1)), Ok(CharValue::Bool(true)));
            assert_eq!(props.validate_network(&json!(0)), Ok(CharValue::Bool(false)));
            assert_eq!(props.validate_network(&json!(true)), Ok(CharValue::Bool(true)));
            assert_eq!(
                props.validate_network(&json!(2)),
                Err(HapStatus::InvalidValueInRequest)
            );
            assert!(props.validate_network(&json!("true")).is_err());
        }

        #[test]
        fn numeric_range_is_enforced() {
            let props = brightness();
            assert_eq!(props.validate_network(&json!(55)), Ok(CharValue::Int(55)));
            assert_eq!(
                props.validate_network(&json!(101)),
                Err(HapStatus::InvalidValueInRequest)
            );
            assert!(props.validate_network(&json!(-1)).is_err());
            assert!(props.validate_network(&json!("50")).is_err());
        }

        #[test]
        fn uint8_natural_bounds() {
            let props = CharProps::new(Format::Uint8, &[Perm::PairedWrite]);
            assert_eq!(props.validate_network(&json!(255)), Ok(CharValue::UInt(255)));
            assert!(props.validate_network(&json!(256)).is_err());
        }

        #[test]
        fn valid_values_list() {
            let props = CharProps::new(Format::Uint8, &[Perm::PairedWrite]).with_valid_values(&[0, 2]);
            assert!(props.validate_network(&json!(2)).is_ok());
            assert!(props.validate_network(&json!(1)).is_err());
        }

        #[test]
        fn string_max_len_defaults_to_64() {
            let props = CharProps::new(Format::String, &[Perm::PairedWrite]);
            assert!(props.validate_network(&json!("a".repeat(64))).is_ok());
            assert!(props.validate_network(&json!("a".repeat(65))).is_err());
        }

        #[test]
        fn data_is_base64() {
            let props = CharProps::new(Format::Tlv8, &[Perm::PairedWrite]);
            assert_eq!(
                props.validate_network(&json!("AQID")),
                Ok(CharValue::Data(vec![1, 2, 3]))
            );
            assert!(props.validate_network(&json!("***")).is_err());
        }
    }

    mod coercion {
        use super::*;

        #[test]
        fn clamps_with_warning() {
            let props = brightness();
            let (value, warning) = props.coerce(CharValue::Int(150)).unwrap();
            assert_eq!(value, CharValue::Int(100));
            assert!(warning.unwrap().contains("clamped"));

            let (value, warning) = props.coerce(CharValue::Int(40)).unwrap();
            assert_eq!(value, CharValue::Int(40));
            assert!(warning.is_none());
        }

        #[test]
        fn truncates_long_strings() {
            let props = CharProps::new(Format::String, &[Perm::PairedRead]).with_max_len(3);
            let (value, warning) = props.coerce(CharValue::from("abcdef")).unwrap();
            assert_eq!(value, CharValue::from("abc"));
            assert!(warning.is_some());
        }

        #[test]
        fn wrong_type_is_refused() {
            let props = CharProps::new(Format::Bool, &[Perm::PairedRead]);
            assert!(props.coerce(CharValue::from("on")).is_err());
            assert_eq!(props.coerce(CharValue::Int(1)).unwrap().0, CharValue::Bool(true));
        }
    }

    mod json_form {
        use super::*;

        #[test]
        fn meta_fields() {
            let meta = brightness().meta_json();
            assert_eq!(meta["format"], json!("int"));
            assert_eq!(meta["unit"], json!("percentage"));
            assert_eq!(meta["minValue"], json!(0));
            assert_eq!(meta["maxValue"], json!(100));
            assert_eq!(meta["minStep"], json!(1));
        }

        #[test]
        fn perms_strings() {
            assert_eq!(
                brightness().perms_json(),
                json!(["pr", "pw", "ev"])
            );
        }

        #[test]
        fn data_values_are_base64() {
            assert_eq!(CharValue::Data(vec![1, 2, 3]).to_json(), json!("AQID"));
            assert_eq!(CharValue::UInt(7).to_json(), json!(7));
        }
    }
}

//! TLV8 encoding/decoding for pairing messages and feature negotiation.
//!
//! TLV8 format: [Type: 1 byte][Length: 1 byte][Value: 0-255 bytes]
//! Values longer than 255 bytes are fragmented across consecutive TLVs of the
//! same type. Entries keep their wire order so repeated types (lists) and
//! separators survive a round trip.

use hap_core::error::ParseError;
use hap_core::status::TlvError;

/// Largest value carried by a single TLV item.
const MAX_FRAGMENT: usize = 255;

/// TLV type constants for HomeKit pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TlvType {
    Method = 0x00,
    Identifier = 0x01,
    Salt = 0x02,
    PublicKey = 0x03,
    Proof = 0x04,
    EncryptedData = 0x05,
    State = 0x06,
    Error = 0x07,
    RetryDelay = 0x08,
    Certificate = 0x09,
    Signature = 0x0A,
    Permissions = 0x0B,
    FragmentData = 0x0C,
    FragmentLast = 0x0D,
    Flags = 0x13,
    Separator = 0xFF,
}

/// Pairing methods carried in the `Method` item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PairingMethod {
    PairSetup = 0x00,
    PairSetupWithAuth = 0x01,
    PairVerify = 0x02,
    AddPairing = 0x03,
    RemovePairing = 0x04,
    ListPairings = 0x05,
}

impl PairingMethod {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::PairSetup),
            0x01 => Some(Self::PairSetupWithAuth),
            0x02 => Some(Self::PairVerify),
            0x03 => Some(Self::AddPairing),
            0x04 => Some(Self::RemovePairing),
            0x05 => Some(Self::ListPairings),
            _ => None,
        }
    }
}

/// Ordered TLV8 message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tlv8 {
    entries: Vec<(u8, Vec<u8>)>,
}

impl Tlv8 {
    /// Create empty TLV8 message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a message that starts with the given `State`.
    pub fn with_state(state: u8) -> Self {
        let mut tlv = Self::new();
        tlv.push(TlvType::State, vec![state]);
        tlv
    }

    /// Create an error response for the given state.
    pub fn error_response(state: u8, error: TlvError) -> Self {
        let mut tlv = Self::with_state(state);
        tlv.push(TlvType::Error, vec![error as u8]);
        tlv
    }

    /// Parse TLV8 from bytes.
    ///
    /// A TLV that directly follows a full (255 byte) fragment of the same
    /// type is a continuation and is concatenated onto it. Any other repeat
    /// of a type starts a new entry.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let mut entries: Vec<(u8, Vec<u8>)> = Vec::new();
        let mut i = 0;
        let mut last: Option<(u8, usize)> = None;

        while i < data.len() {
            if i + 2 > data.len() {
                return Err(ParseError::InvalidFormat(
                    "TLV8: truncated header".to_string(),
                ));
            }

            let typ = data[i];
            let len = data[i + 1] as usize;
            i += 2;

            if i + len > data.len() {
                return Err(ParseError::InvalidFormat(format!(
                    "TLV8: truncated value (expected {} bytes, got {})",
                    len,
                    data.len() - i
                )));
            }

            let value = &data[i..i + len];
            i += len;

            // A same-type item right after a full fragment continues it, even
            // when empty; an empty continuation only ends the value.
            let continues = matches!(last, Some((t, MAX_FRAGMENT)) if t == typ);
            if let (true, Some((_, existing))) = (continues, entries.last_mut()) {
                existing.extend_from_slice(value);
            } else {
                entries.push((typ, value.to_vec()));
            }

            last = Some((typ, len));
        }

        Ok(Self { entries })
    }

    /// Encode to bytes in entry order.
    ///
    /// Values > 255 bytes are fragmented across multiple TLVs.
    pub fn encode(&self) -> Vec<u8> {
        let mut result = Vec::new();

        for (typ, value) in &self.entries {
            if value.is_empty() {
                result.push(*typ);
                result.push(0);
                continue;
            }
            for chunk in value.chunks(MAX_FRAGMENT) {
                result.push(*typ);
                result.push(chunk.len() as u8);
                result.extend_from_slice(chunk);
            }
        }

        result
    }

    /// First value for type (map mode).
    pub fn get(&self, typ: TlvType) -> Option<&[u8]> {
        self.get_raw(typ as u8)
    }

    /// First value for raw type.
    pub fn get_raw(&self, typ: u8) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(t, _)| *t == typ)
            .map(|(_, v)| v.as_slice())
    }

    /// Every value for raw type, in wire order (list mode).
    pub fn get_all_raw(&self, typ: u8) -> Vec<&[u8]> {
        self.entries
            .iter()
            .filter(|(t, _)| *t == typ)
            .map(|(_, v)| v.as_slice())
            .collect()
    }

    /// Every value for type, in wire order (list mode).
    pub fn get_all(&self, typ: TlvType) -> Vec<&[u8]> {
        self.get_all_raw(typ as u8)
    }

    /// Replace the first value for type, or append it.
    pub fn set(&mut self, typ: TlvType, value: impl Into<Vec<u8>>) {
        self.set_raw(typ as u8, value);
    }

    /// Replace the first value for raw type, or append it.
    pub fn set_raw(&mut self, typ: u8, value: impl Into<Vec<u8>>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(t, _)| *t == typ) {
            Some((_, existing)) => *existing = value,
            None => self.entries.push((typ, value)),
        }
    }

    /// Append a value, keeping earlier values of the same type.
    pub fn push(&mut self, typ: TlvType, value: impl Into<Vec<u8>>) {
        self.entries.push((typ as u8, value.into()));
    }

    /// Append a value for a raw type.
    pub fn push_raw(&mut self, typ: u8, value: impl Into<Vec<u8>>) {
        self.entries.push((typ, value.into()));
    }

    /// Append an empty separator item.
    pub fn push_separator(&mut self) {
        self.entries.push((TlvType::Separator as u8, Vec::new()));
    }

    /// Split the message into groups delimited by separator items.
    pub fn split(&self) -> Vec<Tlv8> {
        let mut groups = vec![Tlv8::new()];
        for (typ, value) in &self.entries {
            if *typ == TlvType::Separator as u8 {
                groups.push(Tlv8::new());
            } else if let Some(group) = groups.last_mut() {
                group.entries.push((*typ, value.clone()));
            }
        }
        groups.retain(|g| !g.is_empty());
        groups
    }

    /// Check if type is present.
    pub fn contains(&self, typ: TlvType) -> bool {
        self.get(typ).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw entries in wire order.
    pub fn entries(&self) -> &[(u8, Vec<u8>)] {
        &self.entries
    }

    /// Get state value (single byte).
    pub fn state(&self) -> Option<u8> {
        self.get(TlvType::State).and_then(|v| v.first().copied())
    }

    /// Get method value (single byte).
    pub fn method(&self) -> Option<PairingMethod> {
        self.get(TlvType::Method)
            .and_then(|v| v.first().copied())
            .and_then(PairingMethod::from_byte)
    }

    /// Get error value (single byte).
    pub fn error(&self) -> Option<u8> {
        self.get(TlvType::Error).and_then(|v| v.first().copied())
    }

    /// Get error as a known pairing error code.
    pub fn error_code(&self) -> Option<TlvError> {
        self.error().and_then(TlvError::from_byte)
    }

    /// Get retry delay value in seconds.
    pub fn retry_delay(&self) -> Option<u64> {
        self.get(TlvType::RetryDelay).and_then(|v| read_uint(v).ok())
    }

    /// Get error description string.
    pub fn error_description(&self) -> Option<String> {
        let code = self.error()?;
        let mut desc = match TlvError::from_byte(code) {
            Some(known) => format!("Error {}", known),
            None => format!("Error 0x{:02x}: Unknown error code", code),
        };

        if let Some(delay) = self.retry_delay() {
            if delay > 0 {
                desc.push_str(&format!(" (retry after {} seconds)", delay));
            }
        }

        Some(desc)
    }
}

impl TlvType {
    /// Convert from raw byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::Method),
            0x01 => Some(Self::Identifier),
            0x02 => Some(Self::Salt),
            0x03 => Some(Self::PublicKey),
            0x04 => Some(Self::Proof),
            0x05 => Some(Self::EncryptedData),
            0x06 => Some(Self::State),
            0x07 => Some(Self::Error),
            0x08 => Some(Self::RetryDelay),
            0x09 => Some(Self::Certificate),
            0x0A => Some(Self::Signature),
            0x0B => Some(Self::Permissions),
            0x0C => Some(Self::FragmentData),
            0x0D => Some(Self::FragmentLast),
            0x13 => Some(Self::Flags),
            0xFF => Some(Self::Separator),
            _ => None,
        }
    }
}

/// Encode an unsigned integer in the minimal number of little-endian bytes.
///
/// Zero is written as a single zero byte.
pub fn write_uint(value: u64) -> Vec<u8> {
    let bytes = value.to_le_bytes();
    let len = bytes.iter().rposition(|b| *b != 0).map_or(1, |i| i + 1);
    bytes[..len].to_vec()
}

/// Decode a little-endian unsigned integer of 1 to 8 bytes.
pub fn read_uint(bytes: &[u8]) -> Result<u64, ParseError> {
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(ParseError::InvalidFormat(format!(
            "TLV8: integer of {} bytes",
            bytes.len()
        )));
    }
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(u64::from_le_bytes(buf))
}

//! Status taxonomies: HAP characteristic status, HTTP status and TLV8 pairing errors.

use std::fmt;

use thiserror::Error;

/// Per-characteristic status returned inside HAP JSON bodies.
///
/// Distinct from the outer HTTP status of the response. Handlers return
/// `Result<T, HapStatus>` so any non-success value can be propagated with `?`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum HapStatus {
    #[error("success")]
    Success = 0,
    #[error("insufficient privileges")]
    InsufficientPrivileges = -70401,
    #[error("service communication failure")]
    ServiceCommunicationFailure = -70402,
    #[error("resource busy")]
    ResourceBusy = -70403,
    #[error("read-only characteristic")]
    ReadOnlyCharacteristic = -70404,
    #[error("write-only characteristic")]
    WriteOnlyCharacteristic = -70405,
    #[error("notification not supported")]
    NotificationNotSupported = -70406,
    #[error("out of resource")]
    OutOfResource = -70407,
    #[error("operation timed out")]
    OperationTimedOut = -70408,
    #[error("resource does not exist")]
    ResourceDoesNotExist = -70409,
    #[error("invalid value in request")]
    InvalidValueInRequest = -70410,
    #[error("insufficient authorization")]
    InsufficientAuthorization = -70411,
    #[error("not allowed in current state")]
    NotAllowedInCurrentState = -70412,
}

impl HapStatus {
    /// Wire value of this status.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Convert from wire value.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            -70401 => Some(Self::InsufficientPrivileges),
            -70402 => Some(Self::ServiceCommunicationFailure),
            -70403 => Some(Self::ResourceBusy),
            -70404 => Some(Self::ReadOnlyCharacteristic),
            -70405 => Some(Self::WriteOnlyCharacteristic),
            -70406 => Some(Self::NotificationNotSupported),
            -70407 => Some(Self::OutOfResource),
            -70408 => Some(Self::OperationTimedOut),
            -70409 => Some(Self::ResourceDoesNotExist),
            -70410 => Some(Self::InvalidValueInRequest),
            -70411 => Some(Self::InsufficientAuthorization),
            -70412 => Some(Self::NotAllowedInCurrentState),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Outer HTTP status codes used by the accessory server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum HttpStatus {
    Ok = 200,
    NoContent = 204,
    MultiStatus = 207,
    BadRequest = 400,
    NotFound = 404,
    MethodNotAllowed = 405,
    UnprocessableEntity = 422,
    ConnectionAuthorizationRequired = 470,
    InternalServerError = 500,
    ServiceUnavailable = 503,
}

impl HttpStatus {
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Reason phrase written on the status line.
    pub fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::NoContent => "No Content",
            Self::MultiStatus => "Multi-Status",
            Self::BadRequest => "Bad Request",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::UnprocessableEntity => "Unprocessable Entity",
            Self::ConnectionAuthorizationRequired => "Connection Authorization Required",
            Self::InternalServerError => "Internal Server Error",
            Self::ServiceUnavailable => "Service Unavailable",
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            200 => Some(Self::Ok),
            204 => Some(Self::NoContent),
            207 => Some(Self::MultiStatus),
            400 => Some(Self::BadRequest),
            404 => Some(Self::NotFound),
            405 => Some(Self::MethodNotAllowed),
            422 => Some(Self::UnprocessableEntity),
            470 => Some(Self::ConnectionAuthorizationRequired),
            500 => Some(Self::InternalServerError),
            503 => Some(Self::ServiceUnavailable),
            _ => None,
        }
    }
}

impl fmt::Display for HttpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// Error codes carried in the TLV8 `Error` item of pairing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TlvError {
    Unknown = 0x01,
    Authentication = 0x02,
    Backoff = 0x03,
    MaxPeers = 0x04,
    MaxTries = 0x05,
    Unavailable = 0x06,
    Busy = 0x07,
}

impl TlvError {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Unknown),
            0x02 => Some(Self::Authentication),
            0x03 => Some(Self::Backoff),
            0x04 => Some(Self::MaxPeers),
            0x05 => Some(Self::MaxTries),
            0x06 => Some(Self::Unavailable),
            0x07 => Some(Self::Busy),
            _ => None,
        }
    }
}

impl fmt::Display for TlvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::Authentication => "Authentication",
            Self::Backoff => "Backoff",
            Self::MaxPeers => "MaxPeers",
            Self::MaxTries => "MaxTries",
            Self::Unavailable => "Unavailable",
            Self::Busy => "Busy",
        };
        write!(f, "0x{:02x} ({})", *self as u8, name)
    }
}

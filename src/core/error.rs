//! Status codes returned by the resource manager and their translation
//! into typed errors.

use std::fmt;

use crate::core::types::Protocol;

/// Raw 32-bit status code returned by every resource-manager entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const SUCCESS: Self = Self(0x0000_0000);

    pub const F_INTERNAL_ERROR: Self = Self(0x8010_0001);
    pub const E_CANCELLED: Self = Self(0x8010_0002);
    pub const E_INVALID_HANDLE: Self = Self(0x8010_0003);
    pub const E_INVALID_PARAMETER: Self = Self(0x8010_0004);
    pub const E_INVALID_TARGET: Self = Self(0x8010_0005);
    pub const E_NO_MEMORY: Self = Self(0x8010_0006);
    pub const F_WAITED_TOO_LONG: Self = Self(0x8010_0007);
    pub const E_INSUFFICIENT_BUFFER: Self = Self(0x8010_0008);
    pub const E_UNKNOWN_READER: Self = Self(0x8010_0009);
    pub const E_TIMEOUT: Self = Self(0x8010_000A);
    pub const E_SHARING_VIOLATION: Self = Self(0x8010_000B);
    pub const E_NO_SMARTCARD: Self = Self(0x8010_000C);
    pub const E_UNKNOWN_CARD: Self = Self(0x8010_000D);
    pub const E_CANT_DISPOSE: Self = Self(0x8010_000E);
    pub const E_PROTO_MISMATCH: Self = Self(0x8010_000F);
    pub const E_NOT_READY: Self = Self(0x8010_0010);
    pub const E_INVALID_VALUE: Self = Self(0x8010_0011);
    pub const E_SYSTEM_CANCELLED: Self = Self(0x8010_0012);
    pub const F_COMM_ERROR: Self = Self(0x8010_0013);
    pub const F_UNKNOWN_ERROR: Self = Self(0x8010_0014);
    pub const E_INVALID_ATR: Self = Self(0x8010_0015);
    pub const E_NOT_TRANSACTED: Self = Self(0x8010_0016);
    pub const E_READER_UNAVAILABLE: Self = Self(0x8010_0017);
    pub const P_SHUTDOWN: Self = Self(0x8010_0018);
    pub const E_PCI_TOO_SMALL: Self = Self(0x8010_0019);
    pub const E_READER_UNSUPPORTED: Self = Self(0x8010_001A);
    pub const E_DUPLICATE_READER: Self = Self(0x8010_001B);
    pub const E_CARD_UNSUPPORTED: Self = Self(0x8010_001C);
    pub const E_NO_SERVICE: Self = Self(0x8010_001D);
    pub const E_SERVICE_STOPPED: Self = Self(0x8010_001E);
    pub const E_UNEXPECTED: Self = Self(0x8010_001F);
    pub const E_ICC_INSTALLATION: Self = Self(0x8010_0020);
    pub const E_ICC_CREATEORDER: Self = Self(0x8010_0021);
    pub const E_UNSUPPORTED_FEATURE: Self = Self(0x8010_0022);
    pub const E_DIR_NOT_FOUND: Self = Self(0x8010_0023);
    pub const E_FILE_NOT_FOUND: Self = Self(0x8010_0024);
    pub const E_NO_DIR: Self = Self(0x8010_0025);
    pub const E_NO_FILE: Self = Self(0x8010_0026);
    pub const E_NO_ACCESS: Self = Self(0x8010_0027);
    pub const E_WRITE_TOO_MANY: Self = Self(0x8010_0028);
    pub const E_BAD_SEEK: Self = Self(0x8010_0029);
    pub const E_INVALID_CHV: Self = Self(0x8010_002A);
    pub const E_UNKNOWN_RES_MNG: Self = Self(0x8010_002B);
    pub const E_NO_SUCH_CERTIFICATE: Self = Self(0x8010_002C);
    pub const E_CERTIFICATE_UNAVAILABLE: Self = Self(0x8010_002D);
    pub const E_NO_READERS_AVAILABLE: Self = Self(0x8010_002E);
    pub const E_COMM_DATA_LOST: Self = Self(0x8010_002F);
    pub const E_NO_KEY_CONTAINER: Self = Self(0x8010_0030);
    pub const E_SERVER_TOO_BUSY: Self = Self(0x8010_0031);
    pub const W_UNSUPPORTED_CARD: Self = Self(0x8010_0065);
    pub const W_UNRESPONSIVE_CARD: Self = Self(0x8010_0066);
    pub const W_UNPOWERED_CARD: Self = Self(0x8010_0067);
    pub const W_RESET_CARD: Self = Self(0x8010_0068);
    pub const W_REMOVED_CARD: Self = Self(0x8010_0069);
    pub const W_SECURITY_VIOLATION: Self = Self(0x8010_006A);
    pub const W_WRONG_CHV: Self = Self(0x8010_006B);
    pub const W_CHV_BLOCKED: Self = Self(0x8010_006C);
    pub const W_EOF: Self = Self(0x8010_006D);
    pub const W_CANCELLED_BY_USER: Self = Self(0x8010_006E);
    pub const W_CARD_NOT_AUTHENTICATED: Self = Self(0x8010_006F);

    pub const fn is_success(self) -> bool {
        self.0 == Self::SUCCESS.0
    }

    /// Platform message for this code.
    pub fn message(self) -> &'static str {
        match self {
            Self::SUCCESS => "Command successful.",
            Self::F_INTERNAL_ERROR => "Internal error.",
            Self::E_CANCELLED => "Command cancelled.",
            Self::E_INVALID_HANDLE => "Invalid handle.",
            Self::E_INVALID_PARAMETER => "Invalid parameter given.",
            Self::E_INVALID_TARGET => "Invalid target given.",
            Self::E_NO_MEMORY => "Not enough memory.",
            Self::F_WAITED_TOO_LONG => "Waited too long.",
            Self::E_INSUFFICIENT_BUFFER => "Insufficient buffer.",
            Self::E_UNKNOWN_READER => "Unknown reader specified.",
            Self::E_TIMEOUT => "Command timeout.",
            Self::E_SHARING_VIOLATION => "Sharing violation.",
            Self::E_NO_SMARTCARD => "No smart card inserted.",
            Self::E_UNKNOWN_CARD => "Unknown card.",
            Self::E_CANT_DISPOSE => "Cannot dispose handle.",
            Self::E_PROTO_MISMATCH => "Card protocol mismatch.",
            Self::E_NOT_READY => "Subsystem not ready.",
            Self::E_INVALID_VALUE => "Invalid value given.",
            Self::E_SYSTEM_CANCELLED => "System cancelled.",
            Self::F_COMM_ERROR => "RPC transport error.",
            Self::F_UNKNOWN_ERROR => "Unknown error.",
            Self::E_INVALID_ATR => "Invalid ATR.",
            Self::E_NOT_TRANSACTED => "Transaction failed.",
            Self::E_READER_UNAVAILABLE => "Reader is unavailable.",
            Self::P_SHUTDOWN => "Shutdown.",
            Self::E_PCI_TOO_SMALL => "PCI struct too small.",
            Self::E_READER_UNSUPPORTED => "Reader is unsupported.",
            Self::E_DUPLICATE_READER => "Reader already exists.",
            Self::E_CARD_UNSUPPORTED => "Card is unsupported.",
            Self::E_NO_SERVICE => "Service not available.",
            Self::E_SERVICE_STOPPED => "Service was stopped.",
            Self::E_UNEXPECTED => "Unexpected card error.",
            Self::E_ICC_INSTALLATION => "Cannot find a smart card reader.",
            Self::E_ICC_CREATEORDER => "Requested order of object creation not supported.",
            Self::E_UNSUPPORTED_FEATURE => "Feature not supported.",
            Self::E_DIR_NOT_FOUND => "Identified directory does not exist.",
            Self::E_FILE_NOT_FOUND => "Identified file does not exist.",
            Self::E_NO_DIR => "Supplied path does not represent a card directory.",
            Self::E_NO_FILE => "Supplied path does not represent a card file.",
            Self::E_NO_ACCESS => "Access is denied to this file.",
            Self::E_WRITE_TOO_MANY => "Card is full.",
            Self::E_BAD_SEEK => "Error trying to set the file pointer.",
            Self::E_INVALID_CHV => "The PIN is incorrect.",
            Self::E_UNKNOWN_RES_MNG => "Unknown resource manager error.",
            Self::E_NO_SUCH_CERTIFICATE => "The requested certificate does not exist.",
            Self::E_CERTIFICATE_UNAVAILABLE => "The requested certificate could not be obtained.",
            Self::E_NO_READERS_AVAILABLE => "Cannot find a smart card reader.",
            Self::E_COMM_DATA_LOST => "Communications error with the smart card.",
            Self::E_NO_KEY_CONTAINER => "The requested key container does not exist.",
            Self::E_SERVER_TOO_BUSY => "Server is too busy.",
            Self::W_UNSUPPORTED_CARD => "Card is not supported.",
            Self::W_UNRESPONSIVE_CARD => "Card is unresponsive.",
            Self::W_UNPOWERED_CARD => "Card is unpowered.",
            Self::W_RESET_CARD => "Card was reset.",
            Self::W_REMOVED_CARD => "Card was removed.",
            Self::W_SECURITY_VIOLATION => "Access was denied because of a security violation.",
            Self::W_WRONG_CHV => "The card cannot be accessed because the wrong PIN was presented.",
            Self::W_CHV_BLOCKED => "The maximum number of PIN entry attempts has been reached.",
            Self::W_EOF => "The end of the smart card file has been reached.",
            Self::W_CANCELLED_BY_USER => "The user pressed \"Cancel\" on a Smart Card Selection Dialog.",
            Self::W_CARD_NOT_AUTHENTICATED => "No PIN was presented to the smart card.",
            _ => "Unknown status code.",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ContextInvalid,
    HandleInvalid,
    ReaderUnavailable,
    CardAbsent,
    CardReset,
    SharingViolation,
    ProtocolMismatch,
    InsufficientBuffer,
    Timeout,
    Cancelled,
    ServiceUnavailable,
    InvalidParameter,
    Other,
}

/// Which kind of handle an entry point was called with.
///
/// The native layer reports a stale context and a stale card handle with
/// the same code, so the caller side has to tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    Context,
    Card,
}

/// A failure status reported by the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("scard: error({code}): {}", code.message())]
pub struct NativeError {
    code: StatusCode,
    kind: ErrorKind,
}

impl NativeError {
    pub(crate) fn new(code: StatusCode, target: Target) -> Self {
        Self {
            code,
            kind: classify(code, target),
        }
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &'static str {
        self.code.message()
    }
}

fn classify(code: StatusCode, target: Target) -> ErrorKind {
    match code {
        StatusCode::E_INVALID_HANDLE => match target {
            Target::Context => ErrorKind::ContextInvalid,
            Target::Card => ErrorKind::HandleInvalid,
        },
        StatusCode::E_UNKNOWN_READER
        | StatusCode::E_READER_UNAVAILABLE
        | StatusCode::E_READER_UNSUPPORTED
        | StatusCode::E_NO_READERS_AVAILABLE
        | StatusCode::E_DUPLICATE_READER => ErrorKind::ReaderUnavailable,
        StatusCode::E_NO_SMARTCARD
        | StatusCode::W_REMOVED_CARD
        | StatusCode::W_UNPOWERED_CARD
        | StatusCode::W_UNRESPONSIVE_CARD => ErrorKind::CardAbsent,
        StatusCode::W_RESET_CARD => ErrorKind::CardReset,
        StatusCode::E_SHARING_VIOLATION => ErrorKind::SharingViolation,
        StatusCode::E_PROTO_MISMATCH
        | StatusCode::E_PCI_TOO_SMALL
        | StatusCode::E_CARD_UNSUPPORTED
        | StatusCode::W_UNSUPPORTED_CARD => ErrorKind::ProtocolMismatch,
        StatusCode::E_INSUFFICIENT_BUFFER => ErrorKind::InsufficientBuffer,
        StatusCode::E_TIMEOUT | StatusCode::F_WAITED_TOO_LONG => ErrorKind::Timeout,
        StatusCode::E_CANCELLED
        | StatusCode::E_SYSTEM_CANCELLED
        | StatusCode::W_CANCELLED_BY_USER => ErrorKind::Cancelled,
        StatusCode::E_NO_SERVICE | StatusCode::E_SERVICE_STOPPED | StatusCode::P_SHUTDOWN => {
            ErrorKind::ServiceUnavailable
        }
        StatusCode::E_INVALID_PARAMETER | StatusCode::E_INVALID_VALUE => {
            ErrorKind::InvalidParameter
        }
        _ => ErrorKind::Other,
    }
}

/// Errors surfaced by the client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Native(#[from] NativeError),

    #[error("failed to establish resource manager context: {0}")]
    EstablishFailed(#[source] NativeError),

    #[error("active protocol {0} cannot carry APDUs")]
    UnsupportedProtocol(Protocol),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("invalid reader name: {0:?}")]
    InvalidName(String),

    #[error("fill phase reported {actual} elements but size query reported {expected}")]
    BufferChanged { expected: usize, actual: usize },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Native(e) | Self::EstablishFailed(e) => e.kind(),
            Self::UnsupportedProtocol(_) => ErrorKind::ProtocolMismatch,
            Self::InvalidArgument(_) | Self::InvalidName(_) => ErrorKind::InvalidParameter,
            Self::BufferChanged { .. } => ErrorKind::InsufficientBuffer,
        }
    }

    /// Raw status code, when the error came from the native layer.
    pub fn code(&self) -> Option<StatusCode> {
        match self {
            Self::Native(e) | Self::EstablishFailed(e) => Some(e.code()),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Turns a status code into `Ok(())` or the matching typed error.
pub(crate) fn check(code: StatusCode, target: Target) -> Result<()> {
    if code.is_success() {
        Ok(())
    } else {
        Err(Error::Native(NativeError::new(code, target)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_is_ok() {
        assert!(check(StatusCode::SUCCESS, Target::Card).is_ok());
    }

    #[test]
    fn test_invalid_handle_depends_on_target() {
        let ctx = check(StatusCode::E_INVALID_HANDLE, Target::Context).unwrap_err();
        let card = check(StatusCode::E_INVALID_HANDLE, Target::Card).unwrap_err();
        assert_eq!(ctx.kind(), ErrorKind::ContextInvalid);
        assert_eq!(card.kind(), ErrorKind::HandleInvalid);
        assert_eq!(ctx.code(), Some(StatusCode::E_INVALID_HANDLE));
    }

    #[test]
    fn test_categories() {
        let cases = [
            (StatusCode::E_UNKNOWN_READER, ErrorKind::ReaderUnavailable),
            (StatusCode::E_NO_SMARTCARD, ErrorKind::CardAbsent),
            (StatusCode::W_REMOVED_CARD, ErrorKind::CardAbsent),
            (StatusCode::W_RESET_CARD, ErrorKind::CardReset),
            (StatusCode::E_SHARING_VIOLATION, ErrorKind::SharingViolation),
            (StatusCode::E_PROTO_MISMATCH, ErrorKind::ProtocolMismatch),
            (StatusCode::E_INSUFFICIENT_BUFFER, ErrorKind::InsufficientBuffer),
            (StatusCode::E_TIMEOUT, ErrorKind::Timeout),
            (StatusCode::E_CANCELLED, ErrorKind::Cancelled),
            (StatusCode::E_NO_SERVICE, ErrorKind::ServiceUnavailable),
        ];
        for (code, kind) in cases {
            assert_eq!(NativeError::new(code, Target::Card).kind(), kind, "{code}");
        }
    }

    #[test]
    fn test_unknown_code_passes_through() {
        let err = check(StatusCode(0x1234_5678), Target::Card).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
        assert_eq!(err.code(), Some(StatusCode(0x1234_5678)));
        assert!(err.to_string().contains("0x12345678"));
        assert!(err.to_string().contains("Unknown status code."));
    }

    #[test]
    fn test_display_includes_code_and_message() {
        let err = NativeError::new(StatusCode::E_NO_SMARTCARD, Target::Card);
        assert_eq!(
            err.to_string(),
            "scard: error(0x8010000c): No smart card inserted."
        );
    }

    #[test]
    fn test_non_native_errors() {
        let err = Error::UnsupportedProtocol(Protocol::Raw);
        assert_eq!(err.kind(), ErrorKind::ProtocolMismatch);
        assert_eq!(err.code(), None);
        assert_eq!(
            Error::InvalidArgument("empty command").kind(),
            ErrorKind::InvalidParameter
        );
    }
}

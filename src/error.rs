//! Status taxonomy and service-level error types.
//!
//! [`Status`] is the only typed value that crosses the process boundary
//! besides raw bytes. Its numeric space is closed and additive: new codes
//! are appended, existing codes are never renumbered. Co-processor codes
//! without a name of their own are preserved as [`Status::Applet`] /
//! [`Status::Runtime`] so the caller sees them unchanged.
//!
//! [`Error`] covers failures that never reach the wire (configuration,
//! start-up). All variants are `Copy` so they can be passed around freely.

use core::fmt;

// ---------------------------------------------------------------------------
// Wire status codes
// ---------------------------------------------------------------------------

/// Result code carried as the first field of every reply envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// 0 — call completed, every declared output is valid.
    Success,

    // ── Common (10–16) ──────────────────────────────────────────
    InternalError,
    /// Output buffer too small; the reply carries the corrected length(s).
    InsufficientBuffer,
    Memory,
    InvalidInput,
    NotImplemented,
    CommsError,
    /// Request cannot be executed in the current session state.
    InvalidRequest,

    // ── Library (101–122) ───────────────────────────────────────
    LibraryNotInitialized,
    FwUpdateFailed,
    FwUpdateInProgress,
    FwUpdateCallFailed,
    FwUpdateNoneAvailable,
    FwUpdateServiceBusy,
    FwUpdateNotReady,
    NotRegisteredForEvents,
    AlreadyRegistered,
    EventsNotSupported,

    // ── Applet management (150–163) ─────────────────────────────
    AppletFatal,
    AppletMissingSrc,
    AppletAuthFailed,
    AppletFileError,
    AppletNotInstalled,
    InvalidAppId,
    AppletInvalidFileExt,
    AppletFileErrorRead,
    AppletInvalidFormat,
    AppletAppIdMismatch,
    MaxAppletsInstalled,
    AppletInstallFailed,
    AppletUninstallFailed,
    AppletSessionUnavailable,

    // ── Instance API (170–172) ──────────────────────────────────
    InvalidInstanceId,
    ClosingInstanceId,
    InvalidProcess,

    // ── Embedded app (201–299) ──────────────────────────────────
    AppletInvalidHandle,
    AppletUnexpectedCall,
    AppletInvalidToken,
    AppletInvalidMessage,
    AppletInvalidType,
    AppletInvalidLength,
    /// Any other embedded-app code, passed through verbatim.
    Applet(u32),
    /// 301 — protocol error between host library and embedded app.
    ProtoError,

    // ── Runtime / instance layer (401–499) ──────────────────────
    RuntimeInternalError,
    RuntimeNotInitialized,
    DriverAccessDenied,
    DriverNotFound,
    InstanceUnavailable,
    InstanceAlreadyAvailable,
    DeviceIdNotSet,
    CannotDeinitWithOpenInstance,
    /// Any other runtime code.
    Runtime(u32),
    /// Anything outside the known ranges, preserved for the caller.
    Unknown(u32),
}

/// Coarse grouping used by callers to decide how to react to a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Success,
    /// Invalid or missing input; never retried.
    Caller,
    /// Output too small; retry once with the corrected length.
    BufferTooSmall,
    /// Co-processor unreachable; the whole call may be retried later.
    Transport,
    /// Local allocation failure.
    Resource,
    /// Protocol misuse relative to the session state.
    SessionState,
    /// Opaque failure reported by the co-processor.
    Applet,
    NotImplemented,
    Internal,
}

impl Status {
    /// Numeric wire value.
    pub const fn code(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::InternalError => 10,
            Self::InsufficientBuffer => 11,
            Self::Memory => 12,
            Self::InvalidInput => 13,
            Self::NotImplemented => 14,
            Self::CommsError => 15,
            Self::InvalidRequest => 16,
            Self::LibraryNotInitialized => 101,
            Self::FwUpdateFailed => 105,
            Self::FwUpdateInProgress => 106,
            Self::FwUpdateCallFailed => 107,
            Self::FwUpdateNoneAvailable => 108,
            Self::FwUpdateServiceBusy => 109,
            Self::FwUpdateNotReady => 110,
            Self::NotRegisteredForEvents => 120,
            Self::AlreadyRegistered => 121,
            Self::EventsNotSupported => 122,
            Self::AppletFatal => 150,
            Self::AppletMissingSrc => 151,
            Self::AppletAuthFailed => 152,
            Self::AppletFileError => 153,
            Self::AppletNotInstalled => 154,
            Self::InvalidAppId => 155,
            Self::AppletInvalidFileExt => 156,
            Self::AppletFileErrorRead => 157,
            Self::AppletInvalidFormat => 158,
            Self::AppletAppIdMismatch => 159,
            Self::MaxAppletsInstalled => 160,
            Self::AppletInstallFailed => 161,
            Self::AppletUninstallFailed => 162,
            Self::AppletSessionUnavailable => 163,
            Self::InvalidInstanceId => 170,
            Self::ClosingInstanceId => 171,
            Self::InvalidProcess => 172,
            Self::AppletInvalidHandle => 201,
            Self::AppletUnexpectedCall => 202,
            Self::AppletInvalidToken => 207,
            Self::AppletInvalidMessage => 208,
            Self::AppletInvalidType => 209,
            Self::AppletInvalidLength => 210,
            Self::ProtoError => 301,
            Self::RuntimeInternalError => 401,
            Self::RuntimeNotInitialized => 402,
            Self::DriverAccessDenied => 403,
            Self::DriverNotFound => 404,
            Self::InstanceUnavailable => 405,
            Self::InstanceAlreadyAvailable => 406,
            Self::DeviceIdNotSet => 407,
            Self::CannotDeinitWithOpenInstance => 408,
            Self::Applet(code) | Self::Runtime(code) | Self::Unknown(code) => code,
        }
    }

    /// Inverse of [`code`](Self::code). Total: unknown values are preserved.
    pub const fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Success,
            10 => Self::InternalError,
            11 => Self::InsufficientBuffer,
            12 => Self::Memory,
            13 => Self::InvalidInput,
            14 => Self::NotImplemented,
            15 => Self::CommsError,
            16 => Self::InvalidRequest,
            101 => Self::LibraryNotInitialized,
            105 => Self::FwUpdateFailed,
            106 => Self::FwUpdateInProgress,
            107 => Self::FwUpdateCallFailed,
            108 => Self::FwUpdateNoneAvailable,
            109 => Self::FwUpdateServiceBusy,
            110 => Self::FwUpdateNotReady,
            120 => Self::NotRegisteredForEvents,
            121 => Self::AlreadyRegistered,
            122 => Self::EventsNotSupported,
            150 => Self::AppletFatal,
            151 => Self::AppletMissingSrc,
            152 => Self::AppletAuthFailed,
            153 => Self::AppletFileError,
            154 => Self::AppletNotInstalled,
            155 => Self::InvalidAppId,
            156 => Self::AppletInvalidFileExt,
            157 => Self::AppletFileErrorRead,
            158 => Self::AppletInvalidFormat,
            159 => Self::AppletAppIdMismatch,
            160 => Self::MaxAppletsInstalled,
            161 => Self::AppletInstallFailed,
            162 => Self::AppletUninstallFailed,
            163 => Self::AppletSessionUnavailable,
            170 => Self::InvalidInstanceId,
            171 => Self::ClosingInstanceId,
            172 => Self::InvalidProcess,
            201 => Self::AppletInvalidHandle,
            202 => Self::AppletUnexpectedCall,
            207 => Self::AppletInvalidToken,
            208 => Self::AppletInvalidMessage,
            209 => Self::AppletInvalidType,
            210 => Self::AppletInvalidLength,
            203..=206 | 211..=299 => Self::Applet(code),
            301 => Self::ProtoError,
            401 => Self::RuntimeInternalError,
            402 => Self::RuntimeNotInitialized,
            403 => Self::DriverAccessDenied,
            404 => Self::DriverNotFound,
            405 => Self::InstanceUnavailable,
            406 => Self::InstanceAlreadyAvailable,
            407 => Self::DeviceIdNotSet,
            408 => Self::CannotDeinitWithOpenInstance,
            409..=499 => Self::Runtime(code),
            _ => Self::Unknown(code),
        }
    }

    /// Wire representation (status fields are signed 32-bit).
    pub const fn to_wire(self) -> i32 {
        self.code() as i32
    }

    pub const fn from_wire(raw: i32) -> Self {
        Self::from_code(raw as u32)
    }

    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    pub const fn class(self) -> ErrorClass {
        match self {
            Self::Success => ErrorClass::Success,
            Self::InsufficientBuffer => ErrorClass::BufferTooSmall,
            Self::InvalidInput
            | Self::InvalidAppId
            | Self::AppletMissingSrc
            | Self::AppletInvalidFileExt
            | Self::InvalidInstanceId
            | Self::InvalidProcess => ErrorClass::Caller,
            Self::CommsError
            | Self::RuntimeNotInitialized
            | Self::DriverAccessDenied
            | Self::DriverNotFound
            | Self::DeviceIdNotSet => ErrorClass::Transport,
            Self::Memory => ErrorClass::Resource,
            Self::InvalidRequest
            | Self::LibraryNotInitialized
            | Self::NotRegisteredForEvents
            | Self::AlreadyRegistered
            | Self::EventsNotSupported
            | Self::AppletNotInstalled
            | Self::AppletSessionUnavailable
            | Self::ClosingInstanceId
            | Self::InstanceUnavailable
            | Self::InstanceAlreadyAvailable
            | Self::CannotDeinitWithOpenInstance => ErrorClass::SessionState,
            Self::NotImplemented => ErrorClass::NotImplemented,
            Self::InternalError
            | Self::RuntimeInternalError
            | Self::Runtime(_)
            | Self::Unknown(_) => ErrorClass::Internal,
            Self::FwUpdateFailed
            | Self::FwUpdateInProgress
            | Self::FwUpdateCallFailed
            | Self::FwUpdateNoneAvailable
            | Self::FwUpdateServiceBusy
            | Self::FwUpdateNotReady
            | Self::AppletFatal
            | Self::AppletAuthFailed
            | Self::AppletFileError
            | Self::AppletFileErrorRead
            | Self::AppletInvalidFormat
            | Self::AppletAppIdMismatch
            | Self::MaxAppletsInstalled
            | Self::AppletInstallFailed
            | Self::AppletUninstallFailed
            | Self::AppletInvalidHandle
            | Self::AppletUnexpectedCall
            | Self::AppletInvalidToken
            | Self::AppletInvalidMessage
            | Self::AppletInvalidType
            | Self::AppletInvalidLength
            | Self::Applet(_)
            | Self::ProtoError => ErrorClass::Applet,
        }
    }

    /// Only transport failures are worth retrying as a whole call.
    pub const fn is_retryable(self) -> bool {
        matches!(self.class(), ErrorClass::Transport)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::InternalError => write!(f, "internal error"),
            Self::InsufficientBuffer => write!(f, "output buffer length insufficient"),
            Self::Memory => write!(f, "unable to allocate memory"),
            Self::InvalidInput => write!(f, "invalid input"),
            Self::NotImplemented => write!(f, "not implemented"),
            Self::CommsError => write!(f, "communication error with co-processor"),
            Self::InvalidRequest => write!(f, "request invalid in current state"),
            Self::LibraryNotInitialized => write!(f, "library not initialized"),
            Self::FwUpdateFailed => write!(f, "firmware update failed"),
            Self::FwUpdateInProgress => write!(f, "firmware update in progress"),
            Self::FwUpdateCallFailed => write!(f, "firmware update call failed"),
            Self::FwUpdateNoneAvailable => write!(f, "no firmware update available"),
            Self::FwUpdateServiceBusy => write!(f, "firmware update service busy"),
            Self::FwUpdateNotReady => write!(f, "firmware update component not ready"),
            Self::NotRegisteredForEvents => write!(f, "not registered for events"),
            Self::AlreadyRegistered => write!(f, "already registered for events"),
            Self::EventsNotSupported => write!(f, "events not supported in shared mode"),
            Self::AppletFatal => write!(f, "embedded app fatal error"),
            Self::AppletMissingSrc => write!(f, "embedded app source missing"),
            Self::AppletAuthFailed => write!(f, "embedded app authentication failed"),
            Self::AppletFileError => write!(f, "embedded app file error"),
            Self::AppletNotInstalled => write!(f, "embedded app not installed"),
            Self::InvalidAppId => write!(f, "invalid app id"),
            Self::AppletInvalidFileExt => write!(f, "invalid embedded app file extension"),
            Self::AppletFileErrorRead => write!(f, "could not read embedded app file"),
            Self::AppletInvalidFormat => write!(f, "invalid embedded app format"),
            Self::AppletAppIdMismatch => write!(f, "embedded app id mismatch"),
            Self::MaxAppletsInstalled => write!(f, "maximum embedded apps installed"),
            Self::AppletInstallFailed => write!(f, "embedded app install failed"),
            Self::AppletUninstallFailed => write!(f, "embedded app uninstall failed"),
            Self::AppletSessionUnavailable => write!(f, "no exclusive embedded app session"),
            Self::InvalidInstanceId => write!(f, "invalid instance id"),
            Self::ClosingInstanceId => write!(f, "instance is closing"),
            Self::InvalidProcess => write!(f, "instance owned by another process"),
            Self::AppletInvalidHandle => write!(f, "embedded app: invalid handle"),
            Self::AppletUnexpectedCall => write!(f, "embedded app: unexpected call"),
            Self::AppletInvalidToken => write!(f, "embedded app: invalid token"),
            Self::AppletInvalidMessage => write!(f, "embedded app: invalid message"),
            Self::AppletInvalidType => write!(f, "embedded app: invalid data type"),
            Self::AppletInvalidLength => write!(f, "embedded app: invalid length"),
            Self::Applet(code) => write!(f, "embedded app error {code}"),
            Self::ProtoError => write!(f, "embedded app protocol error"),
            Self::RuntimeInternalError => write!(f, "runtime internal error"),
            Self::RuntimeNotInitialized => write!(f, "runtime not initialized"),
            Self::DriverAccessDenied => write!(f, "access to the device driver denied"),
            Self::DriverNotFound => write!(f, "device driver not found"),
            Self::InstanceUnavailable => write!(f, "instance unavailable"),
            Self::InstanceAlreadyAvailable => write!(f, "instance already available"),
            Self::DeviceIdNotSet => write!(f, "device id not set"),
            Self::CannotDeinitWithOpenInstance => write!(f, "cannot deinit with an open instance"),
            Self::Runtime(code) => write!(f, "runtime error {code}"),
            Self::Unknown(code) => write!(f, "unknown status {code}"),
        }
    }
}

impl std::error::Error for Status {}

// ---------------------------------------------------------------------------
// Local (non-wire) errors
// ---------------------------------------------------------------------------

/// Failures that stay inside the daemon process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Configuration is invalid or could not be loaded.
    Config(&'static str),
    /// A subsystem failed to start.
    Init(&'static str),
    /// A wire operation failed with the given status.
    Status(Status),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Init(msg) => write!(f, "init: {msg}"),
            Self::Status(s) => write!(f, "status {}: {s}", s.code()),
        }
    }
}

impl std::error::Error for Error {}

impl From<Status> for Error {
    fn from(s: Status) -> Self {
        Self::Status(s)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_round_trip() {
        for code in [0, 10, 11, 12, 13, 14, 15, 16, 101, 121, 154, 163, 170, 172, 301] {
            let s = Status::from_code(code);
            assert!(!matches!(s, Status::Unknown(_)), "code {code} should be named");
            assert_eq!(s.code(), code);
        }
    }

    #[test]
    fn applet_range_passes_through() {
        assert_eq!(Status::from_code(201), Status::AppletInvalidHandle);
        assert_eq!(Status::from_code(224), Status::Applet(224));
        assert_eq!(Status::from_code(299).class(), ErrorClass::Applet);
        assert_eq!(Status::from_code(406), Status::InstanceAlreadyAvailable);
        assert_eq!(Status::from_code(450), Status::Runtime(450));
    }

    #[test]
    fn every_code_in_the_named_ranges_round_trips() {
        for code in (0..=500).chain([9999, u32::MAX]) {
            assert_eq!(Status::from_code(code).code(), code);
        }
        assert_eq!(Status::DriverNotFound.class(), ErrorClass::Transport);
        assert_eq!(Status::InstanceUnavailable.class(), ErrorClass::SessionState);
    }

    #[test]
    fn unknown_codes_are_preserved() {
        let s = Status::from_code(9999);
        assert_eq!(s, Status::Unknown(9999));
        assert_eq!(s.code(), 9999);
        assert_eq!(Status::from_wire(-1).code(), u32::MAX);
    }

    #[test]
    fn classes_separate_the_taxonomy() {
        assert_eq!(Status::InsufficientBuffer.class(), ErrorClass::BufferTooSmall);
        assert_eq!(Status::InvalidInput.class(), ErrorClass::Caller);
        assert_eq!(Status::AlreadyRegistered.class(), ErrorClass::SessionState);
        assert_eq!(Status::Memory.class(), ErrorClass::Resource);
        assert_eq!(Status::NotImplemented.class(), ErrorClass::NotImplemented);
        assert!(Status::CommsError.is_retryable());
        assert!(!Status::InvalidRequest.is_retryable());
        assert!(!Status::InsufficientBuffer.is_retryable());
    }

    #[test]
    fn error_display_includes_code() {
        let e = Error::from(Status::CommsError);
        assert_eq!(e.to_string(), "status 15: communication error with co-processor");
        assert_eq!(Error::Config("bad").to_string(), "config: bad");
    }
}

// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Status values returned across the trust boundary.

use core::fmt::{self, Display, Formatter};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The call completed successfully.
pub const SUCCESS: i32 = 0;

/// The service exists but cannot accept the call right now. The caller may retry.
pub const SERVICE_BUSY: i32 = 1;

/// Values from `SERVICE_BUSY + 1` up to (but excluding) this are reserved by the core. A service
/// function must never return one of them.
pub const SERVICE_SPECIFIC_ERROR_MIN: i32 = 0x20;

/// Version of the PSA Firmware Framework implemented by the IPC model.
pub const PSA_FRAMEWORK_VERSION: u32 = 0x0100;

/// Returned by a version query for a service which doesn't exist or which the caller may not use.
pub const PSA_VERSION_NONE: u32 = 0;

/// Errors reported by the core.
///
/// Every variant is delivered to the caller as its (negative) discriminant; no other channel exists
/// to report an error across the boundary.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum Error {
    /// A non-secure request arrived while a secure call chain was already active.
    SecureDomainLocked = -2,
    /// A request descriptor, buffer or argument was malformed.
    InvalidParameter = -3,
    /// The target partition is already on the current call chain.
    ServiceNonReentrant = -4,
    /// A non-secure request was trapped from thread mode.
    NsThreadModeCall = -5,
    /// The partition database hasn't been initialised.
    NotInitialized = -6,
    /// A service-level primitive was used while no partition was running.
    NoActivePartition = -7,
    /// The trap came from an execution mode which isn't allowed for this kind of request.
    InvalidExcMode = -8,
    /// The target partition isn't in a state which allows it to be locked.
    SecureLockFailed = -9,
    /// Unlock was requested with no secure partition running.
    SecureUnlockFailed = -10,
    /// A saved context didn't hold the value the engine stored in it.
    ContextCorrupted = -11,
    /// The target partition's message queue has no free slot.
    QueueFull = -12,
    /// The request code isn't implemented.
    NotSupported = -13,
    /// A partition used a PSA service primitive in a way that the framework forbids.
    ProgrammerError = -14,
    /// The service refused the connection, or the caller may not use it.
    ConnectionRefused = -15,
    /// The requested data doesn't exist.
    NotFound = -16,
    /// Anything else.
    Generic = -31,
}

impl Error {
    /// Returns whether this error means that the dispatcher state can no longer be trusted.
    ///
    /// Such errors must never be returned to a caller; the core halts instead.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::SecureUnlockFailed | Self::ContextCorrupted)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let description = match self {
            Self::SecureDomainLocked => "secure domain locked",
            Self::InvalidParameter => "invalid parameter",
            Self::ServiceNonReentrant => "service is not reentrant",
            Self::NsThreadModeCall => "non-secure call from thread mode",
            Self::NotInitialized => "not initialised",
            Self::NoActivePartition => "no active partition",
            Self::InvalidExcMode => "invalid exception mode",
            Self::SecureLockFailed => "secure lock failed",
            Self::SecureUnlockFailed => "secure unlock failed",
            Self::ContextCorrupted => "saved context corrupted",
            Self::QueueFull => "message queue full",
            Self::NotSupported => "not supported",
            Self::ProgrammerError => "programmer error",
            Self::ConnectionRefused => "connection refused",
            Self::NotFound => "not found",
            Self::Generic => "generic error",
        };
        write!(f, "{description} ({})", i32::from(*self))
    }
}

/// Converts the result of a core operation to the status which is written back to the caller.
pub fn status_of(result: Result<(), Error>) -> i32 {
    match result {
        Ok(()) => SUCCESS,
        Err(error) => error.into(),
    }
}

/// How the value returned by a service function must be treated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServiceReturn {
    /// Pass the value on to the caller unchanged.
    Relay(i32),
    /// The service returned a value reserved by the core.
    Reserved(i32),
}

/// Classifies the return value of a service function.
pub fn check_service_return(value: i32) -> ServiceReturn {
    match value {
        SUCCESS | SERVICE_BUSY => ServiceReturn::Relay(value),
        value if value > SUCCESS && value < SERVICE_SPECIFIC_ERROR_MIN => {
            ServiceReturn::Reserved(value)
        }
        value => ServiceReturn::Relay(value),
    }
}

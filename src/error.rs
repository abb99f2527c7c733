//! Error types shared by the engine.
//!
//! `FfaError` is the status code a partition sees in `x2` of an `FFA_ERROR`
//! return. `Error` is what engine operations return internally; several
//! variants collapse onto the same wire code.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// FF-A status codes (DEN0077A Table 2.3).
#[derive(Clone, Copy, Debug, Eq, Error, IntoPrimitive, PartialEq, TryFromPrimitive)]
#[repr(i32)]
pub enum FfaError {
    #[error("Not supported")]
    NotSupported = -1,
    #[error("Invalid parameters")]
    InvalidParameters = -2,
    #[error("No memory")]
    NoMemory = -3,
    #[error("Busy")]
    Busy = -4,
    #[error("Interrupted")]
    Interrupted = -5,
    #[error("Denied")]
    Denied = -6,
    #[error("Retry")]
    Retry = -7,
    #[error("Aborted")]
    Aborted = -8,
    #[error("No data")]
    NoData = -9,
}

/// Engine error.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("unknown function id {0:#x}")]
    UnknownFunction(u64),
    #[error("operation not supported")]
    NotSupported,
    #[error("invalid parameters")]
    InvalidParameters,
    /// Handle or vCPU is not in a state that allows the transition.
    #[error("invalid state for requested transition")]
    InvalidState,
    #[error("access denied")]
    Denied,
    #[error("target busy")]
    Busy,
    #[error("out of resources")]
    NoMemory,
    #[error("interrupted")]
    Interrupted,
    #[error("retry")]
    Retry,
    #[error("aborted")]
    Aborted,
    #[error("no data")]
    NoData,
    #[error("fragment rejected: {0}")]
    Fragment(FragmentError),
}

/// Reasons a multi-fragment transfer session is torn down.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum FragmentError {
    #[error("expected sequence {expected}, got {got}")]
    OutOfOrder { expected: u32, got: u32 },
    #[error("fragment length {0} invalid")]
    BadLength(u32),
    #[error("fragments exceed declared total")]
    Overrun,
    #[error("no session for handle")]
    UnknownSession,
    #[error("session owned by another partition")]
    WrongSender,
}

impl Error {
    /// Status code reported to the calling partition.
    pub fn ffa_code(self) -> FfaError {
        match self {
            Error::UnknownFunction(_) | Error::NotSupported => FfaError::NotSupported,
            Error::InvalidParameters | Error::Fragment(_) => FfaError::InvalidParameters,
            Error::InvalidState | Error::Denied => FfaError::Denied,
            Error::Busy => FfaError::Busy,
            Error::NoMemory => FfaError::NoMemory,
            Error::Interrupted => FfaError::Interrupted,
            Error::Retry => FfaError::Retry,
            Error::Aborted => FfaError::Aborted,
            Error::NoData => FfaError::NoData,
        }
    }
}

impl From<FfaError> for Error {
    fn from(code: FfaError) -> Self {
        match code {
            FfaError::NotSupported => Error::NotSupported,
            FfaError::InvalidParameters => Error::InvalidParameters,
            FfaError::NoMemory => Error::NoMemory,
            FfaError::Busy => Error::Busy,
            FfaError::Interrupted => Error::Interrupted,
            FfaError::Denied => Error::Denied,
            FfaError::Retry => Error::Retry,
            FfaError::Aborted => Error::Aborted,
            FfaError::NoData => Error::NoData,
        }
    }
}

impl From<FragmentError> for Error {
    fn from(e: FragmentError) -> Self {
        Error::Fragment(e)
    }
}

pub type Result<T> = core::result::Result<T, Error>;

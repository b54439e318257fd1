use std::cell::Cell;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Error kinds recorded in the scheduler-wide error slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ErrorCode {
    #[default]
    None,
    NoChannel,
    WouldBlock,
    NotImplemented,
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::None => write!(f, "none"),
            ErrorCode::NoChannel => write!(f, "no channel"),
            ErrorCode::WouldBlock => write!(f, "would block"),
            ErrorCode::NotImplemented => write!(f, "not implemented"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// The handle does not name an open channel: never opened, closed, or
    /// closed and reopened while the caller was parked.
    #[error("No such channel")]
    NoChannel,
    /// A non-blocking operation could not complete right now.
    #[error("Operation would block")]
    WouldBlock,
    /// The entry point is disabled in the bus configuration.
    #[error("Not implemented")]
    NotImplemented,
}

impl BusError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BusError::NoChannel => ErrorCode::NoChannel,
            BusError::WouldBlock => ErrorCode::WouldBlock,
            BusError::NotImplemented => ErrorCode::NotImplemented,
        }
    }

    /// Records this error in the error slot and hands it back, so failure
    /// paths read `return Err(BusError::NoChannel.raise())`.
    pub fn raise(self) -> Self {
        set_last_error(self.code());
        self
    }
}

impl From<BusError> for ErrorCode {
    fn from(err: BusError) -> Self {
        err.code()
    }
}

pub type BusResult<T> = Result<T, BusError>;

// One slot per thread: a cooperative scheduler runs all of its tasks on the
// thread that drives it, so this is shared by every task of that scheduler.
thread_local! {
    static LAST_ERROR: Cell<ErrorCode> = const { Cell::new(ErrorCode::None) };
}

/// The most recent error raised by any bus operation on this scheduler.
///
/// Only meaningful right after an operation reported failure; successful
/// operations leave the slot untouched.
pub fn last_error() -> ErrorCode {
    LAST_ERROR.with(|slot| slot.get())
}

pub fn set_last_error(code: ErrorCode) {
    LAST_ERROR.with(|slot| slot.set(code));
}

//! IPC Error Taxonomy
//!
//! Every failure the IPC core can report is an [`IpcError`]. Errors are
//! recovered locally and surfaced to the offending (or waiting) task as an
//! ordinary return value; answers carry them in the return-value slot of the
//! call vector as a negative errno.
//!
//! Only internal invariant violations (a call observed in two queues at
//! once) are fatal, and those are `panic!`s at the point of detection.

use thiserror::Error;

/// Raw errno as carried in a call's return-value slot.
pub type Errno = isize;

/// Success, as carried in a return-value word.
pub const EOK: usize = 0;

/// IPC error types
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpcError {
    /// Handle not present in the capability table (or stale generation)
    #[error("capability handle not found")]
    NotFound,

    /// Out of memory for a call, buffer or table entry
    #[error("out of memory")]
    NoMemory,

    /// A configured limit was hit
    #[error("limit exceeded")]
    Limit,

    /// The call could not be forwarded to its new destination
    #[error("forwarding failed")]
    Forwarded,

    /// Operation not permitted
    #[error("permission denied")]
    Permission,

    /// The connection or the mailbox behind it is gone
    #[error("connection hung up")]
    HungUp,

    /// The receiving party could not accept the call
    #[error("receiving party failed")]
    Party,

    /// The object already exists
    #[error("already exists")]
    Exists,

    /// An address did not resolve in the relevant address space
    #[error("bad memory reference")]
    BadMemory,

    /// Method not serviced by the receiver
    #[error("operation not supported")]
    NotSupported,

    /// Malformed argument
    #[error("invalid argument")]
    Invalid,

    /// Payload larger than the negotiated limit
    #[error("payload exceeds transfer limit")]
    Overflow,

    /// Sleep interrupted
    #[error("interrupted")]
    Interrupted,

    /// Sleep timed out (or a non-blocking poll found nothing)
    #[error("timed out")]
    TimedOut,

    /// Handle names an object of a different kind
    #[error("capability names an object of the wrong kind")]
    WrongKind,

    /// Connection was never established
    #[error("connection not established")]
    NoEntry,
}

pub type Result<T> = core::result::Result<T, IpcError>;

impl IpcError {
    const ALL: [IpcError; 16] = [
        IpcError::NotFound,
        IpcError::NoMemory,
        IpcError::Limit,
        IpcError::Forwarded,
        IpcError::Permission,
        IpcError::HungUp,
        IpcError::Party,
        IpcError::Exists,
        IpcError::BadMemory,
        IpcError::NotSupported,
        IpcError::Invalid,
        IpcError::Overflow,
        IpcError::Interrupted,
        IpcError::TimedOut,
        IpcError::WrongKind,
        IpcError::NoEntry,
    ];

    /// Negative errno for this error
    pub const fn errno(self) -> Errno {
        match self {
            IpcError::NotFound => -1,
            IpcError::NoMemory => -2,
            IpcError::Limit => -3,
            IpcError::Forwarded => -4,
            IpcError::Permission => -5,
            IpcError::HungUp => -6,
            IpcError::Party => -7,
            IpcError::Exists => -8,
            IpcError::BadMemory => -9,
            IpcError::NotSupported => -10,
            IpcError::Invalid => -11,
            IpcError::Overflow => -12,
            IpcError::Interrupted => -13,
            IpcError::TimedOut => -14,
            IpcError::WrongKind => -15,
            IpcError::NoEntry => -16,
        }
    }

    /// Map a raw errno back to an error, `None` for success or unknown codes
    pub fn from_errno(errno: Errno) -> Option<Self> {
        Self::ALL.iter().copied().find(|e| e.errno() == errno)
    }

    /// Encode as a return-value word
    #[inline]
    pub const fn to_retval(self) -> usize {
        self.errno() as usize
    }
}

/// Interpret a return-value word: non-negative is success, a known
/// negative errno is the corresponding error.
///
/// Unknown negative values are passed through as success so that servers
/// remain free to use their own return codes.
pub fn check_retval(retval: usize) -> Result<usize> {
    match IpcError::from_errno(retval as Errno) {
        Some(err) => Err(err),
        None => Ok(retval),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_are_unique_and_negative() {
        for (i, a) in IpcError::ALL.iter().enumerate() {
            assert!(a.errno() < 0);
            for b in &IpcError::ALL[i + 1..] {
                assert_ne!(a.errno(), b.errno());
            }
        }
    }

    #[test]
    fn retval_words_decode() {
        assert_eq!(check_retval(0), Ok(0));
        assert_eq!(check_retval(7), Ok(7));
        assert_eq!(check_retval(IpcError::HungUp.to_retval()), Err(IpcError::HungUp));
        assert_eq!(IpcError::from_errno(0), None);
    }
}

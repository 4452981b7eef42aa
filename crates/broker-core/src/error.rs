use std::io;

/// Error kinds surfaced across the C3/C4 boundary (spec §7).
///
/// Triggering callers only ever see one of these, mapped to an errno at the
/// FUSE edge by [`BrokerError::to_errno`].
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("not found")]
    NotFound,

    #[error("busy: {0}")]
    Busy(String),

    #[error("interrupted")]
    Interrupted,

    #[error("timed out")]
    TimedOut,

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("helper failed: {0}")]
    HelperFailed(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl BrokerError {
    /// Maps a broker error to the errno a FUSE reply should carry.
    pub fn to_errno(&self) -> i32 {
        match self {
            BrokerError::NotFound => libc::ENOENT,
            BrokerError::Busy(_) => libc::EBUSY,
            BrokerError::Interrupted => libc::EINTR,
            BrokerError::TimedOut => libc::ETIMEDOUT,
            BrokerError::BadInput(_) => libc::EINVAL,
            BrokerError::HelperFailed(_) => libc::EIO,
            BrokerError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Reconstructs a `BrokerError` from a raw completion code received over
    /// the helper channel (§6.2 `Done.error`).
    pub fn from_code(code: i32) -> Option<BrokerError> {
        match code {
            0 => None,
            e if e == libc::ETIMEDOUT => Some(BrokerError::TimedOut),
            e if e == libc::ENOENT => Some(BrokerError::NotFound),
            e if e == libc::EBUSY => Some(BrokerError::Busy(String::new())),
            e if e == libc::EINTR => Some(BrokerError::Interrupted),
            e if e == libc::EINVAL => Some(BrokerError::BadInput(String::new())),
            _ => Some(BrokerError::HelperFailed(format!("errno {code}"))),
        }
    }

    /// The raw completion code to store in a [`crate::request::Request`] on success.
    pub const OK: i32 = 0;
}

pub type Result<T> = std::result::Result<T, BrokerError>;

use std::{error::Error, fmt};

use backtrace::Backtrace;
use log::error;

/// Result codes of the storage core. Success is expressed by `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The optimistic path could not do the job, retry pessimistically.
    Fail,
    /// The updated record does not fit in the page.
    Overflow,
    /// The updated page would become too empty.
    Underflow,
    OutOfFileSpace,
    /// The request was queued in the lock system, the caller has to
    /// suspend.
    LockWait,
    Deadlock,
    LockWaitTimeout,
    DuplicateKey,
    /// Foreign key violation on the child side.
    NoReferencedRow,
    /// Foreign key violation on the parent side.
    RowIsReferenced,
    /// A consistent read needed an undo record which was already purged.
    MissingHistory,
    RecordNotFound,
    TooBigRecord,
    Corruption,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Fail => "DB_FAIL",
            ErrorCode::Overflow => "DB_OVERFLOW",
            ErrorCode::Underflow => "DB_UNDERFLOW",
            ErrorCode::OutOfFileSpace => "DB_OUT_OF_FILE_SPACE",
            ErrorCode::LockWait => "DB_LOCK_WAIT",
            ErrorCode::Deadlock => "DB_DEADLOCK",
            ErrorCode::LockWaitTimeout => "DB_LOCK_WAIT_TIMEOUT",
            ErrorCode::DuplicateKey => "DB_DUPLICATE_KEY",
            ErrorCode::NoReferencedRow => "DB_NO_REFERENCED_ROW",
            ErrorCode::RowIsReferenced => "DB_ROW_IS_REFERENCED",
            ErrorCode::MissingHistory => "DB_MISSING_HISTORY",
            ErrorCode::RecordNotFound => "DB_RECORD_NOT_FOUND",
            ErrorCode::TooBigRecord => "DB_TOO_BIG_RECORD",
            ErrorCode::Corruption => "DB_CORRUPTION",
            ErrorCode::Internal => "DB_ERROR",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmallError {
    code: ErrorCode,
    details: String,
}

impl SmallError {
    pub fn new(code: ErrorCode, msg: &str) -> SmallError {
        SmallError {
            code,
            details: msg.to_string(),
        }
    }

    /// Shortcut for errors that should never happen on a healthy tree.
    pub fn internal(msg: &str) -> SmallError {
        Self::new(ErrorCode::Internal, msg)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code
    }

    /// Structural failures are handled by switching to the pessimistic
    /// path, they are never surfaced to a transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::Fail | ErrorCode::Overflow | ErrorCode::Underflow
        )
    }

    pub fn show_backtrace(&self) {
        let bt = Backtrace::new();
        error!("error: [{}], backtrace: {:?}", self, bt);
    }
}

impl fmt::Display for SmallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.details)
    }
}

impl Error for SmallError {
    fn description(&self) -> &str {
        &self.details
    }
}

use std::{error::Error, fmt};

use backtrace::Backtrace;

/// Classification of every error the engine can surface. Callers match on
/// the kind; the message is for humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Table / index / row / page does not exist.
    NotFound,
    /// Duplicate table / index / view / trigger.
    AlreadyExists,
    /// A unique index would be violated.
    UniqueViolation,
    /// NOT NULL, CHECK or PRIMARY KEY violated.
    ConstraintViolation,
    /// The transaction was chosen as a deadlock victim. Retryable after
    /// abort.
    Deadlock,
    /// A lock could not be acquired within the configured wait budget.
    LockTimeout,
    /// An insert does not fit in the page. Handled internally by the heap
    /// (new page) and the B+tree (split); never escapes the engine.
    PageFull,
    /// Every cached page is pinned; the caller must unpin before asking for
    /// more pages than the pool capacity.
    BufferPoolFull,
    /// Underlying file IO failed.
    Io,
    /// Decoded bytes violate an invariant of their format.
    Corruption,
    /// A bug in the engine itself.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub struct DbError {
    kind: ErrorKind,
    details: String,
    backtrace: Backtrace,
}

impl DbError {
    pub fn new(kind: ErrorKind, msg: &str) -> Self {
        Self {
            kind,
            details: msg.to_string(),
            backtrace: Backtrace::new_unresolved(),
        }
    }

    pub fn not_found(msg: &str) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    pub fn corruption(msg: &str) -> Self {
        Self::new(ErrorKind::Corruption, msg)
    }

    pub fn internal(msg: &str) -> Self {
        Self::new(ErrorKind::Internal, msg)
    }

    pub fn io(msg: &str) -> Self {
        Self::new(ErrorKind::Io, msg)
    }

    pub fn get_kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn show_backtrace(&self) {
        let mut bt = self.backtrace.clone();
        bt.resolve();
        log::error!("{}\nbacktrace:\n{:?}", self, bt);
    }
}

impl From<std::io::Error> for DbError {
    fn from(e: std::io::Error) -> Self {
        DbError::new(ErrorKind::Io, &e.to_string())
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.details)
    }
}

impl fmt::Debug for DbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Error for DbError {}

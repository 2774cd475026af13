use std::io;

pub type Result<T> = std::result::Result<T, SrError>;

/// Coarse classification of [`SrError`], used by callers that only care
/// about how to react (retry later, report, give up).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Resource,
    LockTimeout,
    NotFound,
    Internal,
    Validation,
    Config,
}

#[derive(Debug, thiserror::Error)]
pub enum SrError {
    /// Memory could not be obtained, including a failed `mmap`.
    #[error("Out of memory: {0}")]
    NoMem(String),

    #[error("System call {call} failed: {source}")]
    Sys {
        call: &'static str,
        #[source]
        source: io::Error,
    },

    /// The deadline expired. The guarded state may be held by a process that
    /// died while holding it; its consistency is unknown.
    #[error("{op} lock timeout expired in {func} (state may be held by a dead process)")]
    LockTimeout { func: String, op: &'static str },

    #[error("{op} lock failed in {func}: {source}")]
    Lock {
        func: String,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Config(#[from] confy::ConfyError),
}

impl SrError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SrError::NoMem(_) | SrError::Sys { .. } => ErrorKind::Resource,
            SrError::LockTimeout { .. } => ErrorKind::LockTimeout,
            SrError::Lock { .. } => ErrorKind::Resource,
            SrError::NotFound(_) => ErrorKind::NotFound,
            SrError::Internal(_) => ErrorKind::Internal,
            SrError::Validation(_) => ErrorKind::Validation,
            SrError::Config(_) => ErrorKind::Config,
        }
    }

    /// Wraps the current `errno` of a failed libc call.
    pub(crate) fn last_sys(call: &'static str) -> SrError {
        SrError::Sys {
            call,
            source: io::Error::last_os_error(),
        }
    }

    pub(crate) fn lock(func: &str, op: &'static str, ret: libc::c_int) -> SrError {
        if ret == libc::ETIMEDOUT {
            SrError::LockTimeout {
                func: func.to_string(),
                op,
            }
        } else {
            SrError::Lock {
                func: func.to_string(),
                op,
                source: io::Error::from_raw_os_error(ret),
            }
        }
    }
}

// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result classes every staged operation collapses into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedOperation,
    Busy,
    NotMounted,
    NotPrivileged,
    Canceled,
    NoResources,
    BadArgument,
    NotFound,
    Internal,
}

impl ErrorKind {
    pub fn code(self) -> u16 {
        match self {
            Self::BadArgument => 400,
            Self::NotPrivileged => 403,
            Self::NotFound => 404,
            Self::NotMounted => 409,
            Self::Busy => 423,
            Self::Canceled => 499,
            Self::Internal => 500,
            Self::UnsupportedOperation => 501,
            Self::NoResources => 507,
        }
    }

    /// Classify an errno value.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EBUSY | libc::ETXTBSY => Self::Busy,
            libc::EPERM | libc::EACCES | libc::EROFS => Self::NotPrivileged,
            libc::ENOENT | libc::ENODEV | libc::ENXIO => Self::NotFound,
            libc::EINVAL | libc::ENAMETOOLONG => Self::BadArgument,
            libc::ENOTSUP | libc::ENOSYS => Self::UnsupportedOperation,
            libc::ENOMEM | libc::ENOSPC | libc::EAGAIN | libc::EMFILE | libc::ENFILE => {
                Self::NoResources
            }
            libc::ECANCELED => Self::Canceled,
            _ => Self::Internal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct ArbiterError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ArbiterError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedOperation, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, message)
    }

    pub fn not_mounted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotMounted, message)
    }

    pub fn not_privileged(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotPrivileged, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled, message)
    }

    pub fn no_resources(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoResources, message)
    }

    pub fn bad_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

impl From<std::io::Error> for ArbiterError {
    fn from(err: std::io::Error) -> Self {
        let kind = err
            .raw_os_error()
            .map(ErrorKind::from_errno)
            .unwrap_or(match err.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                std::io::ErrorKind::PermissionDenied => ErrorKind::NotPrivileged,
                std::io::ErrorKind::InvalidInput => ErrorKind::BadArgument,
                std::io::ErrorKind::Unsupported => ErrorKind::UnsupportedOperation,
                std::io::ErrorKind::OutOfMemory => ErrorKind::NoResources,
                _ => ErrorKind::Internal,
            });
        Self::new(kind, err.to_string())
    }
}

/// A veto against a pending operation, optionally naming the process in the way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dissenter {
    pub status: ArbiterError,
    pub process_id: Option<i32>,
}

impl Dissenter {
    pub fn new(status: ArbiterError) -> Self {
        Self {
            status,
            process_id: None,
        }
    }

    pub fn with_process(status: ArbiterError, process_id: Option<i32>) -> Self {
        Self { status, process_id }
    }

    pub fn kind(&self) -> ErrorKind {
        self.status.kind
    }
}

impl From<ArbiterError> for Dissenter {
    fn from(status: ArbiterError) -> Self {
        Self::new(status)
    }
}

impl std::fmt::Display for Dissenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.process_id {
            Some(pid) => write!(f, "{} (blocked by pid {pid})", self.status),
            None => write!(f, "{}", self.status),
        }
    }
}

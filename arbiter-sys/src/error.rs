// SPDX-License-Identifier: GPL-3.0-only

use arbiter_types::{ArbiterError, ErrorKind};
use thiserror::Error;

/// Error types for host-level operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Errno(#[from] nix::Error),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Invalid mountinfo line: {0}")]
    InvalidMountInfoLine(String),

    #[error("Command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Tool not installed: {0}")]
    ToolMissing(String),
}

impl From<SysError> for ArbiterError {
    fn from(err: SysError) -> Self {
        match err {
            SysError::Io(io) => ArbiterError::from(io),
            SysError::Errno(errno) => {
                ArbiterError::new(ErrorKind::from_errno(errno as i32), errno.desc())
            }
            SysError::DeviceNotFound(device) => {
                ArbiterError::not_found(format!("Device not found: {device}"))
            }
            SysError::ToolMissing(tool) => {
                ArbiterError::unsupported(format!("Tool not installed: {tool}"))
            }
            other => ArbiterError::internal(other.to_string()),
        }
    }
}

/// Result type alias for host operations
pub type Result<T> = std::result::Result<T, SysError>;

//! Client request models

use std::fmt;
use std::path::PathBuf;

use enumflags2::{BitFlags, bitflags};
use serde::{Deserialize, Serialize};

use crate::{DiskDescription, Dissenter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Claim,
    Eject,
    Mount,
    Unmount,
    Probe,
    Rename,
    Refresh,
}

impl RequestKind {
    /// Polkit-style action identifier for kinds that can require elevation.
    pub fn action_id(self) -> Option<&'static str> {
        match self {
            Self::Mount => Some("org.cosmic.ext.disk-arbiter.mount"),
            Self::Unmount => Some("org.cosmic.ext.disk-arbiter.unmount"),
            Self::Eject => Some("org.cosmic.ext.disk-arbiter.eject"),
            Self::Rename => Some("org.cosmic.ext.disk-arbiter.rename"),
            Self::Claim | Self::Probe | Self::Refresh => None,
        }
    }

    /// Whether interested sessions are asked before the request commits.
    pub fn solicits_approval(self) -> bool {
        matches!(self, Self::Claim | Self::Mount | Self::Unmount | Self::Eject)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Claim => "claim",
            Self::Eject => "eject",
            Self::Mount => "mount",
            Self::Unmount => "unmount",
            Self::Probe => "probe",
            Self::Rename => "rename",
            Self::Refresh => "refresh",
        };
        f.write_str(name)
    }
}

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestFlag {
    /// Escalate unmount/eject (lazy detach)
    Force = 1 << 0,
    /// Remount an already mounted volume with new options
    Update = 1 << 1,
    /// Additional read-only mount of an already mounted volume
    Snapshot = 1 << 2,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestArguments {
    pub flags: BitFlags<RequestFlag>,

    /// Explicit mount point (mount, snapshot)
    pub mount_path: Option<PathBuf>,

    /// Caller-supplied mount options, highest precedence
    pub options: Vec<String>,

    /// New volume name (rename)
    pub name: Option<String>,
}

impl RequestArguments {
    pub fn force() -> Self {
        Self {
            flags: RequestFlag::Force.into(),
            ..Default::default()
        }
    }

    pub fn has(&self, flag: RequestFlag) -> bool {
        self.flags.contains(flag)
    }
}

/// Identity of the principal behind a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
    pub pid: Option<u32>,
    pub session: Option<SessionId>,
}

impl Caller {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            pid: None,
            session: None,
        }
    }

    pub fn root() -> Self {
        Self::new(0, 0)
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Payload of a successful request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Done,
    Mounted(PathBuf),
    Probed(DiskDescription),
}

pub type RequestOutcome = Result<Reply, Dissenter>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_sensitive_kinds_carry_actions() {
        assert!(RequestKind::Mount.action_id().is_some());
        assert!(RequestKind::Rename.action_id().is_some());
        assert!(RequestKind::Claim.action_id().is_none());
        assert!(RequestKind::Refresh.action_id().is_none());
    }

    #[test]
    fn force_arguments() {
        let args = RequestArguments::force();
        assert!(args.has(RequestFlag::Force));
        assert!(!args.has(RequestFlag::Update));
    }
}

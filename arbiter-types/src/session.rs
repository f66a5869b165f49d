//! Types exchanged with client sessions

use enumflags2::{BitFlags, bitflags};
use serde::{Deserialize, Serialize};

use crate::{Caller, DescriptionKey, DiskDescription, DiskId, RequestArguments, RequestKind};

/// What a session wants to be consulted about.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interest {
    /// Look at each disk before it is mounted
    Peek = 1 << 0,
    /// Approve or veto claim/mount/unmount/eject requests
    Approve = 1 << 1,
    /// Receive appeared/disappeared/changed notifications
    Notify = 1 << 2,
}

/// Question put to approval observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalQuery {
    pub kind: RequestKind,
    pub disk: DiskId,
    pub description: DiskDescription,
    pub caller: Caller,
    pub arguments: RequestArguments,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeekVerdict {
    Proceed,
    /// Keep the disk from being mounted automatically
    Veto,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    Appeared {
        disk: DiskId,
        description: DiskDescription,
    },
    Disappeared {
        disk: DiskId,
    },
    DescriptionChanged {
        disk: DiskId,
        keys: BitFlags<DescriptionKey>,
        description: DiskDescription,
    },
}

impl Notification {
    pub fn disk(&self) -> &DiskId {
        match self {
            Self::Appeared { disk, .. }
            | Self::Disappeared { disk }
            | Self::DescriptionChanged { disk, .. } => disk,
        }
    }
}

// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;
use std::path::{Path, PathBuf};

use arbiter_types::{ArbiterError, DiskDescription, MountOptionSet};

use super::mount_map::MapLookup;
use super::mount_path;
use crate::config::Preferences;

/// Inputs to a policy decision beyond the disk and the maps.
#[derive(Debug, Clone, Default)]
pub struct ResolveContext<'a> {
    /// Evaluating an automatic mount rather than a client request
    pub automatic: bool,
    /// Caller-supplied options, highest precedence
    pub options: &'a [String],
    /// Caller-supplied mount point
    pub mount_path: Option<&'a Path>,
    pub claimed: bool,
    pub peek_vetoed: bool,
    pub suppress_automount: bool,
    pub console_user: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Suppressed,
    PeekVeto,
    Claimed,
    MapNoAuto,
    AutomountDisabled,
    DeferredExternal,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Suppressed => "probe candidate suppresses automount",
            Self::PeekVeto => "vetoed during peek",
            Self::Claimed => "claimed by a session",
            Self::MapNoAuto => "mount map says noauto",
            Self::AutomountDisabled => "automount disabled",
            Self::DeferredExternal => "external media deferred until login",
        };
        f.write_str(reason)
    }
}

/// Where a mount will land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountTarget {
    /// A pre-existing directory named by a map or the caller
    Explicit(PathBuf),
    /// A fresh directory to allocate under `base`
    Allocate { base: PathBuf, name: String },
}

impl MountTarget {
    /// Produce the directory to mount on. Blocks; run on a worker.
    ///
    /// Returns the path and whether it was newly created.
    pub fn prepare(&self) -> Result<(PathBuf, bool), ArbiterError> {
        match self {
            Self::Explicit(path) => {
                if !path.is_dir() {
                    return Err(ArbiterError::not_found(format!(
                        "mount point {} does not exist",
                        path.display()
                    )));
                }
                Ok((path.clone(), false))
            }
            Self::Allocate { base, name } => Ok((mount_path::allocate(base, name)?, true)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPlan {
    pub target: MountTarget,
    pub options: Vec<String>,
    pub automatic: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountDecision {
    Mount(MountPlan),
    Cancel(CancelReason),
}

/// Trust level of a disk's attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustTier {
    Internal,
    TrustedExternal,
    Untrusted,
}

impl TrustTier {
    pub fn of(description: &DiskDescription, preferences: &Preferences) -> Self {
        if description.internal {
            Self::Internal
        } else if (description.removable && preferences.trust_removable)
            || (!description.removable && preferences.trust_external)
        {
            Self::TrustedExternal
        } else {
            Self::Untrusted
        }
    }

    fn defaults(self, preferences: &Preferences) -> MountOptionSet {
        match self {
            Self::Internal => MountOptionSet {
                no_suid: Some(false),
                no_dev: Some(false),
                no_owners: Some(false),
                ..Default::default()
            },
            Self::TrustedExternal => MountOptionSet {
                no_suid: Some(true),
                no_dev: Some(true),
                no_owners: Some(false),
                ..Default::default()
            },
            Self::Untrusted => MountOptionSet {
                read_only: preferences.removable_read_only.then_some(true),
                no_suid: Some(true),
                no_dev: Some(true),
                no_owners: Some(true),
                ..Default::default()
            },
        }
    }
}

/// Decide whether, where and how to mount a volume.
pub fn resolve(
    description: &DiskDescription,
    lookup: &MapLookup,
    preferences: &Preferences,
    context: &ResolveContext<'_>,
) -> MountDecision {
    if context.automatic
        && let Some(reason) = automatic_veto(description, lookup, preferences, context)
    {
        return MountDecision::Cancel(reason);
    }

    let mut options = MountOptionSet::from_tokens(context.options);
    options.merge_under(&lookup.options);
    options.merge_under(&TrustTier::of(description, preferences).defaults(preferences));
    if !description.writable {
        options.read_only = Some(true);
    }

    let target = match context.mount_path.or(lookup.mount_path.as_deref()) {
        Some(path) => MountTarget::Explicit(path.to_path_buf()),
        None => MountTarget::Allocate {
            base: preferences.mount_base.clone(),
            name: mount_path::sanitize_name(description.volume_name.as_deref()),
        },
    };

    MountDecision::Mount(MountPlan {
        target,
        options: options.to_tokens(),
        automatic: context.automatic,
    })
}

fn automatic_veto(
    description: &DiskDescription,
    lookup: &MapLookup,
    preferences: &Preferences,
    context: &ResolveContext<'_>,
) -> Option<CancelReason> {
    if context.suppress_automount {
        return Some(CancelReason::Suppressed);
    }
    if context.peek_vetoed {
        return Some(CancelReason::PeekVeto);
    }
    if context.claimed {
        return Some(CancelReason::Claimed);
    }
    match lookup.automatic {
        Some(false) => Some(CancelReason::MapNoAuto),
        Some(true) => None,
        None if !preferences.auto_mount => Some(CancelReason::AutomountDisabled),
        None if preferences.defer_external
            && !description.internal
            && context.console_user.is_none() =>
        {
            Some(CancelReason::DeferredExternal)
        }
        None => None,
    }
}

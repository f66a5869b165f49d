// SPDX-License-Identifier: GPL-3.0-only

//! Mount policy: map lookup, trust defaults and mount point allocation

pub mod mount_map;
pub mod mount_path;
pub mod resolver;

pub use mount_map::{MapLookup, VolInfoEntry};
pub use resolver::{
    CancelReason, MountDecision, MountPlan, MountTarget, ResolveContext, TrustTier, resolve,
};
